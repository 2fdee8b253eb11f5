// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Plumbing for running commands on the host, or pretending to.

mod error;
mod executor;
mod input;
mod output;

pub use error::{CommandFailureInfo, ExecutionError};
pub use executor::{
    command_to_string, BoxedExecuteFn, BoxedExecutor, CommandSequence,
    Executor, FakeExecutor, FakeExecutorBuilder, HostExecutor,
};
pub use input::Input;
pub use output::{Output, OutputExt};

/// Privilege-escalation wrapper commonly used on illumos hosts.
pub const PFEXEC: &str = "/usr/bin/pfexec";
