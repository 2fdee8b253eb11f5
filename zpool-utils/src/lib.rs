// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wrappers around the `zpool` command.

pub mod config;
pub mod fakes;
pub mod host;
pub mod zpool;

#[cfg(test)]
pub(crate) mod test_util {
    use slog::{o, Drain, Logger};

    /// Returns a logger which writes through the test harness, so output is
    /// only shown for failing tests.
    pub(crate) fn test_setup_log(name: &str) -> Logger {
        let decorator =
            slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        Logger::root(drain, o!("test" => name.to_string()))
    }
}
