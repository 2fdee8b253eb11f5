// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::error::ExecutionError;
use super::input::Input;
use super::output::{Output, OutputExt};

use itertools::Itertools;
use slog::{debug, error, info, Logger};
use std::process::Command;
use std::str::from_utf8;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub fn command_to_string(command: &Command) -> String {
    Input::from(command).to_string()
}

fn to_space_separated_string<T, I>(iter: T) -> String
where
    T: IntoIterator<Item = I>,
    I: std::fmt::Debug,
{
    Itertools::intersperse(
        iter.into_iter().map(|arg| format!("{arg:?}")),
        " ".into(),
    )
    .collect::<String>()
}

fn log_input(log: &Logger, id: u64, command: &Command) {
    info!(
        log,
        "running command via executor";
        "id" => id,
        "command" => %Input::from(command),
    );
    debug!(
        log,
        "running command via executor";
        "id" => id,
        "envs" => %to_space_separated_string(command.get_envs()),
    );
}

fn log_output(log: &Logger, id: u64, output: &Output) {
    info!(
        log,
        "finished running command via executor";
        "id" => id,
        "result" => if output.status.success() { "OK" } else { "ERROR" },
        "status" => output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none".to_string()),
    );
    if !output.stdout.is_empty() {
        debug!(
            log,
            "finished command stdout";
            "id" => id,
            "stdout" => from_utf8(&output.stdout)
                .unwrap_or("<Not valid UTF-8>"),
        );
    }
    if !output.stderr.is_empty() {
        debug!(
            log,
            "finished command stderr";
            "id" => id,
            "stderr" => from_utf8(&output.stderr)
                .unwrap_or("<Not valid UTF-8>"),
        );
    }
}

/// Describes the commonly-used "safe-to-reference" type describing the
/// Executor as a trait object.
pub type BoxedExecutor = Arc<dyn Executor>;

/// Describes an "executor", which can run [Command]s and return a response.
///
/// - In production, this is usually simply a [HostExecutor].
/// - Under test, this can be customized, and a [FakeExecutor] may be used.
pub trait Executor: Send + Sync {
    /// Executes a task, waiting for it to complete, and returning output.
    ///
    /// A command which runs but exits unsuccessfully is reported as
    /// [ExecutionError::CommandFailure].
    fn execute(&self, command: &mut Command) -> Result<Output, ExecutionError>;
}

pub struct HostExecutor {
    log: Logger,
    counter: AtomicU64,
}

impl HostExecutor {
    pub fn new(log: Logger) -> Arc<Self> {
        Arc::new(Self { log, counter: AtomicU64::new(0) })
    }

    pub fn as_executor(self: Arc<Self>) -> BoxedExecutor {
        self
    }

    fn prepare(&self, command: &Command) -> u64 {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        log_input(&self.log, id, command);
        id
    }

    fn finalize(
        &self,
        command: &Command,
        id: u64,
        output: Output,
    ) -> Result<Output, ExecutionError> {
        log_output(&self.log, id, &output);
        if !output.status.success() {
            return Err(ExecutionError::from_output(command, &output));
        }
        Ok(output)
    }
}

impl Executor for HostExecutor {
    fn execute(&self, command: &mut Command) -> Result<Output, ExecutionError> {
        let id = self.prepare(command);
        let output = command.output().map_err(|err| {
            error!(self.log, "Could not start program!"; "id" => id);
            ExecutionError::ExecutionStart {
                command: command_to_string(command),
                err,
            }
        })?;
        self.finalize(command, id, output)
    }
}

/// Handler called when a fake command is executed.
pub type ExecuteFn = dyn FnMut(&Command) -> Output + Send + Sync;
pub type BoxedExecuteFn = Box<ExecuteFn>;

pub struct FakeExecutorBuilder {
    log: Logger,
    handler: Option<BoxedExecuteFn>,
}

impl FakeExecutorBuilder {
    pub fn new(log: Logger) -> Self {
        Self { log, handler: None }
    }

    pub fn handler(mut self, f: BoxedExecuteFn) -> Self {
        self.handler = Some(f);
        self
    }

    /// Convenience function to register the sequence with a [FakeExecutor].
    pub fn with_sequence(mut self, mut sequence: CommandSequence) -> Self {
        self.handler = Some(Box::new(move |command: &Command| -> Output {
            sequence.execute(command)
        }));
        self
    }

    pub fn build(self) -> Arc<FakeExecutor> {
        FakeExecutor::new(
            self.log,
            self.handler.unwrap_or_else(|| {
                Box::new(|_cmd: &Command| Output::success())
            }),
        )
    }
}

/// An executor which can expect certain inputs, and respond with specific
/// outputs.
pub struct FakeExecutor {
    log: Logger,
    counter: AtomicU64,
    handler: Mutex<BoxedExecuteFn>,
}

impl FakeExecutor {
    pub fn new(log: Logger, handler: BoxedExecuteFn) -> Arc<FakeExecutor> {
        Arc::new(Self {
            log,
            counter: AtomicU64::new(0),
            handler: Mutex::new(handler),
        })
    }

    /// Perform some type coercion to access a commonly-used trait object.
    pub fn as_executor(self: Arc<Self>) -> BoxedExecutor {
        self
    }
}

impl Executor for FakeExecutor {
    fn execute(&self, command: &mut Command) -> Result<Output, ExecutionError> {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        log_input(&self.log, id, command);

        let output = {
            let mut handler =
                self.handler.lock().unwrap_or_else(|e| e.into_inner());
            handler(command)
        };
        log_output(&self.log, id, &output);

        if !output.status.success() {
            return Err(ExecutionError::from_output(command, &output));
        }
        Ok(output)
    }
}

type DynamicHandler = Box<dyn FnMut(Input) -> Output + Send + Sync>;

enum HandledCommand {
    Static { input: Input, output: Output },
    Dynamic { handler: DynamicHandler },
}

/// A handler that may be used for setting inputs/outputs to the executor
/// when these commands are known ahead-of-time.
///
/// See: [FakeExecutorBuilder::with_sequence] for integration with a
/// [FakeExecutor].
pub struct CommandSequence {
    expected: Vec<HandledCommand>,
    index: usize,
}

impl Default for CommandSequence {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandSequence {
    pub fn new() -> Self {
        Self { expected: Vec::new(), index: 0 }
    }

    /// Expects a static "input" to exactly produce some "output".
    pub fn expect(&mut self, input: Input, output: Output) {
        self.expected.push(HandledCommand::Static { input, output });
    }

    /// A helper for [Self::expect] which quietly succeeds.
    pub fn expect_ok<S: AsRef<str>>(&mut self, input: S) {
        self.expect(Input::shell(input), Output::success())
    }

    /// A helper for [Self::expect] which quietly fails.
    pub fn expect_fail<S: AsRef<str>>(&mut self, input: S) {
        self.expect(Input::shell(input), Output::failure())
    }

    /// A helper for [Self::expect] which succeeds and prints `stdout`.
    pub fn expect_stdout<S: AsRef<str>, T: AsRef<str>>(
        &mut self,
        input: S,
        stdout: T,
    ) {
        self.expect(Input::shell(input), Output::success().set_stdout(stdout))
    }

    /// Expects a dynamic handler to be invoked to dynamically
    /// determine the output of this call.
    pub fn expect_dynamic(&mut self, handler: DynamicHandler) {
        self.expected.push(HandledCommand::Dynamic { handler });
    }

    fn execute(&mut self, command: &Command) -> Output {
        let observed_input = Input::from(command);
        let expected = &mut self
            .expected
            .get_mut(self.index)
            .unwrap_or_else(|| panic!("Unexpected command: {observed_input}"));
        self.index += 1;

        match expected {
            HandledCommand::Static { input, output } => {
                assert_eq!(&observed_input, input, "Unexpected input command");
                output.clone()
            }
            HandledCommand::Dynamic { ref mut handler } => {
                handler(observed_input)
            }
        }
    }
}

impl Drop for CommandSequence {
    fn drop(&mut self) {
        let expected = self.expected.len();
        let actual = self.index;
        if actual < expected {
            let next = &self.expected[actual];
            let tip = match next {
                HandledCommand::Static { input, .. } => input.to_string(),
                HandledCommand::Dynamic { .. } => {
                    "<dynamic handler>".to_string()
                }
            };
            let errmsg = format!(
                "Only saw {actual} calls, expected {expected}\n\
                 Next would have been: {tip}"
            );
            if !std::thread::panicking() {
                panic!("{errmsg}");
            } else {
                eprintln!("{errmsg}");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::test_setup_log;

    #[test]
    fn fake_executor_reports_failure() {
        let log = test_setup_log("fake_executor_reports_failure");
        let mut seq = CommandSequence::new();
        seq.expect(
            Input::shell("zpool destroy tank"),
            Output::failure().set_stderr("cannot open 'tank': no such pool\n"),
        );
        let executor =
            FakeExecutorBuilder::new(log).with_sequence(seq).build();

        let mut command = Command::new("zpool");
        command.args(["destroy", "tank"]);
        let err = executor.execute(&mut command).unwrap_err();
        match err {
            ExecutionError::CommandFailure(info) => {
                assert_eq!(info.command, "zpool destroy tank");
                assert_eq!(info.status.code(), Some(1));
                assert!(info.stderr.contains("no such pool"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn fake_executor_defaults_to_success() {
        let log = test_setup_log("fake_executor_defaults_to_success");
        let executor = FakeExecutorBuilder::new(log).build().as_executor();

        let mut command = Command::new("zpool");
        command.arg("list");
        let output = executor.execute(&mut command).unwrap();
        assert!(output.status.success());
        assert!(output.stdout.is_empty());
    }

    #[test]
    fn dynamic_handler_sees_input() {
        let log = test_setup_log("dynamic_handler_sees_input");
        let mut seq = CommandSequence::new();
        seq.expect_dynamic(Box::new(|input: Input| -> Output {
            assert_eq!(input.program, "zpool");
            Output::success().set_stdout(input.args.join(","))
        }));
        let executor =
            FakeExecutorBuilder::new(log).with_sequence(seq).build();

        let mut command = Command::new("zpool");
        command.args(["list", "-Ho", "name"]);
        let output = executor.execute(&mut command).unwrap();
        assert_eq!(output.stdout, b"list,-Ho,name");
    }

    #[test]
    #[should_panic(expected = "Only saw 0 calls, expected 1")]
    fn unconsumed_sequence_panics() {
        let mut seq = CommandSequence::new();
        seq.expect_ok("zpool list");
    }
}
