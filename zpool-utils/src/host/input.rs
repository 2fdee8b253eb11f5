// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::borrow::Cow;
use std::process::Command;

/// Wrapper around the input of a [std::process::Command] as strings.
///
/// Environment variables are not part of the input: two commands
/// are considered the same if they run the same program with the same
/// arguments.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Input {
    pub program: String,
    pub args: Vec<String>,
}

impl Input {
    /// Short-hand for a whitespace-separated string, which can be provided
    /// "like a shell command".
    pub fn shell<S: AsRef<str>>(input: S) -> Self {
        let mut args = shlex::split(input.as_ref()).expect("Invalid input");

        if args.is_empty() {
            panic!("Empty input is invalid");
        }

        let program = args.remove(0);
        Self { program, args }
    }
}

fn quote(s: &str) -> Cow<'_, str> {
    shlex::try_quote(s).unwrap_or(Cow::Borrowed(s))
}

impl std::fmt::Display for Input {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", quote(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", quote(arg))?;
        }
        Ok(())
    }
}

fn os_str_to_string(s: &std::ffi::OsStr) -> String {
    s.to_string_lossy().to_string()
}

impl From<&Command> for Input {
    fn from(command: &Command) -> Self {
        Self {
            program: os_str_to_string(command.get_program()),
            args: command.get_args().map(os_str_to_string).collect(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn shell_input_matches_command() {
        let mut command = Command::new("zpool");
        command.args(["create", "-o", "comment=two words", "tank", "sdb"]);
        command.env("LC_ALL", "C.UTF-8");

        let observed = Input::from(&command);
        let expected =
            Input::shell("zpool create -o 'comment=two words' tank sdb");
        assert_eq!(observed, expected);

        // Display output must survive being split again.
        assert_eq!(Input::shell(observed.to_string()), observed);
    }

    #[test]
    #[should_panic(expected = "Empty input is invalid")]
    fn empty_shell_input_panics() {
        Input::shell("   ");
    }
}
