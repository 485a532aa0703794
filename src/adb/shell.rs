use crate::adb::protocol::MAX_REQUEST_LEN;
use crate::error::{AdbError, Result};

const SHELL_PREFIX: &str = "shell:";

/// A shell command line destined for `shell:<command>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    command: String,
    args: Vec<String>,
}

impl ShellCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Command and arguments joined by single spaces, as the device shell sees them
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }

    /// The service string, rejecting blank commands and lines too long to frame
    pub fn service(&self) -> Result<String> {
        let line = self.command_line();
        if line.trim().is_empty() {
            return Err(AdbError::invalid_argument("shell command cannot be empty"));
        }

        let service = format!("{}{}", SHELL_PREFIX, line);
        if service.len() > MAX_REQUEST_LEN {
            return Err(AdbError::invalid_argument(format!(
                "shell command is {} bytes, the protocol allows at most {}",
                service.len(),
                MAX_REQUEST_LEN
            )));
        }
        Ok(service)
    }
}

impl From<&str> for ShellCommand {
    fn from(command: &str) -> Self {
        Self::new(command)
    }
}

impl From<String> for ShellCommand {
    fn from(command: String) -> Self {
        Self::new(command)
    }
}
