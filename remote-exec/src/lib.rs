// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Running shell commands on cluster machines and inside their containers.
//!
//! All remote work goes through the [`Executor`] trait. In production this is
//! a [`MachineExecutor`], which shells out to `docker-machine`; under test a
//! [`FakeExecutor`] records what would have run and replies with canned
//! output.

use async_trait::async_trait;
use camino::Utf8Path;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

mod fake;
mod machine;

pub use fake::{FakeExecutor, FakeReply, Invocation, ReplyFn};
pub use machine::MachineExecutor;

/// Where a command runs.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Target {
    /// The machine running the orchestrator.
    Local,
    /// A provisioned host, addressed by machine name.
    Machine { name: String },
    /// A container on a provisioned host.
    Container { machine: String, container: String },
}

impl Target {
    pub fn machine(name: impl Into<String>) -> Self {
        Target::Machine { name: name.into() }
    }

    pub fn container(
        machine: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Target::Container {
            machine: machine.into(),
            container: container.into(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Local => f.write_str("local"),
            Target::Machine { name } => write!(f, "machine:{name}"),
            Target::Container { machine, container } => {
                write!(f, "container:{machine}/{container}")
            }
        }
    }
}

#[derive(Debug)]
pub struct CommandFailureInfo {
    pub target: Target,
    pub command: String,
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl fmt::Display for CommandFailureInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let status = self
            .status
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none".to_string());
        write!(
            f,
            "Command [{}] on {} executed and failed with status: {}",
            self.command, self.target, status
        )?;
        write!(f, "  stdout: {}", self.stdout)?;
        write!(f, "  stderr: {}", self.stderr)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ExecutionError {
    #[error("Failed to start execution of [{command}]: {err}")]
    ExecutionStart { command: String, err: std::io::Error },

    #[error("{0}")]
    CommandFailure(Box<CommandFailureInfo>),

    #[error("Failed to send input to [{command}]: {err}")]
    Input { command: String, err: std::io::Error },

    #[error("Command [{command}] on {target} timed out after {timeout:?}")]
    Timeout { target: Target, command: String, timeout: Duration },
}

impl ExecutionError {
    /// Captured standard output of a command that ran and failed.
    pub fn stdout(&self) -> Option<&str> {
        match self {
            ExecutionError::CommandFailure(info) => Some(&info.stdout),
            _ => None,
        }
    }
}

/// Describes the commonly-used "safe-to-reference" type describing the
/// Executor as a trait object.
pub type BoxedExecutor = Arc<dyn Executor>;

/// Runs commands against a [`Target`] and returns their standard output.
///
/// A non-zero exit and a timeout are both errors.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Runs `command` through a shell on `target`, waiting for it to finish.
    async fn exec(
        &self,
        target: &Target,
        command: &str,
    ) -> Result<String, ExecutionError>;

    /// Writes `contents` to `path` on `target`, replacing any existing file.
    async fn write_file(
        &self,
        target: &Target,
        path: &Utf8Path,
        contents: &[u8],
    ) -> Result<(), ExecutionError>;

    /// Removes `path` on `target`. Removing a missing file succeeds.
    async fn remove_file(
        &self,
        target: &Target,
        path: &Utf8Path,
    ) -> Result<(), ExecutionError> {
        self.exec(target, &format!("rm -f {}", shell_quote(path.as_str())))
            .await
            .map(|_| ())
    }
}

/// Quotes `s` for inclusion as a single word in a POSIX shell command line.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars().all(|c| {
            c.is_ascii_alphanumeric()
                || matches!(c, '/' | '.' | '-' | '_' | '=' | ':' | ',')
        })
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r#"'\''"#))
}

/// The shell command used to stream a file's contents from stdin.
pub(crate) fn write_file_command(path: &Utf8Path) -> String {
    format!("cat > {}", shell_quote(path.as_str()))
}
