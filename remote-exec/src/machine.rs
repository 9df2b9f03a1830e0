// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::{
    shell_quote, write_file_command, BoxedExecutor, CommandFailureInfo,
    ExecutionError, Executor, Target,
};

use async_trait::async_trait;
use camino::Utf8Path;
use slog::{debug, error, info, Logger};
use std::process::{Output, Stdio};
use std::str::from_utf8;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

pub const DOCKER_MACHINE: &str = "docker-machine";

fn log_input(log: &Logger, id: u64, target: &Target, command: &str) {
    info!(
        log,
        "running command via executor";
        "id" => id,
        "target" => %target,
        "command" => command,
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
            "stdout" => from_utf8(&output.stdout).unwrap_or("<Not valid UTF-8>"),
        );
    }
    if !output.stderr.is_empty() {
        debug!(
            log,
            "finished command stderr";
            "id" => id,
            "stderr" => from_utf8(&output.stderr).unwrap_or("<Not valid UTF-8>"),
        );
    }
}

/// Runs commands locally through `sh`, and remotely through
/// `docker-machine ssh`, with a per-command timeout.
pub struct MachineExecutor {
    log: Logger,
    counter: AtomicU64,
    timeout: Duration,
}

impl MachineExecutor {
    pub fn new(log: Logger, timeout: Duration) -> Arc<Self> {
        Arc::new(Self { log, counter: AtomicU64::new(0), timeout })
    }

    pub fn as_executor(self: Arc<Self>) -> BoxedExecutor {
        self
    }

    fn command_for(target: &Target, command: &str) -> Command {
        match target {
            Target::Local => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(command);
                cmd
            }
            Target::Machine { name } => {
                let mut cmd = Command::new(DOCKER_MACHINE);
                cmd.args(["ssh", name.as_str(), command]);
                cmd
            }
            Target::Container { machine, container } => {
                let mut cmd = Command::new(DOCKER_MACHINE);
                let remote = format!(
                    "sudo docker exec -i {} sh -c {}",
                    shell_quote(container),
                    shell_quote(command)
                );
                cmd.args(["ssh", machine.as_str(), remote.as_str()]);
                cmd
            }
        }
    }

    async fn run(
        &self,
        target: &Target,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> Result<Output, ExecutionError> {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        log_input(&self.log, id, target, command);

        let mut cmd = Self::command_for(target, command);
        cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| {
            error!(self.log, "Could not start program!"; "id" => id);
            ExecutionError::ExecutionStart { command: command.to_string(), err }
        })?;

        if let Some(input) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input).await.map_err(|err| {
                    ExecutionError::Input { command: command.to_string(), err }
                })?;
            }
        }

        let output =
            match tokio::time::timeout(self.timeout, child.wait_with_output())
                .await
            {
                Ok(result) => result.map_err(|err| {
                    ExecutionError::ExecutionStart {
                        command: command.to_string(),
                        err,
                    }
                })?,
                Err(_) => {
                    error!(
                        self.log,
                        "command timed out";
                        "id" => id,
                        "timeout" => ?self.timeout,
                    );
                    return Err(ExecutionError::Timeout {
                        target: target.clone(),
                        command: command.to_string(),
                        timeout: self.timeout,
                    });
                }
            };

        log_output(&self.log, id, &output);
        if !output.status.success() {
            return Err(ExecutionError::CommandFailure(Box::new(
                CommandFailureInfo {
                    target: target.clone(),
                    command: command.to_string(),
                    status: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout)
                        .to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr)
                        .to_string(),
                },
            )));
        }
        Ok(output)
    }
}

#[async_trait]
impl Executor for MachineExecutor {
    async fn exec(
        &self,
        target: &Target,
        command: &str,
    ) -> Result<String, ExecutionError> {
        let output = self.run(target, command, None).await?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn write_file(
        &self,
        target: &Target,
        path: &Utf8Path,
        contents: &[u8],
    ) -> Result<(), ExecutionError> {
        self.run(target, &write_file_command(path), Some(contents))
            .await
            .map(|_| ())
    }
}
