// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::{
    write_file_command, BoxedExecutor, CommandFailureInfo, ExecutionError,
    Executor, Target,
};

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use slog::{info, Logger};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// What a [`FakeExecutor`] answers for one command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FakeReply {
    Success { stdout: String },
    Failure { status: i32, stderr: String },
    Timeout,
}

impl FakeReply {
    pub fn success() -> Self {
        FakeReply::Success { stdout: String::new() }
    }

    pub fn stdout(stdout: impl Into<String>) -> Self {
        FakeReply::Success { stdout: stdout.into() }
    }

    pub fn failure() -> Self {
        FakeReply::Failure { status: 1, stderr: String::new() }
    }
}

/// One call observed by a [`FakeExecutor`], in arrival order.
#[derive(Clone, Debug)]
pub struct Invocation {
    pub target: Target,
    /// The shell command. File writes appear as `cat > <path>`.
    pub command: String,
    /// Contents streamed to a file write.
    pub contents: Option<Vec<u8>>,
    /// When the call arrived, on the tokio clock.
    pub at: Instant,
}

impl Invocation {
    pub fn written_path(&self) -> Option<Utf8PathBuf> {
        self.contents.as_ref()?;
        self.command
            .strip_prefix("cat > ")
            .map(|p| Utf8PathBuf::from(p.trim_matches('\'')))
    }
}

/// Handler deciding the reply for each command.
pub type ReplyFn = dyn FnMut(&Target, &str) -> FakeReply + Send;

struct FakeExecutorInner {
    log: Logger,
    counter: AtomicU64,
    handler: Mutex<Box<ReplyFn>>,
    invocations: Mutex<Vec<Invocation>>,
}

/// An executor which records every command and answers from a handler.
///
/// By default every command succeeds with empty output.
pub struct FakeExecutor {
    inner: Arc<FakeExecutorInner>,
}

impl FakeExecutor {
    pub fn new(log: Logger) -> Arc<FakeExecutor> {
        Arc::new(Self {
            inner: Arc::new(FakeExecutorInner {
                log,
                counter: AtomicU64::new(0),
                handler: Mutex::new(Box::new(|_, _| FakeReply::success())),
                invocations: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Set the reply handler to an arbitrary function.
    pub fn set_handler(&self, f: Box<ReplyFn>) {
        *self.inner.handler.lock().unwrap() = f;
    }

    /// Fails every command for which `pred` holds; everything else succeeds.
    pub fn fail_when<F>(&self, mut pred: F)
    where
        F: FnMut(&Target, &str) -> bool + Send + 'static,
    {
        self.set_handler(Box::new(move |target, command| {
            if pred(target, command) {
                FakeReply::failure()
            } else {
                FakeReply::success()
            }
        }));
    }

    /// Perform some type coercion to access a commonly-used trait object.
    pub fn as_executor(self: Arc<Self>) -> BoxedExecutor {
        self
    }

    /// Every call seen so far.
    pub fn invocations(&self) -> Vec<Invocation> {
        self.inner.invocations.lock().unwrap().clone()
    }

    /// The commands seen so far, without targets.
    pub fn commands(&self) -> Vec<String> {
        self.invocations().into_iter().map(|i| i.command).collect()
    }

    pub fn clear(&self) {
        self.inner.invocations.lock().unwrap().clear();
    }

    fn record(
        &self,
        target: &Target,
        command: &str,
        contents: Option<&[u8]>,
    ) -> Result<String, ExecutionError> {
        let id = self.inner.counter.fetch_add(1, Ordering::SeqCst);
        info!(
            self.inner.log,
            "running command via fake executor";
            "id" => id,
            "target" => %target,
            "command" => command,
        );
        self.inner.invocations.lock().unwrap().push(Invocation {
            target: target.clone(),
            command: command.to_string(),
            contents: contents.map(|c| c.to_vec()),
            at: Instant::now(),
        });

        let reply = (self.inner.handler.lock().unwrap())(target, command);
        match reply {
            FakeReply::Success { stdout } => Ok(stdout),
            FakeReply::Failure { status, stderr } => {
                Err(ExecutionError::CommandFailure(Box::new(
                    CommandFailureInfo {
                        target: target.clone(),
                        command: command.to_string(),
                        status: Some(status),
                        stdout: String::new(),
                        stderr,
                    },
                )))
            }
            FakeReply::Timeout => Err(ExecutionError::Timeout {
                target: target.clone(),
                command: command.to_string(),
                timeout: Duration::ZERO,
            }),
        }
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    async fn exec(
        &self,
        target: &Target,
        command: &str,
    ) -> Result<String, ExecutionError> {
        self.record(target, command, None)
    }

    async fn write_file(
        &self,
        target: &Target,
        path: &Utf8Path,
        contents: &[u8],
    ) -> Result<(), ExecutionError> {
        self.record(target, &write_file_command(path), Some(contents))
            .map(|_| ())
    }
}
