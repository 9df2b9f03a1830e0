// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Polling for a condition to become true

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Result of one check of the condition
#[derive(Debug, thiserror::Error)]
pub enum CondCheckError<E> {
    /// the condition is not yet true
    #[error("condition not yet true")]
    NotYet,
    /// the condition can never become true
    #[error("permanent error")]
    Failed(#[from] E),
}

/// Error returned by [`wait_for_condition`]
#[derive(Debug, thiserror::Error)]
pub enum Error<E> {
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("permanent error: {0}")]
    PermanentError(E),
}

/// Invokes `cond` every `poll_interval` until it returns a value or a
/// permanent error, giving up after `poll_max`.
///
/// Time is measured on the tokio clock, so this works with paused time.
pub async fn wait_for_condition<O, E, Func, Fut>(
    mut cond: Func,
    poll_interval: &Duration,
    poll_max: &Duration,
) -> Result<O, Error<E>>
where
    Func: FnMut() -> Fut,
    Fut: Future<Output = Result<O, CondCheckError<E>>>,
{
    let poll_start = Instant::now();
    loop {
        let duration = Instant::now().duration_since(poll_start);
        if duration > *poll_max {
            return Err(Error::TimedOut(duration));
        }

        match cond().await {
            Ok(output) => return Ok(output),
            Err(CondCheckError::Failed(e)) => {
                return Err(Error::PermanentError(e))
            }
            Err(CondCheckError::NotYet) => {}
        }

        tokio::time::sleep(*poll_interval).await;
    }
}
