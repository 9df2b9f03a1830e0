// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Module providing utilities for retrying operations.
//!
//! Provisioning is attempt-once almost everywhere. The exception is waiting
//! for a freshly created node to answer remote commands, which uses the
//! bounded, fixed-interval policy defined here.

use serde::Deserialize;
use std::time::Duration;

pub use ::backoff::backoff::Backoff;
pub use ::backoff::future::{retry, retry_notify};
pub use ::backoff::Error as BackoffError;
pub use ::backoff::Notify;

/// Parameters for waiting on a remote agent to become reachable.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub struct AgentWaitConfig {
    /// Total number of probes, including the first.
    #[serde(default = "AgentWaitConfig::default_max_attempts")]
    pub max_attempts: u32,
    /// Pause between two consecutive probes.
    #[serde(default = "AgentWaitConfig::default_interval_secs")]
    pub interval_secs: u64,
}

impl AgentWaitConfig {
    fn default_max_attempts() -> u32 {
        6
    }

    fn default_interval_secs() -> u64 {
        10
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn policy(&self) -> FixedRetryPolicy {
        FixedRetryPolicy::new(self.max_attempts, self.interval())
    }
}

impl Default for AgentWaitConfig {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            interval_secs: Self::default_interval_secs(),
        }
    }
}

/// A [`Backoff`] that waits the same interval between attempts and gives up
/// after a fixed number of attempts.
///
/// `next_backoff` is consulted once per failed attempt, so a policy built with
/// `max_attempts = 6` lets the operation run six times in total.
#[derive(Clone, Debug)]
pub struct FixedRetryPolicy {
    max_attempts: u32,
    interval: Duration,
    failures: u32,
}

impl FixedRetryPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self { max_attempts, interval, failures: 0 }
    }

    /// Number of failed attempts seen since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

impl Backoff for FixedRetryPolicy {
    fn reset(&mut self) {
        self.failures = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if self.failures < self.max_attempts {
            Some(self.interval)
        } else {
            None
        }
    }
}

/// Return the policy used by the agent-reachability step with the default
/// parameters (6 attempts, 10 seconds apart).
pub fn agent_wait_policy() -> FixedRetryPolicy {
    AgentWaitConfig::default().policy()
}
