// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Provisioning and lifecycle orchestration for identity clusters
//!
//! An [`Orchestrator`] takes a node record from the state store and runs the
//! remaining steps of its role against the node's machine or container, one
//! at a time, recording each completed step so an interrupted deploy can be
//! resumed. Directory nodes additionally join the cluster's replication
//! topology; other roles are told when their peers come and go.

pub mod config;
pub mod ip_pool;
pub mod node_log;
pub mod opendj;
mod orchestrator;
pub mod replication;
pub mod setup;
pub mod task_queue;
pub mod template;
pub mod topology;

pub use config::Config;
pub use orchestrator::{Orchestrator, SetupError};
