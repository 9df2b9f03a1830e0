// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-node log files

use camino::{Utf8Path, Utf8PathBuf};
use gluu_common::api::Node;
use slog::{o, Drain, Logger};
use std::fs::OpenOptions;

#[derive(Debug, thiserror::Error)]
pub enum NodeLogError {
    #[error("failed to open node log {path}")]
    Open {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
}

/// A logger writing both to the process log and to `<dir>/<node name>.log`.
///
/// The file is closed once this value and every logger derived from it have
/// been dropped.
pub struct NodeLog {
    log: Logger,
    path: Utf8PathBuf,
}

impl NodeLog {
    pub fn open(
        parent: &Logger,
        dir: &Utf8Path,
        node: &Node,
    ) -> Result<NodeLog, NodeLogError> {
        let path = dir.join(format!("{}.log", node.name));
        std::fs::create_dir_all(dir)
            .map_err(|err| NodeLogError::Open { path: path.clone(), err })?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| NodeLogError::Open { path: path.clone(), err })?;

        let decorator = slog_term::PlainSyncDecorator::new(file);
        let file_drain = slog_term::FullFormat::new(decorator).build();
        let drain =
            slog::Duplicate::new(file_drain, parent.clone()).ignore_res();
        let log = Logger::root(
            drain,
            o!(
                "node_id" => node.id.to_string(),
                "node" => node.name.clone(),
                "role" => node.role.label(),
            ),
        );
        Ok(NodeLog { log, path })
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}
