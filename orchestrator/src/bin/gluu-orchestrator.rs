// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command-line front end of the cluster orchestrator

use anyhow::{bail, Context};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use gluu_common::api::Node;
use gluu_common::typed_uuid::{ClusterUuid, NodeUuid};
use gluu_common::FileKv;
use gluu_datastore::{DataStore, JsonFileBackend};
use gluu_orchestrator::task_queue::{
    Operation, TaskQueue, TaskRequest, TaskStatus,
};
use gluu_orchestrator::template::FsTemplateRenderer;
use gluu_orchestrator::topology::Topology;
use gluu_orchestrator::{Config, Orchestrator};
use gluu_remote_exec::MachineExecutor;
use slog::{info, o};
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(version, about = "Provision and tear down identity cluster nodes")]
struct Args {
    /// Path to the orchestrator configuration file
    #[arg(long, short, default_value = "/etc/gluu-orchestrator/config.toml")]
    config_file: Utf8PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Deploy nodes, resuming any that stopped part way
    Deploy {
        #[arg(required = true)]
        node_ids: Vec<NodeUuid>,
    },
    /// Remove a node from its cluster and delete it
    Teardown { node_id: NodeUuid },
    /// Release a node left claimed by a run that never finished
    Recover {
        node_id: NodeUuid,
        /// Recover even if the node was updated recently
        #[arg(long)]
        force: bool,
    },
    /// Show a node's state and step progress
    Status { node_id: NodeUuid },
    /// List a cluster's containers in the order they should be restarted
    RecoveryOrder { cluster_id: ClusterUuid },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::from_file(&args.config_file)
        .with_context(|| format!("loading {}", args.config_file))?;
    let log = config
        .log
        .to_logger("gluu-orchestrator")
        .context("failed to create logger")?;
    let log = log.new(o!(FileKv));

    let backend = JsonFileBackend::open(&config.data_dir)
        .await
        .with_context(|| format!("opening state store {}", config.data_dir))?;
    let datastore = DataStore::new(&log, Arc::new(backend));

    match args.command {
        Command::Deploy { node_ids } => {
            let orchestrator = build_orchestrator(&log, &config, datastore);
            run_tasks(&log, orchestrator, &config, node_ids, Operation::Deploy)
                .await
        }
        Command::Teardown { node_id } => {
            let orchestrator = build_orchestrator(&log, &config, datastore);
            run_tasks(
                &log,
                orchestrator,
                &config,
                vec![node_id],
                Operation::Teardown,
            )
            .await
        }
        Command::Recover { node_id, force } => {
            let orchestrator = build_orchestrator(&log, &config, datastore);
            let state = orchestrator.recover(node_id, force).await?;
            println!("{node_id}: {state}");
            Ok(())
        }
        Command::Status { node_id } => {
            let node: Node = datastore.get(node_id).await?;
            println!("{} ({}): {}", node.name, node.role, node.state);
            for (step, done) in node.steps.iter() {
                println!("  [{}] {step}", if done { "x" } else { " " });
            }
            Ok(())
        }
        Command::RecoveryOrder { cluster_id } => {
            let topology = Topology::new(datastore);
            for node in topology.recovery_order(cluster_id).await? {
                println!(
                    "{}\t{}\t{}",
                    node.recovery_priority, node.role, node.name
                );
            }
            Ok(())
        }
    }
}

fn build_orchestrator(
    log: &slog::Logger,
    config: &Config,
    datastore: DataStore,
) -> Arc<Orchestrator> {
    let settings = &config.orchestrator;
    let executor =
        MachineExecutor::new(log.clone(), settings.command_timeout())
            .as_executor();
    let templates = Arc::new(FsTemplateRenderer::new(&settings.template_dir));
    Orchestrator::new(log, settings.clone(), executor, datastore, templates)
}

async fn run_tasks(
    log: &slog::Logger,
    orchestrator: Arc<Orchestrator>,
    config: &Config,
    node_ids: Vec<NodeUuid>,
    op: Operation,
) -> anyhow::Result<()> {
    let queue =
        TaskQueue::start(log, orchestrator, config.orchestrator.workers);
    let mut tasks = Vec::new();
    for node_id in node_ids {
        tasks.push((node_id, queue.enqueue(TaskRequest { node_id, op })?));
    }

    let drain = queue.drain();
    tokio::pin!(drain);
    tokio::select! {
        _ = &mut drain => {}
        _ = tokio::signal::ctrl_c() => {
            info!(log, "interrupted, stopping after current steps");
            queue.cancel();
            drain.await;
        }
    }

    let mut failed = 0;
    for (node_id, task_id) in tasks {
        match queue.status(task_id) {
            Some(TaskStatus::Succeeded) => println!("{node_id}: ok"),
            Some(TaskStatus::Failed { message }) => {
                failed += 1;
                println!("{node_id}: failed: {message}");
            }
            status => {
                failed += 1;
                println!("{node_id}: unfinished ({status:?})");
            }
        }
    }
    if failed > 0 {
        bail!("{failed} operation(s) failed");
    }
    Ok(())
}
