// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Steps shared by every containerized role

use super::{StepContext, StepError};
use camino::Utf8PathBuf;
use gluu_common::api::{Node, NodeRole};
use gluu_common::steps::Step;
use gluu_remote_exec::{shell_quote, Target};
use slog::{info, warn};

/// Image repository for containers of `role`.
pub(super) fn image_for(role: NodeRole) -> Option<&'static str> {
    match role {
        NodeRole::Directory => Some("opendj"),
        NodeRole::AuthServer => Some("oxauth"),
        NodeRole::TrustServer => Some("oxtrust"),
        NodeRole::FederationProxy => Some("oxidp"),
        NodeRole::WebFront => Some("nginx"),
        NodeRole::Discovery | NodeRole::Master | NodeRole::Worker => None,
    }
}

/// Starts the node's container on its host and records its id.
pub(super) async fn create(
    ctx: &StepContext<'_>,
    node: &mut Node,
) -> Result<(), StepError> {
    let image = image_for(node.role).ok_or(StepError::Unsupported {
        step: Step::CreateContainer,
        role: node.role,
    })?;
    let machine = ctx.topology.machine_for(node).await?;
    let command = format!(
        "sudo docker run -d --name {} gluufederation/{image}:{}",
        shell_quote(&node.name),
        shell_quote(&ctx.config.image_tag),
    );
    let stdout = ctx.exec(&Target::machine(&machine), &command).await?;
    let container_id = stdout.trim();
    if container_id.is_empty() {
        return Err(StepError::UnexpectedOutput { command, output: stdout });
    }
    info!(
        ctx.log,
        "created container";
        "machine" => &machine,
        "container_id" => container_id,
    );
    node.container_id = Some(container_id.to_string());
    Ok(())
}

/// Connects the node's container to the cluster overlay network.
///
/// The reserved address is given back if attaching fails.
pub(super) async fn attach_overlay(
    ctx: &StepContext<'_>,
    node: &mut Node,
) -> Result<(), StepError> {
    let container_id = node.container_id.clone().ok_or_else(|| {
        StepError::NotReady { what: format!("container of {}", node.name) }
    })?;
    let machine = ctx.topology.machine_for(node).await?;
    let overlay = ctx.overlay.reserve(node.cluster_id).await?;
    let command = format!(
        "sudo weave attach {overlay} {}",
        shell_quote(&container_id)
    );
    if let Err(err) = ctx.exec(&Target::machine(&machine), &command).await {
        if let Err(release_err) =
            ctx.overlay.release(node.cluster_id, overlay.addr).await
        {
            warn!(
                ctx.log,
                "failed to release overlay address";
                "address" => %overlay,
                "error" => %release_err,
            );
        }
        return Err(err);
    }
    node.overlay = Some(overlay);
    Ok(())
}

/// Registers `program` with the container's process supervisor.
pub(super) async fn add_auto_startup(
    ctx: &StepContext<'_>,
    node: &Node,
    program: &str,
) -> Result<(), StepError> {
    let target = ctx.target(node).await?;
    let dest = Utf8PathBuf::from(format!(
        "/etc/supervisor/conf.d/{program}.conf"
    ));
    ctx.render_to(
        &target,
        &format!("supervisor/{program}.conf"),
        &dest,
        &serde_json::json!({}),
    )
    .await
}

pub(super) async fn reload_supervisor(
    ctx: &StepContext<'_>,
    node: &Node,
) -> Result<(), StepError> {
    let target = ctx.target(node).await?;
    ctx.exec(&target, "supervisorctl reload").await?;
    Ok(())
}

/// Succeeds once the container's supervisor answers.
pub(super) async fn probe_supervisor(
    ctx: &StepContext<'_>,
    node: &Node,
) -> Result<(), StepError> {
    let target = ctx.target(node).await?;
    ctx.exec(&target, "supervisorctl pid").await?;
    Ok(())
}

/// Removes the node's container and gives its overlay address back.
pub(super) async fn release(ctx: &StepContext<'_>, node: &Node) {
    let machine = match ctx.topology.machine_for(node).await {
        Ok(machine) => Target::machine(machine),
        Err(err) => {
            warn!(
                ctx.log,
                "cannot locate host, leaving container behind";
                "error" => %err,
            );
            return release_overlay(ctx, node).await;
        }
    };
    if let Some(container_id) = &node.container_id {
        let container_id = shell_quote(container_id);
        for command in [
            format!("sudo weave detach {container_id}"),
            format!("sudo docker rm -f {container_id}"),
        ] {
            if let Err(err) = ctx.exec(&machine, &command).await {
                warn!(
                    ctx.log,
                    "failed to release container resource";
                    "command" => &command,
                    "error" => %err,
                );
            }
        }
    }
    release_overlay(ctx, node).await
}

async fn release_overlay(ctx: &StepContext<'_>, node: &Node) {
    let Some(overlay) = node.overlay else {
        return;
    };
    if let Err(err) = ctx.overlay.release(node.cluster_id, overlay.addr).await {
        warn!(
            ctx.log,
            "failed to release overlay address";
            "address" => %overlay,
            "error" => %err,
        );
    }
}
