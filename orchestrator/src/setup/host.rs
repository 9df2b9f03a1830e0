// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Provisioning of host machines: discovery, master and worker nodes

use super::{RoleSetup, StepContext, StepError};
use async_trait::async_trait;
use gluu_common::api::{Node, NodeRole};
use gluu_common::steps::Step;
use gluu_remote_exec::{shell_quote, Target};
use slog::{info, warn};
use std::net::IpAddr;

const CONSUL_PORT: u16 = 8500;
const REMOTE_DOCKER_CERT_DIR: &str = "/opt/gluu/docker/certs";
const DOCKER_CERT_FILES: [&str; 3] = ["ca.pem", "cert.pem", "key.pem"];

const CLUSTER_TOOLS: &str =
    "https://github.com/GluuFederation/cluster-tools/raw/master";
const RNG_TOOLS_CONF: &str = "https://raw.githubusercontent.com/\
                              GluuFederation/cluster-tools/master/rng_tools";

pub struct HostSetup;

impl HostSetup {
    async fn create(
        &self,
        ctx: &StepContext<'_>,
        node: &mut Node,
    ) -> Result<(), StepError> {
        let mut args = vec!["docker-machine".to_string(), "create".to_string()];
        args.extend(ctx.provider.driver_args().iter().map(|a| shell_quote(a)));
        if node.role != NodeRole::Discovery {
            let consul = self.discovery_address(ctx).await?;
            args.push("--swarm".to_string());
            if node.role == NodeRole::Master {
                args.push("--swarm-master".to_string());
            }
            args.push(format!(
                "--swarm-discovery=consul://{consul}:{CONSUL_PORT}"
            ));
            args.push(format!(
                "--engine-opt=cluster-store=consul://{consul}:{CONSUL_PORT}"
            ));
            args.push("--engine-opt=cluster-advertise=eth0:2376".to_string());
        }
        args.push(shell_quote(&node.name));
        info!(ctx.log, "creating machine"; "driver" => &ctx.provider.driver);
        ctx.exec(&Target::Local, &args.join(" ")).await?;

        let command = format!("docker-machine ip {}", shell_quote(&node.name));
        let output = ctx.exec(&Target::Local, &command).await?;
        let address: IpAddr = output.trim().parse().map_err(|_| {
            StepError::UnexpectedOutput { command, output: output.clone() }
        })?;
        info!(ctx.log, "machine created"; "address" => %address);
        node.address = Some(address);
        Ok(())
    }

    /// Address of the cluster's key-value store used for swarm discovery.
    async fn discovery_address(
        &self,
        ctx: &StepContext<'_>,
    ) -> Result<IpAddr, StepError> {
        ctx.finished_peers(NodeRole::Discovery)
            .await?
            .into_iter()
            .find_map(|n| n.address)
            .ok_or(StepError::MissingPeer {
                role: NodeRole::Discovery,
                cluster_id: ctx.cluster.id,
            })
    }

    async fn launch_overlay(
        &self,
        ctx: &StepContext<'_>,
        node: &Node,
    ) -> Result<(), StepError> {
        let command = match node.role {
            NodeRole::Master => "sudo weave launch".to_string(),
            NodeRole::Worker => {
                let peer = ctx
                    .finished_peers(NodeRole::Master)
                    .await?
                    .into_iter()
                    .find_map(|n| n.address)
                    .ok_or(StepError::MissingPeer {
                        role: NodeRole::Master,
                        cluster_id: ctx.cluster.id,
                    })?;
                format!("sudo weave launch {peer}")
            }
            role => {
                return Err(StepError::Unsupported {
                    step: Step::LaunchOverlay,
                    role,
                })
            }
        };
        ctx.exec(&Target::machine(&node.name), &command).await?;
        Ok(())
    }

    /// Copies the local docker client certificates onto the machine so
    /// tools running there can talk to the swarm.
    async fn push_docker_cert(
        &self,
        ctx: &StepContext<'_>,
        node: &Node,
    ) -> Result<(), StepError> {
        ctx.exec(
            &Target::machine(&node.name),
            &format!("sudo mkdir -p {REMOTE_DOCKER_CERT_DIR}"),
        )
        .await?;
        for file in DOCKER_CERT_FILES {
            ctx.exec(
                &Target::Local,
                &format!(
                    "docker-machine scp \"$HOME/.docker/machine/certs/{file}\" \
                     {}:{REMOTE_DOCKER_CERT_DIR}",
                    shell_quote(&node.name),
                ),
            )
            .await?;
        }
        Ok(())
    }
}

/// The shell commands of steps that only run a fixed script on the machine.
fn scripted_commands(step: Step, image_tag: &str) -> Option<Vec<String>> {
    let commands = match step {
        Step::InstallConsul => vec![format!(
            "sudo docker run -d --name=consul -p {CONSUL_PORT}:{CONSUL_PORT} \
             -h consul --restart=always -v /opt/gluu/consul/data:/data \
             progrium/consul -server -bootstrap"
        )],
        Step::InstallOverlay => vec![
            "sudo curl -L git.io/weave -o /usr/local/bin/weave".to_string(),
        ],
        Step::OverlayPermission => {
            vec!["sudo chmod +x /usr/local/bin/weave".to_string()]
        }
        Step::InstallFswatcher => vec![
            format!(
                "sudo wget {CLUSTER_TOOLS}/fswatcher/fswatcher.py -P /usr/bin"
            ),
            "sudo chmod +x /usr/bin/fswatcher.py".to_string(),
            "sudo apt-get -qq install -y --force-yes supervisor python-pip"
                .to_string(),
            "sudo pip -q install --upgrade pip".to_string(),
            "sudo pip -q install virtualenv".to_string(),
            "sudo mkdir -p /root/.virtualenvs".to_string(),
            "sudo virtualenv /root/.virtualenvs/fswatcher".to_string(),
            "sudo /root/.virtualenvs/fswatcher/bin/pip -q install watchdog"
                .to_string(),
            format!(
                "sudo wget {CLUSTER_TOOLS}/fswatcher/fswatcher.conf \
                 -P /etc/supervisor/conf.d"
            ),
            "sudo supervisorctl reload".to_string(),
        ],
        Step::InstallRecovery => vec![
            format!(
                "sudo wget {CLUSTER_TOOLS}/recovery/recovery.py -P /usr/bin"
            ),
            "sudo chmod +x /usr/bin/recovery.py".to_string(),
            "sudo apt-get -qq install -y --force-yes supervisor".to_string(),
            format!(
                "sudo wget {CLUSTER_TOOLS}/recovery/recovery.conf \
                 -P /etc/supervisor/conf.d"
            ),
            "sudo supervisorctl reload".to_string(),
        ],
        Step::InstallEntropySource => vec![
            format!("sudo wget {RNG_TOOLS_CONF} -O /etc/default/rng-tools"),
            "sudo apt-get -o Dpkg::Options::=\"--force-confdef\" \
             -o Dpkg::Options::=\"--force-confold\" install -y rng-tools"
                .to_string(),
        ],
        Step::PullImages => ["oxauth", "nginx"]
            .iter()
            .map(|image| {
                format!(
                    "sudo docker pull gluufederation/{image}:{}",
                    shell_quote(image_tag)
                )
            })
            .collect(),
        _ => return None,
    };
    Some(commands)
}

#[async_trait]
impl RoleSetup for HostSetup {
    async fn run_step(
        &self,
        ctx: &StepContext<'_>,
        node: &mut Node,
        step: Step,
    ) -> Result<(), StepError> {
        match step {
            Step::Create => self.create(ctx, node).await,
            Step::LaunchOverlay => self.launch_overlay(ctx, node).await,
            Step::PushDockerCert => self.push_docker_cert(ctx, node).await,
            step => {
                let commands = scripted_commands(step, &ctx.config.image_tag)
                    .ok_or(StepError::Unsupported { step, role: node.role })?;
                ctx.exec(&Target::machine(&node.name), &commands.join(" && "))
                    .await?;
                Ok(())
            }
        }
    }

    /// Host steps never wait for an agent.
    async fn probe_agent(
        &self,
        _ctx: &StepContext<'_>,
        _node: &Node,
    ) -> Result<(), StepError> {
        Ok(())
    }

    async fn release(&self, ctx: &StepContext<'_>, node: &Node) {
        let command =
            format!("docker-machine rm -y {}", shell_quote(&node.name));
        if let Err(err) = ctx.exec(&Target::Local, &command).await {
            warn!(ctx.log, "failed to remove machine"; "error" => %err);
        }
    }
}
