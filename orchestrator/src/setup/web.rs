// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Provisioning of the web front end

use super::{
    container, oxapp, CertIssuer, RoleSetup, StepContext, StepError,
};
use async_trait::async_trait;
use camino::Utf8Path;
use gluu_common::api::{Node, NodeRole};
use gluu_common::steps::Step;
use gluu_remote_exec::Target;
use serde_json::json;
use slog::warn;

const TOMCAT_HTTPS_PORT: u16 = 8443;
const SITE_AVAILABLE: &str = "/etc/nginx/sites-available/gluu_https.conf";
const SITE_ENABLED: &str = "/etc/nginx/sites-enabled/gluu_https.conf";

pub struct WebSetup {
    certs: CertIssuer,
}

pub static WEB_FRONT: WebSetup = WebSetup {
    certs: CertIssuer { name: "nginx", owner: "root", keystore: false },
};

async fn backends(
    ctx: &StepContext<'_>,
    role: NodeRole,
) -> Result<Vec<String>, StepError> {
    Ok(ctx
        .finished_peers(role)
        .await?
        .iter()
        .map(|n| format!("{}:{TOMCAT_HTTPS_PORT}", n.domain_name()))
        .collect())
}

async fn render_proxy_config(
    ctx: &StepContext<'_>,
    target: &Target,
) -> Result<(), StepError> {
    let certs = &WEB_FRONT.certs;
    let context = json!({
        "hostname": ctx.cluster.hostname,
        "cert_fn": certs.cert_path(),
        "key_fn": certs.key_path(),
        "auth_servers": backends(ctx, NodeRole::AuthServer).await?,
        "trust_servers": backends(ctx, NodeRole::TrustServer).await?,
    });
    ctx.render_to(
        target,
        "nginx/gluu_https.conf",
        Utf8Path::new(SITE_AVAILABLE),
        &context,
    )
    .await?;
    ctx.exec(target, &format!("ln -sf {SITE_AVAILABLE} {SITE_ENABLED}"))
        .await?;
    Ok(())
}

/// Rewrites `web`'s proxy configuration from the current set of deployed
/// application servers and reloads it.
pub(super) async fn refresh_proxy_config(
    ctx: &StepContext<'_>,
    web: &Node,
) -> Result<(), StepError> {
    let target = ctx.target(web).await?;
    render_proxy_config(ctx, &target).await?;
    ctx.exec(&target, "nginx -s reload").await?;
    Ok(())
}

#[async_trait]
impl RoleSetup for WebSetup {
    async fn run_step(
        &self,
        ctx: &StepContext<'_>,
        node: &mut Node,
        step: Step,
    ) -> Result<(), StepError> {
        match step {
            Step::CreateContainer => container::create(ctx, node).await,
            Step::AttachOverlay => container::attach_overlay(ctx, node).await,
            Step::IssueCertificate => {
                let target = ctx.target(node).await?;
                self.certs.issue(ctx, &target, &ctx.cluster.hostname).await
            }
            Step::RenderProxyConfig => {
                let target = ctx.target(node).await?;
                render_proxy_config(ctx, &target).await
            }
            Step::AddAutoStartup => {
                container::add_auto_startup(ctx, node, "nginx").await
            }
            Step::ReloadSupervisor => {
                container::reload_supervisor(ctx, node).await
            }
            step => Err(StepError::Unsupported { step, role: node.role }),
        }
    }

    /// The oldest deployed web front is the one applications resolve the
    /// cluster hostname to. When that is this node, applications deployed
    /// before it get their hosts entry now.
    async fn notify(&self, ctx: &StepContext<'_>, node: &Node) {
        let webs = match ctx.finished_peers(NodeRole::WebFront).await {
            Ok(webs) => webs,
            Err(err) => {
                warn!(ctx.log, "cannot list web fronts"; "error" => %err);
                return;
            }
        };
        if webs.first().map(|web| web.id) == Some(node.id) {
            oxapp::point_apps_at_web_front(ctx, node).await;
        }
    }
}
