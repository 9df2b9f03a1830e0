// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Provisioning of the Java application servers: authorization server,
//! trust manager and federation proxy

use super::{
    container, web, CertIssuer, HostFileEditor, RoleSetup, StepContext,
    StepError,
};
use crate::opendj;
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use gluu_common::api::{Node, NodeRole};
use gluu_common::steps::Step;
use gluu_remote_exec::{shell_quote, Target};
use serde_json::json;
use slog::{debug, info, warn};

const TOMCAT_CONF_DIR: &str = "/opt/tomcat/conf";
const WEBAPPS_DIR: &str = "/var/gluu/webapps";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OxApp {
    Auth,
    Trust,
    Federation,
}

impl OxApp {
    /// Name of the web application, also used for its certificate and its
    /// override directory.
    pub fn name(&self) -> &'static str {
        match self {
            OxApp::Auth => "oxauth",
            OxApp::Trust => "oxtrust",
            OxApp::Federation => "oxidp",
        }
    }
}

pub struct OxAppSetup {
    app: OxApp,
    certs: CertIssuer,
    hosts: Option<HostFileEditor>,
}

pub static AUTH_SERVER: OxAppSetup = OxAppSetup {
    app: OxApp::Auth,
    certs: CertIssuer { name: "oxauth", owner: "tomcat", keystore: true },
    hosts: None,
};

pub static TRUST_SERVER: OxAppSetup = OxAppSetup {
    app: OxApp::Trust,
    certs: CertIssuer { name: "oxtrust", owner: "tomcat", keystore: true },
    hosts: Some(HostFileEditor),
};

pub static FEDERATION_PROXY: OxAppSetup = OxAppSetup {
    app: OxApp::Federation,
    certs: CertIssuer { name: "oxidp", owner: "tomcat", keystore: true },
    hosts: Some(HostFileEditor),
};

/// Makes every deployed directory's certificate trusted on `node`.
pub(super) async fn import_directory_certificates(
    ctx: &StepContext<'_>,
    node: &Node,
) -> Result<(), StepError> {
    let target = ctx.target(node).await?;
    for directory in ctx.finished_peers(NodeRole::Directory).await? {
        let domain = directory.domain_name();
        let source = ctx.target(&directory).await?;
        let cert =
            ctx.exec(&source, &format!("cat {}", opendj::CERT_FILE)).await?;
        let dest = Utf8PathBuf::from(format!("/etc/certs/{domain}_opendj.crt"));
        ctx.executor.write_file(&target, &dest, cert.as_bytes()).await?;

        let alias = shell_quote(&format!("{domain}_opendj"));
        ctx.exec(
            &target,
            &format!(
                "keytool -delete -alias {alias} -keystore {ks} \
                 -storepass changeit >/dev/null 2>&1; \
                 keytool -import -trustcacerts -alias {alias} -file {dest} \
                 -keystore {ks} -storepass changeit -noprompt",
                ks = opendj::JAVA_TRUSTSTORE,
            ),
        )
        .await?;
        debug!(
            ctx.log,
            "trusted directory certificate";
            "directory" => &domain,
        );
    }
    Ok(())
}

impl OxAppSetup {
    async fn render_ldap_properties(
        &self,
        ctx: &StepContext<'_>,
        target: &Target,
    ) -> Result<(), StepError> {
        let directories = ctx.finished_peers(NodeRole::Directory).await?;
        if directories.is_empty() {
            return Err(StepError::MissingPeer {
                role: NodeRole::Directory,
                cluster_id: ctx.cluster.id,
            });
        }
        let hosts = directories
            .iter()
            .map(|d| format!("{}:{}", d.domain_name(), opendj::LDAPS_PORT))
            .collect::<Vec<_>>()
            .join(",");
        let context = json!({
            "ldap_binddn": opendj::BIND_DN,
            "ldap_password": ctx.cluster.secrets.admin_password,
            "ldap_hosts": hosts,
            "inum_appliance": ctx.cluster.secrets.inum_appliance,
        });
        let dest = Utf8Path::new(TOMCAT_CONF_DIR).join("ox-ldap.properties");
        ctx.render_to(target, "_shared/ox-ldap.properties", &dest, &context)
            .await
    }

    async fn render_server_xml(
        &self,
        ctx: &StepContext<'_>,
        target: &Target,
    ) -> Result<(), StepError> {
        let context = json!({
            "keystore_fn": self.certs.keystore_path(),
            "keystore_pass": ctx.cluster.secrets.admin_password,
        });
        let dest = Utf8Path::new(TOMCAT_CONF_DIR).join("server.xml");
        ctx.render_to(target, "_shared/server.xml", &dest, &context).await
    }

    /// Copies the operator's customized web resources into the container,
    /// keeping their layout below the application's directory.
    async fn pull_overrides(
        &self,
        ctx: &StepContext<'_>,
        target: &Target,
    ) -> Result<(), StepError> {
        let Some(root) = &ctx.config.override_dir else {
            return Ok(());
        };
        let root = root.join(self.app.name());
        if !tokio::fs::try_exists(&root).await.unwrap_or(false) {
            debug!(ctx.log, "no overrides"; "dir" => %root);
            return Ok(());
        }
        let dest_root = Utf8Path::new(WEBAPPS_DIR).join(self.app.name());

        let mut files = Vec::new();
        let mut dirs = vec![root.clone()];
        while let Some(dir) = dirs.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|err| StepError::Io { path: dir.clone(), err })?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|err| StepError::Io { path: dir.clone(), err })?
            {
                let Ok(path) = Utf8PathBuf::try_from(entry.path()) else {
                    continue;
                };
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|err| StepError::Io { path: path.clone(), err })?;
                if file_type.is_dir() {
                    dirs.push(path);
                } else {
                    files.push(path);
                }
            }
        }
        files.sort();

        for src in files {
            let Ok(relative) = src.strip_prefix(&root) else {
                continue;
            };
            let dest = dest_root.join(relative);
            if let Some(parent) = dest.parent() {
                let command =
                    format!("mkdir -p {}", shell_quote(parent.as_str()));
                ctx.exec(target, &command).await?;
            }
            let contents = tokio::fs::read(&src)
                .await
                .map_err(|err| StepError::Io { path: src.clone(), err })?;
            debug!(ctx.log, "copying override"; "src" => %src, "dest" => %dest);
            ctx.executor.write_file(target, &dest, &contents).await?;
        }
        Ok(())
    }

    /// Points the cluster hostname at the web front so the application can
    /// reach its own public endpoints.
    ///
    /// Without a deployed web front there is nothing to point at yet; the
    /// entry is added once one is deployed, see [`point_apps_at_web_front`].
    async fn edit_host_file(
        &self,
        ctx: &StepContext<'_>,
        target: &Target,
    ) -> Result<(), StepError> {
        let Some(editor) = self.hosts else {
            return Ok(());
        };
        let webs = ctx.finished_peers(NodeRole::WebFront).await?;
        let Some(web) = webs.first() else {
            info!(ctx.log, "no web front deployed yet, deferring hosts entry");
            return Ok(());
        };
        editor
            .add_entry(ctx, target, &web.domain_name(), &ctx.cluster.hostname)
            .await
    }
}

/// Adds the hosts entry for `web` to every deployed application that needs
/// one. Failures are logged per node.
pub(super) async fn point_apps_at_web_front(ctx: &StepContext<'_>, web: &Node) {
    for role in [NodeRole::TrustServer, NodeRole::FederationProxy] {
        let apps = match ctx.finished_peers(role).await {
            Ok(apps) => apps,
            Err(err) => {
                warn!(ctx.log, "cannot list {role} nodes"; "error" => %err);
                continue;
            }
        };
        for app in apps {
            info!(
                ctx.log,
                "adding hosts entry for web front";
                "app" => &app.name,
                "web" => &web.name,
            );
            let result = match ctx.target(&app).await {
                Ok(target) => {
                    HostFileEditor
                        .add_entry(
                            ctx,
                            &target,
                            &web.domain_name(),
                            &ctx.cluster.hostname,
                        )
                        .await
                }
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                warn!(
                    ctx.log,
                    "failed to add hosts entry";
                    "app" => &app.name,
                    "error" => %err,
                );
            }
        }
    }
}

#[async_trait]
impl RoleSetup for OxAppSetup {
    async fn run_step(
        &self,
        ctx: &StepContext<'_>,
        node: &mut Node,
        step: Step,
    ) -> Result<(), StepError> {
        match step {
            Step::CreateContainer => return container::create(ctx, node).await,
            Step::AttachOverlay => {
                return container::attach_overlay(ctx, node).await
            }
            _ => {}
        }

        let target = ctx.target(node).await?;
        match step {
            Step::RenderLdapProperties => {
                self.render_ldap_properties(ctx, &target).await
            }
            Step::RenderServerXml => self.render_server_xml(ctx, &target).await,
            Step::IssueCertificate => {
                self.certs.issue(ctx, &target, &ctx.cluster.hostname).await
            }
            Step::PullOverrides => self.pull_overrides(ctx, &target).await,
            Step::ImportDirectoryCertificates => {
                import_directory_certificates(ctx, node).await
            }
            Step::EditHostFile => self.edit_host_file(ctx, &target).await,
            Step::AddAutoStartup => {
                container::add_auto_startup(ctx, node, "tomcat").await
            }
            Step::ReloadSupervisor => {
                container::reload_supervisor(ctx, node).await
            }
            step => Err(StepError::Unsupported { step, role: node.role }),
        }
    }

    /// The web front proxies to authorization and trust servers.
    async fn notify(&self, ctx: &StepContext<'_>, node: &Node) {
        if self.app == OxApp::Federation {
            return;
        }
        let webs = match ctx.finished_peers(NodeRole::WebFront).await {
            Ok(webs) => webs,
            Err(err) => {
                warn!(ctx.log, "cannot list web fronts"; "error" => %err);
                return;
            }
        };
        for web in webs {
            info!(
                ctx.log,
                "refreshing proxy configuration";
                "web" => &web.name,
                "changed" => &node.name,
            );
            if let Err(err) = web::refresh_proxy_config(ctx, &web).await {
                warn!(
                    ctx.log,
                    "failed to refresh proxy configuration";
                    "web" => &web.name,
                    "error" => %err,
                );
            }
        }
    }
}
