// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Provisioning of directory server nodes
//!
//! The first directory node of a cluster is seeded with the initial data
//! set. Every later one replicates from the oldest deployed replica instead.
//! The two never happen for the same node.

use super::{container, oxapp, RoleSetup, StepContext, StepError};
use crate::opendj;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use camino::{Utf8Path, Utf8PathBuf};
use gluu_common::api::{Node, NodeRole};
use gluu_common::steps::Step;
use gluu_remote_exec::{shell_quote, Target};
use serde::Deserialize;
use serde_json::json;
use slog::{info, warn};

/// Initial data, imported into `userRoot` in this order.
const LDIF_FILES: [&str; 8] = [
    "base.ldif",
    "appliance.ldif",
    "attributes.ldif",
    "scopes.ldif",
    "clients.ldif",
    "people.ldif",
    "groups.ldif",
    "scripts.ldif",
];

/// Application configuration stored base64-encoded in the directory, as
/// (LDIF template variable, JSON template).
const APP_CONFIGS: [(&str, &str); 7] = [
    ("oxauth_config_base64", "oxauth/oxauth-config.json"),
    ("oxauth_static_conf_base64", "oxauth/oxauth-static-conf.json"),
    ("oxauth_error_base64", "oxauth/oxauth-errors.json"),
    ("oxtrust_config_base64", "oxtrust/oxtrust-config.json"),
    ("oxtrust_cache_refresh_base64", "oxtrust/oxtrust-cache-refresh.json"),
    ("oxtrust_import_person_base64", "oxtrust/oxtrust-import-person.json"),
    ("oxidp_config_base64", "oxidp/oxidp-config.json"),
];

/// Shipped with the directory image.
const SITE_LDIF: &str = "/opt/opendj/ldif/o_site.ldif";

const INDEX_BACKENDS: [&str; 2] = ["site", "userRoot"];

const CONFIG_CHANGES: [&str; 9] = [
    "set-global-configuration-prop \
     --set single-structural-objectclass-behavior:accept",
    "set-attribute-syntax-prop --syntax-name 'Directory String' \
     --set allow-zero-length-values:true",
    "set-password-policy-prop --policy-name 'Default Password Policy' \
     --set allow-pre-encoded-passwords:true",
    "set-log-publisher-prop --publisher-name 'File-Based Audit Logger' \
     --set enabled:true",
    "create-backend --backend-name site --set base-dn:o=site \
     --type local-db --set enabled:true",
    "set-connection-handler-prop --handler-name 'LDAP Connection Handler' \
     --set enabled:false",
    r#"set-access-control-handler-prop --remove global-aci:'(targetattr!="userPassword||authPassword||changes||changeNumber||changeType||changeTime||targetDN||newRDN||newSuperior||deleteOldRDN||targetEntryUUID||changeInitiatorsName||changeLogCookie||includedAttributes")(version 3.0; acl "Anonymous read access"; allow (read,search,compare) userdn="ldap:///anyone";)'"#,
    "set-global-configuration-prop \
     --set reject-unauthenticated-requests:true",
    "set-password-policy-prop --policy-name 'Default Password Policy' \
     --set default-password-storage-scheme:'Salted SHA-512'",
];

/// Runs the key generator shipped with the image.
async fn generate_openid_keys(
    ctx: &StepContext<'_>,
    target: &Target,
) -> Result<String, StepError> {
    let output = ctx.exec(target, opendj::OPENID_KEYGEN).await?;
    if output.trim().is_empty() {
        return Err(StepError::UnexpectedOutput {
            command: opendj::OPENID_KEYGEN.to_string(),
            output,
        });
    }
    Ok(output)
}

/// One entry of the index definition file shipped with the image.
#[derive(Debug, Deserialize)]
struct IndexDefinition {
    attribute: String,
    index: Vec<String>,
    backend: Vec<String>,
}

pub struct DirectorySetup;

/// Arguments connecting an administration tool to the local server.
fn admin_args(node: &Node) -> String {
    format!(
        "--hostname {} --port {} --bindDN {} --bindPasswordFile {}",
        node.domain_name(),
        opendj::ADMIN_PORT,
        shell_quote(opendj::BIND_DN),
        opendj::password_file(),
    )
}

fn import_ldif_command(node: &Node, ldif: &str, backend: &str) -> String {
    let basename = Utf8Path::new(ldif).file_name().unwrap_or(ldif);
    format!(
        "{} --ldifFile {ldif} --backendID {backend} {} \
         --rejectFile /tmp/rejected-{basename} --append --trustAll",
        opendj::IMPORT_LDIF,
        admin_args(node),
    )
}

fn index_commands(
    node: &Node,
    definitions: &[IndexDefinition],
    backend: &str,
) -> Vec<String> {
    let mut commands = Vec::new();
    for def in definitions {
        if !def.backend.iter().any(|b| b == backend) {
            continue;
        }
        for index_type in &def.index {
            commands.push(format!(
                "{} create-local-db-index --backend-name {backend} \
                 --type generic --index-name {} --set index-type:{} \
                 --set index-entry-limit:4000 {} \
                 --trustAll --noPropertiesFile --no-prompt",
                opendj::DSCONFIG,
                shell_quote(&def.attribute),
                shell_quote(index_type),
                admin_args(node),
            ));
        }
    }
    commands
}

impl DirectorySetup {
    async fn write_password(
        &self,
        ctx: &StepContext<'_>,
        target: &Target,
    ) -> Result<(), StepError> {
        ctx.executor
            .write_file(
                target,
                opendj::password_file(),
                ctx.cluster.secrets.admin_password.as_bytes(),
            )
            .await?;
        Ok(())
    }

    async fn install_schema(
        &self,
        ctx: &StepContext<'_>,
        target: &Target,
    ) -> Result<(), StepError> {
        let dest = Utf8Path::new(opendj::SCHEMA_DIR).join("100-user.ldif");
        ctx.render_to(
            target,
            "opendj/schema/100-user.ldif",
            &dest,
            &ctx.cluster_context(),
        )
        .await
    }

    async fn install_custom_schema(
        &self,
        ctx: &StepContext<'_>,
        target: &Target,
    ) -> Result<(), StepError> {
        let Some(dir) = &ctx.config.custom_schema_dir else {
            return Ok(());
        };
        let io_err = |path: &Utf8Path| {
            let path = path.to_owned();
            move |err| StepError::Io { path, err }
        };
        let mut entries =
            tokio::fs::read_dir(dir).await.map_err(io_err(dir))?;
        let mut files = Vec::new();
        while let Some(entry) =
            entries.next_entry().await.map_err(io_err(dir))?
        {
            let Ok(path) = Utf8PathBuf::try_from(entry.path()) else {
                continue;
            };
            if path.extension() == Some("ldif") {
                files.push(path);
            }
        }
        files.sort();

        for path in files {
            let contents =
                tokio::fs::read(&path).await.map_err(io_err(&path))?;
            let Some(name) = path.file_name() else {
                continue;
            };
            let dest = Utf8Path::new(opendj::SCHEMA_DIR).join(name);
            info!(ctx.log, "installing custom schema"; "file" => name);
            ctx.executor.write_file(target, &dest, &contents).await?;
        }
        Ok(())
    }

    async fn setup_directory(
        &self,
        ctx: &StepContext<'_>,
        node: &Node,
        target: &Target,
    ) -> Result<(), StepError> {
        self.write_password(ctx, target).await?;
        let properties = json!({
            "ldap_hostname": node.domain_name(),
            "ldap_port": opendj::LDAP_PORT,
            "ldaps_port": opendj::LDAPS_PORT,
            "ldap_jmx_port": opendj::JMX_PORT,
            "ldap_admin_port": opendj::ADMIN_PORT,
            "ldap_binddn": opendj::BIND_DN,
            "ldap_pass_fn": opendj::password_file().as_str(),
            "ldap_backend_type": "local-db",
        });
        ctx.render_to(
            target,
            "opendj/opendj-setup.properties",
            Utf8Path::new(opendj::SETUP_PROPERTIES),
            &properties,
        )
        .await?;

        info!(ctx.log, "running directory server setup");
        ctx.exec(
            target,
            &format!(
                "{} --no-prompt --cli --doNotStart --acceptLicense \
                 --propertiesFilePath {}",
                opendj::SETUP,
                opendj::SETUP_PROPERTIES,
            ),
        )
        .await?;
        ctx.exec(target, opendj::DSJAVAPROPERTIES).await?;
        Ok(())
    }

    async fn configure_directory(
        &self,
        ctx: &StepContext<'_>,
        node: &Node,
        target: &Target,
    ) -> Result<(), StepError> {
        self.write_password(ctx, target).await?;
        for change in CONFIG_CHANGES {
            let command = format!(
                "{} --trustAll --no-prompt {} {change}",
                opendj::DSCONFIG,
                admin_args(node),
            );
            ctx.exec(target, &command).await?;
        }
        Ok(())
    }

    async fn index_directory(
        &self,
        ctx: &StepContext<'_>,
        node: &Node,
        target: &Target,
    ) -> Result<(), StepError> {
        self.write_password(ctx, target).await?;
        let definitions = match ctx
            .exec(target, &format!("cat {}", opendj::INDEX_JSON))
            .await
            .map(|out| serde_json::from_str::<Vec<IndexDefinition>>(&out))
        {
            Ok(Ok(definitions)) => definitions,
            Ok(Err(err)) => {
                warn!(ctx.log, "malformed index definitions"; "error" => %err);
                Vec::new()
            }
            Err(err) => {
                warn!(
                    ctx.log,
                    "unable to read index definitions";
                    "error" => %err,
                );
                Vec::new()
            }
        };
        for backend in INDEX_BACKENDS {
            for command in index_commands(node, &definitions, backend) {
                ctx.exec(target, &command).await?;
            }
        }
        Ok(())
    }

    /// Loads the initial data set into a cluster's first directory node.
    async fn seed(
        &self,
        ctx: &StepContext<'_>,
        node: &Node,
        target: &Target,
    ) -> Result<(), StepError> {
        self.write_password(ctx, target).await?;
        ctx.exec(target, &format!("mkdir -p {}", opendj::LDIF_DIR)).await?;
        let context = ctx.cluster_context();
        for file in LDIF_FILES {
            let dest = Utf8Path::new(opendj::LDIF_DIR).join(file);
            let template = format!("opendj/ldif/{file}");
            ctx.render_to(target, &template, &dest, &context).await?;
            info!(ctx.log, "importing initial data"; "file" => file);
            let command = import_ldif_command(node, dest.as_str(), "userRoot");
            ctx.exec(target, &command).await?;
        }
        self.import_scim_config(ctx, node, target).await?;
        self.import_app_config(ctx, node, target).await?;
        ctx.exec(target, &import_ldif_command(node, SITE_LDIF, "site")).await?;
        Ok(())
    }

    /// Registers the SCIM clients, each with its own key set.
    async fn import_scim_config(
        &self,
        ctx: &StepContext<'_>,
        node: &Node,
        target: &Target,
    ) -> Result<(), StepError> {
        let mut context = ctx.cluster_context();
        for client in ["scim_rs", "scim_rp"] {
            let jwks = generate_openid_keys(ctx, target).await?;
            context[format!("{client}_client_base64_jwks")] =
                json!(BASE64.encode(jwks));
        }
        self.import_rendered(ctx, node, target, "scim.ldif", &context).await
    }

    /// Stores the rendered application configuration and the server's
    /// OpenID keys.
    async fn import_app_config(
        &self,
        ctx: &StepContext<'_>,
        node: &Node,
        target: &Target,
    ) -> Result<(), StepError> {
        let mut context = ctx.cluster_context();
        for (var, template) in APP_CONFIGS {
            let contents = ctx.templates.render(template, &context)?;
            context[var] = json!(BASE64.encode(contents));
        }
        let jwks = generate_openid_keys(ctx, target).await?;
        context["oxauth_openid_key_base64"] = json!(BASE64.encode(jwks));
        self.import_rendered(ctx, node, target, "configuration.ldif", &context)
            .await
    }

    async fn import_rendered(
        &self,
        ctx: &StepContext<'_>,
        node: &Node,
        target: &Target,
        file: &str,
        context: &serde_json::Value,
    ) -> Result<(), StepError> {
        let dest = Utf8Path::new(opendj::LDIF_DIR).join(file);
        let template = format!("opendj/ldif/{file}");
        ctx.render_to(target, &template, &dest, context).await?;
        info!(ctx.log, "importing initial data"; "file" => file);
        let command = import_ldif_command(node, dest.as_str(), "userRoot");
        ctx.exec(target, &command).await?;
        Ok(())
    }

    async fn seed_or_replicate(
        &self,
        ctx: &StepContext<'_>,
        node: &Node,
        target: &Target,
    ) -> Result<(), StepError> {
        // A failed lookup must not be mistaken for "no peer": seeding a
        // second replica would fork the cluster's data.
        let peer = ctx
            .topology
            .first_peer_or_none(node.cluster_id, NodeRole::Directory, node.id)
            .await?;
        match peer {
            Some(existing) => {
                info!(
                    ctx.log,
                    "replicating from existing directory";
                    "existing" => &existing.name,
                );
                ctx.replication
                    .replicate_from(ctx.log, ctx.cluster, node, &existing)
                    .await?;
            }
            None => {
                info!(ctx.log, "first directory of cluster, seeding data");
                self.seed(ctx, node, target).await?;
            }
        }
        Ok(())
    }

    async fn export_certificate(
        &self,
        ctx: &StepContext<'_>,
        target: &Target,
    ) -> Result<(), StepError> {
        ctx.exec(
            target,
            &format!(
                "keytool -exportcert -keystore {} \
                 -storepass \"$(cat {})\" -file {} -alias server-cert -rfc",
                opendj::TRUSTSTORE,
                opendj::KEYSTORE_PIN,
                opendj::CERT_FILE,
            ),
        )
        .await?;
        Ok(())
    }

    async fn import_certificate(
        &self,
        ctx: &StepContext<'_>,
        node: &Node,
        target: &Target,
    ) -> Result<(), StepError> {
        ctx.exec(
            target,
            &format!(
                "keytool -import -trustcacerts -alias {} -file {} \
                 -keystore {} -storepass changeit -noprompt",
                shell_quote(&node.domain_name()),
                opendj::CERT_FILE,
                opendj::JAVA_TRUSTSTORE,
            ),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RoleSetup for DirectorySetup {
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
            Step::InstallSchema => self.install_schema(ctx, &target).await,
            Step::InstallCustomSchema => {
                self.install_custom_schema(ctx, &target).await
            }
            Step::SetupDirectory => {
                self.setup_directory(ctx, node, &target).await
            }
            Step::AddAutoStartup => {
                container::add_auto_startup(ctx, node, "opendj").await
            }
            Step::ReloadSupervisor => {
                container::reload_supervisor(ctx, node).await
            }
            Step::ConfigureDirectory => {
                self.configure_directory(ctx, node, &target).await
            }
            Step::IndexDirectory => {
                self.index_directory(ctx, node, &target).await
            }
            Step::SeedOrReplicate => {
                self.seed_or_replicate(ctx, node, &target).await
            }
            Step::ExportCertificate => {
                self.export_certificate(ctx, &target).await
            }
            Step::ImportCertificate => {
                self.import_certificate(ctx, node, &target).await
            }
            step => Err(StepError::Unsupported { step, role: node.role }),
        }
    }

    /// The directory server itself must be up, not just the supervisor.
    async fn probe_agent(
        &self,
        ctx: &StepContext<'_>,
        node: &Node,
    ) -> Result<(), StepError> {
        let target = ctx.target(node).await?;
        let status = ctx.exec(&target, "supervisorctl status opendj").await?;
        if !status.contains("RUNNING") {
            return Err(StepError::NotReady {
                what: format!("directory server on {}", node.name),
            });
        }
        Ok(())
    }

    async fn cleanup(
        &self,
        ctx: &StepContext<'_>,
        node: &Node,
    ) -> Result<(), StepError> {
        if node.container_id.is_none() {
            return Ok(());
        }
        let target = ctx.target(node).await?;
        ctx.executor.remove_file(&target, opendj::password_file()).await?;
        Ok(())
    }

    async fn teardown(
        &self,
        ctx: &StepContext<'_>,
        node: &Node,
    ) -> Result<(), StepError> {
        let peers = ctx
            .topology
            .finished_peers(node.cluster_id, NodeRole::Directory, Some(node.id))
            .await?;
        if peers.is_empty() || node.container_id.is_none() {
            return Ok(());
        }
        ctx.replication.disable_replication(ctx.log, ctx.cluster, node).await?;
        Ok(())
    }

    /// Federation proxies trust every directory certificate; refresh them.
    async fn notify(&self, ctx: &StepContext<'_>, _node: &Node) {
        let proxies = match ctx.finished_peers(NodeRole::FederationProxy).await
        {
            Ok(proxies) => proxies,
            Err(err) => {
                warn!(
                    ctx.log,
                    "cannot list federation proxies";
                    "error" => %err,
                );
                return;
            }
        };
        for proxy in proxies {
            if let Err(err) =
                oxapp::import_directory_certificates(ctx, &proxy).await
            {
                warn!(
                    ctx.log,
                    "failed to refresh directory certificates";
                    "node" => &proxy.name,
                    "error" => %err,
                );
            }
        }
    }
}
