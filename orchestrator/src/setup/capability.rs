// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Capabilities shared by several roles
//!
//! Roles opt into these by holding one in their setup value rather than by
//! inheriting behavior.

use super::{StepContext, StepError};
use camino::Utf8PathBuf;
use gluu_remote_exec::{shell_quote, Target};
use slog::{info, warn};

/// Issues a self-signed certificate for one service inside a container.
#[derive(Clone, Copy, Debug)]
pub struct CertIssuer {
    /// Base name of the generated files under `/etc/certs`.
    pub name: &'static str,
    /// Account that owns the generated files.
    pub owner: &'static str,
    /// Whether to also build a PKCS12 keystore for a Java server.
    pub keystore: bool,
}

impl CertIssuer {
    pub fn cert_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("/etc/certs/{}.crt", self.name))
    }

    pub fn key_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("/etc/certs/{}.key", self.name))
    }

    pub fn keystore_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("/etc/certs/{}.jks", self.name))
    }

    fn pass_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("/tmp/{}.pass", self.name))
    }

    /// The chain of commands generating key, request, certificate and
    /// (optionally) keystore, run as one shell command.
    pub(super) fn commands(
        &self,
        org_name: &str,
        common_name: &str,
        email: &str,
    ) -> String {
        let name = self.name;
        let pass = format!("file:{}", self.pass_path());
        let subject = shell_quote(&format!(
            "/O={org_name}/CN={common_name}/emailAddress={email}"
        ));
        let mut commands = vec![
            "mkdir -p /etc/certs".to_string(),
            format!(
                "openssl genrsa -des3 -passout {pass} \
                 -out /etc/certs/{name}.key.orig 2048"
            ),
            format!(
                "openssl rsa -passin {pass} -in /etc/certs/{name}.key.orig \
                 -out /etc/certs/{name}.key"
            ),
            format!(
                "openssl req -new -key /etc/certs/{name}.key \
                 -out /etc/certs/{name}.csr -subj {subject}"
            ),
            format!(
                "openssl x509 -req -days 365 -in /etc/certs/{name}.csr \
                 -signkey /etc/certs/{name}.key -out /etc/certs/{name}.crt"
            ),
        ];
        if self.keystore {
            commands.push(format!(
                "openssl pkcs12 -export -inkey /etc/certs/{name}.key \
                 -in /etc/certs/{name}.crt -out /etc/certs/{name}.pkcs12 \
                 -name {common_name} -passout {pass}"
            ));
            commands.push(format!(
                "keytool -importkeystore -srckeystore /etc/certs/{name}.pkcs12 \
                 -srcstorepass:file {pass_file} -srcstoretype PKCS12 \
                 -destkeystore /etc/certs/{name}.jks \
                 -deststorepass:file {pass_file} -deststoretype JKS \
                 -noprompt",
                pass_file = self.pass_path(),
            ));
        }
        commands.push(format!(
            "chown {owner}:{owner} /etc/certs/{name}.*",
            owner = self.owner
        ));
        commands.join(" && ")
    }

    /// Generates the certificate on `target`, using the cluster's admin
    /// password as passphrase.
    ///
    /// The passphrase file is removed afterwards, whether or not generation
    /// succeeded.
    pub async fn issue(
        &self,
        ctx: &StepContext<'_>,
        target: &Target,
        common_name: &str,
    ) -> Result<(), StepError> {
        let cluster = ctx.cluster;
        let pass_path = self.pass_path();
        ctx.executor
            .write_file(
                target,
                &pass_path,
                cluster.secrets.admin_password.as_bytes(),
            )
            .await?;
        let result = ctx
            .exec(
                target,
                &self.commands(
                    &cluster.org_name,
                    common_name,
                    &cluster.admin_email,
                ),
            )
            .await;
        if let Err(err) = ctx.executor.remove_file(target, &pass_path).await {
            warn!(
                ctx.log,
                "failed to remove certificate passphrase";
                "path" => %pass_path,
                "error" => %err,
            );
        }
        result?;
        info!(ctx.log, "issued certificate"; "name" => self.name);
        Ok(())
    }
}

/// Maintains static name resolution entries inside a container.
#[derive(Clone, Copy, Debug)]
pub struct HostFileEditor;

impl HostFileEditor {
    /// Adds `<ip> <hostname>` to `/etc/hosts` unless the exact line exists.
    pub async fn add_entry(
        &self,
        ctx: &StepContext<'_>,
        target: &Target,
        ip: &str,
        hostname: &str,
    ) -> Result<(), StepError> {
        let line = shell_quote(&format!("{ip} {hostname}"));
        ctx.exec(
            target,
            &format!(
                "grep -qxF {line} /etc/hosts || echo {line} >> /etc/hosts"
            ),
        )
        .await?;
        Ok(())
    }
}
