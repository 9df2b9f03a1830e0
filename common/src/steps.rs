// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-role provisioning steps and the flags recording which of them are done.
//!
//! Every node role has a canonical, strictly ordered list of steps. A node's
//! [`StepFlags`] record which of those steps have completed. The next step to
//! run is always the first one in canonical order whose flag is not set, so a
//! later step never runs before an earlier one has succeeded: later steps rely
//! on the remote side effects of earlier ones.
//!
//! Flags only move from `false` to `true`.

use crate::api::NodeRole;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One provisioning action.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Step {
    // Host roles.
    Create,
    InstallConsul,
    InstallOverlay,
    OverlayPermission,
    LaunchOverlay,
    PushDockerCert,
    InstallFswatcher,
    InstallRecovery,
    InstallEntropySource,
    PullImages,

    // Steps shared by every container role.
    CreateContainer,
    AttachOverlay,
    WaitForAgent,
    AddAutoStartup,
    ReloadSupervisor,
    IssueCertificate,

    // Directory service.
    InstallSchema,
    InstallCustomSchema,
    SetupDirectory,
    ConfigureDirectory,
    IndexDirectory,
    SeedOrReplicate,
    ExportCertificate,
    ImportCertificate,

    // Java application servers.
    RenderLdapProperties,
    RenderServerXml,
    PullOverrides,
    ImportDirectoryCertificates,
    EditHostFile,

    // Web front end.
    RenderProxyConfig,
}

impl Step {
    /// Whether a failure of this step stops the orchestration run.
    ///
    /// Non-critical steps log their failure, are recorded as done, and let the
    /// run continue in a degraded configuration.
    pub fn is_critical(&self) -> bool {
        !matches!(
            self,
            Step::InstallCustomSchema
                | Step::IndexDirectory
                | Step::PullOverrides
        )
    }

    /// Whether this step is retried under the bounded agent-wait policy.
    ///
    /// Every other step is attempted exactly once per run.
    pub fn is_agent_wait(&self) -> bool {
        matches!(self, Step::WaitForAgent)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Step::Create => "create",
            Step::InstallConsul => "install-consul",
            Step::InstallOverlay => "install-overlay",
            Step::OverlayPermission => "overlay-permission",
            Step::LaunchOverlay => "launch-overlay",
            Step::PushDockerCert => "push-docker-cert",
            Step::InstallFswatcher => "install-fswatcher",
            Step::InstallRecovery => "install-recovery",
            Step::InstallEntropySource => "install-entropy-source",
            Step::PullImages => "pull-images",
            Step::CreateContainer => "create-container",
            Step::AttachOverlay => "attach-overlay",
            Step::WaitForAgent => "wait-for-agent",
            Step::AddAutoStartup => "add-auto-startup",
            Step::ReloadSupervisor => "reload-supervisor",
            Step::IssueCertificate => "issue-certificate",
            Step::InstallSchema => "install-schema",
            Step::InstallCustomSchema => "install-custom-schema",
            Step::SetupDirectory => "setup-directory",
            Step::ConfigureDirectory => "configure-directory",
            Step::IndexDirectory => "index-directory",
            Step::SeedOrReplicate => "seed-or-replicate",
            Step::ExportCertificate => "export-certificate",
            Step::ImportCertificate => "import-certificate",
            Step::RenderLdapProperties => "render-ldap-properties",
            Step::RenderServerXml => "render-server-xml",
            Step::PullOverrides => "pull-overrides",
            Step::ImportDirectoryCertificates => {
                "import-directory-certificates"
            }
            Step::EditHostFile => "edit-host-file",
            Step::RenderProxyConfig => "render-proxy-config",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

const DISCOVERY_STEPS: &[Step] = &[Step::Create, Step::InstallConsul];

const MASTER_STEPS: &[Step] = &[
    Step::Create,
    Step::InstallOverlay,
    Step::OverlayPermission,
    Step::LaunchOverlay,
    Step::PushDockerCert,
    Step::InstallFswatcher,
    Step::InstallRecovery,
    Step::InstallEntropySource,
    Step::PullImages,
];

const WORKER_STEPS: &[Step] = &[
    Step::Create,
    Step::InstallOverlay,
    Step::OverlayPermission,
    Step::LaunchOverlay,
    Step::InstallRecovery,
    Step::InstallEntropySource,
    Step::PullImages,
];

// The directory server is itself the agent we wait on, so the wait happens
// once supervisor has been told to start it.
const DIRECTORY_STEPS: &[Step] = &[
    Step::CreateContainer,
    Step::AttachOverlay,
    Step::InstallSchema,
    Step::InstallCustomSchema,
    Step::SetupDirectory,
    Step::AddAutoStartup,
    Step::ReloadSupervisor,
    Step::WaitForAgent,
    Step::ConfigureDirectory,
    Step::IndexDirectory,
    Step::SeedOrReplicate,
    Step::ExportCertificate,
    Step::ImportCertificate,
];

const AUTH_SERVER_STEPS: &[Step] = &[
    Step::CreateContainer,
    Step::AttachOverlay,
    Step::WaitForAgent,
    Step::RenderLdapProperties,
    Step::RenderServerXml,
    Step::IssueCertificate,
    Step::PullOverrides,
    Step::AddAutoStartup,
    Step::ReloadSupervisor,
];

const TRUST_SERVER_STEPS: &[Step] = &[
    Step::CreateContainer,
    Step::AttachOverlay,
    Step::WaitForAgent,
    Step::RenderLdapProperties,
    Step::RenderServerXml,
    Step::IssueCertificate,
    Step::PullOverrides,
    Step::ImportDirectoryCertificates,
    Step::EditHostFile,
    Step::AddAutoStartup,
    Step::ReloadSupervisor,
];

const FEDERATION_PROXY_STEPS: &[Step] = &[
    Step::CreateContainer,
    Step::AttachOverlay,
    Step::WaitForAgent,
    Step::RenderLdapProperties,
    Step::RenderServerXml,
    Step::IssueCertificate,
    Step::ImportDirectoryCertificates,
    Step::EditHostFile,
    Step::AddAutoStartup,
    Step::ReloadSupervisor,
];

const WEB_FRONT_STEPS: &[Step] = &[
    Step::CreateContainer,
    Step::AttachOverlay,
    Step::WaitForAgent,
    Step::IssueCertificate,
    Step::RenderProxyConfig,
    Step::AddAutoStartup,
    Step::ReloadSupervisor,
];

/// Returns the canonical step ordering for `role`.
pub fn steps_for_role(role: NodeRole) -> &'static [Step] {
    match role {
        NodeRole::Discovery => DISCOVERY_STEPS,
        NodeRole::Master => MASTER_STEPS,
        NodeRole::Worker => WORKER_STEPS,
        NodeRole::Directory => DIRECTORY_STEPS,
        NodeRole::AuthServer => AUTH_SERVER_STEPS,
        NodeRole::TrustServer => TRUST_SERVER_STEPS,
        NodeRole::FederationProxy => FEDERATION_PROXY_STEPS,
        NodeRole::WebFront => WEB_FRONT_STEPS,
    }
}

/// What the state machine says to do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NextStep {
    Run(Step),
    Complete,
}

/// Completion flags for one node, keyed by step name.
///
/// Flags for steps that are not part of the node's role are never created.
/// "Complete" is not a flag: it is derived by [`StepFlags::is_complete`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepFlags(BTreeMap<Step, bool>);

impl StepFlags {
    /// All of `role`'s steps, none completed.
    pub fn for_role(role: NodeRole) -> Self {
        StepFlags(steps_for_role(role).iter().map(|s| (*s, false)).collect())
    }

    pub fn is_done(&self, step: Step) -> bool {
        self.0.get(&step).copied().unwrap_or(false)
    }

    /// Record `step` as completed. Completed steps stay completed.
    pub fn mark_done(&mut self, step: Step) {
        self.0.insert(step, true);
    }

    /// Returns the first step of `role` that has not completed.
    pub fn next_step(&self, role: NodeRole) -> NextStep {
        steps_for_role(role)
            .iter()
            .find(|step| !self.is_done(**step))
            .map(|step| NextStep::Run(*step))
            .unwrap_or(NextStep::Complete)
    }

    /// Steps of `role` that still need to run, in execution order.
    pub fn pending(&self, role: NodeRole) -> Vec<Step> {
        steps_for_role(role)
            .iter()
            .copied()
            .filter(|step| !self.is_done(*step))
            .collect()
    }

    /// The last step, in canonical order, that has completed.
    pub fn last_completed(&self, role: NodeRole) -> Option<Step> {
        steps_for_role(role)
            .iter()
            .copied()
            .take_while(|step| self.is_done(*step))
            .last()
    }

    pub fn is_complete(&self, role: NodeRole) -> bool {
        self.next_step(role) == NextStep::Complete
    }

    pub fn iter(&self) -> impl Iterator<Item = (Step, bool)> + '_ {
        self.0.iter().map(|(step, done)| (*step, *done))
    }
}
