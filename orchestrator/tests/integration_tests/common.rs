// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared setup for the orchestration tests

use camino::Utf8PathBuf;
use camino_tempfile::Utf8TempDir;
use gluu_common::api::{
    Cluster, ClusterCreate, Node, NodeCreate, NodeRole, NodeState, Provider,
    ProviderCreate,
};
use gluu_common::steps::steps_for_role;
use gluu_datastore::{DataStore, MemoryBackend, StoreBackend};
use gluu_orchestrator::config::OrchestratorConfig;
use gluu_orchestrator::opendj;
use gluu_orchestrator::template::FsTemplateRenderer;
use gluu_orchestrator::{Orchestrator, SetupError};
use gluu_remote_exec::{FakeExecutor, FakeReply, Invocation, Target};
use gluu_test_utils::dev::{test_setup_log, LogContext};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const MASTER: &str = "gluu-master";
pub const MASTER_ADDRESS: &str = "192.168.99.100";
/// What `docker-machine ip` answers for every newly created machine.
pub const NEW_MACHINE_ADDRESS: &str = "192.168.99.101";

pub const INDEX_JSON: &str =
    r#"[{"attribute": "uid", "index": ["equality"], "backend": ["userRoot"]}]"#;
pub const DIRECTORY_CERT: &str =
    "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";
pub const OPENID_JWKS: &str = r#"{"keys": [{"kid": "1", "kty": "RSA"}]}"#;

/// Replies the way freshly provisioned machines and containers would.
pub fn default_reply(_target: &Target, command: &str) -> FakeReply {
    if let Some(rest) = command.strip_prefix("sudo docker run -d --name ") {
        let name = rest.split_whitespace().next().unwrap_or_default();
        return FakeReply::stdout(format!("{name}-cid\n"));
    }
    if command.starts_with("docker-machine ip ") {
        return FakeReply::stdout(format!("{NEW_MACHINE_ADDRESS}\n"));
    }
    if command == "supervisorctl status opendj" {
        return FakeReply::stdout("opendj RUNNING pid 42, uptime 0:00:05");
    }
    if command == format!("cat {}", opendj::INDEX_JSON) {
        return FakeReply::stdout(INDEX_JSON);
    }
    if command == opendj::OPENID_KEYGEN {
        return FakeReply::stdout(OPENID_JWKS);
    }
    if command == format!("cat {}", opendj::CERT_FILE) {
        return FakeReply::stdout(DIRECTORY_CERT);
    }
    FakeReply::success()
}

fn template_dir() -> Utf8PathBuf {
    Utf8PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("templates")
}

/// A cluster with one deployed master host, ready to run containers.
pub struct TestContext {
    pub logctx: LogContext,
    pub executor: Arc<FakeExecutor>,
    pub datastore: DataStore,
    pub orchestrator: Arc<Orchestrator>,
    pub cluster: Cluster,
    pub provider: Provider,
    pub master: Node,
    created: AtomicI64,
    _node_logs: Utf8TempDir,
}

impl TestContext {
    pub async fn new(test_name: &str) -> TestContext {
        Self::setup(test_name, |_| {}, Arc::new(MemoryBackend::new())).await
    }

    pub async fn with_config<F>(test_name: &str, tweak: F) -> TestContext
    where
        F: FnOnce(&mut OrchestratorConfig),
    {
        Self::setup(test_name, tweak, Arc::new(MemoryBackend::new())).await
    }

    pub async fn with_backend(
        test_name: &str,
        backend: Arc<dyn StoreBackend>,
    ) -> TestContext {
        Self::setup(test_name, |_| {}, backend).await
    }

    async fn setup<F>(
        test_name: &str,
        tweak: F,
        backend: Arc<dyn StoreBackend>,
    ) -> TestContext
    where
        F: FnOnce(&mut OrchestratorConfig),
    {
        let logctx = test_setup_log(test_name);
        let log = &logctx.log;
        let node_logs = Utf8TempDir::new().unwrap();
        let mut config =
            OrchestratorConfig::new(node_logs.path(), &template_dir());
        tweak(&mut config);

        let executor = FakeExecutor::new(log.clone());
        executor.set_handler(Box::new(default_reply));
        let datastore = DataStore::new(log, backend);
        let templates = Arc::new(FsTemplateRenderer::new(&config.template_dir));
        let orchestrator = Orchestrator::new(
            log,
            config,
            executor.clone().as_executor(),
            datastore.clone(),
            templates,
        );

        let cluster = Cluster::new(ClusterCreate {
            name: "test".to_string(),
            org_name: "Example Inc".to_string(),
            hostname: "ox.example.com".to_string(),
            admin_email: "admin@example.com".to_string(),
            overlay_network: "10.20.10.0/24".parse().unwrap(),
        });
        datastore.persist(&cluster).await.unwrap();
        let provider = Provider::new(ProviderCreate {
            name: "local".to_string(),
            hostname: "tcp://127.0.0.1:2376".to_string(),
            driver: "generic".to_string(),
            driver_options: BTreeMap::new(),
        });
        datastore.persist(&provider).await.unwrap();

        let mut master = Node::new(NodeCreate {
            name: MASTER.to_string(),
            cluster_id: cluster.id,
            provider_id: provider.id,
            role: NodeRole::Master,
        });
        for step in steps_for_role(NodeRole::Master) {
            master.steps.mark_done(*step);
        }
        master.state = NodeState::SetupFinished;
        master.address = Some(MASTER_ADDRESS.parse().unwrap());
        master.time_created = cluster.time_created;
        datastore.persist(&master).await.unwrap();

        TestContext {
            logctx,
            executor,
            datastore,
            orchestrator,
            cluster,
            provider,
            master,
            created: AtomicI64::new(0),
            _node_logs: node_logs,
        }
    }

    /// Adds a pending node, created after every node added before it.
    pub async fn add_node(&self, name: &str, role: NodeRole) -> Node {
        let mut node = Node::new(NodeCreate {
            name: name.to_string(),
            cluster_id: self.cluster.id,
            provider_id: self.provider.id,
            role,
        });
        let offset = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        node.time_created =
            self.cluster.time_created + chrono::Duration::seconds(offset);
        self.datastore.persist(&node).await.unwrap();
        node
    }

    pub async fn deploy(&self, node: &Node) -> Result<NodeState, SetupError> {
        self.orchestrator.deploy(node.id, &CancellationToken::new()).await
    }

    /// Adds a node and deploys it, which must succeed.
    pub async fn deployed(&self, name: &str, role: NodeRole) -> Node {
        let node = self.add_node(name, role).await;
        let state = self.deploy(&node).await.unwrap();
        assert_eq!(state, NodeState::SetupFinished);
        self.node(&node).await
    }

    /// The current record of `node`.
    pub async fn node(&self, node: &Node) -> Node {
        self.datastore.get(node.id).await.unwrap()
    }

    pub async fn cluster(&self) -> Cluster {
        self.datastore.get(self.cluster.id).await.unwrap()
    }

    /// Where commands for a deployed container node ran.
    pub fn container_target(&self, node: &Node) -> Target {
        Target::container(MASTER, node.container_id.clone().unwrap())
    }

    pub fn commands_on(&self, target: &Target) -> Vec<String> {
        self.executor
            .invocations()
            .into_iter()
            .filter(|i| &i.target == target)
            .map(|i| i.command)
            .collect()
    }

    /// Every file write to `path`, in order.
    pub fn writes_to(&self, path: &str) -> Vec<Invocation> {
        self.executor
            .invocations()
            .into_iter()
            .filter(|i| {
                i.written_path().is_some_and(|p| p.as_str() == path)
            })
            .collect()
    }

    pub fn cleanup_successful(self) {
        self.logctx.cleanup_successful();
    }
}

pub fn count_matching(commands: &[String], needle: &str) -> usize {
    commands.iter().filter(|c| c.contains(needle)).count()
}
