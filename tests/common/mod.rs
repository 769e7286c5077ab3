//! Shared test utilities

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use don_capabilities::capabilities::CapabilityConfig;
use don_capabilities::remote::LoopbackDispatcher;
use don_capabilities::topology::{
    CapabilityConfiguration, CapabilityDescriptor, DonWithCapabilities, NodeInfo,
};
use don_capabilities::{
    BaseCapability, CapabilityInfo, CapabilityRequest, CapabilityResponse, CapabilityType,
    ConnectionManager, Dispatcher, Don, DonId, ExecutableCapability, Launcher, LauncherConfig,
    LocalRegistry, LoopbackNetwork, PeerId, Registry,
};

/// Deterministic peer id
#[must_use]
pub fn peer(n: u8) -> PeerId {
    PeerId([n; 32])
}

#[must_use]
pub fn don(id: DonId, members: &[PeerId], f: u8, is_public: bool, accepts_workflows: bool) -> Don {
    Don {
        id,
        config_version: 1,
        f,
        members: members.to_vec(),
        is_public,
        accepts_workflows,
    }
}

/// Builds `LocalRegistry` snapshots
#[derive(Default)]
pub struct TopologyBuilder {
    registry: LocalRegistry,
}

impl TopologyBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a DON serving `capabilities` with the given decoded configs
    #[must_use]
    pub fn don(mut self, don: Don, capabilities: &[(&str, CapabilityConfig)]) -> Self {
        let capability_configurations: BTreeMap<String, CapabilityConfiguration> = capabilities
            .iter()
            .map(|(id, config)| {
                (
                    (*id).to_string(),
                    CapabilityConfiguration {
                        config: config.encode_to_vec(),
                    },
                )
            })
            .collect();
        for member in &don.members {
            self = self.node(*member);
        }
        self.registry.ids_to_dons.insert(
            don.id,
            DonWithCapabilities {
                don,
                capability_configurations,
            },
        );
        self
    }

    #[must_use]
    pub fn capability(mut self, id: &str, capability_type: CapabilityType) -> Self {
        self.registry.ids_to_capabilities.insert(
            id.to_string(),
            CapabilityDescriptor {
                id: id.to_string(),
                capability_type,
                config_contract: None,
            },
        );
        self
    }

    /// Register node info; the signer is the first byte of the peer id
    #[must_use]
    pub fn node(mut self, peer_id: PeerId) -> Self {
        self.registry
            .ids_to_nodes
            .entry(peer_id)
            .or_insert_with(|| NodeInfo {
                peer_id,
                signer: vec![peer_id.as_bytes()[0]; 20],
                node_operator_id: 0,
                workflow_don_id: None,
                capability_don_ids: Vec::new(),
            });
        self
    }

    #[must_use]
    pub fn without_node(mut self, peer_id: PeerId) -> Self {
        self.registry.ids_to_nodes.remove(&peer_id);
        self
    }

    #[must_use]
    pub fn build(self) -> LocalRegistry {
        self.registry
    }
}

/// One node attached to a loopback network
pub struct TestNode {
    pub peer_id: PeerId,
    pub dispatcher: Arc<LoopbackDispatcher>,
    pub registry: Arc<Registry>,
    pub launcher: Launcher,
}

impl TestNode {
    #[must_use]
    pub fn new(network: &Arc<LoopbackNetwork>, peer_id: PeerId) -> Self {
        let dispatcher = network.join(peer_id);
        let registry = Arc::new(Registry::new());
        let launcher = Launcher::new(
            peer_id,
            Arc::clone(&registry),
            Arc::clone(&dispatcher) as Arc<dyn Dispatcher>,
            Arc::clone(&dispatcher) as Arc<dyn ConnectionManager>,
            LauncherConfig {
                target_request_timeout: Duration::from_secs(5),
                ..LauncherConfig::default()
            },
        );
        Self {
            peer_id,
            dispatcher,
            registry,
            launcher,
        }
    }
}

/// Target that echoes its inputs and counts executions
pub struct EchoTarget {
    info: CapabilityInfo,
    pub calls: AtomicUsize,
}

impl EchoTarget {
    #[must_use]
    pub fn new(id: &str) -> Self {
        Self {
            info: CapabilityInfo::new(id, CapabilityType::Target, "echo").unwrap(),
            calls: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl BaseCapability for EchoTarget {
    fn info(&self) -> &CapabilityInfo {
        &self.info
    }
}

#[async_trait]
impl ExecutableCapability for EchoTarget {
    async fn execute(
        &self,
        request: CapabilityRequest,
    ) -> don_capabilities::Result<CapabilityResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(CapabilityResponse {
            value: request.inputs,
        })
    }
}

/// Poll `check` until it holds or `timeout` elapses
pub async fn wait_for<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
