//! Registry of capabilities available to this node
//!
//! Holds both local capabilities and the remote shims the launcher installs,
//! plus the latest topology snapshot so callers can ask which DONs the node
//! belongs to and how a capability is configured on a DON.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::{
    Capability, CapabilityConfig, CapabilityType, ExecutableCapability, TriggerCapability,
};
use crate::topology::{Don, DonId, LocalRegistry, NodeInfo, PeerId};
use crate::{Error, Result};

/// The local node as seen by the latest topology snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalNode {
    pub peer_id: PeerId,
    pub info: NodeInfo,
    /// Workflow DON this node belongs to, if any
    pub workflow_don: Option<Don>,
    /// Other DONs this node belongs to
    pub capability_dons: Vec<Don>,
}

#[derive(Debug)]
struct LocalState {
    peer_id: PeerId,
    registry: Arc<LocalRegistry>,
}

/// Registry of capabilities keyed by fully qualified id
#[derive(Debug, Default)]
pub struct Registry {
    capabilities: RwLock<HashMap<String, Capability>>,
    local: RwLock<Option<LocalState>>,
}

impl Registry {
    /// Create a new empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a capability
    ///
    /// # Errors
    ///
    /// Returns error if the id is taken or the implementation does not
    /// satisfy the contract of its declared type
    pub async fn add(&self, capability: Capability) -> Result<()> {
        let mut capabilities = self.capabilities.write().await;
        let info = capability.info();

        if !capability.satisfies_declared_type() {
            return Err(Error::CapabilityTypeMismatch(format!(
                "{} capability {} does not satisfy the {} contract",
                info.capability_type(),
                info.id(),
                if info.capability_type().is_synchronous() {
                    "synchronous"
                } else {
                    "asynchronous"
                }
            )));
        }

        let id = info.id().to_string();
        if capabilities.contains_key(&id) {
            return Err(Error::CapabilityAlreadyExists(format!(
                "id {id} found in registry"
            )));
        }

        tracing::info!(
            id = %id,
            capability_type = %info.capability_type(),
            description = info.description(),
            version = %info.version(),
            "capability added"
        );
        capabilities.insert(id, capability);
        Ok(())
    }

    /// Get a capability by id
    ///
    /// # Errors
    ///
    /// Returns error if no capability has this id
    pub async fn get(&self, id: &str) -> Result<Capability> {
        self.capabilities
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::CapabilityNotFound(format!("capability not found with id {id}")))
    }

    /// Get a trigger capability
    ///
    /// # Errors
    ///
    /// Returns error if missing or not declared as a trigger
    pub async fn get_trigger(&self, id: &str) -> Result<Arc<dyn TriggerCapability>> {
        let cap = self.get_typed(id, CapabilityType::Trigger).await?;
        cap.as_trigger().ok_or_else(|| mismatch(id, CapabilityType::Trigger))
    }

    /// Get an action capability
    ///
    /// # Errors
    ///
    /// Returns error if missing or not declared as an action
    pub async fn get_action(&self, id: &str) -> Result<Arc<dyn ExecutableCapability>> {
        let cap = self.get_typed(id, CapabilityType::Action).await?;
        cap.as_executable().ok_or_else(|| mismatch(id, CapabilityType::Action))
    }

    /// Get a target capability
    ///
    /// # Errors
    ///
    /// Returns error if missing or not declared as a target
    pub async fn get_target(&self, id: &str) -> Result<Arc<dyn ExecutableCapability>> {
        let cap = self.get_typed(id, CapabilityType::Target).await?;
        cap.as_executable().ok_or_else(|| mismatch(id, CapabilityType::Target))
    }

    /// Get a consensus (report) capability
    ///
    /// # Errors
    ///
    /// Returns error if missing or not declared as consensus
    pub async fn get_consensus(&self, id: &str) -> Result<Arc<dyn TriggerCapability>> {
        let cap = self.get_typed(id, CapabilityType::Consensus).await?;
        cap.as_trigger().ok_or_else(|| mismatch(id, CapabilityType::Consensus))
    }

    async fn get_typed(&self, id: &str, expected: CapabilityType) -> Result<Capability> {
        let cap = self.get(id).await?;
        if cap.info().capability_type() != expected {
            return Err(mismatch(id, expected));
        }
        Ok(cap)
    }

    /// Snapshot of all registered capabilities
    pub async fn list(&self) -> Vec<Capability> {
        self.capabilities.read().await.values().cloned().collect()
    }

    /// Number of registered capabilities
    pub async fn len(&self) -> usize {
        self.capabilities.read().await.len()
    }

    /// Whether the registry is empty
    pub async fn is_empty(&self) -> bool {
        self.capabilities.read().await.is_empty()
    }

    /// Store the topology snapshot the launcher is acting on
    pub async fn set_local_registry(&self, peer_id: PeerId, registry: LocalRegistry) {
        *self.local.write().await = Some(LocalState {
            peer_id,
            registry: Arc::new(registry),
        });
    }

    /// The latest topology snapshot, if one was stored
    pub async fn local_registry(&self) -> Option<Arc<LocalRegistry>> {
        self.local
            .read()
            .await
            .as_ref()
            .map(|state| Arc::clone(&state.registry))
    }

    /// Describe the local node from the latest snapshot
    ///
    /// # Errors
    ///
    /// Returns error if no snapshot was stored or the node is not in it
    pub async fn local_node(&self) -> Result<LocalNode> {
        let local = self.local.read().await;
        let state = local
            .as_ref()
            .ok_or_else(|| Error::Config("no topology snapshot available".to_string()))?;

        let info = state
            .registry
            .ids_to_nodes
            .get(&state.peer_id)
            .cloned()
            .ok_or_else(|| Error::NodeNotFound(state.peer_id.to_string()))?;

        let mut workflow_don = None;
        let mut capability_dons = Vec::new();
        for d in state.registry.ids_to_dons.values() {
            if !d.don.contains(&state.peer_id) {
                continue;
            }
            if d.don.accepts_workflows && workflow_don.is_none() {
                workflow_don = Some(d.don.clone());
            } else {
                capability_dons.push(d.don.clone());
            }
        }

        Ok(LocalNode {
            peer_id: state.peer_id,
            info,
            workflow_don,
            capability_dons,
        })
    }

    /// Decoded configuration of a capability on a DON
    ///
    /// # Errors
    ///
    /// Returns error if the snapshot, DON or configuration is missing, or
    /// the configuration cannot be decoded
    pub async fn config_for_capability(
        &self,
        capability_id: &str,
        don_id: DonId,
    ) -> Result<CapabilityConfig> {
        let registry = self
            .local_registry()
            .await
            .ok_or_else(|| Error::Config("no topology snapshot available".to_string()))?;

        let don = registry
            .ids_to_dons
            .get(&don_id)
            .ok_or_else(|| Error::DonNotFound(don_id.to_string()))?;

        let encoded = don.capability_configurations.get(capability_id).ok_or_else(|| {
            Error::CapabilityNotFound(format!(
                "no configuration for capability {capability_id} on DON {don_id}"
            ))
        })?;

        encoded.decode()
    }
}

fn mismatch(id: &str, expected: CapabilityType) -> Error {
    Error::CapabilityTypeMismatch(format!(
        "capability with id {id} does not satisfy the {expected} capability interface"
    ))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use tokio_test::assert_ok;

    use super::*;
    use crate::capabilities::{
        BaseCapability, CapabilityInfo, CapabilityRequest, CapabilityResponse,
        TriggerRegistrationRequest, TriggerResponse,
    };
    use crate::topology::{CapabilityConfiguration, DonWithCapabilities};

    struct Exec(CapabilityInfo);

    impl BaseCapability for Exec {
        fn info(&self) -> &CapabilityInfo {
            &self.0
        }
    }

    #[async_trait]
    impl ExecutableCapability for Exec {
        async fn execute(&self, request: CapabilityRequest) -> Result<CapabilityResponse> {
            Ok(CapabilityResponse {
                value: request.inputs,
            })
        }
    }

    struct Trig(CapabilityInfo);

    impl BaseCapability for Trig {
        fn info(&self) -> &CapabilityInfo {
            &self.0
        }
    }

    #[async_trait]
    impl TriggerCapability for Trig {
        async fn register_trigger(
            &self,
            _request: TriggerRegistrationRequest,
        ) -> Result<mpsc::Receiver<TriggerResponse>> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }

        async fn unregister_trigger(&self, _request: TriggerRegistrationRequest) -> Result<()> {
            Ok(())
        }
    }

    fn exec(id: &str, ty: CapabilityType) -> Capability {
        Capability::Executable(Arc::new(Exec(CapabilityInfo::new(id, ty, "test").unwrap())))
    }

    fn trig(id: &str, ty: CapabilityType) -> Capability {
        Capability::Trigger(Arc::new(Trig(CapabilityInfo::new(id, ty, "test").unwrap())))
    }

    #[tokio::test]
    async fn add_and_get() {
        let registry = Registry::new();
        registry
            .add(exec("write-chain@1.0.0", CapabilityType::Target))
            .await
            .unwrap();

        let cap = registry.get("write-chain@1.0.0").await.unwrap();
        assert_eq!(cap.info().id(), "write-chain@1.0.0");
        assert_ok!(registry.get_target("write-chain@1.0.0").await);
    }

    #[tokio::test]
    async fn duplicate_id_fails() {
        let registry = Registry::new();
        registry
            .add(trig("streams-trigger@1.0.0", CapabilityType::Trigger))
            .await
            .unwrap();
        let err = registry
            .add(trig("streams-trigger@1.0.0", CapabilityType::Trigger))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CapabilityAlreadyExists(_)));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn contract_checked_on_insert() {
        let registry = Registry::new();
        let err = registry
            .add(trig("write-chain@1.0.0", CapabilityType::Target))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CapabilityTypeMismatch(_)));

        let err = registry
            .add(exec("streams-trigger@1.0.0", CapabilityType::Trigger))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CapabilityTypeMismatch(_)));

        // consensus uses the asynchronous contract
        registry
            .add(trig("offchain-reporting@1.0.0", CapabilityType::Consensus))
            .await
            .unwrap();
        assert_ok!(registry.get_consensus("offchain-reporting@1.0.0").await);
        assert!(!registry.is_empty().await);
    }

    #[tokio::test]
    async fn typed_accessor_mismatch() {
        let registry = Registry::new();
        registry
            .add(trig("streams-trigger@1.0.0", CapabilityType::Trigger))
            .await
            .unwrap();

        let err = registry.get_action("streams-trigger@1.0.0").await.err().unwrap();
        assert!(matches!(err, Error::CapabilityTypeMismatch(_)));
        assert!(registry.get_target("streams-trigger@1.0.0").await.is_err());
        assert!(registry.get_consensus("streams-trigger@1.0.0").await.is_err());
    }

    #[tokio::test]
    async fn missing_capability() {
        let registry = Registry::new();
        let err = registry.get("nope@1.0.0").await.unwrap_err();
        assert!(matches!(err, Error::CapabilityNotFound(_)));
    }

    #[tokio::test]
    async fn list_is_a_snapshot() {
        let registry = Registry::new();
        for i in 0..3 {
            registry
                .add(exec(&format!("action-{i}@1.0.0"), CapabilityType::Action))
                .await
                .unwrap();
        }
        let listed = registry.list().await;
        registry
            .add(exec("action-3@1.0.0", CapabilityType::Action))
            .await
            .unwrap();

        assert_eq!(listed.len(), 3);
        let mut ids: Vec<_> = listed.iter().map(|c| c.info().id().to_string()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn concurrent_adds() {
        let registry = Arc::new(Registry::new());
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    registry
                        .add(exec(&format!("action-{i}@1.0.0"), CapabilityType::Action))
                        .await
                })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(registry.len().await, 16);
    }

    fn snapshot(me: PeerId) -> LocalRegistry {
        let mut configs = BTreeMap::new();
        configs.insert(
            "write-chain@1.0.0".to_string(),
            CapabilityConfiguration {
                config: CapabilityConfig {
                    default_config: vec![9],
                    ..CapabilityConfig::default()
                }
                .encode_to_vec(),
            },
        );

        let mut dons = BTreeMap::new();
        dons.insert(
            1,
            DonWithCapabilities {
                don: Don {
                    id: 1,
                    config_version: 1,
                    f: 0,
                    members: vec![me],
                    is_public: false,
                    accepts_workflows: true,
                },
                capability_configurations: BTreeMap::new(),
            },
        );
        dons.insert(
            2,
            DonWithCapabilities {
                don: Don {
                    id: 2,
                    config_version: 1,
                    f: 0,
                    members: vec![me],
                    is_public: true,
                    accepts_workflows: false,
                },
                capability_configurations: configs,
            },
        );

        let mut nodes = HashMap::new();
        nodes.insert(
            me,
            NodeInfo {
                peer_id: me,
                signer: vec![1; 20],
                node_operator_id: 1,
                workflow_don_id: Some(1),
                capability_don_ids: vec![2],
            },
        );

        LocalRegistry {
            ids_to_dons: dons,
            ids_to_capabilities: BTreeMap::new(),
            ids_to_nodes: nodes,
        }
    }

    #[tokio::test]
    async fn local_node_from_snapshot() {
        let me = PeerId([5; 32]);
        let registry = Registry::new();
        assert!(registry.local_node().await.is_err());

        registry.set_local_registry(me, snapshot(me)).await;
        let node = registry.local_node().await.unwrap();
        assert_eq!(node.workflow_don.map(|d| d.id), Some(1));
        assert_eq!(
            node.capability_dons.iter().map(|d| d.id).collect::<Vec<_>>(),
            vec![2]
        );
    }

    #[tokio::test]
    async fn unknown_local_node() {
        let registry = Registry::new();
        registry
            .set_local_registry(PeerId([6; 32]), snapshot(PeerId([5; 32])))
            .await;
        let err = registry.local_node().await.unwrap_err();
        assert!(matches!(err, Error::NodeNotFound(_)));
    }

    #[tokio::test]
    async fn config_lookup() {
        let me = PeerId([5; 32]);
        let registry = Registry::new();
        registry.set_local_registry(me, snapshot(me)).await;

        let config = registry
            .config_for_capability("write-chain@1.0.0", 2)
            .await
            .unwrap();
        assert_eq!(config.default_config, vec![9]);

        assert!(matches!(
            registry.config_for_capability("write-chain@1.0.0", 7).await,
            Err(Error::DonNotFound(_))
        ));
        assert!(matches!(
            registry.config_for_capability("other@1.0.0", 2).await,
            Err(Error::CapabilityNotFound(_))
        ));
    }
}
