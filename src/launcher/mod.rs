//! Turns topology snapshots into live remote shims
//!
//! For each snapshot the launcher:
//!
//! 1. classifies every DON relative to the local node ([`plan`])
//! 2. pushes the peer set to the transport
//! 3. installs consumer shims for capabilities served by remote DONs
//! 4. installs provider shims for capabilities this node serves to
//!    remote workflow DONs
//!
//! Re-launching with the same snapshot is a no-op: shims already in the
//! registry or already receiving on the dispatcher are left alone.

pub mod plan;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::capabilities::{
    Capability, CapabilityConfig, CapabilityInfo, CapabilityType, ExecutableCapability, Registry,
    RemoteTriggerConfig, TriggerCapability,
};
use crate::remote::target_client::DEFAULT_REQUEST_TIMEOUT;
use crate::remote::{
    ConnectionManager, Dispatcher, Receiver, StreamConfig, TargetClient, TargetServer,
    TriggerPublisher, TriggerSubscriber,
};
use crate::service::Service;
use crate::streams::{MercuryRemoteAggregator, STREAMS_TRIGGER_PREFIX};
use crate::topology::{Don, DonId, DonWithCapabilities, PeerId, TopologySnapshot};
use crate::{Error, Result};

pub use plan::{LaunchPlan, plan};

/// Defaults handed to every shim the launcher builds
#[derive(Debug, Clone, PartialEq)]
pub struct LauncherConfig {
    /// Stream settings applied to every peer
    pub stream: StreamConfig,
    /// How long a remote target call may take
    pub target_request_timeout: Duration,
    /// Fallbacks for unset remote trigger settings
    pub trigger_defaults: RemoteTriggerConfig,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            stream: StreamConfig::default(),
            target_request_timeout: DEFAULT_REQUEST_TIMEOUT,
            trigger_defaults: RemoteTriggerConfig::default(),
        }
    }
}

/// Installs and owns the remote shims for one node
pub struct Launcher {
    peer_id: PeerId,
    registry: Arc<Registry>,
    dispatcher: Arc<dyn Dispatcher>,
    connections: Arc<dyn ConnectionManager>,
    config: LauncherConfig,
    services: Mutex<Vec<Arc<dyn Service>>>,
    launching: Mutex<()>,
}

impl Launcher {
    #[must_use]
    pub fn new(
        peer_id: PeerId,
        registry: Arc<Registry>,
        dispatcher: Arc<dyn Dispatcher>,
        connections: Arc<dyn ConnectionManager>,
        config: LauncherConfig,
    ) -> Self {
        Self {
            peer_id,
            registry,
            dispatcher,
            connections,
            config,
            services: Mutex::new(Vec::new()),
            launching: Mutex::new(()),
        }
    }

    #[must_use]
    pub const fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Number of shims started so far
    pub async fn service_count(&self) -> usize {
        self.services.lock().await.len()
    }

    /// Resolve `snapshot` and install whatever shims are missing
    ///
    /// # Errors
    ///
    /// Returns error if the transport rejects the peer set, the node is in
    /// more than one workflow DON, or a shim cannot be built or installed.
    /// Shims installed before the failure stay in place.
    pub async fn launch<S: TopologySnapshot + ?Sized>(&self, snapshot: &S) -> Result<()> {
        let _guard = self.launching.lock().await;

        let plan = plan(snapshot, self.peer_id);
        let peers: HashMap<PeerId, StreamConfig> = plan
            .all_peers
            .iter()
            .map(|p| (*p, self.config.stream))
            .collect();
        self.connections.update_connections(peers).await?;

        let workflow_don = plan.workflow_don()?;
        self.registry
            .set_local_registry(self.peer_id, snapshot.to_local_registry())
            .await;
        tracing::info!(
            peer_id = %self.peer_id,
            dons = plan.don_ids.len(),
            peers = plan.all_peers.len(),
            workflow_don = ?workflow_don.map(|d| d.id),
            capability_dons = plan.my_capability_dons.len(),
            "launching capabilities from topology"
        );

        if let Some(my_workflow_don) = workflow_don {
            for remote_don in &plan.remote_capability_dons {
                self.add_remote_capabilities(snapshot, my_workflow_don, remote_don)
                    .await?;
            }
        }

        if !plan.my_capability_dons.is_empty() {
            let workflow_dons: HashMap<DonId, Don> = plan
                .remote_workflow_dons
                .iter()
                .map(|d| (d.id, d.clone()))
                .collect();
            for my_don in &plan.my_capability_dons {
                self.expose_capabilities(snapshot, my_don, &workflow_dons)
                    .await?;
            }
        }

        Ok(())
    }

    /// Consumer side: proxy every capability `remote` serves
    async fn add_remote_capabilities<S: TopologySnapshot + ?Sized>(
        &self,
        snapshot: &S,
        my_don: &Don,
        remote: &DonWithCapabilities,
    ) -> Result<()> {
        for (capability_id, encoded) in &remote.capability_configurations {
            let capability_type = capability_type_of(snapshot, capability_id)?;
            let config = encoded.decode()?;
            let info = CapabilityInfo::new_remote(
                capability_id.as_str(),
                capability_type,
                format!("Remote Capability for {capability_id}"),
                remote.don.clone(),
            )?;

            match capability_type {
                CapabilityType::Trigger => {
                    if !capability_id.starts_with(STREAMS_TRIGGER_PREFIX) {
                        return Err(Error::Unsupported(format!(
                            "remote trigger {capability_id} is not supported"
                        )));
                    }
                    let shim = self.trigger_subscriber(snapshot, info, my_don, remote, &config)?;
                    self.install_consumer(
                        Capability::Trigger(Arc::clone(&shim) as Arc<dyn TriggerCapability>),
                        Arc::clone(&shim) as Arc<dyn Receiver>,
                        shim,
                        remote.don.id,
                    )
                    .await?;
                }
                CapabilityType::Target => {
                    let shim = Arc::new(TargetClient::new(
                        info,
                        remote.don.clone(),
                        my_don.clone(),
                        Arc::clone(&self.dispatcher),
                        self.config.target_request_timeout,
                    ));
                    self.install_consumer(
                        Capability::Executable(Arc::clone(&shim) as Arc<dyn ExecutableCapability>),
                        Arc::clone(&shim) as Arc<dyn Receiver>,
                        shim,
                        remote.don.id,
                    )
                    .await?;
                }
                CapabilityType::Action | CapabilityType::Consensus => {
                    tracing::warn!(
                        capability_id = %capability_id,
                        capability_type = %capability_type,
                        don_id = remote.don.id,
                        "no remote shim for capability type, skipping"
                    );
                }
            }
        }
        Ok(())
    }

    fn trigger_subscriber<S: TopologySnapshot + ?Sized>(
        &self,
        snapshot: &S,
        info: CapabilityInfo,
        my_don: &Don,
        remote: &DonWithCapabilities,
        config: &CapabilityConfig,
    ) -> Result<Arc<TriggerSubscriber>> {
        let mut signers = Vec::with_capacity(remote.don.members.len());
        for member in &remote.don.members {
            let node = snapshot
                .node(member)
                .ok_or_else(|| Error::NodeNotFound(member.to_string()))?;
            signers.push(node.signer.clone());
        }
        let min_responses = remote.don.min_responses();
        let aggregator = MercuryRemoteAggregator::new(signers, min_responses);

        let mut trigger_config = self.trigger_config(config.remote_trigger_config.clone());
        trigger_config.min_responses_to_aggregate = u32::try_from(min_responses).unwrap_or(u32::MAX);

        Ok(Arc::new(TriggerSubscriber::new(
            trigger_config,
            info,
            remote.don.clone(),
            my_don.clone(),
            Arc::clone(&self.dispatcher),
            Arc::new(aggregator),
        )))
    }

    fn trigger_config(&self, configured: Option<RemoteTriggerConfig>) -> RemoteTriggerConfig {
        let defaults = &self.config.trigger_defaults;
        configured.map_or_else(|| defaults.clone(), |c| c.with_defaults(defaults))
    }

    /// Wire a consumer shim: receiver first, then start, then publish it in
    /// the registry. A failure at any step undoes the earlier ones so a later
    /// pass can retry.
    async fn install_consumer(
        &self,
        capability: Capability,
        receiver: Arc<dyn Receiver>,
        service: Arc<dyn Service>,
        don_id: DonId,
    ) -> Result<()> {
        let capability_id = capability.info().id().to_string();

        if self.registry.get(&capability_id).await.is_ok() {
            tracing::debug!(
                capability_id = %capability_id,
                don_id,
                "capability already exists, skipping"
            );
            return Ok(());
        }
        if !self.set_receiver(&capability_id, don_id, receiver)? {
            return Ok(());
        }

        if let Err(e) = service.start().await {
            self.dispatcher.remove_receiver(&capability_id, don_id);
            return Err(e);
        }

        if let Err(e) = self.registry.add(capability).await {
            if let Err(close_err) = service.close().await {
                tracing::warn!(service = %service.name(), error = %close_err, "failed to close shim");
            }
            self.dispatcher.remove_receiver(&capability_id, don_id);
            return match e {
                Error::CapabilityAlreadyExists(_) => {
                    tracing::debug!(
                        capability_id = %capability_id,
                        don_id,
                        "capability already exists, skipping"
                    );
                    Ok(())
                }
                e => Err(e),
            };
        }

        self.track_shim(service).await;
        Ok(())
    }

    /// Provider side: expose every capability `my_don` serves
    async fn expose_capabilities<S: TopologySnapshot + ?Sized>(
        &self,
        snapshot: &S,
        my_don: &DonWithCapabilities,
        workflow_dons: &HashMap<DonId, Don>,
    ) -> Result<()> {
        for (capability_id, encoded) in &my_don.capability_configurations {
            let capability_type = capability_type_of(snapshot, capability_id)?;
            let config = encoded.decode()?;
            let info = CapabilityInfo::new_remote(
                capability_id.as_str(),
                capability_type,
                format!("Remote Capability for {capability_id}"),
                my_don.don.clone(),
            )?;

            match capability_type {
                CapabilityType::Trigger => {
                    let underlying = self.registry.get_trigger(capability_id).await?;
                    let trigger_config = self.trigger_config(config.remote_trigger_config);
                    let shim = Arc::new(TriggerPublisher::new(
                        trigger_config,
                        underlying,
                        info,
                        my_don.don.clone(),
                        workflow_dons.clone(),
                        Arc::clone(&self.dispatcher),
                    ));
                    self.install_provider(capability_id, my_don.don.id, shim).await?;
                }
                CapabilityType::Target => {
                    let underlying = self.registry.get_target(capability_id).await?;
                    let excluded = config
                        .remote_target_config
                        .map(|c| c.request_hash_excluded_attributes)
                        .unwrap_or_default();
                    let shim = Arc::new(TargetServer::new(
                        info,
                        my_don.don.clone(),
                        workflow_dons.clone(),
                        underlying,
                        Arc::clone(&self.dispatcher),
                        self.config.target_request_timeout,
                        excluded,
                    ));
                    self.install_provider(capability_id, my_don.don.id, shim).await?;
                }
                CapabilityType::Action | CapabilityType::Consensus => {
                    tracing::warn!(
                        capability_id = %capability_id,
                        capability_type = %capability_type,
                        don_id = my_don.don.id,
                        "cannot expose capability type remotely, skipping"
                    );
                }
            }
        }
        Ok(())
    }

    async fn install_provider<T>(&self, capability_id: &str, don_id: DonId, shim: Arc<T>) -> Result<()>
    where
        T: Receiver + Service + 'static,
    {
        if !self.set_receiver(capability_id, don_id, Arc::clone(&shim) as Arc<dyn Receiver>)? {
            return Ok(());
        }
        if let Err(e) = shim.start().await {
            self.dispatcher.remove_receiver(capability_id, don_id);
            return Err(e);
        }
        self.track_shim(shim).await;
        Ok(())
    }

    /// Returns `false` if a receiver was already installed by an earlier pass
    fn set_receiver(
        &self,
        capability_id: &str,
        don_id: DonId,
        receiver: Arc<dyn Receiver>,
    ) -> Result<bool> {
        match self.dispatcher.set_receiver(capability_id, don_id, receiver) {
            Ok(()) => Ok(true),
            Err(Error::ReceiverExists(_)) => {
                tracing::debug!(
                    capability_id = %capability_id,
                    don_id,
                    "receiver already exists, skipping"
                );
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn track_shim(&self, service: Arc<dyn Service>) {
        tracing::info!(service = %service.name(), "started remote shim");
        self.services.lock().await.push(service);
    }
}

fn capability_type_of<S: TopologySnapshot + ?Sized>(
    snapshot: &S,
    capability_id: &str,
) -> Result<CapabilityType> {
    snapshot
        .capability(capability_id)
        .map(|c| c.capability_type)
        .ok_or_else(|| {
            Error::CapabilityNotFound(format!("capability not found for id {capability_id}"))
        })
}

#[async_trait]
impl Service for Launcher {
    fn name(&self) -> String {
        "Launcher".to_string()
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Stop every shim in start order, then drop all connections
    async fn close(&self) -> Result<()> {
        let services: Vec<Arc<dyn Service>> = self.services.lock().await.drain(..).collect();
        for service in services {
            if let Err(e) = service.close().await {
                tracing::error!(service = %service.name(), error = %e, "failed to close shim");
            }
        }
        self.connections.update_connections(HashMap::new()).await
    }
}
