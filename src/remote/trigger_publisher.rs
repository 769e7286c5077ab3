//! Provider side of a remote trigger
//!
//! Listens for registrations from members of remote workflow DONs. Once
//! enough members of a workflow DON agree on a registration, the publisher
//! registers it with the local trigger and forwards every event it produces
//! to all members of that workflow DON. Registrations that stop being
//! refreshed expire and are unregistered.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::aggregation::mode;
use super::{
    Dispatcher, METHOD_REGISTER_TRIGGER, METHOD_TRIGGER_EVENT, METHOD_UNREGISTER_TRIGGER,
    MessageBody, MessageCache, Receiver, TriggerEventMetadata, broadcast, check_sender,
};
use crate::capabilities::{
    CapabilityInfo, RemoteTriggerConfig, TriggerCapability, TriggerRegistrationRequest,
    TriggerResponse,
};
use crate::service::{BackgroundTask, Service};
use crate::topology::{Don, DonId, PeerId};
use crate::{Error, Result};

/// (caller DON id, workflow id)
type RegistrationKey = (DonId, String);

struct ActiveRegistration {
    request: TriggerRegistrationRequest,
    forwarder: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    messages: MessageCache<RegistrationKey, PeerId>,
    active: HashMap<RegistrationKey, ActiveRegistration>,
}

struct Inner {
    config: RemoteTriggerConfig,
    underlying: Arc<dyn TriggerCapability>,
    info: CapabilityInfo,
    capability_don: Don,
    workflow_dons: HashMap<DonId, Don>,
    dispatcher: Arc<dyn Dispatcher>,
    state: AsyncMutex<State>,
}

/// Exposes a local trigger to remote workflow DONs
pub struct TriggerPublisher {
    inner: Arc<Inner>,
    task: Mutex<Option<BackgroundTask>>,
}

impl TriggerPublisher {
    #[must_use]
    pub fn new(
        config: RemoteTriggerConfig,
        underlying: Arc<dyn TriggerCapability>,
        info: CapabilityInfo,
        capability_don: Don,
        workflow_dons: HashMap<DonId, Don>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                underlying,
                info,
                capability_don,
                workflow_dons,
                dispatcher,
                state: AsyncMutex::new(State::default()),
            }),
            task: Mutex::new(None),
        }
    }

    /// Number of registrations currently forwarded to remote DONs
    pub async fn active_count(&self) -> usize {
        self.inner.state.lock().await.active.len()
    }
}

impl Inner {
    fn registration_cutoff(&self) -> Option<Instant> {
        Instant::now().checked_sub(self.config.registration_expiry)
    }

    /// Resolve the caller DON and verify the sender belongs to it
    fn authorize(&self, message: &MessageBody) -> Result<(&Don, PeerId)> {
        let caller_don = self
            .workflow_dons
            .get(&message.caller_don_id)
            .ok_or_else(|| {
                Error::Unauthorized(format!(
                    "DON {} is not allowed to use {}",
                    message.caller_don_id,
                    self.info.id()
                ))
            })?;
        let sender = check_sender(message, &caller_don.members)?;
        Ok((caller_don, sender))
    }

    async fn receive(&self, message: MessageBody) {
        let (caller_don, sender) = match self.authorize(&message) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(
                    capability_id = %self.info.id(),
                    caller_don_id = message.caller_don_id,
                    error = %e,
                    "dropping registration message"
                );
                return;
            }
        };

        let request: TriggerRegistrationRequest = match serde_json::from_slice(&message.payload) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(sender = %sender, error = %e, "invalid registration payload");
                return;
            }
        };
        let key = (caller_don.id, request.metadata.workflow_id.clone());

        match message.method.as_str() {
            METHOD_REGISTER_TRIGGER => self.register(caller_don, sender, key, message).await,
            METHOD_UNREGISTER_TRIGGER => self.unregister(caller_don, sender, key).await,
            other => tracing::warn!(method = other, "trigger publisher received unsupported method"),
        }
    }

    async fn register(
        &self,
        caller_don: &Don,
        sender: PeerId,
        key: RegistrationKey,
        message: MessageBody,
    ) {
        let mut state = self.state.lock().await;
        let count = state
            .messages
            .insert(key.clone(), sender, Instant::now(), message.payload);
        tracing::debug!(
            capability_id = %self.info.id(),
            caller_don_id = key.0,
            workflow_id = %key.1,
            count,
            "received trigger registration"
        );

        if state.active.contains_key(&key) {
            return;
        }

        let min_responses = caller_don.min_responses();
        let Some(payloads) =
            state
                .messages
                .ready(&key, min_responses, self.registration_cutoff(), false)
        else {
            return;
        };

        let Some((agreed, _)) = mode(&payloads, min_responses) else {
            tracing::warn!(
                workflow_id = %key.1,
                "registrations from caller DON do not agree"
            );
            return;
        };
        let request: TriggerRegistrationRequest = match serde_json::from_slice(agreed) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "agreed registration is not decodable");
                return;
            }
        };

        match self.underlying.register_trigger(request.clone()).await {
            Ok(events) => {
                let forwarder = tokio::spawn(forward_events(
                    Arc::clone(&self.dispatcher),
                    self.info.id().to_string(),
                    self.capability_don.id,
                    caller_don.clone(),
                    key.1.clone(),
                    events,
                ));
                tracing::info!(
                    capability_id = %self.info.id(),
                    caller_don_id = key.0,
                    workflow_id = %key.1,
                    "registered remote workflow with trigger"
                );
                state.active.insert(key, ActiveRegistration { request, forwarder });
            }
            Err(e) => tracing::error!(
                capability_id = %self.info.id(),
                workflow_id = %key.1,
                error = %e,
                "failed to register with underlying trigger"
            ),
        }
    }

    async fn unregister(&self, caller_don: &Don, sender: PeerId, key: RegistrationKey) {
        let mut state = self.state.lock().await;
        state.messages.remove_sender(&key, &sender);

        let still_ready = state
            .messages
            .ready(&key, caller_don.min_responses(), self.registration_cutoff(), false)
            .is_some();
        if still_ready {
            return;
        }

        state.messages.delete(&key);
        let removed = state.active.remove(&key);
        drop(state);
        if let Some(active) = removed {
            self.deactivate(&key, active).await;
        }
    }

    async fn deactivate(&self, key: &RegistrationKey, active: ActiveRegistration) {
        active.forwarder.abort();
        if let Err(e) = self.underlying.unregister_trigger(active.request).await {
            tracing::warn!(workflow_id = %key.1, error = %e, "failed to unregister trigger");
        } else {
            tracing::info!(
                capability_id = %self.info.id(),
                caller_don_id = key.0,
                workflow_id = %key.1,
                "unregistered remote workflow"
            );
        }
    }

    async fn expire_registrations(&self) {
        let cutoff = self.registration_cutoff();
        let mut expired = Vec::new();
        {
            let mut state = self.state.lock().await;
            let keys: Vec<RegistrationKey> = state.messages.keys().cloned().collect();
            for key in keys {
                let Some(don) = self.workflow_dons.get(&key.0) else {
                    continue;
                };
                if state
                    .messages
                    .ready(&key, don.min_responses(), cutoff, false)
                    .is_some()
                {
                    continue;
                }
                state.messages.delete(&key);
                if let Some(active) = state.active.remove(&key) {
                    expired.push((key, active));
                }
            }
        }

        for (key, active) in expired {
            self.deactivate(&key, active).await;
        }
    }
}

async fn forward_events(
    dispatcher: Arc<dyn Dispatcher>,
    capability_id: String,
    capability_don_id: DonId,
    caller_don: Don,
    workflow_id: String,
    mut events: mpsc::Receiver<TriggerResponse>,
) {
    while let Some(response) = events.recv().await {
        let payload = match response.to_bytes() {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode trigger event");
                continue;
            }
        };
        let message = MessageBody {
            capability_id: capability_id.clone(),
            capability_don_id,
            caller_don_id: caller_don.id,
            method: METHOD_TRIGGER_EVENT.to_string(),
            message_id: response.event.id.as_bytes().to_vec(),
            payload,
            trigger_event: Some(TriggerEventMetadata {
                trigger_event_id: response.event.id.clone(),
                workflow_ids: vec![workflow_id.clone()],
            }),
            ..MessageBody::default()
        };
        let sent = broadcast(dispatcher.as_ref(), &caller_don.members, &message).await;
        tracing::debug!(
            event_id = %response.event.id,
            workflow_id = %workflow_id,
            sent,
            "forwarded trigger event"
        );
    }
    tracing::debug!(workflow_id = %workflow_id, "trigger event stream ended");
}

#[async_trait]
impl Receiver for TriggerPublisher {
    async fn receive(&self, message: MessageBody) {
        self.inner.receive(message).await;
    }
}

#[async_trait]
impl Service for TriggerPublisher {
    fn name(&self) -> String {
        format!("TriggerPublisher({})", self.inner.info.id())
    }

    async fn start(&self) -> Result<()> {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return Err(Error::Service(format!("{} already started", self.name())));
        }

        let inner = Arc::clone(&self.inner);
        *task = Some(BackgroundTask::spawn(|mut shutdown_rx| async move {
            let mut ticker = tokio::time::interval(inner.config.registration_refresh);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => inner.expire_registrations().await,
                }
            }
        }));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.stop().await;
        }

        let active: Vec<(RegistrationKey, ActiveRegistration)> = {
            let mut state = self.inner.state.lock().await;
            state.messages = MessageCache::new();
            state.active.drain().collect()
        };
        for (key, registration) in active {
            self.inner.deactivate(&key, registration).await;
        }
        tracing::debug!(capability_id = %self.inner.info.id(), "trigger publisher closed");
        Ok(())
    }
}
