//! Consumer side of a remote trigger
//!
//! Local workflows register here as if the trigger were local. The
//! subscriber keeps their registrations alive on every member of the remote
//! capability DON, collects the events those members publish, and hands each
//! event to the workflow once enough members reported it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;

use super::{
    Aggregator, Dispatcher, METHOD_REGISTER_TRIGGER, METHOD_TRIGGER_EVENT,
    METHOD_UNREGISTER_TRIGGER, MessageBody, MessageCache, Receiver, broadcast, check_sender,
};
use crate::capabilities::{
    BaseCapability, CapabilityInfo, RemoteTriggerConfig, TriggerCapability,
    TriggerRegistrationRequest, TriggerResponse,
};
use crate::service::{BackgroundTask, Service};
use crate::topology::{Don, PeerId};
use crate::{Error, Result};

/// Capacity of each workflow's event queue
const DEFAULT_SEND_CHANNEL_BUFFER_SIZE: usize = 1000;

/// (trigger event id, workflow id)
type EventKey = (String, String);

struct Registration {
    payload: Vec<u8>,
    callback: mpsc::Sender<TriggerResponse>,
}

#[derive(Default)]
struct State {
    registrations: HashMap<String, Registration>,
    messages: MessageCache<EventKey, PeerId>,
}

struct Inner {
    config: RemoteTriggerConfig,
    info: CapabilityInfo,
    capability_don: Don,
    local_don: Don,
    dispatcher: Arc<dyn Dispatcher>,
    aggregator: Arc<dyn Aggregator>,
    state: Mutex<State>,
}

/// Proxy for a trigger served by a remote DON
pub struct TriggerSubscriber {
    inner: Arc<Inner>,
    task: Mutex<Option<BackgroundTask>>,
}

impl TriggerSubscriber {
    /// Create a subscriber for `info`, served by `capability_don`, on behalf
    /// of the workflow DON `local_don`
    #[must_use]
    pub fn new(
        config: RemoteTriggerConfig,
        info: CapabilityInfo,
        capability_don: Don,
        local_don: Don,
        dispatcher: Arc<dyn Dispatcher>,
        aggregator: Arc<dyn Aggregator>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                info,
                capability_don,
                local_don,
                dispatcher,
                aggregator,
                state: Mutex::new(State::default()),
            }),
            task: Mutex::new(None),
        }
    }

    /// Number of workflows currently registered
    #[must_use]
    pub fn registration_count(&self) -> usize {
        self.inner.lock_state().registrations.len()
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn message(&self, method: &str, workflow_id: &str, payload: Vec<u8>) -> MessageBody {
        MessageBody {
            capability_id: self.info.id().to_string(),
            capability_don_id: self.capability_don.id,
            caller_don_id: self.local_don.id,
            method: method.to_string(),
            message_id: workflow_id.as_bytes().to_vec(),
            payload,
            ..MessageBody::default()
        }
    }

    async fn send_to_publishers(&self, method: &str, workflow_id: &str, payload: Vec<u8>) {
        let message = self.message(method, workflow_id, payload);
        let sent = broadcast(
            self.dispatcher.as_ref(),
            &self.capability_don.members,
            &message,
        )
        .await;
        tracing::debug!(
            capability_id = %self.info.id(),
            workflow_id,
            method,
            sent,
            "sent registration to remote publishers"
        );
    }

    async fn refresh_registrations(&self) {
        let pending: Vec<(String, Vec<u8>)> = self
            .lock_state()
            .registrations
            .iter()
            .map(|(wid, reg)| (wid.clone(), reg.payload.clone()))
            .collect();

        for (workflow_id, payload) in pending {
            self.send_to_publishers(METHOD_REGISTER_TRIGGER, &workflow_id, payload)
                .await;
        }
    }

    fn expire_messages(&self) {
        let Some(cutoff) = Instant::now().checked_sub(self.config.message_expiry) else {
            return;
        };
        let expired = self.lock_state().messages.delete_older_than(cutoff);
        if !expired.is_empty() {
            tracing::debug!(
                capability_id = %self.info.id(),
                count = expired.len(),
                "expired trigger events"
            );
        }
    }

    fn receive(&self, message: &MessageBody) {
        let sender = match check_sender(message, &self.capability_don.members) {
            Ok(sender) => sender,
            Err(e) => {
                tracing::warn!(capability_id = %self.info.id(), error = %e, "dropping trigger message");
                return;
            }
        };

        if message.method != METHOD_TRIGGER_EVENT {
            tracing::warn!(method = %message.method, "trigger subscriber received unsupported method");
            return;
        }
        if !message.is_ok() {
            tracing::warn!(
                sender = %sender,
                error = %message.error_msg,
                "remote publisher reported an error"
            );
            return;
        }
        let Some(meta) = message.trigger_event.as_ref() else {
            tracing::warn!(sender = %sender, "trigger event without metadata");
            return;
        };

        let min_responses = self.config.min_responses_to_aggregate as usize;
        let now = Instant::now();
        let mut deliveries = Vec::new();
        {
            let mut state = self.lock_state();
            for workflow_id in &meta.workflow_ids {
                let Some(callback) = state
                    .registrations
                    .get(workflow_id)
                    .map(|r| r.callback.clone())
                else {
                    tracing::debug!(workflow_id = %workflow_id, "event for unregistered workflow");
                    continue;
                };

                let key = (meta.trigger_event_id.clone(), workflow_id.clone());
                if state.messages.is_ready(&key) {
                    continue;
                }

                let count = state
                    .messages
                    .insert(key.clone(), sender, now, message.payload.clone());
                tracing::debug!(
                    event_id = %meta.trigger_event_id,
                    workflow_id = %workflow_id,
                    count,
                    min_responses,
                    "received trigger event"
                );

                if let Some(payloads) = state.messages.ready(&key, min_responses, None, true) {
                    deliveries.push((workflow_id.clone(), payloads, callback));
                }
            }
        }

        for (workflow_id, payloads, callback) in deliveries {
            let response = match self
                .aggregator
                .aggregate(&meta.trigger_event_id, &payloads)
            {
                Ok(response) => response,
                Err(e) => {
                    tracing::error!(
                        event_id = %meta.trigger_event_id,
                        workflow_id = %workflow_id,
                        error = %e,
                        "failed to aggregate trigger responses"
                    );
                    continue;
                }
            };

            match callback.try_send(response) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => tracing::warn!(
                    event_id = %meta.trigger_event_id,
                    workflow_id = %workflow_id,
                    "subscriber queue full, dropping event"
                ),
                Err(TrySendError::Closed(_)) => tracing::debug!(
                    workflow_id = %workflow_id,
                    "subscriber queue closed"
                ),
            }
        }
    }
}

impl BaseCapability for TriggerSubscriber {
    fn info(&self) -> &CapabilityInfo {
        &self.inner.info
    }
}

#[async_trait]
impl TriggerCapability for TriggerSubscriber {
    async fn register_trigger(
        &self,
        request: TriggerRegistrationRequest,
    ) -> Result<mpsc::Receiver<TriggerResponse>> {
        let workflow_id = request.metadata.workflow_id.clone();
        if workflow_id.is_empty() {
            return Err(Error::InvalidConfig(
                "trigger registration requires a workflow id".to_string(),
            ));
        }
        let payload = serde_json::to_vec(&request)?;

        let rx = {
            let mut state = self.inner.lock_state();
            if state.registrations.contains_key(&workflow_id) {
                return Err(Error::TriggerAlreadyRegistered(format!(
                    "workflow {workflow_id} already registered for {}",
                    self.inner.info.id()
                )));
            }
            let (tx, rx) = mpsc::channel(DEFAULT_SEND_CHANNEL_BUFFER_SIZE);
            state.registrations.insert(
                workflow_id.clone(),
                Registration {
                    payload: payload.clone(),
                    callback: tx,
                },
            );
            rx
        };

        self.inner
            .send_to_publishers(METHOD_REGISTER_TRIGGER, &workflow_id, payload)
            .await;
        Ok(rx)
    }

    async fn unregister_trigger(&self, request: TriggerRegistrationRequest) -> Result<()> {
        let workflow_id = request.metadata.workflow_id;
        let removed = self.inner.lock_state().registrations.remove(&workflow_id);
        let Some(registration) = removed else {
            return Err(Error::TriggerNotRegistered(format!(
                "no registration for workflow {workflow_id}"
            )));
        };

        self.inner
            .send_to_publishers(METHOD_UNREGISTER_TRIGGER, &workflow_id, registration.payload)
            .await;
        Ok(())
    }
}

#[async_trait]
impl Receiver for TriggerSubscriber {
    async fn receive(&self, message: MessageBody) {
        self.inner.receive(&message);
    }
}

#[async_trait]
impl Service for TriggerSubscriber {
    fn name(&self) -> String {
        format!("TriggerSubscriber({})", self.inner.info.id())
    }

    async fn start(&self) -> Result<()> {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return Err(Error::Service(format!("{} already started", self.name())));
        }

        let inner = Arc::clone(&self.inner);
        *task = Some(BackgroundTask::spawn(|mut shutdown_rx| async move {
            let mut refresh = tokio::time::interval(inner.config.registration_refresh);
            refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = refresh.tick() => {
                        inner.refresh_registrations().await;
                        inner.expire_messages();
                    }
                }
            }
        }));

        tracing::debug!(capability_id = %self.inner.info.id(), "trigger subscriber started");
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
        // dropping the senders closes every workflow queue
        self.inner.lock_state().registrations.clear();
        tracing::debug!(capability_id = %self.inner.info.id(), "trigger subscriber closed");
        Ok(())
    }
}
