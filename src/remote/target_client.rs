//! Consumer side of a remote target
//!
//! Sends each request to every member of the remote capability DON and
//! returns once `f + 1` members replied with the same outcome.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use super::{Dispatcher, METHOD_EXECUTE, MessageBody, Receiver, broadcast, check_sender};
use crate::capabilities::{
    BaseCapability, CapabilityInfo, CapabilityRequest, CapabilityResponse, ExecutableCapability,
};
use crate::service::Service;
use crate::topology::{Don, PeerId};
use crate::{Error, Result};

/// Default time to wait for a quorum of responses
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// What one remote member answered
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Outcome {
    Success(Vec<u8>),
    Failure(String),
}

struct PendingRequest {
    responses: HashMap<PeerId, Outcome>,
    done: Option<oneshot::Sender<Result<CapabilityResponse>>>,
}

/// Proxy for a target served by a remote DON
pub struct TargetClient {
    info: CapabilityInfo,
    remote_don: Don,
    local_don: Don,
    dispatcher: Arc<dyn Dispatcher>,
    request_timeout: Duration,
    pending: Mutex<HashMap<String, PendingRequest>>,
}

/// Removes a pending request when the call that created it ends, including
/// when the caller drops the future
struct PendingGuard<'a> {
    client: &'a TargetClient,
    message_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.client.lock_pending().remove(self.message_id);
    }
}

/// Identifier shared by every workflow node issuing the same step
#[must_use]
pub fn message_id_for(request: &CapabilityRequest) -> String {
    let m = &request.metadata;
    format!("{}/{}/{}", m.workflow_id, m.workflow_execution_id, m.reference_id)
}

impl TargetClient {
    #[must_use]
    pub fn new(
        info: CapabilityInfo,
        remote_don: Don,
        local_don: Don,
        dispatcher: Arc<dyn Dispatcher>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            info,
            remote_don,
            local_don,
            dispatcher,
            request_timeout,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Requests still waiting for a quorum
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(outcome: Outcome) -> Result<CapabilityResponse> {
        match outcome {
            Outcome::Success(payload) => serde_json::from_slice(&payload)
                .map_err(|e| Error::Codec(format!("invalid target response: {e}"))),
            Outcome::Failure(msg) => Err(Error::Service(format!("remote execution failed: {msg}"))),
        }
    }
}

impl BaseCapability for TargetClient {
    fn info(&self) -> &CapabilityInfo {
        &self.info
    }
}

#[async_trait]
impl ExecutableCapability for TargetClient {
    async fn execute(&self, request: CapabilityRequest) -> Result<CapabilityResponse> {
        if request.metadata.workflow_execution_id.is_empty() {
            return Err(Error::InvalidConfig(
                "target request requires a workflow execution id".to_string(),
            ));
        }
        let message_id = message_id_for(&request);
        let payload = serde_json::to_vec(&request)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.lock_pending();
            if pending.contains_key(&message_id) {
                return Err(Error::Service(format!(
                    "request {message_id} already in progress"
                )));
            }
            pending.insert(
                message_id.clone(),
                PendingRequest {
                    responses: HashMap::new(),
                    done: Some(tx),
                },
            );
        }
        let _guard = PendingGuard {
            client: self,
            message_id: &message_id,
        };

        let message = MessageBody {
            capability_id: self.info.id().to_string(),
            capability_don_id: self.remote_don.id,
            caller_don_id: self.local_don.id,
            method: METHOD_EXECUTE.to_string(),
            message_id: message_id.as_bytes().to_vec(),
            payload,
            ..MessageBody::default()
        };
        let sent = broadcast(self.dispatcher.as_ref(), &self.remote_don.members, &message).await;
        tracing::debug!(
            capability_id = %self.info.id(),
            message_id = %message_id,
            sent,
            "sent remote target request"
        );

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => Err(Error::Service(format!("request {message_id} was cancelled"))),
            Err(_) => Err(Error::Timeout(format!(
                "no quorum for request {message_id} after {:?}",
                self.request_timeout
            ))),
        }
    }
}

#[async_trait]
impl Receiver for TargetClient {
    async fn receive(&self, message: MessageBody) {
        let sender = match check_sender(&message, &self.remote_don.members) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(capability_id = %self.info.id(), error = %e, "dropping target response");
                return;
            }
        };
        if message.method != METHOD_EXECUTE {
            tracing::warn!(method = %message.method, "target client received unsupported method");
            return;
        }

        let message_id = message.message_id_str();
        let outcome = if message.is_ok() {
            Outcome::Success(message.payload)
        } else {
            Outcome::Failure(format!("{:?}: {}", message.error(), message.error_msg))
        };

        let mut pending = self.lock_pending();
        let Some(request) = pending.get_mut(&message_id) else {
            tracing::debug!(message_id = %message_id, "response for unknown request");
            return;
        };
        request.responses.insert(sender, outcome.clone());

        let agreeing = request.responses.values().filter(|o| **o == outcome).count();
        if agreeing < self.remote_don.min_responses() {
            return;
        }
        if let Some(done) = request.done.take() {
            tracing::debug!(message_id = %message_id, agreeing, "target request reached quorum");
            // caller may have timed out already
            let _ = done.send(Self::resolve(outcome));
        }
    }
}

#[async_trait]
impl Service for TargetClient {
    fn name(&self) -> String {
        format!("TargetClient({})", self.info.id())
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // dropping the senders cancels in-flight requests
        self.lock_pending().clear();
        Ok(())
    }
}
