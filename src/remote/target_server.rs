//! Provider side of a remote target
//!
//! Each member of a workflow DON sends its own copy of a request. The server
//! groups copies by caller DON, message id and request hash, runs the local
//! target once `f + 1` distinct members asked for the same thing, and sends
//! the single result back to every member that asked.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;

use super::{
    Dispatcher, ErrorCode, METHOD_EXECUTE, MessageBody, Receiver, broadcast, check_sender,
    error_reply,
};
use crate::capabilities::{CapabilityInfo, CapabilityRequest, ExecutableCapability};
use crate::service::{BackgroundTask, Service};
use crate::topology::{Don, DonId, PeerId};
use crate::{Error, Result};

/// (caller DON id, message id, request hash)
type RequestKey = (DonId, String, String);

enum Progress {
    Collecting,
    Executing,
    Done(MessageBody),
}

struct ServerRequest {
    created_at: Instant,
    requesters: BTreeSet<PeerId>,
    progress: Progress,
}

struct Inner {
    info: CapabilityInfo,
    capability_don: Don,
    workflow_dons: HashMap<DonId, Don>,
    underlying: Arc<dyn ExecutableCapability>,
    dispatcher: Arc<dyn Dispatcher>,
    request_timeout: Duration,
    excluded_attributes: Vec<String>,
    requests: AsyncMutex<HashMap<RequestKey, ServerRequest>>,
}

/// Exposes a local target to remote workflow DONs
pub struct TargetServer {
    inner: Arc<Inner>,
    task: Mutex<Option<BackgroundTask>>,
}

/// Hex SHA-256 of the request with `excluded` input paths removed
///
/// Paths are dotted (`signed_report.signatures`) and resolved inside
/// `inputs`. Object keys are sorted so logically equal requests hash equally.
///
/// # Errors
///
/// Returns error if the request cannot be serialized
pub fn request_hash(request: &CapabilityRequest, excluded: &[String]) -> Result<String> {
    let mut value = serde_json::to_value(request)?;
    if let Some(inputs) = value.get_mut("inputs") {
        for path in excluded {
            remove_path(inputs, path);
        }
    }
    let canonical = serde_json::to_vec(&value)?;
    Ok(hex::encode(Sha256::digest(canonical)))
}

fn remove_path(value: &mut serde_json::Value, path: &str) {
    let mut segments: Vec<&str> = path.split('.').collect();
    let Some(last) = segments.pop() else {
        return;
    };
    let mut current = value;
    for segment in segments {
        match current.get_mut(segment) {
            Some(next) => current = next,
            None => return,
        }
    }
    if let Some(map) = current.as_object_mut() {
        map.remove(last);
    }
}

impl TargetServer {
    #[must_use]
    pub fn new(
        info: CapabilityInfo,
        capability_don: Don,
        workflow_dons: HashMap<DonId, Don>,
        underlying: Arc<dyn ExecutableCapability>,
        dispatcher: Arc<dyn Dispatcher>,
        request_timeout: Duration,
        excluded_attributes: Vec<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                info,
                capability_don,
                workflow_dons,
                underlying,
                dispatcher,
                request_timeout,
                excluded_attributes,
                requests: AsyncMutex::new(HashMap::new()),
            }),
            task: Mutex::new(None),
        }
    }

    /// Requests currently tracked
    pub async fn request_count(&self) -> usize {
        self.inner.requests.lock().await.len()
    }
}

impl Inner {
    async fn reply_error(&self, request: &MessageBody, code: ErrorCode, msg: &str) {
        let Ok(sender) = request.sender_peer() else {
            return;
        };
        let mut reply = error_reply(request, code, msg);
        reply.capability_don_id = self.capability_don.id;
        if let Err(e) = self.dispatcher.send(sender, reply).await {
            tracing::warn!(peer = %sender, error = %e, "failed to send error reply");
        }
    }

    async fn receive(&self, message: MessageBody) {
        if message.method != METHOD_EXECUTE {
            self.reply_error(&message, ErrorCode::InvalidMethod, "unsupported method")
                .await;
            return;
        }

        let Some(caller_don) = self.workflow_dons.get(&message.caller_don_id) else {
            tracing::warn!(
                capability_id = %self.info.id(),
                caller_don_id = message.caller_don_id,
                "request from unauthorized DON"
            );
            self.reply_error(&message, ErrorCode::Unauthorized, "caller DON not allowed")
                .await;
            return;
        };
        let sender = match check_sender(&message, &caller_don.members) {
            Ok(s) => s,
            Err(e) => {
                self.reply_error(&message, ErrorCode::InvalidSender, &e.to_string())
                    .await;
                return;
            }
        };

        let request: CapabilityRequest = match serde_json::from_slice(&message.payload) {
            Ok(r) => r,
            Err(e) => {
                self.reply_error(&message, ErrorCode::InvalidPayload, &e.to_string())
                    .await;
                return;
            }
        };
        let hash = match request_hash(&request, &self.excluded_attributes) {
            Ok(h) => h,
            Err(e) => {
                self.reply_error(&message, ErrorCode::InvalidPayload, &e.to_string())
                    .await;
                return;
            }
        };

        let key = (caller_don.id, message.message_id_str(), hash);
        let (stored, should_execute) = {
            let mut requests = self.requests.lock().await;
            let entry = requests.entry(key.clone()).or_insert_with(|| ServerRequest {
                created_at: Instant::now(),
                requesters: BTreeSet::new(),
                progress: Progress::Collecting,
            });
            entry.requesters.insert(sender);

            let stored = if let Progress::Done(response) = &entry.progress {
                Some(response.clone())
            } else {
                None
            };
            let should_execute = matches!(entry.progress, Progress::Collecting)
                && entry.requesters.len() >= caller_don.min_responses();
            if should_execute {
                entry.progress = Progress::Executing;
            }
            (stored, should_execute)
        };

        if let Some(response) = stored {
            self.send_response(&[sender], &response).await;
        } else if should_execute {
            self.execute(key, &message, request).await;
        }
    }

    async fn execute(&self, key: RequestKey, message: &MessageBody, request: CapabilityRequest) {
        tracing::debug!(
            capability_id = %self.info.id(),
            message_id = %key.1,
            "executing remote target request"
        );
        let outcome =
            tokio::time::timeout(self.request_timeout, self.underlying.execute(request)).await;

        let mut response = MessageBody {
            capability_id: self.info.id().to_string(),
            capability_don_id: self.capability_don.id,
            caller_don_id: key.0,
            method: METHOD_EXECUTE.to_string(),
            message_id: message.message_id.clone(),
            ..MessageBody::default()
        };
        match outcome {
            Ok(Ok(value)) => match serde_json::to_vec(&value) {
                Ok(payload) => response.payload = payload,
                Err(e) => {
                    response.set_error(ErrorCode::InternalError);
                    response.error_msg = e.to_string();
                }
            },
            Ok(Err(e)) => {
                tracing::warn!(message_id = %key.1, error = %e, "target execution failed");
                response.set_error(ErrorCode::InternalError);
                response.error_msg = e.to_string();
            }
            Err(_) => {
                response.set_error(ErrorCode::RequestTimeout);
                response.error_msg = "target execution timed out".to_string();
            }
        }

        let requesters: Vec<PeerId> = {
            let mut requests = self.requests.lock().await;
            let Some(entry) = requests.get_mut(&key) else {
                return;
            };
            entry.progress = Progress::Done(response.clone());
            entry.requesters.iter().copied().collect()
        };
        self.send_response(&requesters, &response).await;
    }

    async fn send_response(&self, peers: &[PeerId], response: &MessageBody) {
        let sent = broadcast(self.dispatcher.as_ref(), peers, response).await;
        tracing::debug!(
            capability_id = %self.info.id(),
            message_id = %response.message_id_str(),
            sent,
            "sent target response"
        );
    }

    async fn expire_requests(&self) {
        let Some(cutoff) = Instant::now().checked_sub(self.request_timeout) else {
            return;
        };

        let mut timed_out = Vec::new();
        {
            let mut requests = self.requests.lock().await;
            let expired: Vec<RequestKey> = requests
                .iter()
                .filter(|(_, r)| r.created_at < cutoff)
                .map(|(k, _)| k.clone())
                .collect();
            for key in expired {
                if let Some(request) = requests.remove(&key) {
                    if !matches!(request.progress, Progress::Done(_)) {
                        timed_out.push((key, request.requesters));
                    }
                }
            }
        }

        for ((caller_don_id, message_id, _), requesters) in timed_out {
            let mut reply = MessageBody {
                capability_id: self.info.id().to_string(),
                capability_don_id: self.capability_don.id,
                caller_don_id,
                method: METHOD_EXECUTE.to_string(),
                message_id: message_id.clone().into_bytes(),
                error_msg: "request timed out before reaching quorum".to_string(),
                ..MessageBody::default()
            };
            reply.set_error(ErrorCode::RequestTimeout);
            tracing::debug!(message_id = %message_id, "expiring target request");
            let peers: Vec<PeerId> = requesters.into_iter().collect();
            self.send_response(&peers, &reply).await;
        }
    }
}

#[async_trait]
impl Receiver for TargetServer {
    async fn receive(&self, message: MessageBody) {
        self.inner.receive(message).await;
    }
}

#[async_trait]
impl Service for TargetServer {
    fn name(&self) -> String {
        format!("TargetServer({})", self.inner.info.id())
    }

    async fn start(&self) -> Result<()> {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return Err(Error::Service(format!("{} already started", self.name())));
        }

        let inner = Arc::clone(&self.inner);
        let period = (self.inner.request_timeout / 2).max(Duration::from_millis(100));
        *task = Some(BackgroundTask::spawn(|mut shutdown_rx| async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => inner.expire_requests().await,
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
        self.inner.requests.lock().await.clear();
        Ok(())
    }
}
