//! Remote capability shims and their transport seams
//!
//! Shims make a capability usable across DON boundaries:
//!
//! - consumer side: [`TriggerSubscriber`] and [`TargetClient`] proxy a
//!   capability served by a remote DON
//! - provider side: [`TriggerPublisher`] and [`TargetServer`] expose a local
//!   capability to remote workflow DONs
//!
//! All shim traffic goes through a [`Dispatcher`], which routes
//! [`MessageBody`] values to the [`Receiver`] registered for a
//! (capability id, capability DON id) pair.

pub mod aggregation;
pub mod loopback;
pub mod message_cache;
pub mod target_client;
pub mod target_server;
pub mod trigger_publisher;
pub mod trigger_subscriber;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use prost::Message;
use serde::{Deserialize, Serialize};

use crate::topology::{DonId, PeerId};
use crate::{Error, Result};

pub use aggregation::Aggregator;
pub use loopback::{LoopbackDispatcher, LoopbackNetwork};
pub use message_cache::MessageCache;
pub use target_client::TargetClient;
pub use target_server::TargetServer;
pub use trigger_publisher::TriggerPublisher;
pub use trigger_subscriber::TriggerSubscriber;

/// Current message envelope version
pub const MESSAGE_VERSION: u32 = 1;

/// Subscribe to a remote trigger
pub const METHOD_REGISTER_TRIGGER: &str = "RegisterTrigger";
/// Cancel a remote trigger subscription
pub const METHOD_UNREGISTER_TRIGGER: &str = "UnregisterTrigger";
/// Trigger event pushed from publisher to subscriber
pub const METHOD_TRIGGER_EVENT: &str = "TriggerEvent";
/// Target request and its response
pub const METHOD_EXECUTE: &str = "Execute";

/// Error codes carried in a message envelope
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    ValidationFailed = 1,
    CapabilityNotFound = 2,
    InvalidMethod = 3,
    InvalidPayload = 4,
    InternalError = 5,
    InvalidSender = 6,
    RequestTimeout = 7,
    Unauthorized = 8,
}

/// Metadata attached to trigger event messages
#[derive(Clone, PartialEq, Message)]
pub struct TriggerEventMetadata {
    #[prost(string, tag = "1")]
    pub trigger_event_id: String,
    #[prost(string, repeated, tag = "2")]
    pub workflow_ids: Vec<String>,
}

/// Envelope for all peer-to-peer capability traffic
#[derive(Clone, PartialEq, Message)]
pub struct MessageBody {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub sender: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub receiver: Vec<u8>,
    /// Unix milliseconds at send time
    #[prost(int64, tag = "4")]
    pub timestamp: i64,
    #[prost(bytes = "vec", tag = "5")]
    pub message_id: Vec<u8>,
    #[prost(string, tag = "6")]
    pub capability_id: String,
    #[prost(uint32, tag = "7")]
    pub capability_don_id: u32,
    #[prost(uint32, tag = "8")]
    pub caller_don_id: u32,
    #[prost(string, tag = "9")]
    pub method: String,
    #[prost(enumeration = "ErrorCode", tag = "10")]
    pub error: i32,
    #[prost(string, tag = "11")]
    pub error_msg: String,
    #[prost(bytes = "vec", tag = "12")]
    pub payload: Vec<u8>,
    #[prost(message, optional, tag = "13")]
    pub trigger_event: Option<TriggerEventMetadata>,
}

impl MessageBody {
    /// Sender as a peer id
    ///
    /// # Errors
    ///
    /// Returns error if the sender field is not a valid peer id
    pub fn sender_peer(&self) -> Result<PeerId> {
        PeerId::from_slice(&self.sender)
    }

    /// Message id as text (lossy)
    #[must_use]
    pub fn message_id_str(&self) -> String {
        String::from_utf8_lossy(&self.message_id).into_owned()
    }

    /// Whether the envelope reports success
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.error() == ErrorCode::Ok
    }
}

/// Token bucket parameters for one rate limiter
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketParams {
    /// Tokens refilled per second
    pub rate: f64,
    /// Bucket size (burst)
    pub capacity: u32,
}

/// Per-peer stream settings pushed to the transport
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub incoming_message_buffer_size: usize,
    pub outgoing_message_buffer_size: usize,
    pub max_message_len_bytes: usize,
    pub message_rate_limiter: TokenBucketParams,
    pub bytes_rate_limiter: TokenBucketParams,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            incoming_message_buffer_size: 500,
            outgoing_message_buffer_size: 500,
            max_message_len_bytes: 500_000,
            message_rate_limiter: TokenBucketParams {
                rate: 100.0,
                capacity: 500,
            },
            bytes_rate_limiter: TokenBucketParams {
                rate: 5_000_000.0,
                capacity: 10_000_000,
            },
        }
    }
}

/// Handles messages addressed to one (capability, DON) pair
#[async_trait]
pub trait Receiver: Send + Sync {
    async fn receive(&self, message: MessageBody);
}

/// Routes capability messages between peers
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Register the receiver for a (capability, capability DON) pair
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReceiverExists`] if one is already registered, or
    /// another error if registration fails
    fn set_receiver(
        &self,
        capability_id: &str,
        don_id: DonId,
        receiver: Arc<dyn Receiver>,
    ) -> Result<()>;

    /// Remove a receiver, if present
    fn remove_receiver(&self, capability_id: &str, don_id: DonId);

    /// Send a message to a peer; the dispatcher fills in sender, receiver,
    /// version and timestamp
    ///
    /// # Errors
    ///
    /// Returns error if the message cannot be delivered to the transport
    async fn send(&self, peer: PeerId, message: MessageBody) -> Result<()>;
}

/// Maintains the set of peers the transport keeps streams open to
#[async_trait]
pub trait ConnectionManager: Send + Sync {
    /// Replace the connected peer set
    ///
    /// # Errors
    ///
    /// Returns error if the transport rejects the update
    async fn update_connections(&self, peers: HashMap<PeerId, StreamConfig>) -> Result<()>;
}

/// Send `message` to every peer in `peers`, logging failures
pub(crate) async fn broadcast(
    dispatcher: &dyn Dispatcher,
    peers: &[PeerId],
    message: &MessageBody,
) -> usize {
    let sends = peers
        .iter()
        .map(|peer| async move { (peer, dispatcher.send(*peer, message.clone()).await) });
    let results = futures::future::join_all(sends).await;

    let mut delivered = 0;
    for (peer, result) in results {
        match result {
            Ok(()) => delivered += 1,
            Err(e) => tracing::warn!(
                peer = %peer,
                capability_id = %message.capability_id,
                method = %message.method,
                error = %e,
                "failed to send message"
            ),
        }
    }
    delivered
}

/// Build an error reply to `request`
pub(crate) fn error_reply(request: &MessageBody, code: ErrorCode, msg: &str) -> MessageBody {
    let mut reply = MessageBody {
        capability_id: request.capability_id.clone(),
        capability_don_id: request.capability_don_id,
        caller_don_id: request.caller_don_id,
        message_id: request.message_id.clone(),
        method: request.method.clone(),
        error_msg: msg.to_string(),
        ..MessageBody::default()
    };
    reply.set_error(code);
    reply
}

/// Reject messages from peers outside `members`
pub(crate) fn check_sender(message: &MessageBody, members: &[PeerId]) -> Result<PeerId> {
    let sender = message.sender_peer()?;
    if members.contains(&sender) {
        Ok(sender)
    } else {
        Err(Error::Unauthorized(format!(
            "sender {sender} is not a member of the expected DON"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_encoding() {
        let mut body = MessageBody {
            version: MESSAGE_VERSION,
            sender: vec![1; 32],
            capability_id: "streams-trigger@1.0.0".into(),
            capability_don_id: 2,
            caller_don_id: 1,
            method: METHOD_TRIGGER_EVENT.into(),
            payload: b"{}".to_vec(),
            trigger_event: Some(TriggerEventMetadata {
                trigger_event_id: "ev".into(),
                workflow_ids: vec!["wf".into()],
            }),
            ..MessageBody::default()
        };
        body.set_error(ErrorCode::InvalidPayload);

        let decoded = MessageBody::decode(body.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, body);
        assert_eq!(decoded.error(), ErrorCode::InvalidPayload);
        assert!(!decoded.is_ok());
        assert_eq!(decoded.sender_peer().unwrap(), PeerId([1; 32]));
    }

    #[test]
    fn sender_check() {
        let body = MessageBody {
            sender: vec![2; 32],
            ..MessageBody::default()
        };
        assert!(check_sender(&body, &[PeerId([2; 32])]).is_ok());
        assert!(matches!(
            check_sender(&body, &[PeerId([3; 32])]),
            Err(Error::Unauthorized(_))
        ));
    }

    #[test]
    fn error_reply_echoes_routing() {
        let request = MessageBody {
            capability_id: "write-chain@1.0.0".into(),
            capability_don_id: 4,
            caller_don_id: 1,
            message_id: b"m".to_vec(),
            method: METHOD_EXECUTE.into(),
            ..MessageBody::default()
        };
        let reply = error_reply(&request, ErrorCode::Unauthorized, "nope");
        assert_eq!(reply.capability_don_id, 4);
        assert_eq!(reply.message_id, b"m");
        assert_eq!(reply.error(), ErrorCode::Unauthorized);
    }
}
