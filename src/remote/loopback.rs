//! In-process transport
//!
//! Every node on a [`LoopbackNetwork`] gets a [`LoopbackDispatcher`]. Messages
//! go through the same envelope encoding, per-peer size limit and per-peer
//! token buckets a real p2p stream would apply, then land on the receiver
//! registered for their (capability id, capability DON id) pair.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use prost::Message;

use super::{
    ConnectionManager, Dispatcher, MESSAGE_VERSION, MessageBody, Receiver, StreamConfig,
    TokenBucketParams,
};
use crate::topology::{DonId, PeerId};
use crate::{Error, Result};

type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

fn limiter(params: TokenBucketParams) -> Result<Limiter> {
    if !params.rate.is_finite() || params.rate <= 0.0 {
        return Err(Error::InvalidConfig(format!(
            "token bucket rate must be positive, got {}",
            params.rate
        )));
    }
    let burst = NonZeroU32::new(params.capacity).ok_or_else(|| {
        Error::InvalidConfig("token bucket capacity must be positive".to_string())
    })?;
    let period = Duration::from_secs_f64(1.0 / params.rate);
    let quota = Quota::with_period(period)
        .ok_or_else(|| Error::InvalidConfig(format!("token bucket rate {} too high", params.rate)))?
        .allow_burst(burst);
    Ok(RateLimiter::direct(quota))
}

struct PeerStream {
    max_message_len: usize,
    messages: Limiter,
    bytes: Limiter,
}

impl PeerStream {
    fn new(config: &StreamConfig) -> Result<Self> {
        Ok(Self {
            max_message_len: config.max_message_len_bytes,
            messages: limiter(config.message_rate_limiter)?,
            bytes: limiter(config.bytes_rate_limiter)?,
        })
    }

    fn admit(&self, len: usize) -> Result<()> {
        if len > self.max_message_len {
            return Err(Error::Transport(format!(
                "message of {len} bytes exceeds limit of {}",
                self.max_message_len
            )));
        }
        if self.messages.check().is_err() {
            return Err(Error::Transport("message rate limit exceeded".to_string()));
        }
        let Some(n) = u32::try_from(len).ok().and_then(NonZeroU32::new) else {
            return Ok(());
        };
        match self.bytes.check_n(n) {
            Ok(Ok(())) => Ok(()),
            _ => Err(Error::Transport("byte rate limit exceeded".to_string())),
        }
    }
}

/// Shared medium connecting loopback dispatchers
#[derive(Default)]
pub struct LoopbackNetwork {
    nodes: Mutex<HashMap<PeerId, Arc<LoopbackDispatcher>>>,
}

impl LoopbackNetwork {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a node, returning its dispatcher
    ///
    /// Joining twice with the same peer id returns the existing dispatcher.
    #[must_use]
    pub fn join(self: &Arc<Self>, peer_id: PeerId) -> Arc<LoopbackDispatcher> {
        let mut nodes = self.nodes.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(nodes.entry(peer_id).or_insert_with(|| {
            Arc::new(LoopbackDispatcher {
                peer_id,
                network: Arc::downgrade(self),
                receivers: Mutex::new(HashMap::new()),
                streams: Mutex::new(HashMap::new()),
            })
        }))
    }

    fn node(&self, peer_id: &PeerId) -> Option<Arc<LoopbackDispatcher>> {
        self.nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer_id)
            .cloned()
    }
}

/// One node's view of the loopback network
pub struct LoopbackDispatcher {
    peer_id: PeerId,
    network: Weak<LoopbackNetwork>,
    receivers: Mutex<HashMap<(String, DonId), Arc<dyn Receiver>>>,
    streams: Mutex<HashMap<PeerId, PeerStream>>,
}

impl LoopbackDispatcher {
    #[must_use]
    pub const fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Peers this node currently keeps streams to, sorted
    #[must_use]
    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.lock_streams().keys().copied().collect();
        peers.sort();
        peers
    }

    /// Number of registered receivers
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.lock_receivers().len()
    }

    fn lock_receivers(&self) -> MutexGuard<'_, HashMap<(String, DonId), Arc<dyn Receiver>>> {
        self.receivers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_streams(&self) -> MutexGuard<'_, HashMap<PeerId, PeerStream>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver(&self, bytes: &[u8]) -> Result<()> {
        let message = MessageBody::decode(bytes)?;
        let key = (message.capability_id.clone(), message.capability_don_id);
        let receiver = self.lock_receivers().get(&key).cloned();

        let Some(receiver) = receiver else {
            tracing::debug!(
                peer = %self.peer_id,
                capability_id = %key.0,
                don_id = key.1,
                "no receiver for message, dropping"
            );
            return Ok(());
        };
        tokio::spawn(async move { receiver.receive(message).await });
        Ok(())
    }
}

#[async_trait]
impl Dispatcher for LoopbackDispatcher {
    fn set_receiver(
        &self,
        capability_id: &str,
        don_id: DonId,
        receiver: Arc<dyn Receiver>,
    ) -> Result<()> {
        let mut receivers = self.lock_receivers();
        let key = (capability_id.to_string(), don_id);
        if receivers.contains_key(&key) {
            return Err(Error::ReceiverExists(format!("{capability_id} on DON {don_id}")));
        }
        receivers.insert(key, receiver);
        Ok(())
    }

    fn remove_receiver(&self, capability_id: &str, don_id: DonId) {
        self.lock_receivers()
            .remove(&(capability_id.to_string(), don_id));
    }

    async fn send(&self, peer: PeerId, mut message: MessageBody) -> Result<()> {
        message.version = MESSAGE_VERSION;
        message.sender = self.peer_id.as_bytes().to_vec();
        message.receiver = peer.as_bytes().to_vec();
        message.timestamp = chrono::Utc::now().timestamp_millis();
        let bytes = message.encode_to_vec();

        if peer != self.peer_id {
            let streams = self.lock_streams();
            let stream = streams
                .get(&peer)
                .ok_or_else(|| Error::Transport(format!("no connection to peer {peer}")))?;
            stream.admit(bytes.len())?;
        }

        let network = self
            .network
            .upgrade()
            .ok_or_else(|| Error::Transport("network is shut down".to_string()))?;
        let target = network
            .node(&peer)
            .ok_or_else(|| Error::Transport(format!("peer {peer} is not reachable")))?;
        target.deliver(&bytes)
    }
}

#[async_trait]
impl ConnectionManager for LoopbackDispatcher {
    async fn update_connections(&self, peers: HashMap<PeerId, StreamConfig>) -> Result<()> {
        let mut streams = HashMap::with_capacity(peers.len());
        for (peer, config) in &peers {
            if *peer == self.peer_id {
                continue;
            }
            streams.insert(*peer, PeerStream::new(config)?);
        }
        tracing::debug!(peer = %self.peer_id, connections = streams.len(), "updated connections");
        *self.lock_streams() = streams;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    struct ChannelReceiver(mpsc::UnboundedSender<MessageBody>);

    #[async_trait]
    impl Receiver for ChannelReceiver {
        async fn receive(&self, message: MessageBody) {
            let _ = self.0.send(message);
        }
    }

    fn message() -> MessageBody {
        MessageBody {
            capability_id: "write-chain@1.0.0".into(),
            capability_don_id: 4,
            caller_don_id: 1,
            method: "Execute".into(),
            payload: b"{}".to_vec(),
            ..MessageBody::default()
        }
    }

    #[tokio::test]
    async fn delivers_to_registered_receiver() {
        let network = LoopbackNetwork::new();
        let a = network.join(PeerId([1; 32]));
        let b = network.join(PeerId([2; 32]));

        let (tx, mut rx) = mpsc::unbounded_channel();
        b.set_receiver("write-chain@1.0.0", 4, Arc::new(ChannelReceiver(tx)))
            .unwrap();
        a.update_connections(HashMap::from([(b.peer_id(), StreamConfig::default())]))
            .await
            .unwrap();

        a.send(b.peer_id(), message()).await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.sender_peer().unwrap(), a.peer_id());
        assert_eq!(received.receiver, b.peer_id().as_bytes().to_vec());
        assert_eq!(received.version, MESSAGE_VERSION);
        assert!(received.timestamp > 0);
    }

    #[tokio::test]
    async fn requires_connection() {
        let network = LoopbackNetwork::new();
        let a = network.join(PeerId([1; 32]));
        let b = network.join(PeerId([2; 32]));
        assert!(matches!(
            a.send(b.peer_id(), message()).await,
            Err(Error::Transport(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_receiver_rejected() {
        let network = LoopbackNetwork::new();
        let a = network.join(PeerId([1; 32]));
        let (tx, _rx) = mpsc::unbounded_channel();
        let receiver: Arc<dyn Receiver> = Arc::new(ChannelReceiver(tx));

        a.set_receiver("cap@1.0.0", 1, Arc::clone(&receiver)).unwrap();
        assert!(matches!(
            a.set_receiver("cap@1.0.0", 1, receiver),
            Err(Error::ReceiverExists(_))
        ));
        a.remove_receiver("cap@1.0.0", 1);
        assert_eq!(a.receiver_count(), 0);
    }

    #[tokio::test]
    async fn enforces_size_and_rate_limits() {
        let network = LoopbackNetwork::new();
        let a = network.join(PeerId([1; 32]));
        let b = network.join(PeerId([2; 32]));

        let config = StreamConfig {
            max_message_len_bytes: 1_000,
            message_rate_limiter: TokenBucketParams {
                rate: 0.001,
                capacity: 2,
            },
            ..StreamConfig::default()
        };
        a.update_connections(HashMap::from([(b.peer_id(), config)]))
            .await
            .unwrap();

        let mut big = message();
        big.payload = vec![0; 2_000];
        assert!(a.send(b.peer_id(), big).await.is_err());

        a.send(b.peer_id(), message()).await.unwrap();
        a.send(b.peer_id(), message()).await.unwrap();
        assert!(a.send(b.peer_id(), message()).await.is_err());
    }

    #[tokio::test]
    async fn rejects_invalid_bucket() {
        let network = LoopbackNetwork::new();
        let a = network.join(PeerId([1; 32]));
        let config = StreamConfig {
            bytes_rate_limiter: TokenBucketParams {
                rate: 0.0,
                capacity: 1,
            },
            ..StreamConfig::default()
        };
        assert!(
            a.update_connections(HashMap::from([(PeerId([2; 32]), config)]))
                .await
                .is_err()
        );
        assert!(a.connected_peers().is_empty());
    }
}
