//! DON topology snapshots
//!
//! A snapshot is the node's view of the on-chain capability registry at one
//! point in time: which DONs exist, who their members are, and which
//! capabilities each DON serves. Snapshots are produced elsewhere and handed
//! to the [`Launcher`](crate::launcher::Launcher) once per sync cycle.
//!
//! The launcher only talks to snapshots through [`TopologySnapshot`], so the
//! same resolution algorithm runs against every registry schema we know how
//! to read.

pub mod hashed;

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::capabilities::CapabilityType;
use crate::capabilities::config::CapabilityConfig;
use crate::codec::hex_bytes;
use crate::{Error, Result};

pub use hashed::{HashedCapability, HashedDon, HashedRegistry, hashed_capability_id};

/// Numeric DON identifier assigned by the on-chain registry
pub type DonId = u32;

/// 32-byte peer identifier (the node's p2p public key)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    /// Raw key bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Build a peer id from a byte slice
    ///
    /// # Errors
    ///
    /// Returns error if the slice is not exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Codec(format!("peer id must be 32 bytes, got {}", bytes.len())))?;
        Ok(Self(arr))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", hex::encode(&self.0[..4]))
    }
}

impl FromStr for PeerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let raw = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(raw).map_err(|e| Error::Codec(format!("peer id: {e}")))?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A decentralized oracle network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Don {
    pub id: DonId,

    #[serde(default)]
    pub config_version: u32,

    /// Fault tolerance; `f + 1` matching responses are needed to trust a result
    pub f: u8,

    /// Member peers, in on-chain order
    pub members: Vec<PeerId>,

    /// Reachable by nodes outside the DON
    #[serde(default)]
    pub is_public: bool,

    /// Hosts workflow execution
    #[serde(default)]
    pub accepts_workflows: bool,
}

impl Don {
    /// Whether `peer` is a member of this DON
    #[must_use]
    pub fn contains(&self, peer: &PeerId) -> bool {
        self.members.contains(peer)
    }

    /// Minimum number of agreeing responses (`f + 1`)
    #[must_use]
    pub fn min_responses(&self) -> usize {
        usize::from(self.f) + 1
    }
}

/// Encoded per-(DON, capability) configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityConfiguration {
    #[serde(with = "hex_bytes", default)]
    pub config: Vec<u8>,
}

impl CapabilityConfiguration {
    /// Decode the protobuf payload
    ///
    /// # Errors
    ///
    /// Returns error if the payload is not a valid `CapabilityConfig`
    pub fn decode(&self) -> Result<CapabilityConfig> {
        CapabilityConfig::decode_bytes(&self.config)
    }
}

/// A DON together with the capabilities it configures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonWithCapabilities {
    #[serde(flatten)]
    pub don: Don,

    /// Capability id to encoded configuration
    #[serde(default)]
    pub capability_configurations: BTreeMap<String, CapabilityConfiguration>,
}

/// A capability declared in the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    /// Fully qualified id (e.g. `streams-trigger@1.0.0`)
    pub id: String,

    pub capability_type: CapabilityType,

    /// Optional contract holding extra configuration
    #[serde(default)]
    pub config_contract: Option<String>,
}

/// A node known to the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub peer_id: PeerId,

    /// Address used to sign trigger reports
    #[serde(with = "hex_bytes")]
    pub signer: Vec<u8>,

    #[serde(default)]
    pub node_operator_id: u32,

    #[serde(default)]
    pub workflow_don_id: Option<DonId>,

    #[serde(default)]
    pub capability_don_ids: Vec<DonId>,
}

/// Read access to a topology snapshot, independent of registry schema
pub trait TopologySnapshot: Send + Sync {
    /// All DON ids in the snapshot, in no particular order
    fn don_ids(&self) -> Vec<DonId>;

    /// Look up a DON and its capability configurations
    fn don(&self, id: DonId) -> Option<Cow<'_, DonWithCapabilities>>;

    /// Look up a capability by its fully qualified id
    fn capability(&self, id: &str) -> Option<Cow<'_, CapabilityDescriptor>>;

    /// Look up a node by peer id
    fn node(&self, peer: &PeerId) -> Option<Cow<'_, NodeInfo>>;

    /// Normalize into the current schema
    fn to_local_registry(&self) -> LocalRegistry;
}

/// Topology snapshot keyed by numeric DON id and plain capability id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalRegistry {
    #[serde(default)]
    pub ids_to_dons: BTreeMap<DonId, DonWithCapabilities>,

    #[serde(default)]
    pub ids_to_capabilities: BTreeMap<String, CapabilityDescriptor>,

    #[serde(default)]
    pub ids_to_nodes: HashMap<PeerId, NodeInfo>,
}

impl LocalRegistry {
    /// Load a snapshot from a JSON file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let registry: Self = serde_json::from_str(&contents)?;
        tracing::debug!(
            path = %path.display(),
            dons = registry.ids_to_dons.len(),
            capabilities = registry.ids_to_capabilities.len(),
            nodes = registry.ids_to_nodes.len(),
            "loaded topology snapshot"
        );
        Ok(registry)
    }
}

impl TopologySnapshot for LocalRegistry {
    fn don_ids(&self) -> Vec<DonId> {
        self.ids_to_dons.keys().copied().collect()
    }

    fn don(&self, id: DonId) -> Option<Cow<'_, DonWithCapabilities>> {
        self.ids_to_dons.get(&id).map(Cow::Borrowed)
    }

    fn capability(&self, id: &str) -> Option<Cow<'_, CapabilityDescriptor>> {
        self.ids_to_capabilities.get(id).map(Cow::Borrowed)
    }

    fn node(&self, peer: &PeerId) -> Option<Cow<'_, NodeInfo>> {
        self.ids_to_nodes.get(peer).map(Cow::Borrowed)
    }

    fn to_local_registry(&self) -> LocalRegistry {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_hex_round_trip() {
        let peer = PeerId([7u8; 32]);
        let parsed: PeerId = format!("0x{peer}").parse().unwrap();
        assert_eq!(parsed, peer);
    }

    #[test]
    fn peer_id_rejects_short_input() {
        assert!("abcd".parse::<PeerId>().is_err());
    }

    #[test]
    fn don_membership_and_threshold() {
        let don = Don {
            id: 1,
            config_version: 1,
            f: 1,
            members: vec![PeerId([1; 32]), PeerId([2; 32])],
            is_public: true,
            accepts_workflows: false,
        };
        assert!(don.contains(&PeerId([2; 32])));
        assert!(!don.contains(&PeerId([3; 32])));
        assert_eq!(don.min_responses(), 2);
    }

    #[test]
    fn snapshot_from_json() {
        let peer = PeerId([9; 32]);
        let json = serde_json::json!({
            "ids_to_dons": {
                "4": {
                    "id": 4,
                    "f": 0,
                    "members": [peer.to_string()],
                    "is_public": true,
                    "capability_configurations": { "write-chain@1.0.0": { "config": "" } }
                }
            },
            "ids_to_capabilities": {
                "write-chain@1.0.0": { "id": "write-chain@1.0.0", "capability_type": "target" }
            },
            "ids_to_nodes": {
                peer.to_string(): { "peer_id": peer.to_string(), "signer": "0xaabb" }
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("topology.json");
        std::fs::write(&path, json.to_string()).unwrap();

        let registry = LocalRegistry::from_json_file(&path).unwrap();
        assert_eq!(registry.don_ids(), vec![4]);
        assert!(registry.don(4).unwrap().don.is_public);
        assert_eq!(
            registry.capability("write-chain@1.0.0").unwrap().capability_type,
            CapabilityType::Target
        );
        assert_eq!(registry.node(&peer).unwrap().signer, vec![0xaa, 0xbb]);
    }
}
