//! Topology snapshots from the older registry reader
//!
//! That generation keys capabilities by a hash of their labelled name and
//! version instead of the human-readable id. Lookups translate between the
//! two so the launcher never sees the difference.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{
    CapabilityConfiguration, CapabilityDescriptor, Don, DonId, DonWithCapabilities, LocalRegistry,
    NodeInfo, PeerId, TopologySnapshot,
};
use crate::capabilities::CapabilityType;

/// Hex-encoded hash identifying a capability by labelled name and version
#[must_use]
pub fn hashed_capability_id(labelled_name: &str, version: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(labelled_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(version.as_bytes());
    hex::encode(hasher.finalize())
}

/// Capability entry keyed by hashed id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashedCapability {
    pub labelled_name: String,
    pub version: String,
    pub capability_type: CapabilityType,
}

impl HashedCapability {
    fn id(&self) -> String {
        format!("{}@{}", self.labelled_name, self.version)
    }
}

/// DON whose capability configurations are keyed by hashed id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashedDon {
    #[serde(flatten)]
    pub don: Don,

    #[serde(default)]
    pub capability_configurations: BTreeMap<String, CapabilityConfiguration>,
}

/// Snapshot in the hashed-id schema
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashedRegistry {
    #[serde(default)]
    pub dons: BTreeMap<DonId, HashedDon>,

    #[serde(default)]
    pub capabilities: BTreeMap<String, HashedCapability>,

    #[serde(default)]
    pub nodes: HashMap<PeerId, NodeInfo>,
}

impl HashedRegistry {
    fn translate_don(&self, don: &HashedDon) -> DonWithCapabilities {
        let mut configurations = BTreeMap::new();
        for (hashed_id, config) in &don.capability_configurations {
            match self.capabilities.get(hashed_id) {
                Some(cap) => {
                    configurations.insert(cap.id(), config.clone());
                }
                None => tracing::warn!(
                    don_id = don.don.id,
                    hashed_id = %hashed_id,
                    "DON configures a capability missing from the snapshot, skipping"
                ),
            }
        }
        DonWithCapabilities {
            don: don.don.clone(),
            capability_configurations: configurations,
        }
    }
}

impl TopologySnapshot for HashedRegistry {
    fn don_ids(&self) -> Vec<DonId> {
        self.dons.keys().copied().collect()
    }

    fn don(&self, id: DonId) -> Option<Cow<'_, DonWithCapabilities>> {
        self.dons
            .get(&id)
            .map(|don| Cow::Owned(self.translate_don(don)))
    }

    fn capability(&self, id: &str) -> Option<Cow<'_, CapabilityDescriptor>> {
        let (name, version) = id.rsplit_once('@')?;
        let cap = self.capabilities.get(&hashed_capability_id(name, version))?;
        Some(Cow::Owned(CapabilityDescriptor {
            id: cap.id(),
            capability_type: cap.capability_type,
            config_contract: None,
        }))
    }

    fn node(&self, peer: &PeerId) -> Option<Cow<'_, NodeInfo>> {
        self.nodes.get(peer).map(Cow::Borrowed)
    }

    fn to_local_registry(&self) -> LocalRegistry {
        LocalRegistry {
            ids_to_dons: self
                .dons
                .iter()
                .map(|(id, don)| (*id, self.translate_don(don)))
                .collect(),
            ids_to_capabilities: self
                .capabilities
                .values()
                .map(|cap| {
                    let id = cap.id();
                    (
                        id.clone(),
                        CapabilityDescriptor {
                            id,
                            capability_type: cap.capability_type,
                            config_contract: None,
                        },
                    )
                })
                .collect(),
            ids_to_nodes: self.nodes.clone(),
        }
    }
}
