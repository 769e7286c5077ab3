//! DON classification for one topology snapshot

use std::collections::BTreeSet;

use serde::Serialize;

use crate::topology::{Don, DonId, DonWithCapabilities, PeerId, TopologySnapshot};
use crate::{Error, Result};

/// What the local node must connect to, consume and expose
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchPlan {
    pub peer_id: PeerId,

    /// Every DON id in the snapshot, sorted
    pub don_ids: Vec<DonId>,

    /// Members of public DONs; the transport keeps streams open to these
    pub all_peers: BTreeSet<PeerId>,

    /// DONs the local node belongs to
    pub my_dons: Vec<Don>,

    /// Workflow DONs the local node belongs to (at most one is valid)
    pub my_workflow_dons: Vec<Don>,

    /// Workflow DONs that may call into capabilities served here
    pub remote_workflow_dons: Vec<Don>,

    /// Public capability DONs the local node serves in
    pub my_capability_dons: Vec<DonWithCapabilities>,

    /// Public capability DONs whose capabilities the local node can consume
    pub remote_capability_dons: Vec<DonWithCapabilities>,
}

impl LaunchPlan {
    /// The workflow DON the local node belongs to
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvariantViolation`] if the node is in more than one
    /// workflow DON
    pub fn workflow_don(&self) -> Result<Option<&Don>> {
        match self.my_workflow_dons.as_slice() {
            [] => Ok(None),
            [don] => Ok(Some(don)),
            dons => Err(Error::InvariantViolation(format!(
                "node {} is in {} workflow DONs ({:?}), expected at most one",
                self.peer_id,
                dons.len(),
                dons.iter().map(|d| d.id).collect::<Vec<_>>()
            ))),
        }
    }

    /// Whether the local node has anything to consume or expose
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.my_workflow_dons.is_empty() && self.my_capability_dons.is_empty()
    }
}

/// Classify every DON in `snapshot` relative to `peer_id`
///
/// DONs are visited in id order so the result does not depend on the
/// snapshot's internal ordering.
pub fn plan<S: TopologySnapshot + ?Sized>(snapshot: &S, peer_id: PeerId) -> LaunchPlan {
    let mut don_ids = snapshot.don_ids();
    don_ids.sort_unstable();

    let mut plan = LaunchPlan {
        peer_id,
        don_ids: don_ids.clone(),
        all_peers: BTreeSet::new(),
        my_dons: Vec::new(),
        my_workflow_dons: Vec::new(),
        remote_workflow_dons: Vec::new(),
        my_capability_dons: Vec::new(),
        remote_capability_dons: Vec::new(),
    };

    for id in don_ids {
        let Some(entry) = snapshot.don(id) else {
            tracing::warn!(don_id = id, "DON listed but missing from snapshot");
            continue;
        };
        let don = &entry.don;
        let is_member = don.contains(&peer_id);

        if don.is_public {
            plan.all_peers.extend(don.members.iter().copied());
        }
        if is_member {
            plan.my_dons.push(don.clone());
        }

        if don.accepts_workflows {
            if is_member {
                plan.my_workflow_dons.push(don.clone());
            } else {
                plan.remote_workflow_dons.push(don.clone());
            }
        }

        if don.is_public && !entry.capability_configurations.is_empty() {
            if is_member {
                plan.my_capability_dons.push(entry.into_owned());
            } else {
                plan.remote_capability_dons.push(entry.into_owned());
            }
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::topology::{CapabilityConfiguration, LocalRegistry};

    fn don(id: DonId, members: &[u8], is_public: bool, accepts_workflows: bool, caps: &[&str]) -> DonWithCapabilities {
        DonWithCapabilities {
            don: Don {
                id,
                config_version: 1,
                f: 0,
                members: members.iter().map(|b| PeerId([*b; 32])).collect(),
                is_public,
                accepts_workflows,
            },
            capability_configurations: caps
                .iter()
                .map(|c| ((*c).to_string(), CapabilityConfiguration::default()))
                .collect(),
        }
    }

    fn snapshot(dons: Vec<DonWithCapabilities>) -> LocalRegistry {
        LocalRegistry {
            ids_to_dons: dons.into_iter().map(|d| (d.don.id, d)).collect::<BTreeMap<_, _>>(),
            ..LocalRegistry::default()
        }
    }

    #[test]
    fn classifies_membership() {
        let registry = snapshot(vec![
            don(1, &[1, 2], true, true, &[]),
            don(2, &[3, 4], true, false, &["streams-trigger@1.0.0"]),
            don(3, &[1, 5], true, false, &["write-chain@1.0.0"]),
            don(4, &[6], true, true, &[]),
        ]);
        let plan = plan(&registry, PeerId([1; 32]));

        assert_eq!(plan.don_ids, vec![1, 2, 3, 4]);
        assert_eq!(plan.my_dons.iter().map(|d| d.id).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(plan.workflow_don().unwrap().map(|d| d.id), Some(1));
        assert_eq!(plan.remote_workflow_dons[0].id, 4);
        assert_eq!(plan.my_capability_dons[0].don.id, 3);
        assert_eq!(plan.remote_capability_dons[0].don.id, 2);
        assert_eq!(plan.all_peers.len(), 6);
        assert!(!plan.is_idle());
    }

    #[test]
    fn private_dons_are_ignored() {
        let registry = snapshot(vec![
            don(1, &[1], true, true, &[]),
            don(2, &[7, 8], false, false, &["streams-trigger@1.0.0"]),
        ]);
        let plan = plan(&registry, PeerId([1; 32]));

        assert!(plan.remote_capability_dons.is_empty());
        assert!(!plan.all_peers.contains(&PeerId([7; 32])));
    }

    #[test]
    fn two_workflow_dons_violate_invariant() {
        let registry = snapshot(vec![
            don(1, &[1], true, true, &[]),
            don(2, &[1], true, true, &[]),
        ]);
        let plan = plan(&registry, PeerId([1; 32]));
        assert!(matches!(plan.workflow_don(), Err(Error::InvariantViolation(_))));
    }

    #[test]
    fn outsider_is_idle() {
        let registry = snapshot(vec![don(1, &[1], true, true, &[])]);
        let plan = plan(&registry, PeerId([9; 32]));
        assert!(plan.is_idle());
        assert_eq!(plan.remote_workflow_dons.len(), 1);
    }
}
