//! Capability model
//!
//! A capability is a named, versioned unit of functionality served by a node
//! or a DON. Capabilities come in two execution contracts:
//!
//! - synchronous ([`ExecutableCapability`]): actions and targets, one request
//!   in and one response out
//! - asynchronous ([`TriggerCapability`]): triggers and consensus/report
//!   capabilities, register once and receive many events on a queue until
//!   unregistered
//!
//! [`Capability`] tags an implementation with its contract so the
//! [`Registry`] can check it against the declared [`CapabilityType`] on
//! insertion.

pub mod config;
pub mod registry;

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::topology::{Don, DonId};
use crate::{Error, Result};

pub use config::{CapabilityConfig, RemoteTargetConfig, RemoteTriggerConfig};
pub use registry::{LocalNode, Registry};

/// Maximum length of a fully qualified capability id
const ID_MAX_LENGTH: usize = 128;

/// Allowed characters for the labelled name part of an id
static NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9_:\-]+$").expect("valid regex"));

/// Declared type of a capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityType {
    /// Event source
    Trigger,
    /// Invocable step without on-chain effect
    Action,
    /// Aggregation-producing step, also called "report"
    #[serde(alias = "report")]
    Consensus,
    /// Invocable step that writes somewhere
    Target,
}

impl CapabilityType {
    /// Lowercase name as used in ids and logs
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trigger => "trigger",
            Self::Action => "action",
            Self::Consensus => "consensus",
            Self::Target => "target",
        }
    }

    /// Whether the type requires the synchronous execution contract
    #[must_use]
    pub const fn is_synchronous(self) -> bool {
        matches!(self, Self::Action | Self::Target)
    }
}

impl fmt::Display for CapabilityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CapabilityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "trigger" => Ok(Self::Trigger),
            "action" => Ok(Self::Action),
            "consensus" | "report" => Ok(Self::Consensus),
            "target" => Ok(Self::Target),
            other => Err(Error::InvalidCapabilityInfo(format!(
                "invalid capability type: {other}"
            ))),
        }
    }
}

/// Immutable description of a capability
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityInfo {
    id: String,
    capability_type: CapabilityType,
    description: String,
    version: semver::Version,
    don: Option<Don>,
}

impl CapabilityInfo {
    /// Describe a locally served capability
    ///
    /// `id` must be `<name>@<semver>` where the name matches `[a-z0-9_:-]+`.
    ///
    /// # Errors
    ///
    /// Returns error if the id or its version is invalid
    pub fn new(
        id: impl Into<String>,
        capability_type: CapabilityType,
        description: impl Into<String>,
    ) -> Result<Self> {
        Self::build(id.into(), capability_type, description.into(), None)
    }

    /// Describe a capability served by a remote DON
    ///
    /// # Errors
    ///
    /// Returns error if the id or its version is invalid
    pub fn new_remote(
        id: impl Into<String>,
        capability_type: CapabilityType,
        description: impl Into<String>,
        don: Don,
    ) -> Result<Self> {
        Self::build(id.into(), capability_type, description.into(), Some(don))
    }

    fn build(
        id: String,
        capability_type: CapabilityType,
        description: String,
        don: Option<Don>,
    ) -> Result<Self> {
        if id.len() > ID_MAX_LENGTH {
            return Err(Error::InvalidCapabilityInfo(format!(
                "id {id} exceeds max length {ID_MAX_LENGTH}"
            )));
        }

        let (name, version) = id.rsplit_once('@').ok_or_else(|| {
            Error::InvalidCapabilityInfo(format!("id {id} is missing a version suffix"))
        })?;

        if !NAME_REGEX.is_match(name) {
            return Err(Error::InvalidCapabilityInfo(format!(
                "invalid id: {id}, name must match {}",
                NAME_REGEX.as_str()
            )));
        }

        let version = semver::Version::parse(version).map_err(|e| {
            Error::InvalidCapabilityInfo(format!("invalid version in id {id}: {e}"))
        })?;

        Ok(Self {
            id,
            capability_type,
            description,
            version,
            don,
        })
    }

    /// Fully qualified id, e.g. `streams-trigger@1.0.0`
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Id without the version suffix
    #[must_use]
    pub fn labelled_name(&self) -> &str {
        self.id.rsplit_once('@').map_or(self.id.as_str(), |(name, _)| name)
    }

    #[must_use]
    pub const fn capability_type(&self) -> CapabilityType {
        self.capability_type
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    #[must_use]
    pub const fn version(&self) -> &semver::Version {
        &self.version
    }

    /// Owning DON, present only for remote capabilities
    #[must_use]
    pub const fn don(&self) -> Option<&Don> {
        self.don.as_ref()
    }

    #[must_use]
    pub const fn is_local(&self) -> bool {
        self.don.is_none()
    }
}

/// Workflow context attached to every capability call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub workflow_id: String,
    #[serde(default)]
    pub workflow_owner: String,
    #[serde(default)]
    pub workflow_execution_id: String,
    #[serde(default)]
    pub workflow_name: String,
    #[serde(default)]
    pub workflow_don_id: DonId,
    #[serde(default)]
    pub workflow_don_config_version: u32,
    #[serde(default)]
    pub reference_id: String,
}

/// Request to a synchronous capability
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRequest {
    pub metadata: RequestMetadata,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub inputs: serde_json::Value,
}

/// Response from a synchronous capability
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityResponse {
    pub value: serde_json::Value,
}

/// Subscription request for an asynchronous capability
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerRegistrationRequest {
    /// Subscriber id, unique per workflow trigger
    pub trigger_id: String,
    pub metadata: RequestMetadata,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// One event produced by a trigger
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub trigger_type: String,
    pub id: String,
    pub outputs: serde_json::Value,
}

/// Event or error delivered to a trigger subscriber
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub event: TriggerEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

impl TriggerResponse {
    /// Serialize for transport
    ///
    /// # Errors
    ///
    /// Returns error if the outputs cannot be serialized
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from transport
    ///
    /// # Errors
    ///
    /// Returns error if the bytes are not a trigger response
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Behaviour shared by every capability
pub trait BaseCapability: Send + Sync {
    fn info(&self) -> &CapabilityInfo;
}

/// Synchronous capability contract (actions and targets)
#[async_trait]
pub trait ExecutableCapability: BaseCapability {
    /// Run the capability once
    ///
    /// # Errors
    ///
    /// Returns error if execution fails
    async fn execute(&self, request: CapabilityRequest) -> Result<CapabilityResponse>;
}

/// Asynchronous capability contract (triggers and consensus)
#[async_trait]
pub trait TriggerCapability: BaseCapability {
    /// Subscribe; events arrive on the returned queue until unregistered
    ///
    /// # Errors
    ///
    /// Returns error if the request is invalid or already registered
    async fn register_trigger(
        &self,
        request: TriggerRegistrationRequest,
    ) -> Result<mpsc::Receiver<TriggerResponse>>;

    /// Remove a subscription and close its queue
    ///
    /// # Errors
    ///
    /// Returns error if no such subscription exists
    async fn unregister_trigger(&self, request: TriggerRegistrationRequest) -> Result<()>;
}

/// A capability implementation tagged with its execution contract
#[derive(Clone)]
pub enum Capability {
    Executable(Arc<dyn ExecutableCapability>),
    Trigger(Arc<dyn TriggerCapability>),
}

impl Capability {
    #[must_use]
    pub fn info(&self) -> &CapabilityInfo {
        match self {
            Self::Executable(c) => c.info(),
            Self::Trigger(c) => c.info(),
        }
    }

    #[must_use]
    pub fn as_executable(&self) -> Option<Arc<dyn ExecutableCapability>> {
        match self {
            Self::Executable(c) => Some(Arc::clone(c)),
            Self::Trigger(_) => None,
        }
    }

    #[must_use]
    pub fn as_trigger(&self) -> Option<Arc<dyn TriggerCapability>> {
        match self {
            Self::Trigger(c) => Some(Arc::clone(c)),
            Self::Executable(_) => None,
        }
    }

    /// Whether the implementation satisfies the contract of its declared type
    #[must_use]
    pub fn satisfies_declared_type(&self) -> bool {
        let declared_sync = self.info().capability_type().is_synchronous();
        match self {
            Self::Executable(_) => declared_sync,
            Self::Trigger(_) => !declared_sync,
        }
    }

    fn contract(&self) -> &'static str {
        match self {
            Self::Executable(_) => "synchronous",
            Self::Trigger(_) => "asynchronous",
        }
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capability")
            .field("id", &self.info().id())
            .field("contract", &self.contract())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_info() {
        let info = CapabilityInfo::new(
            "streams-trigger:network_mainnet@1.0.0",
            CapabilityType::Trigger,
            "streams",
        )
        .unwrap();
        assert_eq!(info.labelled_name(), "streams-trigger:network_mainnet");
        assert_eq!(info.version(), &semver::Version::new(1, 0, 0));
        assert!(info.is_local());
    }

    #[test]
    fn rejects_invalid_name() {
        for id in ["Streams@1.0.0", "streams trigger@1.0.0", "@1.0.0", "a.b@1.0.0"] {
            let err = CapabilityInfo::new(id, CapabilityType::Action, "").unwrap_err();
            assert!(matches!(err, Error::InvalidCapabilityInfo(_)), "{id}");
        }
    }

    #[test]
    fn rejects_invalid_version() {
        for id in ["streams", "streams@1.0", "streams@latest", "streams@"] {
            assert!(CapabilityInfo::new(id, CapabilityType::Action, "").is_err(), "{id}");
        }
    }

    #[test]
    fn rejects_overlong_id() {
        let id = format!("{}@1.0.0", "a".repeat(ID_MAX_LENGTH));
        assert!(CapabilityInfo::new(id, CapabilityType::Action, "").is_err());
    }

    #[test]
    fn remote_info_carries_don() {
        let don = Don {
            id: 3,
            config_version: 1,
            f: 1,
            members: vec![],
            is_public: true,
            accepts_workflows: false,
        };
        let info =
            CapabilityInfo::new_remote("write-chain@2.1.0", CapabilityType::Target, "", don)
                .unwrap();
        assert!(!info.is_local());
        assert_eq!(info.don().map(|d| d.id), Some(3));
    }

    #[test]
    fn parses_capability_types() {
        assert_eq!("trigger".parse::<CapabilityType>().unwrap(), CapabilityType::Trigger);
        assert_eq!("report".parse::<CapabilityType>().unwrap(), CapabilityType::Consensus);
        assert!("workflow".parse::<CapabilityType>().is_err());
        let parsed: CapabilityType = serde_json::from_str("\"report\"").unwrap();
        assert_eq!(parsed, CapabilityType::Consensus);
    }

    #[test]
    fn trigger_response_bytes() {
        let response = TriggerResponse {
            event: TriggerEvent {
                trigger_type: "streams-trigger@1.0.0".into(),
                id: "ev".into(),
                outputs: serde_json::json!({"k": 1}),
            },
            err: None,
        };
        let decoded = TriggerResponse::from_bytes(&response.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, response);
        assert!(TriggerResponse::from_bytes(b"not json").is_err());
    }
}
