//! DON capabilities - capability registry and cross-DON capability plumbing
//!
//! This library provides the pieces a node needs to use and serve
//! capabilities across Decentralized Oracle Network boundaries:
//! - A capability registry keyed by versioned capability id
//! - A launcher that turns topology snapshots into remote capability shims
//! - Trigger and target shims for both the consuming and providing side
//! - The streams (Mercury) trigger service and its remote aggregator
//! - The OCR3 data feeds outcome aggregator
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Topology snapshot                    │
//! │        DONs  │  Capabilities  │  Nodes              │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                    Launcher                          │
//! │   Subscriber │ Publisher │ Target client │ Server   │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │          Registry  │  Dispatcher (transport)         │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod capabilities;
pub mod codec;
pub mod config;
pub mod datafeeds;
pub mod error;
pub mod launcher;
pub mod remote;
pub mod service;
pub mod streams;
pub mod topology;

pub use capabilities::{
    BaseCapability, Capability, CapabilityInfo, CapabilityRequest, CapabilityResponse,
    CapabilityType, ExecutableCapability, Registry, TriggerCapability, TriggerRegistrationRequest,
    TriggerResponse,
};
pub use config::Config;
pub use datafeeds::DataFeedsAggregator;
pub use error::{Error, Result};
pub use launcher::{LaunchPlan, Launcher, LauncherConfig};
pub use remote::{ConnectionManager, Dispatcher, LoopbackNetwork, Receiver};
pub use service::Service;
pub use streams::{MercuryRemoteAggregator, MercuryTriggerService};
pub use topology::{Don, DonId, LocalRegistry, PeerId, TopologySnapshot};
