//! On-chain capability configuration
//!
//! Each (DON, capability) pair carries a protobuf-encoded `CapabilityConfig`
//! with an opaque default config and optionally the remote-shim settings for
//! triggers or targets. Zero durations mean "use the node default".

use std::time::Duration;

use prost::Message;

use crate::Result;

/// Default interval between trigger re-registrations
pub const DEFAULT_REGISTRATION_REFRESH: Duration = Duration::from_secs(30);

/// Default lifetime of a trigger registration that is not refreshed
pub const DEFAULT_REGISTRATION_EXPIRY: Duration = Duration::from_secs(120);

/// Default lifetime of a partially aggregated trigger event
pub const DEFAULT_MESSAGE_EXPIRY: Duration = Duration::from_secs(120);

/// Protobuf duration
#[derive(Clone, Copy, PartialEq, Eq, Message)]
pub struct ProtoDuration {
    #[prost(int64, tag = "1")]
    pub seconds: i64,
    #[prost(int32, tag = "2")]
    pub nanos: i32,
}

impl From<Duration> for ProtoDuration {
    fn from(d: Duration) -> Self {
        Self {
            seconds: i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
            nanos: i32::try_from(d.subsec_nanos()).unwrap_or(0),
        }
    }
}

impl From<ProtoDuration> for Duration {
    fn from(d: ProtoDuration) -> Self {
        let secs = u64::try_from(d.seconds).unwrap_or(0);
        let nanos = u32::try_from(d.nanos).unwrap_or(0);
        Self::new(secs, nanos)
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct RemoteTriggerConfigProto {
    #[prost(message, optional, tag = "1")]
    pub registration_refresh: Option<ProtoDuration>,
    #[prost(message, optional, tag = "2")]
    pub registration_expiry: Option<ProtoDuration>,
    #[prost(uint32, tag = "3")]
    pub min_responses_to_aggregate: u32,
    #[prost(message, optional, tag = "4")]
    pub message_expiry: Option<ProtoDuration>,
}

#[derive(Clone, PartialEq, Message)]
pub struct RemoteTargetConfigProto {
    #[prost(string, repeated, tag = "1")]
    pub request_hash_excluded_attributes: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum RemoteConfigProto {
    #[prost(message, tag = "2")]
    RemoteTriggerConfig(RemoteTriggerConfigProto),
    #[prost(message, tag = "3")]
    RemoteTargetConfig(RemoteTargetConfigProto),
}

#[derive(Clone, PartialEq, Message)]
pub struct CapabilityConfigProto {
    #[prost(bytes = "vec", tag = "1")]
    pub default_config: Vec<u8>,
    #[prost(oneof = "RemoteConfigProto", tags = "2, 3")]
    pub remote_config: Option<RemoteConfigProto>,
}

/// Settings for remote trigger shims
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTriggerConfig {
    pub registration_refresh: Duration,
    pub registration_expiry: Duration,
    pub min_responses_to_aggregate: u32,
    pub message_expiry: Duration,
}

impl Default for RemoteTriggerConfig {
    fn default() -> Self {
        Self {
            registration_refresh: DEFAULT_REGISTRATION_REFRESH,
            registration_expiry: DEFAULT_REGISTRATION_EXPIRY,
            min_responses_to_aggregate: 1,
            message_expiry: DEFAULT_MESSAGE_EXPIRY,
        }
    }
}

impl RemoteTriggerConfig {
    /// Replace unset values with `defaults`
    #[must_use]
    pub fn with_defaults(mut self, defaults: &Self) -> Self {
        if self.registration_refresh.is_zero() {
            self.registration_refresh = defaults.registration_refresh;
        }
        if self.registration_expiry.is_zero() {
            self.registration_expiry = defaults.registration_expiry;
        }
        if self.message_expiry.is_zero() {
            self.message_expiry = defaults.message_expiry;
        }
        if self.min_responses_to_aggregate == 0 {
            self.min_responses_to_aggregate = defaults.min_responses_to_aggregate.max(1);
        }
        self
    }
}

impl From<RemoteTriggerConfigProto> for RemoteTriggerConfig {
    fn from(p: RemoteTriggerConfigProto) -> Self {
        Self {
            registration_refresh: p.registration_refresh.map(Into::into).unwrap_or_default(),
            registration_expiry: p.registration_expiry.map(Into::into).unwrap_or_default(),
            min_responses_to_aggregate: p.min_responses_to_aggregate,
            message_expiry: p.message_expiry.map(Into::into).unwrap_or_default(),
        }
    }
}

impl From<&RemoteTriggerConfig> for RemoteTriggerConfigProto {
    fn from(c: &RemoteTriggerConfig) -> Self {
        Self {
            registration_refresh: Some(c.registration_refresh.into()),
            registration_expiry: Some(c.registration_expiry.into()),
            min_responses_to_aggregate: c.min_responses_to_aggregate,
            message_expiry: Some(c.message_expiry.into()),
        }
    }
}

/// Settings for remote target shims
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteTargetConfig {
    /// Dotted input paths left out of the request hash (e.g. `signed_report.signatures`)
    pub request_hash_excluded_attributes: Vec<String>,
}

/// Decoded per-(DON, capability) configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityConfig {
    pub default_config: Vec<u8>,
    pub remote_trigger_config: Option<RemoteTriggerConfig>,
    pub remote_target_config: Option<RemoteTargetConfig>,
}

impl CapabilityConfig {
    /// Decode a protobuf `CapabilityConfig`
    ///
    /// # Errors
    ///
    /// Returns error if the bytes are not valid protobuf
    pub fn decode_bytes(bytes: &[u8]) -> Result<Self> {
        let proto = CapabilityConfigProto::decode(bytes)?;
        let mut config = Self {
            default_config: proto.default_config,
            ..Self::default()
        };
        match proto.remote_config {
            Some(RemoteConfigProto::RemoteTriggerConfig(t)) => {
                config.remote_trigger_config = Some(t.into());
            }
            Some(RemoteConfigProto::RemoteTargetConfig(t)) => {
                config.remote_target_config = Some(RemoteTargetConfig {
                    request_hash_excluded_attributes: t.request_hash_excluded_attributes,
                });
            }
            None => {}
        }
        Ok(config)
    }

    /// Encode as protobuf
    #[must_use]
    pub fn encode_to_vec(&self) -> Vec<u8> {
        let remote_config = if let Some(t) = &self.remote_trigger_config {
            Some(RemoteConfigProto::RemoteTriggerConfig(t.into()))
        } else {
            self.remote_target_config.as_ref().map(|t| {
                RemoteConfigProto::RemoteTargetConfig(RemoteTargetConfigProto {
                    request_hash_excluded_attributes: t.request_hash_excluded_attributes.clone(),
                })
            })
        };
        CapabilityConfigProto {
            default_config: self.default_config.clone(),
            remote_config,
        }
        .encode_to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_bytes_decode_to_empty_config() {
        let config = CapabilityConfig::decode_bytes(&[]).unwrap();
        assert_eq!(config, CapabilityConfig::default());
    }

    #[test]
    fn trigger_config_survives_encoding() {
        let config = CapabilityConfig {
            default_config: vec![1, 2],
            remote_trigger_config: Some(RemoteTriggerConfig {
                registration_refresh: Duration::from_secs(5),
                registration_expiry: Duration::from_secs(60),
                min_responses_to_aggregate: 3,
                message_expiry: Duration::from_millis(1500),
            }),
            remote_target_config: None,
        };
        let decoded = CapabilityConfig::decode_bytes(&config.encode_to_vec()).unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn target_config_excluded_attributes() {
        let config = CapabilityConfig {
            remote_target_config: Some(RemoteTargetConfig {
                request_hash_excluded_attributes: vec!["signed_report.signatures".into()],
            }),
            ..CapabilityConfig::default()
        };
        let decoded = CapabilityConfig::decode_bytes(&config.encode_to_vec()).unwrap();
        assert!(decoded.remote_trigger_config.is_none());
        assert_eq!(
            decoded
                .remote_target_config
                .unwrap()
                .request_hash_excluded_attributes,
            vec!["signed_report.signatures".to_string()]
        );
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(CapabilityConfig::decode_bytes(&[0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn zero_values_take_defaults() {
        let config = RemoteTriggerConfig {
            registration_refresh: Duration::ZERO,
            registration_expiry: Duration::from_secs(7),
            min_responses_to_aggregate: 0,
            message_expiry: Duration::ZERO,
        }
        .with_defaults(&RemoteTriggerConfig::default());

        assert_eq!(config.registration_refresh, DEFAULT_REGISTRATION_REFRESH);
        assert_eq!(config.registration_expiry, Duration::from_secs(7));
        assert_eq!(config.message_expiry, DEFAULT_MESSAGE_EXPIRY);
        assert_eq!(config.min_responses_to_aggregate, 1);
    }
}
