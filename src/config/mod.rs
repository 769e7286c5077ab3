//! Configuration management for the capability node

pub mod file;

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::capabilities::RemoteTriggerConfig;
use crate::launcher::LauncherConfig;
use crate::remote::StreamConfig;
use crate::remote::target_client::DEFAULT_REQUEST_TIMEOUT;
use crate::streams::trigger_service::{DEFAULT_QUEUE_CAPACITY, DEFAULT_TICK_RESOLUTION_MS};
use crate::topology::PeerId;
use crate::{Error, Result};

use file::ConfigFile;

/// Node configuration
///
/// Precedence is env > toml > default.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Local node; commands that need one fail without it
    pub peer_id: Option<PeerId>,

    /// Limits applied to every peer stream
    pub stream: StreamConfig,

    /// How long a remote target call may take
    pub target_request_timeout: Duration,

    /// Fallbacks for unset remote trigger settings
    pub trigger_defaults: RemoteTriggerConfig,

    /// Local streams trigger service
    pub streams: StreamsServiceConfig,
}

/// Settings for the local streams trigger service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamsServiceConfig {
    pub tick_resolution_ms: u64,
    pub queue_capacity: usize,
}

impl Default for StreamsServiceConfig {
    fn default() -> Self {
        Self {
            tick_resolution_ms: DEFAULT_TICK_RESOLUTION_MS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            peer_id: None,
            stream: StreamConfig::default(),
            target_request_timeout: DEFAULT_REQUEST_TIMEOUT,
            trigger_defaults: RemoteTriggerConfig::default(),
            streams: StreamsServiceConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the standard file location and the process
    /// environment
    ///
    /// An explicit `path` must exist and parse; the standard location is
    /// optional.
    ///
    /// # Errors
    ///
    /// Returns error if the explicit file cannot be loaded or a value is
    /// invalid
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let fc = match path {
            Some(p) => file::load_config_file_from(p)?,
            None => file::load_config_file(),
        };

        let mut config = Self::from_file(fc)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay a parsed config file on top of defaults
    ///
    /// # Errors
    ///
    /// Returns error if the peer id is malformed
    pub fn from_file(fc: ConfigFile) -> Result<Self> {
        let mut config = Self {
            peer_id: fc.peer_id.as_deref().map(PeerId::from_str).transpose()?,
            ..Self::default()
        };

        let stream = &mut config.stream;
        if let Some(v) = fc.stream.incoming_message_buffer_size {
            stream.incoming_message_buffer_size = v;
        }
        if let Some(v) = fc.stream.outgoing_message_buffer_size {
            stream.outgoing_message_buffer_size = v;
        }
        if let Some(v) = fc.stream.max_message_len_bytes {
            stream.max_message_len_bytes = v;
        }
        if let Some(v) = fc.stream.message_rate {
            stream.message_rate_limiter.rate = v;
        }
        if let Some(v) = fc.stream.message_capacity {
            stream.message_rate_limiter.capacity = v;
        }
        if let Some(v) = fc.stream.bytes_rate {
            stream.bytes_rate_limiter.rate = v;
        }
        if let Some(v) = fc.stream.bytes_capacity {
            stream.bytes_rate_limiter.capacity = v;
        }

        if let Some(secs) = fc.target.request_timeout_secs {
            config.target_request_timeout = Duration::from_secs(secs);
        }

        let trigger = &mut config.trigger_defaults;
        if let Some(secs) = fc.trigger.registration_refresh_secs {
            trigger.registration_refresh = Duration::from_secs(secs);
        }
        if let Some(secs) = fc.trigger.registration_expiry_secs {
            trigger.registration_expiry = Duration::from_secs(secs);
        }
        if let Some(secs) = fc.trigger.message_expiry_secs {
            trigger.message_expiry = Duration::from_secs(secs);
        }

        if let Some(ms) = fc.streams.tick_resolution_ms {
            config.streams.tick_resolution_ms = ms;
        }
        if let Some(n) = fc.streams.queue_capacity {
            config.streams.queue_capacity = n;
        }

        Ok(config)
    }

    /// Override values from `DONCAP_*` variables
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if a variable is set but unparseable
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("DONCAP_PEER_ID") {
            self.peer_id = Some(v.parse()?);
        }
        if let Some(secs) = env_parse::<u64, _>(&lookup, "DONCAP_TARGET_TIMEOUT_SECS")? {
            self.target_request_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse(&lookup, "DONCAP_MAX_MESSAGE_LEN")? {
            self.stream.max_message_len_bytes = n;
        }
        if let Some(secs) = env_parse::<u64, _>(&lookup, "DONCAP_REGISTRATION_REFRESH_SECS")? {
            self.trigger_defaults.registration_refresh = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64, _>(&lookup, "DONCAP_REGISTRATION_EXPIRY_SECS")? {
            self.trigger_defaults.registration_expiry = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64, _>(&lookup, "DONCAP_MESSAGE_EXPIRY_SECS")? {
            self.trigger_defaults.message_expiry = Duration::from_secs(secs);
        }
        if let Some(ms) = env_parse(&lookup, "DONCAP_TICK_RESOLUTION_MS")? {
            self.streams.tick_resolution_ms = ms;
        }
        if let Some(n) = env_parse(&lookup, "DONCAP_QUEUE_CAPACITY")? {
            self.streams.queue_capacity = n;
        }
        Ok(())
    }

    /// Reject values no component can run with
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the offending value
    pub fn validate(&self) -> Result<()> {
        if self.target_request_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "target request timeout must be positive".to_string(),
            ));
        }
        if self.streams.tick_resolution_ms == 0 {
            return Err(Error::InvalidConfig(
                "streams tick resolution must be positive".to_string(),
            ));
        }
        if self.streams.queue_capacity == 0 {
            return Err(Error::InvalidConfig(
                "streams queue capacity must be positive".to_string(),
            ));
        }
        if self.stream.max_message_len_bytes == 0 {
            return Err(Error::InvalidConfig(
                "max message length must be positive".to_string(),
            ));
        }
        for (name, bucket) in [
            ("message", self.stream.message_rate_limiter),
            ("bytes", self.stream.bytes_rate_limiter),
        ] {
            if !bucket.rate.is_finite() || bucket.rate <= 0.0 || bucket.capacity == 0 {
                return Err(Error::InvalidConfig(format!(
                    "{name} rate limiter needs a positive rate and capacity"
                )));
            }
        }
        Ok(())
    }

    /// The local peer id
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if none was configured
    pub fn require_peer_id(&self) -> Result<PeerId> {
        self.peer_id.ok_or_else(|| {
            Error::Config("no peer id configured (set DONCAP_PEER_ID or peer_id)".to_string())
        })
    }

    /// Shim defaults for the launcher
    #[must_use]
    pub fn launcher_config(&self) -> LauncherConfig {
        LauncherConfig {
            stream: self.stream,
            target_request_timeout: self.target_request_timeout,
            trigger_defaults: self.trigger_defaults.clone(),
        }
    }
}

fn env_parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| Error::InvalidConfig(format!("{key}={raw}: {e}")))
        })
        .transpose()
}
