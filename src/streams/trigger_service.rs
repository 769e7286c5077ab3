//! Provider-side streams trigger
//!
//! Keeps the latest report per feed and, on every aligned tick, pushes each
//! subscriber the reports for its feeds when its cadence divides the tick.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::{FeedId, FeedReport, SignersMetadata, event_id, wrap_reports};
use crate::capabilities::{
    BaseCapability, CapabilityInfo, CapabilityType, TriggerCapability,
    TriggerRegistrationRequest, TriggerResponse,
};
use crate::service::{BackgroundTask, Service};
use crate::{Error, Result};

/// Default tick resolution in milliseconds
pub const DEFAULT_TICK_RESOLUTION_MS: u64 = 1000;

/// Default capacity of each subscriber queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Per-subscriber trigger configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamsTriggerConfig {
    pub feed_ids: Vec<FeedId>,
    /// Cadence; must be a multiple of the tick resolution
    pub max_frequency_ms: u64,
}

struct Subscriber {
    workflow_id: String,
    config: StreamsTriggerConfig,
    tx: mpsc::Sender<TriggerResponse>,
}

#[derive(Default)]
struct State {
    subscribers: HashMap<String, Subscriber>,
    latest_reports: HashMap<FeedId, FeedReport>,
}

struct Inner {
    info: CapabilityInfo,
    tick_resolution_ms: u64,
    queue_capacity: usize,
    metadata: SignersMetadata,
    state: Mutex<State>,
}

/// Multiplexes one report stream to many subscribers on a fixed cadence
pub struct MercuryTriggerService {
    inner: Arc<Inner>,
    task: Mutex<Option<BackgroundTask>>,
}

/// Wall-clock milliseconds advanced by the tokio clock
///
/// Anchored to the system time once, then moved forward with
/// [`tokio::time::Instant`] so the cadence follows paused test time.
struct TickClock {
    wall_base_ms: i64,
    start: tokio::time::Instant,
}

impl TickClock {
    fn new() -> Self {
        Self {
            wall_base_ms: chrono::Utc::now().timestamp_millis(),
            start: tokio::time::Instant::now(),
        }
    }

    fn now_ms(&self) -> i64 {
        let elapsed = i64::try_from(self.start.elapsed().as_millis()).unwrap_or(i64::MAX);
        self.wall_base_ms.saturating_add(elapsed)
    }
}

/// Nearest multiple of `resolution` to `now`
const fn align(now: i64, resolution: i64) -> i64 {
    now.saturating_add(resolution / 2) / resolution * resolution
}

/// Delay until the tick after `aligned`, and whether the pass that ended at
/// `finished` overran one resolution
fn next_wait(aligned: i64, started: i64, finished: i64, resolution: i64) -> (i64, bool) {
    let overran = finished.saturating_sub(started) > resolution;
    let wait = aligned
        .saturating_add(resolution)
        .saturating_sub(finished)
        .max(0);
    (wait, overran)
}

impl MercuryTriggerService {
    /// Create the service under capability id `id`
    ///
    /// # Errors
    ///
    /// Returns error if the id is invalid or the tick resolution is zero
    pub fn new(id: &str, tick_resolution_ms: u64, queue_capacity: usize) -> Result<Self> {
        Self::with_signers(
            id,
            tick_resolution_ms,
            queue_capacity,
            SignersMetadata::default(),
        )
    }

    /// Create the service with signer metadata attached to every event
    ///
    /// # Errors
    ///
    /// Returns error if the id is invalid or the tick resolution is zero
    pub fn with_signers(
        id: &str,
        tick_resolution_ms: u64,
        queue_capacity: usize,
        metadata: SignersMetadata,
    ) -> Result<Self> {
        if tick_resolution_ms == 0 {
            return Err(Error::InvalidConfig(
                "tick resolution must be positive".to_string(),
            ));
        }
        let info = CapabilityInfo::new(id, CapabilityType::Trigger, "Streams Trigger")?;
        Ok(Self {
            inner: Arc::new(Inner {
                info,
                tick_resolution_ms,
                queue_capacity: queue_capacity.max(1),
                metadata,
                state: Mutex::new(State::default()),
            }),
            task: Mutex::new(None),
        })
    }

    /// Record new reports, replacing older ones for the same feed
    pub fn process_report(&self, reports: Vec<FeedReport>) {
        let mut state = self.inner.lock_state();
        let count = reports.len();
        for report in reports {
            state.latest_reports.insert(report.feed_id.clone(), report);
        }
        tracing::trace!(count, feeds = state.latest_reports.len(), "processed reports");
    }

    /// Run one cadence pass for the aligned tick `timestamp_ms`
    pub fn process(&self, timestamp_ms: i64) {
        self.inner.process(timestamp_ms);
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock_state().subscribers.len()
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn validate(&self, config: &StreamsTriggerConfig) -> Result<()> {
        if config.feed_ids.is_empty() {
            return Err(Error::InvalidConfig("feedIds must not be empty".to_string()));
        }
        if config.max_frequency_ms == 0 {
            return Err(Error::InvalidConfig(
                "maxFrequencyMs must be positive".to_string(),
            ));
        }
        if config.max_frequency_ms % self.tick_resolution_ms != 0 {
            return Err(Error::InvalidConfig(format!(
                "maxFrequencyMs {} must be a multiple of {}",
                config.max_frequency_ms, self.tick_resolution_ms
            )));
        }
        Ok(())
    }

    fn process(&self, timestamp_ms: i64) {
        let state = self.lock_state();
        for (trigger_id, subscriber) in &state.subscribers {
            let Ok(cadence) = i64::try_from(subscriber.config.max_frequency_ms) else {
                continue;
            };
            if timestamp_ms % cadence != 0 {
                continue;
            }

            let reports: Vec<FeedReport> = subscriber
                .config
                .feed_ids
                .iter()
                .filter_map(|id| state.latest_reports.get(id).cloned())
                .collect();
            if reports.is_empty() {
                continue;
            }

            let response = match self.build_response(timestamp_ms, &subscriber.config, reports) {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!(trigger_id = %trigger_id, error = %e, "failed to build trigger event");
                    continue;
                }
            };

            match subscriber.tx.try_send(response) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => tracing::warn!(
                    trigger_id = %trigger_id,
                    workflow_id = %subscriber.workflow_id,
                    "subscriber queue full, dropping event"
                ),
                Err(TrySendError::Closed(_)) => tracing::debug!(
                    trigger_id = %trigger_id,
                    "subscriber queue closed"
                ),
            }
        }
    }

    fn build_response(
        &self,
        timestamp_ms: i64,
        config: &StreamsTriggerConfig,
        reports: Vec<FeedReport>,
    ) -> Result<TriggerResponse> {
        let id = event_id(timestamp_ms, &config.feed_ids);
        let event = wrap_reports(
            self.info.id(),
            &id,
            reports,
            timestamp_ms,
            self.metadata.clone(),
        )?;
        Ok(TriggerResponse { event, err: None })
    }

    async fn run(self: Arc<Self>, mut shutdown_rx: mpsc::Receiver<()>) {
        let resolution = i64::try_from(self.tick_resolution_ms).unwrap_or(i64::MAX);
        let clock = TickClock::new();
        let mut wait = resolution - clock.now_ms().rem_euclid(resolution);

        loop {
            let sleep = Duration::from_millis(u64::try_from(wait).unwrap_or(0));
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                () = tokio::time::sleep(sleep) => {}
            }

            let started = clock.now_ms();
            let aligned = align(started, resolution);
            self.process(aligned);

            let finished = clock.now_ms();
            let (next, overran) = next_wait(aligned, started, finished, resolution);
            if overran {
                tracing::warn!(
                    elapsed_ms = finished - started,
                    resolution_ms = resolution,
                    "trigger processing overran tick"
                );
            }
            wait = next;
        }
    }
}

impl BaseCapability for MercuryTriggerService {
    fn info(&self) -> &CapabilityInfo {
        &self.inner.info
    }
}

#[async_trait]
impl TriggerCapability for MercuryTriggerService {
    async fn register_trigger(
        &self,
        request: TriggerRegistrationRequest,
    ) -> Result<mpsc::Receiver<TriggerResponse>> {
        if request.trigger_id.is_empty() {
            return Err(Error::InvalidConfig("trigger id is required".to_string()));
        }
        let config: StreamsTriggerConfig = serde_json::from_value(request.config.clone())
            .map_err(|e| Error::InvalidConfig(format!("invalid streams trigger config: {e}")))?;
        self.inner.validate(&config)?;

        let mut state = self.inner.lock_state();
        if state.subscribers.contains_key(&request.trigger_id) {
            return Err(Error::TriggerAlreadyRegistered(request.trigger_id));
        }

        let (tx, rx) = mpsc::channel(self.inner.queue_capacity);
        tracing::info!(
            trigger_id = %request.trigger_id,
            workflow_id = %request.metadata.workflow_id,
            feeds = config.feed_ids.len(),
            max_frequency_ms = config.max_frequency_ms,
            "registered streams trigger"
        );
        state.subscribers.insert(
            request.trigger_id,
            Subscriber {
                workflow_id: request.metadata.workflow_id,
                config,
                tx,
            },
        );
        Ok(rx)
    }

    async fn unregister_trigger(&self, request: TriggerRegistrationRequest) -> Result<()> {
        let removed = self
            .inner
            .lock_state()
            .subscribers
            .remove(&request.trigger_id);
        if removed.is_none() {
            return Err(Error::TriggerNotRegistered(request.trigger_id));
        }
        tracing::info!(trigger_id = %request.trigger_id, "unregistered streams trigger");
        Ok(())
    }
}

#[async_trait]
impl Service for MercuryTriggerService {
    fn name(&self) -> String {
        format!("MercuryTriggerService({})", self.inner.info.id())
    }

    async fn start(&self) -> Result<()> {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return Err(Error::Service(format!("{} already started", self.name())));
        }
        let inner = Arc::clone(&self.inner);
        *task = Some(BackgroundTask::spawn(|shutdown_rx| inner.run(shutdown_rx)));
        tracing::info!(
            id = %self.inner.info.id(),
            tick_resolution_ms = self.inner.tick_resolution_ms,
            "streams trigger service started"
        );
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
        self.inner.lock_state().subscribers.clear();
        tracing::info!(id = %self.inner.info.id(), "streams trigger service closed");
        Ok(())
    }
}
