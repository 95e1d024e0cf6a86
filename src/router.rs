// =============================================================================
// router.rs — THE LONG-RUNNING SUBSCRIBER
// =============================================================================
//
// One router per consumer group. It subscribes to every topic, fetches
// entries and fans them out to partition workers:
//
//   fetch loop ──hash(key) % N──▶ worker 0 ─┐
//                               ▶ worker 1 ─┼─▶ handler ─▶ ack / leave pending
//                               ▶ worker N ─┘
//
// Entries sharing an ordering key (the campaign id for batch requests) land
// on the same worker and are handled one after another in stream order.
// Different keys proceed concurrently.
//
// Per entry:
//   Ok                 → remember in the replay guard, ack
//   data / external    → log, remember, ack (redelivery would fail the same way)
//   transient          → leave pending, schedule a rewind so it comes back
//
// A handler error never reaches the fetch loop.
//
// Shutdown: stop fetching, close the worker queues, wait for the workers to
// drain (bounded by the grace period), disconnect from the broker.
// =============================================================================

use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::broker::{EventSource, StreamEntry};
use crate::config::Config;
use crate::dedup::ReplayGuard;
use crate::error::HandlerError;
use crate::insights::InsightGenerator;
use crate::metrics::MetricsCollector;
use crate::models::{
    ActivityEvent, ActivityRecord, BatchRequested, InsightRequested, LogPurgeRequested,
    SegmentPurgeRequested,
};
use crate::pipeline::BatchPipeline;
use crate::store::CampaignStore;

/// Delay before entries left pending by a transient failure are re-read.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);
const SUBSCRIBE_RETRY: Duration = Duration::from_secs(5);
const FETCH_ERROR_BACKOFF: Duration = Duration::from_secs(1);
const QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterState {
    Connecting,
    Subscribed,
    Running,
    ShuttingDown,
    Stopped,
}

impl RouterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouterState::Connecting => "connecting",
            RouterState::Subscribed => "subscribed",
            RouterState::Running => "running",
            RouterState::ShuttingDown => "shutting-down",
            RouterState::Stopped => "stopped",
        }
    }
}

// =============================================================================
// Routing table
// =============================================================================

#[derive(Debug, Clone)]
pub struct Topics {
    pub batch: String,
    pub message_log: String,
    pub insights: String,
    pub activities: String,
    pub segment: String,
}

impl Topics {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch: config.topic_batch.clone(),
            message_log: config.topic_message_log.clone(),
            insights: config.topic_insights.clone(),
            activities: config.topic_activities.clone(),
            segment: config.topic_segment.clone(),
        }
    }

    pub fn all(&self) -> Vec<String> {
        vec![
            self.batch.clone(),
            self.message_log.clone(),
            self.insights.clone(),
            self.activities.clone(),
            self.segment.clone(),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Batch,
    PurgeDeliveries,
    Insight,
    Activity,
    PurgeSegment,
    Unknown,
}

pub struct EventHandlers {
    topics: Topics,
    store: Arc<dyn CampaignStore>,
    pipeline: Arc<BatchPipeline>,
    insights: Arc<InsightGenerator>,
}

impl EventHandlers {
    pub fn new(
        topics: Topics,
        store: Arc<dyn CampaignStore>,
        pipeline: Arc<BatchPipeline>,
        insights: Arc<InsightGenerator>,
    ) -> Self {
        Self {
            topics,
            store,
            pipeline,
            insights,
        }
    }

    fn route(&self, stream: &str) -> Route {
        let t = &self.topics;
        if stream == t.batch {
            Route::Batch
        } else if stream == t.message_log {
            Route::PurgeDeliveries
        } else if stream == t.insights {
            Route::Insight
        } else if stream == t.activities {
            Route::Activity
        } else if stream == t.segment {
            Route::PurgeSegment
        } else {
            Route::Unknown
        }
    }

    pub async fn handle(&self, entry: &StreamEntry) -> Result<(), HandlerError> {
        let Some(value) = entry.value.as_deref() else {
            return Err(HandlerError::data("entry carries no value"));
        };

        match self.route(&entry.stream) {
            Route::Batch => {
                let request: BatchRequested = serde_json::from_str(value)?;
                self.pipeline.run(&request).await.map(|_| ())
            }
            Route::PurgeDeliveries => {
                let request: LogPurgeRequested = serde_json::from_str(value)?;
                let removed = self.store.delete_deliveries(&request.campaign_id).await?;
                info!(campaign_id = %request.campaign_id, removed, "Delivery records purged");
                Ok(())
            }
            Route::Insight => {
                let request: InsightRequested = serde_json::from_str(value)?;
                self.insights.generate(&request).await.map(|_| ())
            }
            Route::Activity => {
                let event: ActivityEvent = serde_json::from_str(value)?;
                let activity_type = event.activity_type.clone();
                if self.store.insert_activity(ActivityRecord::from(event)).await? {
                    debug!(activity_type = %activity_type, "Activity recorded");
                } else {
                    debug!(activity_type = %activity_type, "Activity already recorded");
                }
                Ok(())
            }
            Route::PurgeSegment => {
                let request: SegmentPurgeRequested = serde_json::from_str(value)?;
                let removed = self.store.delete_memberships(&request.segment_id).await?;
                info!(segment_id = %request.segment_id, removed, "Segment memberships purged");
                Ok(())
            }
            Route::Unknown => {
                warn!(topic = %entry.stream, entry_id = %entry.id, "No handler for topic, acknowledging");
                Ok(())
            }
        }
    }
}

// =============================================================================
// Partition workers
// =============================================================================

#[derive(Clone)]
struct Worker {
    source: Arc<dyn EventSource>,
    handlers: Arc<EventHandlers>,
    guard: Arc<ReplayGuard>,
    metrics: Arc<MetricsCollector>,
    rewind_at: Arc<Mutex<Option<Instant>>>,
    retry_delay: Duration,
}

impl Worker {
    async fn run(self, index: usize, mut queue: mpsc::Receiver<StreamEntry>) {
        while let Some(entry) = queue.recv().await {
            self.process(entry).await;
        }
        debug!(worker = index, "Partition worker drained");
    }

    async fn process(&self, entry: StreamEntry) {
        let replay_key = ReplayGuard::entry_key(&entry.stream, &entry.id);
        if self.guard.is_known(&replay_key) {
            self.metrics.increment_replayed();
            debug!(topic = %entry.stream, entry_id = %entry.id, "Already handled, acknowledging again");
            self.ack(&entry).await;
            return;
        }

        match self.handlers.handle(&entry).await {
            Ok(()) => {
                self.guard.remember(&replay_key);
                self.ack(&entry).await;
            }
            Err(e) if e.is_retryable() => {
                self.metrics.increment_retried();
                warn!(
                    topic = %entry.stream,
                    entry_id = %entry.id,
                    key = %entry.key,
                    error = %e,
                    "Transient failure, entry left pending"
                );
                let mut at = self.rewind_at.lock();
                if at.is_none() {
                    *at = Some(Instant::now() + self.retry_delay);
                }
            }
            Err(e) => {
                self.metrics.increment_dropped();
                error!(
                    topic = %entry.stream,
                    entry_id = %entry.id,
                    key = %entry.key,
                    error = %e,
                    "Event dropped"
                );
                self.guard.remember(&replay_key);
                self.ack(&entry).await;
            }
        }
    }

    async fn ack(&self, entry: &StreamEntry) {
        match self.source.ack(entry).await {
            Ok(()) => self.metrics.increment_acked(),
            Err(e) => warn!(
                topic = %entry.stream,
                entry_id = %entry.id,
                error = %e,
                "Acknowledgement failed, entry will be redelivered"
            ),
        }
    }
}

// =============================================================================
// Router
// =============================================================================

pub struct EventRouter {
    source: Arc<dyn EventSource>,
    handlers: Arc<EventHandlers>,
    guard: Arc<ReplayGuard>,
    metrics: Arc<MetricsCollector>,
    topics: Vec<String>,
    partitions: usize,
    shutdown_grace: Duration,
    retry_delay: Duration,
    state: watch::Sender<RouterState>,
}

impl EventRouter {
    pub fn new(
        source: Arc<dyn EventSource>,
        handlers: Arc<EventHandlers>,
        guard: Arc<ReplayGuard>,
        metrics: Arc<MetricsCollector>,
        config: &Config,
    ) -> Self {
        let (state, _) = watch::channel(RouterState::Connecting);
        Self {
            topics: handlers.topics.all(),
            source,
            handlers,
            guard,
            metrics,
            partitions: config.partition_workers.max(1),
            shutdown_grace: config.shutdown_grace,
            retry_delay: DEFAULT_RETRY_DELAY,
            state,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RouterState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: RouterState) {
        self.state.send_replace(state);
        self.metrics.set_router_state(state.as_str());
        info!(state = state.as_str(), "Router state changed");
    }

    /// Worker index for an ordering key.
    pub fn partition_for(key: &str, partitions: usize) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % partitions.max(1) as u64) as usize
    }

    /// Runs until `shutdown` flips (or its sender goes away).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        self.set_state(RouterState::Connecting);

        loop {
            match self.source.subscribe(&self.topics).await {
                Ok(()) => break,
                Err(e) => {
                    warn!(error = %e, "Subscription failed, retrying in {}s", SUBSCRIBE_RETRY.as_secs());
                    tokio::select! {
                        _ = tokio::time::sleep(SUBSCRIBE_RETRY) => {}
                        _ = shutdown.changed() => {
                            self.stop().await;
                            return;
                        }
                    }
                }
            }
        }
        self.set_state(RouterState::Subscribed);
        info!(topics = ?self.topics, partitions = self.partitions, "Subscribed to topics");

        let rewind_at = Arc::new(Mutex::new(None));
        let worker = Worker {
            source: Arc::clone(&self.source),
            handlers: Arc::clone(&self.handlers),
            guard: Arc::clone(&self.guard),
            metrics: Arc::clone(&self.metrics),
            rewind_at: Arc::clone(&rewind_at),
            retry_delay: self.retry_delay,
        };

        let mut queues = Vec::with_capacity(self.partitions);
        let mut handles = Vec::with_capacity(self.partitions);
        for index in 0..self.partitions {
            let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
            queues.push(tx);
            handles.push(tokio::spawn(worker.clone().run(index, rx)));
        }

        self.set_state(RouterState::Running);

        'fetch: loop {
            if *shutdown.borrow() {
                break;
            }

            let due = {
                let mut at = rewind_at.lock();
                match *at {
                    Some(when) if when <= Instant::now() => at.take().is_some(),
                    _ => false,
                }
            };
            if due {
                debug!("Re-reading entries left pending");
                self.source.rewind().await;
            }

            let fetched = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                fetched = self.source.fetch() => fetched,
            };

            match fetched {
                Ok(entries) => {
                    for entry in entries {
                        self.metrics.increment_received();
                        let partition = Self::partition_for(&entry.key, self.partitions);
                        if queues[partition].send(entry).await.is_err() {
                            error!(worker = partition, "Partition worker is gone, stopping");
                            break 'fetch;
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Fetch failed");
                    tokio::select! {
                        _ = tokio::time::sleep(FETCH_ERROR_BACKOFF) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }

        self.set_state(RouterState::ShuttingDown);
        drop(queues);

        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let drained = tokio::time::timeout(
            self.shutdown_grace,
            futures::future::join_all(handles),
        )
        .await;
        if drained.is_err() {
            warn!(
                grace_secs = self.shutdown_grace.as_secs(),
                "Workers did not drain in time, aborting"
            );
            for abort in aborts {
                abort.abort();
            }
        }

        self.stop().await;
    }

    async fn stop(&self) {
        self.source.disconnect().await;
        self.set_state(RouterState::Stopped);
    }
}
