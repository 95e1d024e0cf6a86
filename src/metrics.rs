// ═══════════════════════════════════════════════════════════════
// METRICS COLLECTOR
// ═══════════════════════════════════════════════════════════════
//
// Atomic counters for the router, the batch pipeline and the insight
// generator, plus a tiny HTTP endpoint that serves them as JSON so an
// operator can see whether the engine is keeping up with the streams.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info};

use crate::circuit_breaker::CircuitBreakerSnapshot;
use crate::dedup::ReplaySnapshot;

/// What gets serialized to JSON.
#[derive(Debug, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub events_received: u64,
    pub events_acked: u64,
    pub events_dropped: u64,
    pub events_retried: u64,
    pub events_replayed: u64,
    pub batches_dispatched: u64,
    pub batches_failed: u64,
    pub deliveries_sent: u64,
    pub deliveries_failed: u64,
    pub campaigns_completed: u64,
    pub activities_published: u64,
    pub activities_fallback: u64,
    pub insights_completed: u64,
    pub insights_failed: u64,
    pub generator_breaker_trips: u64,
    pub uptime_seconds: u64,
    pub events_per_minute: f64,
    pub router_state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replay_guard: Option<ReplaySnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generator_breaker: Option<CircuitBreakerSnapshot>,
}

/// Lock-free counters shared by every component.
pub struct MetricsCollector {
    events_received: AtomicU64,
    events_acked: AtomicU64,
    events_dropped: AtomicU64,
    events_retried: AtomicU64,
    events_replayed: AtomicU64,
    batches_dispatched: AtomicU64,
    batches_failed: AtomicU64,
    deliveries_sent: AtomicU64,
    deliveries_failed: AtomicU64,
    campaigns_completed: AtomicU64,
    activities_published: AtomicU64,
    activities_fallback: AtomicU64,
    insights_completed: AtomicU64,
    insights_failed: AtomicU64,
    generator_breaker_trips: AtomicU64,
    router_state: parking_lot::RwLock<String>,
    start_time: Instant,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            events_received: AtomicU64::new(0),
            events_acked: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            events_retried: AtomicU64::new(0),
            events_replayed: AtomicU64::new(0),
            batches_dispatched: AtomicU64::new(0),
            batches_failed: AtomicU64::new(0),
            deliveries_sent: AtomicU64::new(0),
            deliveries_failed: AtomicU64::new(0),
            campaigns_completed: AtomicU64::new(0),
            activities_published: AtomicU64::new(0),
            activities_fallback: AtomicU64::new(0),
            insights_completed: AtomicU64::new(0),
            insights_failed: AtomicU64::new(0),
            generator_breaker_trips: AtomicU64::new(0),
            router_state: parking_lot::RwLock::new("connecting".to_string()),
            start_time: Instant::now(),
        }
    }

    pub fn increment_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_acked(&self) {
        self.events_acked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_retried(&self) {
        self.events_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_replayed(&self) {
        self.events_replayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_batches_dispatched(&self) {
        self.batches_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_batches_failed(&self) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_deliveries(&self, sent: u64, failed: u64) {
        self.deliveries_sent.fetch_add(sent, Ordering::Relaxed);
        self.deliveries_failed.fetch_add(failed, Ordering::Relaxed);
    }

    pub fn increment_campaigns_completed(&self) {
        self.campaigns_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_activities_published(&self) {
        self.activities_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_activities_fallback(&self) {
        self.activities_fallback.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_insights_completed(&self) {
        self.insights_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_insights_failed(&self) {
        self.insights_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_breaker_trips(&self) {
        self.generator_breaker_trips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_router_state(&self, state: &str) {
        *self.router_state.write() = state.to_string();
    }

    /// Lock-free reads of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let uptime = self.start_time.elapsed().as_secs();
        let received = self.events_received.load(Ordering::Relaxed);
        let events_per_minute = if uptime > 0 {
            (received as f64 / uptime as f64) * 60.0
        } else {
            0.0
        };

        MetricsSnapshot {
            events_received: received,
            events_acked: self.events_acked.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            events_retried: self.events_retried.load(Ordering::Relaxed),
            events_replayed: self.events_replayed.load(Ordering::Relaxed),
            batches_dispatched: self.batches_dispatched.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            deliveries_sent: self.deliveries_sent.load(Ordering::Relaxed),
            deliveries_failed: self.deliveries_failed.load(Ordering::Relaxed),
            campaigns_completed: self.campaigns_completed.load(Ordering::Relaxed),
            activities_published: self.activities_published.load(Ordering::Relaxed),
            activities_fallback: self.activities_fallback.load(Ordering::Relaxed),
            insights_completed: self.insights_completed.load(Ordering::Relaxed),
            insights_failed: self.insights_failed.load(Ordering::Relaxed),
            generator_breaker_trips: self.generator_breaker_trips.load(Ordering::Relaxed),
            uptime_seconds: uptime,
            events_per_minute,
            router_state: self.router_state.read().clone(),
            replay_guard: None,
            generator_breaker: None,
        }
    }
}

/// Extra snapshots merged into the endpoint response.
pub trait SnapshotSource: Send + Sync {
    fn replay_guard(&self) -> Option<ReplaySnapshot> {
        None
    }

    fn generator_breaker(&self) -> Option<CircuitBreakerSnapshot> {
        None
    }
}

/// Serve the metrics snapshot as JSON on `port` until `shutdown` flips.
pub async fn run_metrics_server(
    port: u16,
    metrics: Arc<MetricsCollector>,
    extras: Arc<dyn SnapshotSource>,
    mut shutdown: watch::Receiver<bool>,
) {
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    let addr = format!("0.0.0.0:{port}");
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(addr = %addr, error = %e, "Failed to bind metrics server");
            return;
        }
    };

    info!(addr = %addr, "Metrics server listening");

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((mut stream, _addr)) => {
                        let mut snapshot = metrics.snapshot();
                        snapshot.replay_guard = extras.replay_guard();
                        snapshot.generator_breaker = extras.generator_breaker();
                        let json = serde_json::to_string_pretty(&snapshot)
                            .unwrap_or_else(|_| "{}".to_string());

                        let response = format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            json.len(),
                            json,
                        );

                        let _ = stream.write_all(response.as_bytes()).await;
                    }
                    Err(e) => {
                        error!(error = %e, "Metrics server accept error");
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("Metrics server shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = MetricsCollector::new();
        metrics.increment_received();
        metrics.increment_received();
        metrics.increment_acked();
        metrics.add_deliveries(85, 15);
        metrics.set_router_state("running");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.events_received, 2);
        assert_eq!(snapshot.events_acked, 1);
        assert_eq!(snapshot.deliveries_sent, 85);
        assert_eq!(snapshot.deliveries_failed, 15);
        assert_eq!(snapshot.router_state, "running");
    }
}
