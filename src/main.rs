// =============================================================================
// CAMPAIGN BATCH ENGINE
// =============================================================================
//
// Wiring only. Everything here is built once, handed to the router as Arcs,
// and torn down in reverse on ctrl-c / SIGTERM:
//
//   store ◀── pipeline ◀── handlers ◀── router ◀── Redis streams
//     ▲          │                        │
//     └── notifier ──▶ recent-activities  └──▶ insights ──▶ Gemini
//
// Metrics are served on their own port as a JSON snapshot.
// =============================================================================

use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use campaign_batch_engine::broker::{BrokerSettings, RedisBroker};
use campaign_batch_engine::circuit_breaker::{CircuitBreaker, CircuitBreakerSnapshot};
use campaign_batch_engine::config::{Config, LogFormat, StoreBackend};
use campaign_batch_engine::dedup::{ReplayGuard, ReplaySnapshot};
use campaign_batch_engine::dispatcher::SimulatedChannel;
use campaign_batch_engine::generator::GeminiClient;
use campaign_batch_engine::insights::{Cohorts, InsightGenerator};
use campaign_batch_engine::metrics::{self, MetricsCollector, SnapshotSource};
use campaign_batch_engine::notifier::CompletionNotifier;
use campaign_batch_engine::pipeline::BatchPipeline;
use campaign_batch_engine::router::{EventHandlers, EventRouter, Topics};
use campaign_batch_engine::store::{CampaignStore, MemoryStore, RedisStore};

/// Component snapshots folded into the metrics endpoint.
struct Extras {
    guard: Arc<ReplayGuard>,
    breaker: Arc<CircuitBreaker>,
}

impl SnapshotSource for Extras {
    fn replay_guard(&self) -> Option<ReplaySnapshot> {
        Some(self.guard.snapshot())
    }

    fn generator_breaker(&self) -> Option<CircuitBreakerSnapshot> {
        Some(self.breaker.snapshot())
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.with_ansi(true).init(),
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Ctrl-C listener failed");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "SIGTERM listener failed");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();
    init_tracing(config.log_format);

    info!(
        consumer_group = %config.consumer_group,
        consumer = %config.consumer_name,
        batch_size = config.batch_size,
        partitions = config.partition_workers,
        "Campaign batch engine starting"
    );

    let metrics_collector = Arc::new(MetricsCollector::new());

    let store: Arc<dyn CampaignStore> = match config.store_backend {
        StoreBackend::Redis => {
            Arc::new(RedisStore::connect(&config.redis_url, &config.store_namespace).await?)
        }
        StoreBackend::Memory => {
            warn!("In-memory store selected, state is lost on exit");
            Arc::new(MemoryStore::new())
        }
    };

    let broker = Arc::new(
        RedisBroker::connect(BrokerSettings {
            redis_url: &config.redis_url,
            group: &config.consumer_group,
            consumer: &config.consumer_name,
            activity_topic: &config.topic_activities,
            read_count: config.read_count,
            read_block: config.read_block,
        })
        .await?,
    );

    let gemini = GeminiClient::from_config(&config, metrics_collector.clone())?;
    let breaker = gemini.breaker();

    let notifier = Arc::new(CompletionNotifier::new(
        store.clone(),
        broker.clone(),
        metrics_collector.clone(),
    ));
    let pipeline = Arc::new(BatchPipeline::new(
        store.clone(),
        Arc::new(SimulatedChannel::new(config.success_probability)),
        notifier,
        metrics_collector.clone(),
        config.batch_size,
    ));
    let insights = Arc::new(InsightGenerator::new(
        store.clone(),
        Arc::new(gemini),
        metrics_collector.clone(),
        Cohorts {
            high_value_spend: config.high_value_spend_threshold,
            recent_activity_days: config.recent_activity_days,
        },
    ));
    let handlers = Arc::new(EventHandlers::new(
        Topics::from_config(&config),
        store.clone(),
        pipeline,
        insights,
    ));

    let guard = Arc::new(ReplayGuard::new(
        config.replay_bloom_items,
        config.replay_bloom_fp_rate,
        config.replay_lru_size,
    ));
    let router = EventRouter::new(
        broker,
        handlers,
        guard.clone(),
        metrics_collector.clone(),
        &config,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let metrics_handle = tokio::spawn(metrics::run_metrics_server(
        config.metrics_port,
        metrics_collector.clone(),
        Arc::new(Extras { guard, breaker }),
        shutdown_rx.clone(),
    ));

    let router_handle = tokio::spawn(async move { router.run(shutdown_rx).await });

    info!(port = config.metrics_port, "All components online");

    wait_for_signal().await;
    warn!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    if let Err(e) = router_handle.await {
        error!(error = %e, "Router task failed");
    }
    if tokio::time::timeout(config.shutdown_grace, metrics_handle)
        .await
        .is_err()
    {
        warn!("Metrics server did not stop in time");
    }

    drop(store);
    info!("Campaign batch engine stopped");
    Ok(())
}
