// =============================================================================
// pipeline.rs — ONE BATCH-REQUESTED EVENT, START TO FINISH
// =============================================================================
//
// resolve audience → record audience size → plan batches →
// (dispatch → aggregate) per batch → notify on completion.
//
// Batches run one after another. A batch that hits a store outage is logged
// and skipped, the remaining batches still run. The event then reports a
// transient failure so it stays pending, and the redelivery picks up only
// the records that never reached a terminal state.
//
// A campaign that is already COMPLETED is left alone: no audience write, no
// dispatch, no second notification.
// =============================================================================

use std::sync::Arc;
use tracing::{error, info, warn};

use crate::aggregator::aggregate_batch;
use crate::audience::resolve_audience;
use crate::dispatcher::{dispatch_batch, DeliveryChannel};
use crate::error::HandlerError;
use crate::metrics::MetricsCollector;
use crate::models::{BatchRequested, CampaignStatus};
use crate::notifier::{Completion, CompletionNotifier};
use crate::planner::{plan_batches, record_audience_size};
use crate::store::CampaignStore;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineReport {
    pub batches: usize,
    pub sent: u64,
    pub failed: u64,
    pub completed_now: bool,
    /// The campaign was already terminal, nothing ran.
    pub skipped: bool,
}

pub struct BatchPipeline {
    store: Arc<dyn CampaignStore>,
    channel: Arc<dyn DeliveryChannel>,
    notifier: Arc<CompletionNotifier>,
    metrics: Arc<MetricsCollector>,
    batch_size: usize,
}

impl BatchPipeline {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        channel: Arc<dyn DeliveryChannel>,
        notifier: Arc<CompletionNotifier>,
        metrics: Arc<MetricsCollector>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            channel,
            notifier,
            metrics,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn run(&self, request: &BatchRequested) -> Result<PipelineReport, HandlerError> {
        let campaign_id = request.campaign_id.as_str();
        let store = self.store.as_ref();

        let campaign = store
            .campaign(campaign_id)
            .await?
            .ok_or_else(|| HandlerError::data(format!("campaign '{campaign_id}' not found")))?;

        if campaign.status != CampaignStatus::Pending {
            info!(
                campaign_id,
                status = %campaign.status,
                "Campaign already terminal, batch request ignored"
            );
            return Ok(PipelineReport { skipped: true, ..Default::default() });
        }

        let audience = resolve_audience(store, &request.segment_id).await?;
        let audience_size = record_audience_size(store, campaign_id, audience.len()).await?;
        let batches = plan_batches(campaign_id, &request.segment_id, &audience, self.batch_size);

        info!(
            campaign_id,
            segment_id = %request.segment_id,
            audience_size,
            batches = batches.len(),
            "Campaign fan-out planned"
        );

        let mut report = PipelineReport { batches: batches.len(), ..Default::default() };
        let mut transient: Option<HandlerError> = None;

        for batch in &batches {
            let outcome =
                match dispatch_batch(store, self.channel.as_ref(), batch, &request.content).await {
                    Ok(outcome) => outcome,
                    Err(e) if e.is_retryable() => {
                        self.metrics.increment_batches_failed();
                        warn!(
                            campaign_id,
                            batch = batch.index,
                            total = batch.total,
                            error = %e,
                            "Batch aborted, left for redelivery"
                        );
                        transient.get_or_insert(e);
                        continue;
                    }
                    Err(e) => return Err(e),
                };
            self.metrics.increment_batches_dispatched();

            let aggregation = match aggregate_batch(store, &outcome).await {
                Ok(aggregation) => aggregation,
                Err(e) if e.is_retryable() => {
                    self.metrics.increment_batches_failed();
                    error!(
                        campaign_id,
                        batch = batch.index,
                        error = %e,
                        "Aggregation failed, outcomes stay pending"
                    );
                    transient.get_or_insert(e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            self.metrics
                .add_deliveries(aggregation.sent_delta, aggregation.failed_delta);
            report.sent += aggregation.sent_delta;
            report.failed += aggregation.failed_delta;

            if aggregation.completed_now {
                report.completed_now = true;
                self.metrics.increment_campaigns_completed();
                info!(
                    campaign_id,
                    sent = aggregation.totals.sent,
                    failed = aggregation.totals.failed,
                    "Campaign completed"
                );
                self.notifier
                    .notify(&Completion {
                        campaign_id: campaign_id.to_string(),
                        name: request.name.clone(),
                        organization_id: request.organization_id.clone(),
                        user_id: request.user_id.clone(),
                        sent: aggregation.totals.sent,
                        failed: aggregation.totals.failed,
                    })
                    .await;
            }
        }

        match transient {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ActivityPublisher;
    use crate::dispatcher::SimulatedChannel;
    use crate::error::BrokerError;
    use crate::models::{ActivityEvent, ActivityRecord, AudienceMembership, Campaign, Customer, User};
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    /// Writes activities straight into the store the way the activity
    /// consumer would.
    struct StoreWriter(Arc<MemoryStore>);

    #[async_trait]
    impl ActivityPublisher for StoreWriter {
        async fn publish_activity(&self, event: &ActivityEvent) -> Result<(), BrokerError> {
            self.0
                .insert_activity(ActivityRecord::from(event.clone()))
                .await
                .map(|_| ())
                .map_err(|_| BrokerError::NotConnected)
        }
    }

    async fn setup(audience: usize) -> (Arc<MemoryStore>, BatchPipeline, BatchRequested) {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_campaign(Campaign::new("c1", "Spring", "Hi {name}", "s1", "o1"))
            .await
            .unwrap();
        store
            .insert_user(User { id: "u1".into(), email: "al@example.com".into(), fullname: "Al".into() })
            .await
            .unwrap();
        for i in 0..audience {
            let id = format!("cu{i}");
            store
                .insert_customer(Customer::new(&id, format!("N{i}"), format!("{id}@example.com"), "o1"))
                .await
                .unwrap();
            store
                .insert_membership(AudienceMembership { segment_id: "s1".into(), customer_id: id })
                .await
                .unwrap();
        }

        let metrics = Arc::new(MetricsCollector::new());
        let notifier = Arc::new(CompletionNotifier::new(
            store.clone(),
            Arc::new(StoreWriter(store.clone())),
            metrics.clone(),
        ));
        let pipeline = BatchPipeline::new(
            store.clone(),
            Arc::new(SimulatedChannel::seeded(0.85, 2024)),
            notifier,
            metrics,
            100,
        );
        let request = BatchRequested {
            campaign_id: "c1".into(),
            segment_id: "s1".into(),
            content: "Hi {name}".into(),
            name: "Spring".into(),
            organization_id: "o1".into(),
            user_id: "u1".into(),
        };
        (store, pipeline, request)
    }

    #[tokio::test]
    async fn test_250_recipients_complete_in_three_batches() {
        let (store, pipeline, request) = setup(250).await;

        let report = pipeline.run(&request).await.unwrap();
        assert_eq!(report.batches, 3);
        assert_eq!(report.sent + report.failed, 250);
        assert!(report.completed_now);

        let campaign = store.campaign("c1").await.unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Completed);
        assert_eq!(campaign.audience_size, 250);
        assert_eq!(campaign.processed(), 250);

        let sent_activities: Vec<_> = store
            .activities("o1")
            .await
            .unwrap()
            .into_iter()
            .filter(|a| a.activity_type == "campaign_sent" && a.target_action_id == "c1")
            .collect();
        assert_eq!(sent_activities.len(), 1);
    }

    #[tokio::test]
    async fn test_replay_of_completed_campaign_changes_nothing() {
        let (store, pipeline, request) = setup(250).await;
        pipeline.run(&request).await.unwrap();
        let before = store.campaign("c1").await.unwrap().unwrap();

        let replay = pipeline.run(&request).await.unwrap();
        assert!(replay.skipped);

        let after = store.campaign("c1").await.unwrap().unwrap();
        assert_eq!((after.sent, after.failed), (before.sent, before.failed));
        assert_eq!(store.activities("o1").await.unwrap().len(), 1);
        assert_eq!(store.deliveries("c1").await.unwrap().len(), 250);
    }

    #[tokio::test]
    async fn test_transient_batch_failure_recovers_on_redelivery() {
        let (store, pipeline, request) = setup(250).await;
        store.inject_delivery_insert_faults(1);

        let err = pipeline.run(&request).await.unwrap_err();
        assert!(err.is_retryable());
        let partial = store.campaign("c1").await.unwrap().unwrap();
        assert_eq!(partial.processed(), 150);
        assert_eq!(partial.status, CampaignStatus::Pending);

        let report = pipeline.run(&request).await.unwrap();
        assert_eq!(report.sent + report.failed, 100);
        assert!(report.completed_now);

        let campaign = store.campaign("c1").await.unwrap().unwrap();
        assert_eq!(campaign.processed(), 250);
        assert_eq!(campaign.status, CampaignStatus::Completed);
        assert_eq!(store.activities("o1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_audience_never_completes() {
        let (store, pipeline, request) = setup(0).await;
        let report = pipeline.run(&request).await.unwrap();
        assert_eq!(report.batches, 0);
        assert!(!report.completed_now);
        let campaign = store.campaign("c1").await.unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Pending);
    }

    #[tokio::test]
    async fn test_unknown_campaign_is_dropped() {
        let (_store, pipeline, mut request) = setup(5).await;
        request.campaign_id = "ghost".into();
        let err = pipeline.run(&request).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
