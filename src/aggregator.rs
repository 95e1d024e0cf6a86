// =============================================================================
// aggregator.rs — OUTCOMES → CAMPAIGN STATISTICS
// =============================================================================
//
// Applies one batch's outcomes and rolls them into the campaign counters:
//
// 1. Bulk PENDING → SENT/FAILED compare-and-set on the delivery records.
// 2. Deltas counted from the transitions that actually happened.
// 3. One atomic increment of `sent` / `failed`, totals read back.
// 4. Success rate recomputed from those totals.
// 5. Completion compare-and-set. Only the caller that wins it gets
//    `completed_now`, every other batch or replay sees `false`.
// =============================================================================

use tracing::info;

use crate::dispatcher::BatchOutcome;
use crate::error::HandlerError;
use crate::models::{CampaignTotals, DeliveryStatus};
use crate::store::CampaignStore;

#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    pub sent_delta: u64,
    pub failed_delta: u64,
    pub totals: CampaignTotals,
    /// This call moved the campaign to COMPLETED.
    pub completed_now: bool,
}

pub async fn aggregate_batch(
    store: &dyn CampaignStore,
    outcome: &BatchOutcome,
) -> Result<Aggregation, HandlerError> {
    let campaign_id = outcome.campaign_id.as_str();

    let applied = if outcome.outcomes.is_empty() {
        Vec::new()
    } else {
        store.apply_outcomes(campaign_id, &outcome.outcomes).await?
    };

    let sent_delta = applied
        .iter()
        .filter(|o| o.status == DeliveryStatus::Sent)
        .count() as u64;
    let failed_delta = applied
        .iter()
        .filter(|o| o.status == DeliveryStatus::Failed)
        .count() as u64;

    let totals = store
        .increment_counters(campaign_id, sent_delta, failed_delta)
        .await?
        .ok_or_else(|| HandlerError::data(format!("campaign '{campaign_id}' not found")))?;

    if let Some(rate) = totals.success_rate() {
        store.set_success_rate(campaign_id, rate).await?;
    }

    let completed_now = totals.reached_completion() && store.complete_if_pending(campaign_id).await?;

    info!(
        campaign_id,
        batch = outcome.index,
        total = outcome.total,
        sent = sent_delta,
        failed = failed_delta,
        total_sent = totals.sent,
        total_failed = totals.failed,
        audience_size = totals.audience_size,
        completed = completed_now,
        "Batch aggregated"
    );

    Ok(Aggregation {
        sent_delta,
        failed_delta,
        totals,
        completed_now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Campaign, CampaignStatus, DeliveryOutcome, DeliveryRecord, Recipient};
    use crate::store::MemoryStore;

    async fn seeded_store(n: usize) -> (MemoryStore, Vec<DeliveryRecord>) {
        let store = MemoryStore::new();
        store
            .insert_campaign(Campaign::new("c1", "Spring", "Hi", "s1", "o1"))
            .await
            .unwrap();
        store.set_audience_size("c1", n as u64).await.unwrap();
        let records: Vec<DeliveryRecord> = (0..n)
            .map(|i| {
                let r = Recipient {
                    id: format!("cu{i}"),
                    name: "x".into(),
                    email: "x@example.com".into(),
                    attributes: Default::default(),
                };
                DeliveryRecord::pending("c1", &r, "Hi".into())
            })
            .collect();
        store.insert_pending_deliveries("c1", records.clone()).await.unwrap();
        (store, records)
    }

    fn outcome(records: &[DeliveryRecord], statuses: &[DeliveryStatus]) -> BatchOutcome {
        BatchOutcome {
            campaign_id: "c1".into(),
            index: 1,
            total: 1,
            outcomes: records
                .iter()
                .zip(statuses)
                .map(|(r, s)| DeliveryOutcome { record_id: r.id.clone(), status: *s })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_counts_and_completes_once() {
        let (store, records) = seeded_store(4).await;
        use DeliveryStatus::{Failed, Sent};
        let batch = outcome(&records, &[Sent, Sent, Sent, Failed]);

        let first = aggregate_batch(&store, &batch).await.unwrap();
        assert_eq!((first.sent_delta, first.failed_delta), (3, 1));
        assert!(first.completed_now);

        let campaign = store.campaign("c1").await.unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Completed);
        assert_eq!(campaign.success_rate, 75.0);

        let replay = aggregate_batch(&store, &batch).await.unwrap();
        assert_eq!((replay.sent_delta, replay.failed_delta), (0, 0));
        assert!(!replay.completed_now);
        assert_eq!(replay.totals.processed(), 4);
    }

    #[tokio::test]
    async fn test_partial_progress_stays_pending() {
        let (store, records) = seeded_store(4).await;
        let batch = outcome(&records[..2], &[DeliveryStatus::Sent, DeliveryStatus::Sent]);

        let result = aggregate_batch(&store, &batch).await.unwrap();
        assert!(!result.completed_now);
        assert_eq!(result.totals.processed(), 2);
        let campaign = store.campaign("c1").await.unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Pending);
        assert!(campaign.processed() <= campaign.audience_size);
    }

    #[tokio::test]
    async fn test_unknown_campaign_is_a_data_error() {
        let store = MemoryStore::new();
        let batch = BatchOutcome {
            campaign_id: "ghost".into(),
            index: 1,
            total: 1,
            outcomes: Vec::new(),
        };
        let err = aggregate_batch(&store, &batch).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
