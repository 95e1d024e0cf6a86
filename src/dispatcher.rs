// =============================================================================
// dispatcher.rs — ONE BATCH OUT THE DOOR
// =============================================================================
//
// For every recipient of a batch: render the message, persist a PENDING
// delivery record, ask the delivery channel for a terminal outcome. The
// outcome set then goes to the aggregator.
//
// Record ids are derived from campaign and recipient, and the store only
// hands back records that are still PENDING. A replayed batch therefore
// draws outcomes only for recipients a previous attempt never finished.
// =============================================================================

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::error::HandlerError;
use crate::models::{DeliveryOutcome, DeliveryRecord, DeliveryStatus};
use crate::planner::Batch;
use crate::store::CampaignStore;
use crate::template;

/// Where rendered messages go. Implementations map whatever the provider
/// reports onto SENT or FAILED.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn deliver(&self, record: &DeliveryRecord) -> DeliveryStatus;
}

/// Stand-in provider: each delivery independently succeeds with a fixed
/// probability.
pub struct SimulatedChannel {
    rng: Mutex<StdRng>,
    success_probability: f64,
}

impl SimulatedChannel {
    pub fn new(success_probability: f64) -> Self {
        Self::with_rng(success_probability, StdRng::from_entropy())
    }

    /// Reproducible draws for tests and dry runs.
    pub fn seeded(success_probability: f64, seed: u64) -> Self {
        Self::with_rng(success_probability, StdRng::seed_from_u64(seed))
    }

    fn with_rng(success_probability: f64, rng: StdRng) -> Self {
        Self {
            rng: Mutex::new(rng),
            success_probability: success_probability.clamp(0.0, 1.0),
        }
    }
}

#[async_trait]
impl DeliveryChannel for SimulatedChannel {
    async fn deliver(&self, _record: &DeliveryRecord) -> DeliveryStatus {
        if self.rng.lock().gen_bool(self.success_probability) {
            DeliveryStatus::Sent
        } else {
            DeliveryStatus::Failed
        }
    }
}

/// Terminal outcomes drawn for one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutcome {
    pub campaign_id: String,
    pub index: usize,
    pub total: usize,
    pub outcomes: Vec<DeliveryOutcome>,
}

/// Renders, persists and delivers one batch. A store failure aborts the
/// whole batch before any outcome is drawn.
pub async fn dispatch_batch(
    store: &dyn CampaignStore,
    channel: &dyn DeliveryChannel,
    batch: &Batch,
    message_template: &str,
) -> Result<BatchOutcome, HandlerError> {
    let records: Vec<DeliveryRecord> = batch
        .recipients
        .iter()
        .map(|recipient| {
            DeliveryRecord::pending(
                &batch.campaign_id,
                recipient,
                template::render(message_template, recipient),
            )
        })
        .collect();
    let requested = records.len();

    let pending = store
        .insert_pending_deliveries(&batch.campaign_id, records)
        .await?;

    if pending.len() < requested {
        debug!(
            campaign_id = %batch.campaign_id,
            batch = batch.index,
            already_terminal = requested - pending.len(),
            "Batch partially handled by an earlier attempt"
        );
    }

    let mut outcomes = Vec::with_capacity(pending.len());
    for record in &pending {
        outcomes.push(DeliveryOutcome {
            record_id: record.id.clone(),
            status: channel.deliver(record).await,
        });
    }

    info!(
        campaign_id = %batch.campaign_id,
        segment_id = %batch.segment_id,
        batch = batch.index,
        total = batch.total,
        recipients = requested,
        drawn = outcomes.len(),
        "Batch dispatched"
    );

    Ok(BatchOutcome {
        campaign_id: batch.campaign_id.clone(),
        index: batch.index,
        total: batch.total,
        outcomes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Recipient;
    use crate::planner::plan_batches;
    use crate::store::MemoryStore;
    use std::collections::BTreeMap;

    fn recipients(n: usize) -> Vec<Recipient> {
        (0..n)
            .map(|i| Recipient {
                id: format!("cu{i}"),
                name: format!("N{i}"),
                email: format!("cu{i}@example.com"),
                attributes: BTreeMap::new(),
            })
            .collect()
    }

    #[test]
    fn test_seeded_channel_is_reproducible() {
        let record = DeliveryRecord::pending("c1", &recipients(1)[0], "Hi".into());
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let draw = |seed| {
            let channel = SimulatedChannel::seeded(0.85, seed);
            rt.block_on(async {
                let mut out = Vec::new();
                for _ in 0..50 {
                    out.push(channel.deliver(&record).await);
                }
                out
            })
        };
        assert_eq!(draw(7), draw(7));
    }

    #[tokio::test]
    async fn test_probability_extremes() {
        let record = DeliveryRecord::pending("c1", &recipients(1)[0], "Hi".into());
        let always = SimulatedChannel::seeded(1.0, 1);
        let never = SimulatedChannel::seeded(0.0, 1);
        for _ in 0..20 {
            assert_eq!(always.deliver(&record).await, DeliveryStatus::Sent);
            assert_eq!(never.deliver(&record).await, DeliveryStatus::Failed);
        }
    }

    #[tokio::test]
    async fn test_dispatch_persists_rendered_records() {
        let store = MemoryStore::new();
        let channel = SimulatedChannel::seeded(0.85, 42);
        let batch = &plan_batches("c1", "s1", &recipients(10), 100)[0];

        let outcome = dispatch_batch(&store, &channel, batch, "Hello {name}").await.unwrap();
        assert_eq!(outcome.outcomes.len(), 10);
        assert!(outcome.outcomes.iter().all(|o| o.status.is_terminal()));

        let stored = store.deliveries("c1").await.unwrap();
        assert_eq!(stored.len(), 10);
        assert!(stored.iter().any(|r| r.message == "Hello N3"));
        assert!(stored.iter().all(|r| r.status == DeliveryStatus::Pending));
    }

    #[tokio::test]
    async fn test_store_failure_aborts_batch() {
        let store = MemoryStore::new();
        store.inject_delivery_insert_faults(1);
        let channel = SimulatedChannel::seeded(0.85, 42);
        let batch = &plan_batches("c1", "s1", &recipients(3), 100)[0];

        let err = dispatch_batch(&store, &channel, batch, "Hi").await.unwrap_err();
        assert!(err.is_retryable());
        assert!(store.deliveries("c1").await.unwrap().is_empty());
    }
}
