// =============================================================================
// planner.rs — AUDIENCE → BATCHES
// =============================================================================
//
// The audience is cut into fixed-size batches in order, the last one possibly
// short. Indices are 1-based and every batch carries the total count so a
// log line like "batch 2/3" needs no extra context.
//
// The audience size write is an overwrite, so a redelivered event simply
// writes the same number again.
// =============================================================================

use tracing::info;

use crate::error::HandlerError;
use crate::models::Recipient;
use crate::store::CampaignStore;

#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub campaign_id: String,
    pub segment_id: String,
    /// 1-based position of this batch.
    pub index: usize,
    pub total: usize,
    pub recipients: Vec<Recipient>,
}

/// Splits `audience` into `ceil(len / batch_size)` batches preserving order.
pub fn plan_batches(
    campaign_id: &str,
    segment_id: &str,
    audience: &[Recipient],
    batch_size: usize,
) -> Vec<Batch> {
    let batch_size = batch_size.max(1);
    let total = audience.len().div_ceil(batch_size);

    audience
        .chunks(batch_size)
        .enumerate()
        .map(|(i, chunk)| Batch {
            campaign_id: campaign_id.to_string(),
            segment_id: segment_id.to_string(),
            index: i + 1,
            total,
            recipients: chunk.to_vec(),
        })
        .collect()
}

/// Records the audience size on the campaign. Returns the size written,
/// which is never below what was already processed.
pub async fn record_audience_size(
    store: &dyn CampaignStore,
    campaign_id: &str,
    size: usize,
) -> Result<u64, HandlerError> {
    match store.set_audience_size(campaign_id, size as u64).await? {
        Some(written) => {
            info!(campaign_id, audience_size = written, "Audience size recorded");
            Ok(written)
        }
        None => Err(HandlerError::data(format!("campaign '{campaign_id}' not found"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Campaign;
    use crate::store::MemoryStore;
    use std::collections::BTreeMap;

    fn audience(n: usize) -> Vec<Recipient> {
        (0..n)
            .map(|i| Recipient {
                id: format!("cu{i}"),
                name: format!("Customer {i}"),
                email: format!("cu{i}@example.com"),
                attributes: BTreeMap::new(),
            })
            .collect()
    }

    #[test]
    fn test_250_by_100_gives_three_batches() {
        let batches = plan_batches("c1", "s1", &audience(250), 100);
        let sizes: Vec<usize> = batches.iter().map(|b| b.recipients.len()).collect();
        assert_eq!(sizes, vec![100, 100, 50]);
        assert_eq!(
            batches.iter().map(|b| b.index).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(batches.iter().all(|b| b.total == 3));
    }

    #[test]
    fn test_batches_preserve_order_and_cover_audience() {
        let people = audience(37);
        for size in [1, 5, 36, 37, 100] {
            let batches = plan_batches("c1", "s1", &people, size);
            assert_eq!(batches.len(), people.len().div_ceil(size));
            let flattened: Vec<Recipient> =
                batches.into_iter().flat_map(|b| b.recipients).collect();
            assert_eq!(flattened, people);
        }
    }

    #[test]
    fn test_empty_audience_has_no_batches() {
        assert!(plan_batches("c1", "s1", &[], 100).is_empty());
    }

    #[test]
    fn test_zero_batch_size_is_treated_as_one() {
        assert_eq!(plan_batches("c1", "s1", &audience(3), 0).len(), 3);
    }

    #[tokio::test]
    async fn test_record_audience_size_overwrites() {
        let store = MemoryStore::new();
        store
            .insert_campaign(Campaign::new("c1", "Spring", "Hi", "s1", "o1"))
            .await
            .unwrap();
        assert_eq!(record_audience_size(&store, "c1", 250).await.unwrap(), 250);
        assert_eq!(record_audience_size(&store, "c1", 120).await.unwrap(), 120);
        assert!(record_audience_size(&store, "missing", 5).await.is_err());
    }
}
