// =============================================================================
// audience.rs — SEGMENT → RECIPIENTS
// =============================================================================
//
// A segment is materialized as AudienceMembership rows. Resolving it means
// loading those rows and then the customers they point at. Customers deleted
// after the segment was evaluated simply drop out of the audience.
// =============================================================================

use tracing::debug;

use crate::error::StoreResult;
use crate::models::Recipient;
use crate::store::CampaignStore;

/// Recipients of `segment_id` in membership order.
pub async fn resolve_audience(
    store: &dyn CampaignStore,
    segment_id: &str,
) -> StoreResult<Vec<Recipient>> {
    let memberships = store.memberships(segment_id).await?;
    if memberships.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<String> = memberships.into_iter().map(|m| m.customer_id).collect();
    let customers = store.customers(&ids).await?;

    if customers.len() < ids.len() {
        debug!(
            segment_id,
            memberships = ids.len(),
            resolved = customers.len(),
            "Skipped memberships whose customer no longer exists"
        );
    }

    Ok(customers.iter().map(Recipient::from).collect())
}
