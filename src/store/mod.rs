// =============================================================================
// store/mod.rs — THE DOCUMENT STORE BOUNDARY
// =============================================================================
//
// The engine never does read-modify-write on shared state. Every mutation
// that can race with another batch of the same campaign is a single store
// operation: atomic counter increment, compare-and-set on delivery status,
// compare-and-set on campaign completion. Implementations must keep each of
// those atomic.
// =============================================================================

pub mod memory;
pub mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::models::{
    ActivityRecord, AudienceMembership, Campaign, CampaignTotals, Customer, DeliveryOutcome,
    DeliveryRecord, InsightReport, InsightStatus, User,
};

#[async_trait]
pub trait CampaignStore: Send + Sync {
    // ---- campaigns ---------------------------------------------------------

    async fn insert_campaign(&self, campaign: Campaign) -> StoreResult<()>;

    async fn campaign(&self, id: &str) -> StoreResult<Option<Campaign>>;

    /// Overwrites `audience_size`, never below the current `sent + failed`.
    /// Returns the size actually written, `None` if the campaign is unknown.
    async fn set_audience_size(&self, id: &str, size: u64) -> StoreResult<Option<u64>>;

    /// Atomically adds the deltas and returns the totals after the add.
    async fn increment_counters(
        &self,
        id: &str,
        sent: u64,
        failed: u64,
    ) -> StoreResult<Option<CampaignTotals>>;

    async fn set_success_rate(&self, id: &str, rate: f64) -> StoreResult<()>;

    /// Flips PENDING → COMPLETED if `audience_size > 0` and
    /// `sent + failed >= audience_size`. Returns whether this call did the flip.
    async fn complete_if_pending(&self, id: &str) -> StoreResult<bool>;

    /// COMPLETED campaigns of an organization, newest first.
    async fn completed_campaigns(&self, organization_id: &str) -> StoreResult<Vec<Campaign>>;

    // ---- customers and memberships ----------------------------------------

    async fn insert_customer(&self, customer: Customer) -> StoreResult<()>;

    /// Loads customers in the order of `ids`. Unknown ids are skipped.
    async fn customers(&self, ids: &[String]) -> StoreResult<Vec<Customer>>;

    async fn insert_membership(&self, membership: AudienceMembership) -> StoreResult<()>;

    /// Memberships of a segment in insertion order.
    async fn memberships(&self, segment_id: &str) -> StoreResult<Vec<AudienceMembership>>;

    async fn delete_memberships(&self, segment_id: &str) -> StoreResult<u64>;

    // ---- delivery records --------------------------------------------------

    /// Inserts each record unless one with the same id exists, then returns
    /// the given records whose stored status is still PENDING.
    async fn insert_pending_deliveries(
        &self,
        campaign_id: &str,
        records: Vec<DeliveryRecord>,
    ) -> StoreResult<Vec<DeliveryRecord>>;

    /// Bulk PENDING → terminal compare-and-set. Returns the outcomes that
    /// were applied; records already terminal are left untouched.
    async fn apply_outcomes(
        &self,
        campaign_id: &str,
        outcomes: &[DeliveryOutcome],
    ) -> StoreResult<Vec<DeliveryOutcome>>;

    async fn deliveries(&self, campaign_id: &str) -> StoreResult<Vec<DeliveryRecord>>;

    async fn delete_deliveries(&self, campaign_id: &str) -> StoreResult<u64>;

    // ---- users and activity ------------------------------------------------

    async fn insert_user(&self, user: User) -> StoreResult<()>;

    async fn user(&self, id: &str) -> StoreResult<Option<User>>;

    /// Appends an activity. Returns `false` if an activity with the same id
    /// was already recorded.
    async fn insert_activity(&self, record: ActivityRecord) -> StoreResult<bool>;

    async fn activities(&self, organization_id: &str) -> StoreResult<Vec<ActivityRecord>>;

    // ---- insight reports ---------------------------------------------------

    async fn insert_insight(&self, report: InsightReport) -> StoreResult<()>;

    async fn insight(&self, id: &str) -> StoreResult<Option<InsightReport>>;

    /// Moves a PENDING report to a terminal status. Returns whether it moved.
    async fn finish_insight(
        &self,
        id: &str,
        status: InsightStatus,
        content: Option<String>,
    ) -> StoreResult<bool>;
}
