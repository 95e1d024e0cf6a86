// =============================================================================
// store/memory.rs — THE PROCESS-LOCAL STORE
// =============================================================================
//
// One parking_lot RwLock over the whole state. Every trait operation takes
// the lock once, which is what makes increments and compare-and-sets atomic
// here. Used by the test suite and by `STORE_BACKEND=memory` dry runs.
// =============================================================================

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};

use super::CampaignStore;
use crate::error::{StoreError, StoreResult};
use crate::models::{
    ActivityRecord, AudienceMembership, Campaign, CampaignStatus, CampaignTotals, Customer,
    DeliveryOutcome, DeliveryRecord, DeliveryStatus, InsightReport, InsightStatus, User,
};

#[derive(Default)]
struct MemoryState {
    campaigns: HashMap<String, Campaign>,
    customers: HashMap<String, Customer>,
    /// segment id → customer ids in insertion order
    memberships: HashMap<String, Vec<String>>,
    /// campaign id → record id → record
    deliveries: HashMap<String, BTreeMap<String, DeliveryRecord>>,
    users: HashMap<String, User>,
    activities: Vec<ActivityRecord>,
    insights: HashMap<String, InsightReport>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    /// Number of upcoming delivery inserts that fail as if the store were down.
    delivery_insert_faults: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` delivery inserts fail with `StoreError::Unavailable`.
    pub fn inject_delivery_insert_faults(&self, n: u32) {
        self.delivery_insert_faults.store(n, Ordering::SeqCst);
    }

    fn take_fault(&self) -> bool {
        self.delivery_insert_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl CampaignStore for MemoryStore {
    async fn insert_campaign(&self, campaign: Campaign) -> StoreResult<()> {
        self.state.write().campaigns.insert(campaign.id.clone(), campaign);
        Ok(())
    }

    async fn campaign(&self, id: &str) -> StoreResult<Option<Campaign>> {
        Ok(self.state.read().campaigns.get(id).cloned())
    }

    async fn set_audience_size(&self, id: &str, size: u64) -> StoreResult<Option<u64>> {
        let mut state = self.state.write();
        Ok(state.campaigns.get_mut(id).map(|campaign| {
            campaign.audience_size = size.max(campaign.processed());
            campaign.updated_at = Utc::now();
            campaign.audience_size
        }))
    }

    async fn increment_counters(
        &self,
        id: &str,
        sent: u64,
        failed: u64,
    ) -> StoreResult<Option<CampaignTotals>> {
        let mut state = self.state.write();
        Ok(state.campaigns.get_mut(id).map(|campaign| {
            campaign.sent += sent;
            campaign.failed += failed;
            campaign.updated_at = Utc::now();
            CampaignTotals {
                sent: campaign.sent,
                failed: campaign.failed,
                audience_size: campaign.audience_size,
                status: campaign.status,
            }
        }))
    }

    async fn set_success_rate(&self, id: &str, rate: f64) -> StoreResult<()> {
        if let Some(campaign) = self.state.write().campaigns.get_mut(id) {
            campaign.success_rate = rate;
        }
        Ok(())
    }

    async fn complete_if_pending(&self, id: &str) -> StoreResult<bool> {
        let mut state = self.state.write();
        let Some(campaign) = state.campaigns.get_mut(id) else {
            return Ok(false);
        };
        let ready = campaign.status == CampaignStatus::Pending
            && campaign.audience_size > 0
            && campaign.processed() >= campaign.audience_size;
        if ready {
            campaign.status = CampaignStatus::Completed;
            campaign.updated_at = Utc::now();
        }
        Ok(ready)
    }

    async fn completed_campaigns(&self, organization_id: &str) -> StoreResult<Vec<Campaign>> {
        let mut campaigns: Vec<Campaign> = self
            .state
            .read()
            .campaigns
            .values()
            .filter(|c| c.organization_id == organization_id && c.status == CampaignStatus::Completed)
            .cloned()
            .collect();
        campaigns.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(campaigns)
    }

    async fn insert_customer(&self, customer: Customer) -> StoreResult<()> {
        self.state.write().customers.insert(customer.id.clone(), customer);
        Ok(())
    }

    async fn customers(&self, ids: &[String]) -> StoreResult<Vec<Customer>> {
        let state = self.state.read();
        Ok(ids.iter().filter_map(|id| state.customers.get(id).cloned()).collect())
    }

    async fn insert_membership(&self, membership: AudienceMembership) -> StoreResult<()> {
        let mut state = self.state.write();
        let members = state.memberships.entry(membership.segment_id).or_default();
        if !members.contains(&membership.customer_id) {
            members.push(membership.customer_id);
        }
        Ok(())
    }

    async fn memberships(&self, segment_id: &str) -> StoreResult<Vec<AudienceMembership>> {
        let state = self.state.read();
        Ok(state
            .memberships
            .get(segment_id)
            .map(|members| {
                members
                    .iter()
                    .map(|customer_id| AudienceMembership {
                        segment_id: segment_id.to_string(),
                        customer_id: customer_id.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_memberships(&self, segment_id: &str) -> StoreResult<u64> {
        let removed = self.state.write().memberships.remove(segment_id);
        Ok(removed.map(|m| m.len() as u64).unwrap_or(0))
    }

    async fn insert_pending_deliveries(
        &self,
        campaign_id: &str,
        records: Vec<DeliveryRecord>,
    ) -> StoreResult<Vec<DeliveryRecord>> {
        if self.take_fault() {
            return Err(StoreError::Unavailable("injected delivery insert fault".to_string()));
        }
        let mut state = self.state.write();
        let stored = state.deliveries.entry(campaign_id.to_string()).or_default();
        let mut pending = Vec::with_capacity(records.len());
        for record in records {
            let existing = stored.entry(record.id.clone()).or_insert_with(|| record.clone());
            if existing.status == DeliveryStatus::Pending {
                pending.push(existing.clone());
            }
        }
        Ok(pending)
    }

    async fn apply_outcomes(
        &self,
        campaign_id: &str,
        outcomes: &[DeliveryOutcome],
    ) -> StoreResult<Vec<DeliveryOutcome>> {
        let mut state = self.state.write();
        let Some(stored) = state.deliveries.get_mut(campaign_id) else {
            return Ok(Vec::new());
        };
        let mut applied = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            if outcome.status == DeliveryStatus::Pending {
                continue;
            }
            if let Some(record) = stored.get_mut(&outcome.record_id) {
                if record.status == DeliveryStatus::Pending {
                    record.status = outcome.status;
                    applied.push(outcome.clone());
                }
            }
        }
        Ok(applied)
    }

    async fn deliveries(&self, campaign_id: &str) -> StoreResult<Vec<DeliveryRecord>> {
        let state = self.state.read();
        Ok(state
            .deliveries
            .get(campaign_id)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_deliveries(&self, campaign_id: &str) -> StoreResult<u64> {
        let removed = self.state.write().deliveries.remove(campaign_id);
        Ok(removed.map(|r| r.len() as u64).unwrap_or(0))
    }

    async fn insert_user(&self, user: User) -> StoreResult<()> {
        self.state.write().users.insert(user.id.clone(), user);
        Ok(())
    }

    async fn user(&self, id: &str) -> StoreResult<Option<User>> {
        Ok(self.state.read().users.get(id).cloned())
    }

    async fn insert_activity(&self, record: ActivityRecord) -> StoreResult<bool> {
        let mut state = self.state.write();
        if state.activities.iter().any(|a| a.id == record.id) {
            return Ok(false);
        }
        state.activities.push(record);
        Ok(true)
    }

    async fn activities(&self, organization_id: &str) -> StoreResult<Vec<ActivityRecord>> {
        let state = self.state.read();
        Ok(state
            .activities
            .iter()
            .filter(|a| a.organization_id == organization_id)
            .cloned()
            .collect())
    }

    async fn insert_insight(&self, report: InsightReport) -> StoreResult<()> {
        self.state.write().insights.insert(report.id.clone(), report);
        Ok(())
    }

    async fn insight(&self, id: &str) -> StoreResult<Option<InsightReport>> {
        Ok(self.state.read().insights.get(id).cloned())
    }

    async fn finish_insight(
        &self,
        id: &str,
        status: InsightStatus,
        content: Option<String>,
    ) -> StoreResult<bool> {
        let mut state = self.state.write();
        match state.insights.get_mut(id) {
            Some(report) if report.status == InsightStatus::Pending => {
                report.status = status;
                report.content = content;
                report.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
