// =============================================================================
// store/redis_store.rs — DOCUMENTS IN REDIS
// =============================================================================
//
// Key layout (all under `{ns}:`):
//
//   campaign:{id}                    HASH   campaign fields, counters included
//   org:{org}:campaigns              SET    campaign ids of an organization
//   customer:{id}                    STRING customer JSON
//   segment:{id}:members             ZSET   customer ids, scored by insert time
//   campaign:{id}:deliveries         HASH   record id → record JSON
//   campaign:{id}:delivery-status    HASH   record id → PENDING | SENT | FAILED
//   user:{id}                        STRING user JSON
//   activity:{id}                    STRING activity JSON
//   org:{org}:activities             LIST   activity ids in append order
//   insight:{id}                     HASH   insight report fields
//
// Anything that must be atomic runs as a Lua script, so a single round trip
// both checks and mutates.
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::LazyLock;
use tracing::{debug, info};

use super::CampaignStore;
use crate::error::{StoreError, StoreResult};
use crate::models::{
    ActivityRecord, AudienceMembership, Campaign, CampaignStatus, CampaignTotals, Customer,
    DeliveryOutcome, DeliveryRecord, DeliveryStatus, InsightReport, InsightStatus, User,
};

static SET_AUDIENCE_SIZE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if redis.call('EXISTS', KEYS[1]) == 0 then return false end
        local processed = tonumber(redis.call('HGET', KEYS[1], 'sent') or '0')
                        + tonumber(redis.call('HGET', KEYS[1], 'failed') or '0')
        local size = math.max(tonumber(ARGV[1]), processed)
        redis.call('HSET', KEYS[1], 'audience_size', size, 'updated_at', ARGV[2])
        return size
        ",
    )
});

static INCREMENT_COUNTERS: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if redis.call('EXISTS', KEYS[1]) == 0 then return false end
        local sent = redis.call('HINCRBY', KEYS[1], 'sent', ARGV[1])
        local failed = redis.call('HINCRBY', KEYS[1], 'failed', ARGV[2])
        redis.call('HSET', KEYS[1], 'updated_at', ARGV[3])
        local audience = tonumber(redis.call('HGET', KEYS[1], 'audience_size') or '0')
        local status = redis.call('HGET', KEYS[1], 'status') or 'PENDING'
        return {sent, failed, audience, status}
        ",
    )
});

static COMPLETE_IF_PENDING: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if redis.call('HGET', KEYS[1], 'status') ~= 'PENDING' then return 0 end
        local audience = tonumber(redis.call('HGET', KEYS[1], 'audience_size') or '0')
        local processed = tonumber(redis.call('HGET', KEYS[1], 'sent') or '0')
                        + tonumber(redis.call('HGET', KEYS[1], 'failed') or '0')
        if audience > 0 and processed >= audience then
            redis.call('HSET', KEYS[1], 'status', 'COMPLETED', 'updated_at', ARGV[1])
            return 1
        end
        return 0
        ",
    )
});

static INSERT_PENDING: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local pending = {}
        for i = 1, #ARGV, 2 do
            redis.call('HSETNX', KEYS[1], ARGV[i], ARGV[i + 1])
            redis.call('HSETNX', KEYS[2], ARGV[i], 'PENDING')
            if redis.call('HGET', KEYS[2], ARGV[i]) == 'PENDING' then
                pending[#pending + 1] = ARGV[i]
            end
        end
        return pending
        ",
    )
});

static APPLY_OUTCOMES: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local applied = {}
        for i = 1, #ARGV, 2 do
            if redis.call('HGET', KEYS[1], ARGV[i]) == 'PENDING' then
                redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
                applied[#applied + 1] = ARGV[i]
                applied[#applied + 1] = ARGV[i + 1]
            end
        end
        return applied
        ",
    )
});

static FINISH_INSIGHT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if redis.call('HGET', KEYS[1], 'status') ~= 'PENDING' then return 0 end
        redis.call('HSET', KEYS[1], 'status', ARGV[1], 'content', ARGV[2], 'updated_at', ARGV[3])
        return 1
        ",
    )
});

/// Key builder for one namespace.
#[derive(Debug, Clone)]
pub struct Keys {
    ns: String,
}

impl Keys {
    pub fn new(ns: impl Into<String>) -> Self {
        Self { ns: ns.into() }
    }

    pub fn campaign(&self, id: &str) -> String {
        format!("{}:campaign:{id}", self.ns)
    }

    pub fn org_campaigns(&self, org: &str) -> String {
        format!("{}:org:{org}:campaigns", self.ns)
    }

    pub fn customer(&self, id: &str) -> String {
        format!("{}:customer:{id}", self.ns)
    }

    pub fn segment_members(&self, id: &str) -> String {
        format!("{}:segment:{id}:members", self.ns)
    }

    pub fn deliveries(&self, campaign: &str) -> String {
        format!("{}:campaign:{campaign}:deliveries", self.ns)
    }

    pub fn delivery_status(&self, campaign: &str) -> String {
        format!("{}:campaign:{campaign}:delivery-status", self.ns)
    }

    pub fn user(&self, id: &str) -> String {
        format!("{}:user:{id}", self.ns)
    }

    pub fn activity(&self, id: &str) -> String {
        format!("{}:activity:{id}", self.ns)
    }

    pub fn org_activities(&self, org: &str) -> String {
        format!("{}:org:{org}:activities", self.ns)
    }

    pub fn insight(&self, id: &str) -> String {
        format!("{}:insight:{id}", self.ns)
    }
}

pub struct RedisStore {
    con: ConnectionManager,
    keys: Keys,
}

impl RedisStore {
    pub async fn connect(redis_url: &str, namespace: &str) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let con = ConnectionManager::new(client).await?;
        info!(namespace = namespace, "Redis document store connected");
        Ok(Self {
            con,
            keys: Keys::new(namespace),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        let mut con = self.con.clone();
        let raw: Option<String> = con.get(key).await?;
        raw.map(|json| serde_json::from_str(&json).map_err(|e| corrupt(key, e)))
            .transpose()
    }

    async fn load_campaign(&self, id: &str) -> StoreResult<Option<Campaign>> {
        let key = self.keys.campaign(id);
        let mut con = self.con.clone();
        let fields: HashMap<String, String> = con.hgetall(&key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        campaign_from_fields(id, &fields)
            .map(Some)
            .map_err(|reason| StoreError::Corrupt { key, reason })
    }
}

fn corrupt(key: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt {
        key: key.to_string(),
        reason: err.to_string(),
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

fn required<'a>(fields: &'a HashMap<String, String>, name: &str) -> Result<&'a str, String> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| format!("missing field '{name}'"))
}

fn parsed<T: FromStr>(fields: &HashMap<String, String>, name: &str, default: T) -> Result<T, String> {
    match fields.get(name) {
        None => Ok(default),
        Some(raw) if raw.is_empty() => Ok(default),
        Some(raw) => raw.parse().map_err(|_| format!("bad value '{raw}' for '{name}'")),
    }
}

fn timestamp(fields: &HashMap<String, String>, name: &str) -> Result<DateTime<Utc>, String> {
    match fields.get(name) {
        None => Ok(Utc::now()),
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| format!("bad timestamp for '{name}': {e}")),
    }
}

pub fn campaign_to_fields(campaign: &Campaign) -> Vec<(&'static str, String)> {
    vec![
        ("name", campaign.name.clone()),
        ("content", campaign.content.clone()),
        ("segment_id", campaign.segment_id.clone()),
        ("organization_id", campaign.organization_id.clone()),
        ("audience_size", campaign.audience_size.to_string()),
        ("sent", campaign.sent.to_string()),
        ("failed", campaign.failed.to_string()),
        ("success_rate", campaign.success_rate.to_string()),
        ("status", campaign.status.as_str().to_string()),
        ("created_at", campaign.created_at.to_rfc3339()),
        ("updated_at", campaign.updated_at.to_rfc3339()),
    ]
}

pub fn campaign_from_fields(id: &str, fields: &HashMap<String, String>) -> Result<Campaign, String> {
    Ok(Campaign {
        id: id.to_string(),
        name: required(fields, "name")?.to_string(),
        content: required(fields, "content")?.to_string(),
        segment_id: fields.get("segment_id").cloned().unwrap_or_default(),
        organization_id: required(fields, "organization_id")?.to_string(),
        audience_size: parsed(fields, "audience_size", 0u64)?,
        sent: parsed(fields, "sent", 0u64)?,
        failed: parsed(fields, "failed", 0u64)?,
        success_rate: parsed(fields, "success_rate", 0.0f64)?,
        status: parsed(fields, "status", CampaignStatus::Pending)?,
        created_at: timestamp(fields, "created_at")?,
        updated_at: timestamp(fields, "updated_at")?,
    })
}

fn insight_from_fields(id: &str, fields: &HashMap<String, String>) -> Result<InsightReport, String> {
    let status: InsightStatus = parsed(fields, "status", InsightStatus::Pending)?;
    Ok(InsightReport {
        id: id.to_string(),
        organization_id: required(fields, "organization_id")?.to_string(),
        status,
        content: fields.get("content").filter(|c| !c.is_empty()).cloned(),
        created_at: timestamp(fields, "created_at")?,
        updated_at: timestamp(fields, "updated_at")?,
    })
}

/// Decodes a flat `[id, status, id, status, ...]` script reply.
fn outcome_pairs(flat: Vec<String>) -> Vec<DeliveryOutcome> {
    flat.chunks_exact(2)
        .filter_map(|pair| {
            DeliveryStatus::from_str(&pair[1])
                .ok()
                .map(|status| DeliveryOutcome {
                    record_id: pair[0].clone(),
                    status,
                })
        })
        .collect()
}

#[async_trait]
impl CampaignStore for RedisStore {
    async fn insert_campaign(&self, campaign: Campaign) -> StoreResult<()> {
        let mut con = self.con.clone();
        let fields = campaign_to_fields(&campaign);
        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(self.keys.campaign(&campaign.id), &fields[..])
            .ignore()
            .sadd(self.keys.org_campaigns(&campaign.organization_id), &campaign.id)
            .ignore()
            .query_async(&mut con)
            .await?;
        Ok(())
    }

    async fn campaign(&self, id: &str) -> StoreResult<Option<Campaign>> {
        self.load_campaign(id).await
    }

    async fn set_audience_size(&self, id: &str, size: u64) -> StoreResult<Option<u64>> {
        let mut con = self.con.clone();
        let written: Option<u64> = SET_AUDIENCE_SIZE
            .key(self.keys.campaign(id))
            .arg(size)
            .arg(now_rfc3339())
            .invoke_async(&mut con)
            .await?;
        Ok(written)
    }

    async fn increment_counters(
        &self,
        id: &str,
        sent: u64,
        failed: u64,
    ) -> StoreResult<Option<CampaignTotals>> {
        let key = self.keys.campaign(id);
        let mut con = self.con.clone();
        let reply: Option<(u64, u64, u64, String)> = INCREMENT_COUNTERS
            .key(&key)
            .arg(sent)
            .arg(failed)
            .arg(now_rfc3339())
            .invoke_async(&mut con)
            .await?;
        let Some((sent, failed, audience_size, status)) = reply else {
            return Ok(None);
        };
        let status = CampaignStatus::from_str(&status).map_err(|e| corrupt(&key, e))?;
        Ok(Some(CampaignTotals {
            sent,
            failed,
            audience_size,
            status,
        }))
    }

    async fn set_success_rate(&self, id: &str, rate: f64) -> StoreResult<()> {
        let mut con = self.con.clone();
        let _: () = con
            .hset(self.keys.campaign(id), "success_rate", rate.to_string())
            .await?;
        Ok(())
    }

    async fn complete_if_pending(&self, id: &str) -> StoreResult<bool> {
        let mut con = self.con.clone();
        let flipped: i64 = COMPLETE_IF_PENDING
            .key(self.keys.campaign(id))
            .arg(now_rfc3339())
            .invoke_async(&mut con)
            .await?;
        Ok(flipped == 1)
    }

    async fn completed_campaigns(&self, organization_id: &str) -> StoreResult<Vec<Campaign>> {
        let mut con = self.con.clone();
        let ids: Vec<String> = con.smembers(self.keys.org_campaigns(organization_id)).await?;
        let mut campaigns = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(campaign) = self.load_campaign(&id).await? {
                if campaign.status == CampaignStatus::Completed {
                    campaigns.push(campaign);
                }
            }
        }
        campaigns.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(campaigns)
    }

    async fn insert_customer(&self, customer: Customer) -> StoreResult<()> {
        let mut con = self.con.clone();
        let json = serde_json::to_string(&customer)?;
        let _: () = con.set(self.keys.customer(&customer.id), json).await?;
        Ok(())
    }

    async fn customers(&self, ids: &[String]) -> StoreResult<Vec<Customer>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = ids.iter().map(|id| self.keys.customer(id)).collect();
        let mut con = self.con.clone();
        let raw: Vec<Option<String>> = redis::cmd("MGET").arg(&keys).query_async(&mut con).await?;
        raw.into_iter()
            .zip(keys.iter())
            .filter_map(|(json, key)| json.map(|j| (j, key)))
            .map(|(json, key)| serde_json::from_str(&json).map_err(|e| corrupt(key, e)))
            .collect()
    }

    async fn insert_membership(&self, membership: AudienceMembership) -> StoreResult<()> {
        let mut con = self.con.clone();
        let score = Utc::now().timestamp_micros();
        let _: () = redis::cmd("ZADD")
            .arg(self.keys.segment_members(&membership.segment_id))
            .arg("NX")
            .arg(score)
            .arg(&membership.customer_id)
            .query_async(&mut con)
            .await?;
        Ok(())
    }

    async fn memberships(&self, segment_id: &str) -> StoreResult<Vec<AudienceMembership>> {
        let mut con = self.con.clone();
        let members: Vec<String> = con
            .zrange(self.keys.segment_members(segment_id), 0, -1)
            .await?;
        Ok(members
            .into_iter()
            .map(|customer_id| AudienceMembership {
                segment_id: segment_id.to_string(),
                customer_id,
            })
            .collect())
    }

    async fn delete_memberships(&self, segment_id: &str) -> StoreResult<u64> {
        let key = self.keys.segment_members(segment_id);
        let mut con = self.con.clone();
        let (count, _): (u64, i64) = redis::pipe()
            .atomic()
            .zcard(&key)
            .del(&key)
            .query_async(&mut con)
            .await?;
        Ok(count)
    }

    async fn insert_pending_deliveries(
        &self,
        campaign_id: &str,
        records: Vec<DeliveryRecord>,
    ) -> StoreResult<Vec<DeliveryRecord>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let mut invocation = INSERT_PENDING.key(self.keys.deliveries(campaign_id));
        invocation.key(self.keys.delivery_status(campaign_id));
        for record in &records {
            invocation.arg(&record.id).arg(serde_json::to_string(record)?);
        }
        let mut con = self.con.clone();
        let pending_ids: Vec<String> = invocation.invoke_async(&mut con).await?;
        debug!(
            campaign_id = campaign_id,
            offered = records.len(),
            pending = pending_ids.len(),
            "Delivery records inserted"
        );
        Ok(records
            .into_iter()
            .filter(|r| pending_ids.contains(&r.id))
            .collect())
    }

    async fn apply_outcomes(
        &self,
        campaign_id: &str,
        outcomes: &[DeliveryOutcome],
    ) -> StoreResult<Vec<DeliveryOutcome>> {
        let terminal: Vec<&DeliveryOutcome> =
            outcomes.iter().filter(|o| o.status.is_terminal()).collect();
        if terminal.is_empty() {
            return Ok(Vec::new());
        }
        let mut invocation = APPLY_OUTCOMES.key(self.keys.delivery_status(campaign_id));
        for outcome in terminal {
            invocation.arg(&outcome.record_id).arg(outcome.status.as_str());
        }
        let mut con = self.con.clone();
        let flat: Vec<String> = invocation.invoke_async(&mut con).await?;
        Ok(outcome_pairs(flat))
    }

    async fn deliveries(&self, campaign_id: &str) -> StoreResult<Vec<DeliveryRecord>> {
        let bodies_key = self.keys.deliveries(campaign_id);
        let mut con = self.con.clone();
        let (bodies, statuses): (HashMap<String, String>, HashMap<String, String>) = redis::pipe()
            .hgetall(&bodies_key)
            .hgetall(self.keys.delivery_status(campaign_id))
            .query_async(&mut con)
            .await?;
        let mut records = Vec::with_capacity(bodies.len());
        for (id, json) in bodies {
            let mut record: DeliveryRecord =
                serde_json::from_str(&json).map_err(|e| corrupt(&bodies_key, e))?;
            if let Some(status) = statuses.get(&id) {
                record.status = DeliveryStatus::from_str(status).map_err(|e| corrupt(&bodies_key, e))?;
            }
            records.push(record);
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    async fn delete_deliveries(&self, campaign_id: &str) -> StoreResult<u64> {
        let bodies_key = self.keys.deliveries(campaign_id);
        let status_key = self.keys.delivery_status(campaign_id);
        let mut con = self.con.clone();
        let (count, _): (u64, i64) = redis::pipe()
            .atomic()
            .hlen(&bodies_key)
            .del(vec![bodies_key.clone(), status_key])
            .query_async(&mut con)
            .await?;
        Ok(count)
    }

    async fn insert_user(&self, user: User) -> StoreResult<()> {
        let mut con = self.con.clone();
        let json = serde_json::to_string(&user)?;
        let _: () = con.set(self.keys.user(&user.id), json).await?;
        Ok(())
    }

    async fn user(&self, id: &str) -> StoreResult<Option<User>> {
        self.get_json(&self.keys.user(id)).await
    }

    async fn insert_activity(&self, record: ActivityRecord) -> StoreResult<bool> {
        let mut con = self.con.clone();
        let json = serde_json::to_string(&record)?;
        let created: bool = con.set_nx(self.keys.activity(&record.id), json).await?;
        if created {
            let _: () = con
                .rpush(self.keys.org_activities(&record.organization_id), &record.id)
                .await?;
        }
        Ok(created)
    }

    async fn activities(&self, organization_id: &str) -> StoreResult<Vec<ActivityRecord>> {
        let mut con = self.con.clone();
        let ids: Vec<String> = con
            .lrange(self.keys.org_activities(organization_id), 0, -1)
            .await?;
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.get_json::<ActivityRecord>(&self.keys.activity(&id)).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn insert_insight(&self, report: InsightReport) -> StoreResult<()> {
        let mut con = self.con.clone();
        let fields = vec![
            ("organization_id", report.organization_id.clone()),
            ("status", report.status.as_str().to_string()),
            ("content", report.content.clone().unwrap_or_default()),
            ("created_at", report.created_at.to_rfc3339()),
            ("updated_at", report.updated_at.to_rfc3339()),
        ];
        let _: () = con.hset_multiple(self.keys.insight(&report.id), &fields[..]).await?;
        Ok(())
    }

    async fn insight(&self, id: &str) -> StoreResult<Option<InsightReport>> {
        let key = self.keys.insight(id);
        let mut con = self.con.clone();
        let fields: HashMap<String, String> = con.hgetall(&key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        insight_from_fields(id, &fields)
            .map(Some)
            .map_err(|reason| StoreError::Corrupt { key, reason })
    }

    async fn finish_insight(
        &self,
        id: &str,
        status: InsightStatus,
        content: Option<String>,
    ) -> StoreResult<bool> {
        let mut con = self.con.clone();
        let moved: i64 = FINISH_INSIGHT
            .key(self.keys.insight(id))
            .arg(status.as_str())
            .arg(content.unwrap_or_default())
            .arg(now_rfc3339())
            .invoke_async(&mut con)
            .await?;
        Ok(moved == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = Keys::new("campaigns");
        assert_eq!(keys.campaign("c1"), "campaigns:campaign:c1");
        assert_eq!(keys.deliveries("c1"), "campaigns:campaign:c1:deliveries");
        assert_eq!(keys.segment_members("s1"), "campaigns:segment:s1:members");
        assert_eq!(keys.org_activities("o1"), "campaigns:org:o1:activities");
    }

    #[test]
    fn test_campaign_fields_round_trip() {
        let mut campaign = Campaign::new("c1", "Spring", "Hi {name}", "s1", "o1");
        campaign.audience_size = 250;
        campaign.sent = 200;
        campaign.failed = 50;
        campaign.success_rate = 80.0;
        campaign.status = CampaignStatus::Completed;

        let fields: HashMap<String, String> = campaign_to_fields(&campaign)
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let decoded = campaign_from_fields("c1", &fields).unwrap();
        assert_eq!(decoded.audience_size, 250);
        assert_eq!(decoded.status, CampaignStatus::Completed);
        assert_eq!(decoded.success_rate, 80.0);
        assert_eq!(decoded.created_at, campaign.created_at);
    }

    #[test]
    fn test_campaign_fields_tolerate_missing_counters() {
        let fields: HashMap<String, String> = [
            ("name", "Spring"),
            ("content", "Hi"),
            ("organization_id", "o1"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let campaign = campaign_from_fields("c1", &fields).unwrap();
        assert_eq!(campaign.sent, 0);
        assert_eq!(campaign.status, CampaignStatus::Pending);
    }

    #[test]
    fn test_outcome_pairs_skip_unknown_status() {
        let flat = vec![
            "c1:a".to_string(),
            "SENT".to_string(),
            "c1:b".to_string(),
            "BOGUS".to_string(),
        ];
        let outcomes = outcome_pairs(flat);
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, DeliveryStatus::Sent);
    }
}
