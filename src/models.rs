// =============================================================================
// models.rs — THE DOCUMENTS AND THE WIRE
// =============================================================================
//
// Everything the engine reads, writes or receives lives here: the stored
// documents (campaigns, delivery records, customers, memberships, activity
// entries, insight reports) and the JSON payloads that arrive on each topic.
//
// Ids are plain strings. The API that creates campaigns and segments owns
// id generation, we only echo its ids back.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle of a campaign. PENDING until every recipient reached a terminal
/// delivery state, then COMPLETED exactly once.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CampaignStatus {
    Pending,
    Completed,
    Failed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Pending => "PENDING",
            CampaignStatus::Completed => "COMPLETED",
            CampaignStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CampaignStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(CampaignStatus::Pending),
            "COMPLETED" => Ok(CampaignStatus::Completed),
            "FAILED" => Ok(CampaignStatus::Failed),
            other => Err(format!("unknown campaign status '{other}'")),
        }
    }
}

/// A named broadcast of one message template to one segment's audience.
///
/// `sent` and `failed` only ever grow, and only through the store's atomic
/// increment. `audience_size` is written by the batch planner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Campaign {
    pub id: String,
    pub name: String,
    /// Message template with `{field}` placeholders.
    pub content: String,
    pub segment_id: String,
    pub organization_id: String,
    pub audience_size: u64,
    pub sent: u64,
    pub failed: u64,
    pub success_rate: f64,
    pub status: CampaignStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
        segment_id: impl Into<String>,
        organization_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            content: content.into(),
            segment_id: segment_id.into(),
            organization_id: organization_id.into(),
            audience_size: 0,
            sent: 0,
            failed: 0,
            success_rate: 0.0,
            status: CampaignStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn processed(&self) -> u64 {
        self.sent + self.failed
    }

    pub fn delivery_rate(&self) -> f64 {
        rate(self.sent, self.processed())
    }
}

/// Counter state handed back by the atomic increment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CampaignTotals {
    pub sent: u64,
    pub failed: u64,
    pub audience_size: u64,
    pub status: CampaignStatus,
}

impl CampaignTotals {
    pub fn processed(&self) -> u64 {
        self.sent + self.failed
    }

    /// `sent / (sent + failed) * 100`, or `None` before anything was processed.
    pub fn success_rate(&self) -> Option<f64> {
        match self.processed() {
            0 => None,
            total => Some(self.sent as f64 / total as f64 * 100.0),
        }
    }

    /// The completion predicate. An empty audience never completes here.
    pub fn reached_completion(&self) -> bool {
        self.audience_size > 0 && self.processed() >= self.audience_size
    }
}

/// Percentage helper shared by the aggregator and the insight summary.
pub fn rate(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

/// Per-recipient delivery state. PENDING → SENT | FAILED, never back.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "PENDING",
            DeliveryStatus::Sent => "SENT",
            DeliveryStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryStatus::Pending)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(DeliveryStatus::Pending),
            "SENT" => Ok(DeliveryStatus::Sent),
            "FAILED" => Ok(DeliveryStatus::Failed),
            other => Err(format!("unknown delivery status '{other}'")),
        }
    }
}

/// One recipient's unit of work for one campaign.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryRecord {
    pub id: String,
    pub campaign_id: String,
    pub recipient_id: String,
    pub recipient_name: String,
    pub recipient_email: String,
    /// The rendered message body.
    pub message: String,
    pub status: DeliveryStatus,
    pub created_at: DateTime<Utc>,
}

impl DeliveryRecord {
    /// Builds a PENDING record for `recipient`. The id is derived from the
    /// campaign and recipient so a replayed batch maps onto the same record.
    pub fn pending(campaign_id: &str, recipient: &Recipient, message: String) -> Self {
        Self {
            id: Self::record_id(campaign_id, &recipient.id),
            campaign_id: campaign_id.to_string(),
            recipient_id: recipient.id.clone(),
            recipient_name: recipient.name.clone(),
            recipient_email: recipient.email.clone(),
            message,
            status: DeliveryStatus::Pending,
            created_at: Utc::now(),
        }
    }

    pub fn record_id(campaign_id: &str, recipient_id: &str) -> String {
        format!("{campaign_id}:{recipient_id}")
    }
}

/// Terminal outcome for one delivery record, as applied by the aggregator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub record_id: String,
    pub status: DeliveryStatus,
}

/// Customer profile as written by the ingestion side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Customer {
    pub id: String,
    pub name: String,
    pub email: String,
    pub organization_id: String,
    #[serde(default)]
    pub visit_count: Option<u64>,
    #[serde(default)]
    pub totalspend: Option<f64>,
    #[serde(default)]
    pub days_inactive: Option<u64>,
    #[serde(default)]
    pub lastpurchase_day: Option<u64>,
}

impl Customer {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        email: impl Into<String>,
        organization_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            email: email.into(),
            organization_id: organization_id.into(),
            visit_count: None,
            totalspend: None,
            days_inactive: None,
            lastpurchase_day: None,
        }
    }
}

/// Lightweight recipient handed through the batch pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Recipient {
    pub id: String,
    pub name: String,
    pub email: String,
    /// Extra customer fields available to message placeholders.
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl Recipient {
    /// Looks up a placeholder field. Absent, null and empty values yield `None`.
    pub fn field(&self, key: &str) -> Option<String> {
        let value = match key {
            "id" => Some(self.id.clone()),
            "name" => Some(self.name.clone()),
            "email" => Some(self.email.clone()),
            other => self.attributes.get(other).and_then(render_value),
        };
        value.filter(|v| !v.is_empty())
    }
}

fn render_value(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => Some(format!("{}", f as i64)),
            _ => Some(n.to_string()),
        },
        other => Some(other.to_string()),
    }
}

impl From<&Customer> for Recipient {
    fn from(customer: &Customer) -> Self {
        let mut attributes = BTreeMap::new();
        if let Some(v) = customer.visit_count {
            attributes.insert("visit_count".to_string(), serde_json::json!(v));
        }
        if let Some(v) = customer.totalspend {
            attributes.insert("totalspend".to_string(), serde_json::json!(v));
        }
        if let Some(v) = customer.days_inactive {
            attributes.insert("days_inactive".to_string(), serde_json::json!(v));
        }
        if let Some(v) = customer.lastpurchase_day {
            attributes.insert("lastpurchase_day".to_string(), serde_json::json!(v));
        }
        Self {
            id: customer.id.clone(),
            name: customer.name.clone(),
            email: customer.email.clone(),
            attributes,
        }
    }
}

/// Segment ↔ customer mapping produced when a segment rule is evaluated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AudienceMembership {
    pub segment_id: String,
    pub customer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub email: String,
    pub fullname: String,
}

/// `createdBy` block of an activity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Actor {
    pub email: String,
    pub fullname: String,
}

impl From<&User> for Actor {
    fn from(user: &User) -> Self {
        Self {
            email: user.email.clone(),
            fullname: user.fullname.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TargetModel {
    Campaign,
    Segment,
    Customer,
    Organization,
}

/// Payload of the `recent-activities` topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    /// Stable id for activities that must be recorded at most once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    pub title: String,
    pub description: String,
    #[serde(rename = "type")]
    pub activity_type: String,
    pub created_by: Actor,
    pub user_id: String,
    pub organization_id: String,
    pub target_action_id: String,
    pub target_model: TargetModel,
}

/// Append-only activity log entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityRecord {
    pub id: String,
    pub title: String,
    pub description: String,
    pub activity_type: String,
    pub created_by: Actor,
    pub user_id: String,
    pub organization_id: String,
    pub target_action_id: String,
    pub target_model: TargetModel,
    pub date: DateTime<Utc>,
}

impl From<ActivityEvent> for ActivityRecord {
    fn from(event: ActivityEvent) -> Self {
        Self {
            id: event.event_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            title: event.title,
            description: event.description,
            activity_type: event.activity_type,
            created_by: event.created_by,
            user_id: event.user_id,
            organization_id: event.organization_id,
            target_action_id: event.target_action_id,
            target_model: event.target_model,
            date: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InsightStatus {
    Pending,
    Completed,
    Failed,
}

impl InsightStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InsightStatus::Pending => "PENDING",
            InsightStatus::Completed => "COMPLETED",
            InsightStatus::Failed => "FAILED",
        }
    }
}

impl FromStr for InsightStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(InsightStatus::Pending),
            "COMPLETED" => Ok(InsightStatus::Completed),
            "FAILED" => Ok(InsightStatus::Failed),
            other => Err(format!("unknown insight status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InsightReport {
    pub id: String,
    pub organization_id: String,
    pub status: InsightStatus,
    pub content: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InsightReport {
    pub fn pending(id: impl Into<String>, organization_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            organization_id: organization_id.into(),
            status: InsightStatus::Pending,
            content: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// =============================================================================
// Topic payloads
// =============================================================================

/// `campaign-batch-data`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequested {
    pub campaign_id: String,
    #[serde(alias = "segment_id")]
    pub segment_id: String,
    pub content: String,
    pub name: String,
    pub organization_id: String,
    pub user_id: String,
}

/// `message-log`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogPurgeRequested {
    pub campaign_id: String,
}

/// `insights`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InsightRequested {
    pub organization_id: String,
    pub insight_id: String,
}

/// `segment`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SegmentPurgeRequested {
    #[serde(alias = "segment_id")]
    pub segment_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_payload_accepts_snake_case_segment_id() {
        let json = r#"{"campaignId":"c1","segment_id":"s1","content":"Hi {name}",
                       "name":"Spring","organizationId":"o1","userId":"u1"}"#;
        let payload: BatchRequested = serde_json::from_str(json).unwrap();
        assert_eq!(payload.segment_id, "s1");
        assert_eq!(payload.campaign_id, "c1");
    }

    #[test]
    fn test_activity_event_uses_type_key() {
        let event = ActivityEvent {
            event_id: None,
            title: "Campaign Sent".into(),
            description: "Sent campaign X".into(),
            activity_type: "campaign_sent".into(),
            created_by: Actor { email: "a@b.c".into(), fullname: "Al".into() },
            user_id: "u1".into(),
            organization_id: "o1".into(),
            target_action_id: "c1".into(),
            target_model: TargetModel::Campaign,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "campaign_sent");
        assert_eq!(value["createdBy"]["fullname"], "Al");
        assert!(value.get("eventId").is_none());
    }

    #[test]
    fn test_totals_completion_predicate() {
        let mut totals = CampaignTotals {
            sent: 0,
            failed: 0,
            audience_size: 0,
            status: CampaignStatus::Pending,
        };
        assert!(!totals.reached_completion());
        assert_eq!(totals.success_rate(), None);

        totals.audience_size = 4;
        totals.sent = 3;
        assert!(!totals.reached_completion());
        totals.failed = 1;
        assert!(totals.reached_completion());
        assert_eq!(totals.success_rate(), Some(75.0));
    }

    #[test]
    fn test_recipient_field_lookup() {
        let mut customer = Customer::new("cu1", "Al", "al@example.com", "o1");
        customer.totalspend = Some(120.0);
        customer.days_inactive = Some(0);
        let recipient = Recipient::from(&customer);
        assert_eq!(recipient.field("name").as_deref(), Some("Al"));
        assert_eq!(recipient.field("totalspend").as_deref(), Some("120"));
        assert_eq!(recipient.field("days_inactive").as_deref(), Some("0"));
        assert_eq!(recipient.field("visit_count"), None);
        assert_eq!(recipient.field("foo"), None);
    }
}
