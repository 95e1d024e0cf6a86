// =============================================================================
// insights.rs — ORGANIZATION-WIDE CAMPAIGN INSIGHTS
// =============================================================================
//
// Rolls every COMPLETED campaign of an organization into one structured
// summary, hands it to the text generator as a pretty-printed JSON prompt
// and stores the narrative on the insight report.
//
// A report leaves PENDING exactly once:
//
//   no completed campaigns     → COMPLETED with a fixed message, no call
//   narrative generated        → COMPLETED with the text
//   generation failed          → FAILED
//
// A report that is already terminal is a replay and left as it is.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{error, info};

use crate::error::HandlerError;
use crate::generator::TextGenerator;
use crate::metrics::MetricsCollector;
use crate::models::{
    rate, Campaign, Customer, DeliveryRecord, DeliveryStatus, InsightRequested, InsightStatus,
};
use crate::store::CampaignStore;

pub const NO_CAMPAIGNS_MESSAGE: &str =
    "No completed campaigns yet. Insights will be available once a campaign has finished sending.";

pub const SYSTEM_INSTRUCTION: &str = "You are a marketing analytics assistant. You receive a JSON \
summary of an organization's completed messaging campaigns: overall totals, per-segment delivery \
rates, and per-campaign delivery rates for high-value and recently-active customers. Write a short \
plain-text report for a marketing manager. Highlight the best and weakest campaigns and segments, \
call out notable cohort differences, and finish with two or three concrete recommendations. Do not \
invent numbers that are not in the summary.";

// =============================================================================
// Summary
// =============================================================================

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CohortRate {
    pub recipients: u64,
    pub delivered: u64,
    pub delivery_rate: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CampaignInsight {
    pub id: String,
    pub name: String,
    pub segment_id: String,
    pub audience_size: u64,
    pub sent: u64,
    pub failed: u64,
    pub delivery_rate: f64,
    pub high_value: CohortRate,
    pub recently_active: CohortRate,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BestCampaign {
    pub id: String,
    pub name: String,
    pub delivery_rate: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SegmentBreakdown {
    pub segment_id: String,
    pub campaigns: u64,
    pub recipients: u64,
    pub delivered: u64,
    pub delivery_rate: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InsightSummary {
    pub total_campaigns: u64,
    pub total_recipients: u64,
    pub total_delivered: u64,
    pub average_delivery_rate: f64,
    pub best_campaign: Option<BestCampaign>,
    pub segments: Vec<SegmentBreakdown>,
    /// Newest first.
    pub campaigns: Vec<CampaignInsight>,
}

/// Cohort thresholds.
#[derive(Debug, Clone, Copy)]
pub struct Cohorts {
    /// High-value means `totalspend` strictly above this.
    pub high_value_spend: f64,
    /// Recently active means `days_inactive` strictly below this.
    pub recent_activity_days: u64,
}

fn cohort_rate<'a>(records: impl Iterator<Item = &'a DeliveryRecord>) -> CohortRate {
    let (mut recipients, mut delivered) = (0u64, 0u64);
    for record in records {
        recipients += 1;
        if record.status == DeliveryStatus::Sent {
            delivered += 1;
        }
    }
    CohortRate {
        recipients,
        delivered,
        delivery_rate: rate(delivered, recipients),
    }
}

/// Builds the summary from campaigns (newest first) with their records.
pub fn summarize(
    campaigns: &[(Campaign, Vec<DeliveryRecord>)],
    customers: &HashMap<String, Customer>,
    cohorts: Cohorts,
) -> InsightSummary {
    let mut insights = Vec::with_capacity(campaigns.len());
    let mut segments: BTreeMap<&str, (u64, u64, u64)> = BTreeMap::new();

    for (campaign, records) in campaigns {
        let customer_of = |r: &DeliveryRecord| customers.get(&r.recipient_id);

        let high_value = cohort_rate(records.iter().filter(|r| {
            customer_of(*r)
                .and_then(|c| c.totalspend)
                .is_some_and(|spend| spend > cohorts.high_value_spend)
        }));
        let recently_active = cohort_rate(records.iter().filter(|r| {
            customer_of(*r)
                .and_then(|c| c.days_inactive)
                .is_some_and(|days| days < cohorts.recent_activity_days)
        }));

        let entry = segments.entry(campaign.segment_id.as_str()).or_default();
        entry.0 += 1;
        entry.1 += campaign.audience_size;
        entry.2 += campaign.sent;

        insights.push(CampaignInsight {
            id: campaign.id.clone(),
            name: campaign.name.clone(),
            segment_id: campaign.segment_id.clone(),
            audience_size: campaign.audience_size,
            sent: campaign.sent,
            failed: campaign.failed,
            delivery_rate: campaign.delivery_rate(),
            high_value,
            recently_active,
            created_at: campaign.created_at,
        });
    }

    let total_campaigns = insights.len() as u64;
    let total_recipients = insights.iter().map(|c| c.audience_size).sum();
    let total_delivered = insights.iter().map(|c| c.sent).sum();
    let average_delivery_rate = if insights.is_empty() {
        0.0
    } else {
        insights.iter().map(|c| c.delivery_rate).sum::<f64>() / insights.len() as f64
    };

    // Ties go to the newer campaign.
    let best_campaign = insights
        .iter()
        .fold(None::<&CampaignInsight>, |best, c| match best {
            Some(b) if b.delivery_rate >= c.delivery_rate => Some(b),
            _ => Some(c),
        })
        .map(|c| BestCampaign {
            id: c.id.clone(),
            name: c.name.clone(),
            delivery_rate: c.delivery_rate,
        });

    let segments = segments
        .into_iter()
        .map(|(segment_id, (campaigns, recipients, delivered))| SegmentBreakdown {
            segment_id: segment_id.to_string(),
            campaigns,
            recipients,
            delivered,
            delivery_rate: rate(delivered, recipients),
        })
        .collect();

    InsightSummary {
        total_campaigns,
        total_recipients,
        total_delivered,
        average_delivery_rate,
        best_campaign,
        segments,
        campaigns: insights,
    }
}

// =============================================================================
// Generator
// =============================================================================

pub struct InsightGenerator {
    store: Arc<dyn CampaignStore>,
    generator: Arc<dyn TextGenerator>,
    metrics: Arc<MetricsCollector>,
    cohorts: Cohorts,
}

impl InsightGenerator {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        generator: Arc<dyn TextGenerator>,
        metrics: Arc<MetricsCollector>,
        cohorts: Cohorts,
    ) -> Self {
        Self {
            store,
            generator,
            metrics,
            cohorts,
        }
    }

    async fn load_summary(&self, organization_id: &str) -> Result<InsightSummary, HandlerError> {
        let campaigns = self.store.completed_campaigns(organization_id).await?;

        let mut with_records = Vec::with_capacity(campaigns.len());
        let mut customer_ids: Vec<String> = Vec::new();
        for campaign in campaigns {
            let records = self.store.deliveries(&campaign.id).await?;
            customer_ids.extend(records.iter().map(|r| r.recipient_id.clone()));
            with_records.push((campaign, records));
        }

        customer_ids.sort();
        customer_ids.dedup();
        let customers: HashMap<String, Customer> = self
            .store
            .customers(&customer_ids)
            .await?
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();

        Ok(summarize(&with_records, &customers, self.cohorts))
    }

    /// Drives one insight report to a terminal status.
    pub async fn generate(&self, request: &InsightRequested) -> Result<InsightStatus, HandlerError> {
        let insight_id = request.insight_id.as_str();
        let report = self
            .store
            .insight(insight_id)
            .await?
            .ok_or_else(|| HandlerError::data(format!("insight report '{insight_id}' not found")))?;

        if report.status != InsightStatus::Pending {
            info!(insight_id, status = report.status.as_str(), "Insight report already terminal");
            return Ok(report.status);
        }

        let summary = self.load_summary(&request.organization_id).await?;

        if summary.total_campaigns == 0 {
            self.finish(insight_id, InsightStatus::Completed, Some(NO_CAMPAIGNS_MESSAGE.to_string()))
                .await?;
            info!(
                insight_id,
                organization_id = %request.organization_id,
                "No completed campaigns, insight report closed"
            );
            return Ok(InsightStatus::Completed);
        }

        let generated = match serde_json::to_string_pretty(&summary) {
            Ok(prompt) => self.generator.generate(SYSTEM_INSTRUCTION, &prompt).await,
            Err(e) => {
                self.finish(insight_id, InsightStatus::Failed, None).await?;
                return Err(HandlerError::data(format!("summary encoding failed: {e}")));
            }
        };

        match generated {
            Ok(text) => {
                self.finish(insight_id, InsightStatus::Completed, Some(text)).await?;
                info!(
                    insight_id,
                    campaigns = summary.total_campaigns,
                    "Insight report completed"
                );
                Ok(InsightStatus::Completed)
            }
            Err(e) => {
                self.finish(insight_id, InsightStatus::Failed, None).await?;
                error!(insight_id, error = %e, "Insight generation failed, report marked FAILED");
                Err(HandlerError::External(e))
            }
        }
    }

    async fn finish(
        &self,
        insight_id: &str,
        status: InsightStatus,
        content: Option<String>,
    ) -> Result<(), HandlerError> {
        if self.store.finish_insight(insight_id, status, content).await? {
            match status {
                InsightStatus::Failed => self.metrics.increment_insights_failed(),
                _ => self.metrics.increment_insights_completed(),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GenerationError;
    use crate::models::{CampaignStatus, InsightReport, Recipient};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    const COHORTS: Cohorts = Cohorts { high_value_spend: 1000.0, recent_activity_days: 30 };

    struct Scripted {
        reply: Result<String, u16>,
        prompts: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn ok(text: &str) -> Arc<Self> {
            Arc::new(Self { reply: Ok(text.to_string()), prompts: Mutex::new(Vec::new()) })
        }

        fn failing(status: u16) -> Arc<Self> {
            Arc::new(Self { reply: Err(status), prompts: Mutex::new(Vec::new()) })
        }
    }

    #[async_trait]
    impl TextGenerator for Scripted {
        async fn generate(&self, _system: &str, prompt: &str) -> Result<String, GenerationError> {
            self.prompts.lock().push(prompt.to_string());
            match &self.reply {
                Ok(text) => Ok(text.clone()),
                Err(status) => Err(GenerationError::Status { status: *status, body: String::new() }),
            }
        }
    }

    fn record(campaign: &str, customer: &str, status: DeliveryStatus) -> DeliveryRecord {
        let recipient = Recipient {
            id: customer.to_string(),
            name: customer.to_string(),
            email: format!("{customer}@example.com"),
            attributes: Default::default(),
        };
        let mut record = DeliveryRecord::pending(campaign, &recipient, "Hi".into());
        record.status = status;
        record
    }

    fn completed(id: &str, segment: &str, sent: u64, failed: u64) -> Campaign {
        let mut campaign = Campaign::new(id, format!("Campaign {id}"), "Hi", segment, "o1");
        campaign.audience_size = sent + failed;
        campaign.sent = sent;
        campaign.failed = failed;
        campaign.status = CampaignStatus::Completed;
        campaign
    }

    fn customers() -> HashMap<String, Customer> {
        let mut rich = Customer::new("rich", "Rich", "rich@example.com", "o1");
        rich.totalspend = Some(5000.0);
        rich.days_inactive = Some(90);
        let mut fresh = Customer::new("fresh", "Fresh", "fresh@example.com", "o1");
        fresh.totalspend = Some(1000.0);
        fresh.days_inactive = Some(2);
        [rich, fresh].into_iter().map(|c| (c.id.clone(), c)).collect()
    }

    #[test]
    fn test_summary_totals_cohorts_and_segments() {
        let campaigns = vec![
            (
                completed("c2", "s1", 1, 1),
                vec![record("c2", "rich", DeliveryStatus::Sent), record("c2", "fresh", DeliveryStatus::Failed)],
            ),
            (completed("c1", "s1", 3, 1), Vec::new()),
            (completed("c3", "s2", 2, 0), Vec::new()),
        ];

        let summary = summarize(&campaigns, &customers(), COHORTS);
        assert_eq!(summary.total_campaigns, 3);
        assert_eq!(summary.total_recipients, 8);
        assert_eq!(summary.total_delivered, 6);
        assert!((summary.average_delivery_rate - (50.0 + 75.0 + 100.0) / 3.0).abs() < 1e-9);
        assert_eq!(summary.best_campaign.as_ref().unwrap().id, "c3");

        let c2 = &summary.campaigns[0];
        assert_eq!(c2.id, "c2");
        assert_eq!((c2.high_value.recipients, c2.high_value.delivery_rate), (1, 100.0));
        assert_eq!((c2.recently_active.recipients, c2.recently_active.delivery_rate), (1, 0.0));
        assert_eq!(summary.campaigns[1].high_value.delivery_rate, 0.0);

        assert_eq!(summary.segments.len(), 2);
        assert_eq!(summary.segments[0].segment_id, "s1");
        assert_eq!(summary.segments[0].campaigns, 2);
        assert_eq!(summary.segments[0].delivery_rate, 4.0 / 6.0 * 100.0);
    }

    async fn store_with_report() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.insert_insight(InsightReport::pending("i1", "o1")).await.unwrap();
        store
    }

    fn request() -> InsightRequested {
        InsightRequested { organization_id: "o1".into(), insight_id: "i1".into() }
    }

    #[tokio::test]
    async fn test_no_completed_campaigns_closes_report_without_generation() {
        let store = store_with_report().await;
        let generator = Scripted::ok("unused");
        let insights =
            InsightGenerator::new(store.clone(), generator.clone(), Arc::new(MetricsCollector::new()), COHORTS);

        assert_eq!(insights.generate(&request()).await.unwrap(), InsightStatus::Completed);
        let report = store.insight("i1").await.unwrap().unwrap();
        assert_eq!(report.status, InsightStatus::Completed);
        assert_eq!(report.content.as_deref(), Some(NO_CAMPAIGNS_MESSAGE));
        assert!(generator.prompts.lock().is_empty());
    }

    #[tokio::test]
    async fn test_generated_text_completes_report() {
        let store = store_with_report().await;
        store.insert_campaign(completed("c1", "s1", 9, 1)).await.unwrap();
        let generator = Scripted::ok("Delivery is healthy.");
        let insights =
            InsightGenerator::new(store.clone(), generator.clone(), Arc::new(MetricsCollector::new()), COHORTS);

        assert_eq!(insights.generate(&request()).await.unwrap(), InsightStatus::Completed);
        let report = store.insight("i1").await.unwrap().unwrap();
        assert_eq!(report.content.as_deref(), Some("Delivery is healthy."));

        let prompts = generator.prompts.lock();
        let prompt: serde_json::Value = serde_json::from_str(&prompts[0]).unwrap();
        assert_eq!(prompt["totalCampaigns"], 1);
        assert_eq!(prompt["bestCampaign"]["id"], "c1");
    }

    #[tokio::test]
    async fn test_generation_failure_marks_report_failed() {
        let store = store_with_report().await;
        store.insert_campaign(completed("c1", "s1", 9, 1)).await.unwrap();
        let metrics = Arc::new(MetricsCollector::new());
        let insights =
            InsightGenerator::new(store.clone(), Scripted::failing(500), metrics.clone(), COHORTS);

        let err = insights.generate(&request()).await.unwrap_err();
        assert!(matches!(err, HandlerError::External(_)));
        assert!(!err.is_retryable());
        assert_eq!(store.insight("i1").await.unwrap().unwrap().status, InsightStatus::Failed);
        assert_eq!(metrics.snapshot().insights_failed, 1);

        // replay leaves the terminal report alone
        assert_eq!(insights.generate(&request()).await.unwrap(), InsightStatus::Failed);
    }

    #[tokio::test]
    async fn test_missing_report_is_a_data_error() {
        let store = Arc::new(MemoryStore::new());
        let insights =
            InsightGenerator::new(store, Scripted::ok("x"), Arc::new(MetricsCollector::new()), COHORTS);
        let err = insights.generate(&request()).await.unwrap_err();
        assert!(matches!(err, HandlerError::Data(_)));
    }
}
