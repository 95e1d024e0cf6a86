// =============================================================================
// notifier.rs — "CAMPAIGN SENT" ACTIVITY
// =============================================================================
//
// Runs once per campaign, for the caller that won the completion
// compare-and-set. Publishes a `campaign_sent` activity and, if the
// activity stream cannot take it, writes the record straight into the
// store. A failure here never undoes the completion.
//
// The activity id is derived from the campaign, so the direct write and a
// later replay of the published event land on the same record.
// =============================================================================

use std::sync::Arc;
use tracing::{error, info, warn};

use crate::broker::ActivityPublisher;
use crate::metrics::MetricsCollector;
use crate::models::{Actor, ActivityEvent, ActivityRecord, TargetModel};
use crate::store::CampaignStore;

pub const CAMPAIGN_SENT: &str = "campaign_sent";

/// Everything the activity needs about the finished campaign.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub campaign_id: String,
    pub name: String,
    pub organization_id: String,
    pub user_id: String,
    pub sent: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    Published,
    /// Publish failed, the record was written directly.
    Fallback,
    Failed,
}

pub struct CompletionNotifier {
    store: Arc<dyn CampaignStore>,
    publisher: Arc<dyn ActivityPublisher>,
    metrics: Arc<MetricsCollector>,
}

impl CompletionNotifier {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        publisher: Arc<dyn ActivityPublisher>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            store,
            publisher,
            metrics,
        }
    }

    pub fn activity_id(campaign_id: &str) -> String {
        format!("{CAMPAIGN_SENT}:{campaign_id}")
    }

    async fn actor(&self, user_id: &str) -> Actor {
        match self.store.user(user_id).await {
            Ok(Some(user)) => Actor::from(&user),
            Ok(None) => {
                warn!(user_id, "Acting user not found, activity attributed to nobody");
                Actor { email: String::new(), fullname: String::new() }
            }
            Err(e) => {
                warn!(user_id, error = %e, "Could not load acting user");
                Actor { email: String::new(), fullname: String::new() }
            }
        }
    }

    pub async fn build_event(&self, completion: &Completion) -> ActivityEvent {
        ActivityEvent {
            event_id: Some(Self::activity_id(&completion.campaign_id)),
            title: "Campaign Sent".to_string(),
            description: format!(
                "Sent campaign {} to {} recipients",
                completion.name, completion.sent
            ),
            activity_type: CAMPAIGN_SENT.to_string(),
            created_by: self.actor(&completion.user_id).await,
            user_id: completion.user_id.clone(),
            organization_id: completion.organization_id.clone(),
            target_action_id: completion.campaign_id.clone(),
            target_model: TargetModel::Campaign,
        }
    }

    pub async fn notify(&self, completion: &Completion) -> NotifyOutcome {
        let event = self.build_event(completion).await;

        match self.publisher.publish_activity(&event).await {
            Ok(()) => {
                self.metrics.increment_activities_published();
                info!(
                    campaign_id = %completion.campaign_id,
                    sent = completion.sent,
                    failed = completion.failed,
                    "Campaign completed, activity published"
                );
                return NotifyOutcome::Published;
            }
            Err(e) => {
                warn!(
                    campaign_id = %completion.campaign_id,
                    error = %e,
                    "Activity publish failed, writing activity directly"
                );
            }
        }

        match self.store.insert_activity(ActivityRecord::from(event)).await {
            Ok(_) => {
                self.metrics.increment_activities_fallback();
                NotifyOutcome::Fallback
            }
            Err(e) => {
                error!(
                    campaign_id = %completion.campaign_id,
                    error = %e,
                    "Activity lost, publish and direct write both failed"
                );
                NotifyOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BrokerError;
    use crate::models::User;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recording {
        fail: bool,
        events: Mutex<Vec<ActivityEvent>>,
    }

    #[async_trait]
    impl ActivityPublisher for Recording {
        async fn publish_activity(&self, event: &ActivityEvent) -> Result<(), BrokerError> {
            if self.fail {
                return Err(BrokerError::NotConnected);
            }
            self.events.lock().push(event.clone());
            Ok(())
        }
    }

    fn completion() -> Completion {
        Completion {
            campaign_id: "c1".into(),
            name: "Spring".into(),
            organization_id: "o1".into(),
            user_id: "u1".into(),
            sent: 212,
            failed: 38,
        }
    }

    async fn store_with_user() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_user(User { id: "u1".into(), email: "al@example.com".into(), fullname: "Al".into() })
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_publishes_campaign_sent_activity() {
        let store = store_with_user().await;
        let publisher = Arc::new(Recording::default());
        let notifier =
            CompletionNotifier::new(store.clone(), publisher.clone(), Arc::new(MetricsCollector::new()));

        assert_eq!(notifier.notify(&completion()).await, NotifyOutcome::Published);
        let events = publisher.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].activity_type, "campaign_sent");
        assert_eq!(events[0].description, "Sent campaign Spring to 212 recipients");
        assert_eq!(events[0].created_by.fullname, "Al");
        assert_eq!(events[0].event_id.as_deref(), Some("campaign_sent:c1"));
        assert!(store.activities("o1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_falls_back_to_direct_write() {
        let store = store_with_user().await;
        let publisher = Arc::new(Recording { fail: true, ..Default::default() });
        let metrics = Arc::new(MetricsCollector::new());
        let notifier = CompletionNotifier::new(store.clone(), publisher, metrics.clone());

        assert_eq!(notifier.notify(&completion()).await, NotifyOutcome::Fallback);
        assert_eq!(notifier.notify(&completion()).await, NotifyOutcome::Fallback);

        let activities = store.activities("o1").await.unwrap();
        assert_eq!(activities.len(), 1);
        assert_eq!(activities[0].id, "campaign_sent:c1");
        assert_eq!(metrics.snapshot().activities_fallback, 2);
    }
}
