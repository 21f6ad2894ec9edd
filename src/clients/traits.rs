//! Contracts of the collaborators the notifier core talks to.

use std::{collections::HashMap, time::Duration};

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{
    check::CheckData,
    contact::{ContactData, DutyData},
    escalation::EscalationEvent,
    event::NotificationEvent,
    notification::ScheduledNotification,
    status::NotifierState,
    subscription::SubscriptionData,
    trigger::TriggerData,
};

/// Link between an ancestor alert and a descendant metric it covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventLink {
    pub trigger_id: String,
    pub metric: String,
}

impl EventLink {
    pub fn new(trigger_id: &str, metric: &str) -> Self {
        Self {
            trigger_id: trigger_id.to_string(),
            metric: metric.to_string(),
        }
    }
}

/// Silenced metrics and tags mapped to the unix time they are silenced until.
#[derive(Debug, Clone, Default)]
pub struct SilencedPatternSnapshot {
    pub metrics: HashMap<String, i64>,
    pub tags: HashMap<String, i64>,
}

/// The persistent store shared by every worker.
#[async_trait]
pub trait Database: Send + Sync {
    async fn ping(&self) -> Result<()>;

    async fn fetch_notification_event(
        &self,
        with_saturations: bool,
        timeout: Duration,
    ) -> Result<Option<NotificationEvent>>;
    async fn push_notification_event(
        &self,
        event: &NotificationEvent,
        with_saturations: bool,
    ) -> Result<()>;
    async fn push_delayed_notification_event(
        &self,
        event: &NotificationEvent,
        with_saturations: bool,
        until: i64,
    ) -> Result<()>;
    /// Removes and returns every delayed event due at or before `to`.
    async fn fetch_delayed_notification_events(
        &self,
        to: i64,
        with_saturations: bool,
    ) -> Result<Vec<NotificationEvent>>;

    async fn add_notifications(&self, notifications: &[ScheduledNotification]) -> Result<()>;
    /// Removes and returns every scheduled notification due at or before `to`.
    async fn fetch_notifications(&self, to: i64) -> Result<Vec<ScheduledNotification>>;

    /// Returns `(throttled_until, window_beginning)` as unix seconds.
    async fn get_trigger_throttling(&self, trigger_id: &str) -> Result<(i64, i64)>;
    async fn set_trigger_throttling(&self, trigger_id: &str, next: i64) -> Result<()>;
    async fn get_notification_event_count(&self, trigger_id: &str, from: i64) -> Result<i64>;

    async fn get_trigger(&self, trigger_id: &str) -> Result<Option<TriggerData>>;
    async fn get_subscription(&self, subscription_id: &str) -> Result<Option<SubscriptionData>>;
    async fn get_tag_subscriptions(&self, tags: &[String]) -> Result<Vec<SubscriptionData>>;
    async fn get_contact(&self, contact_id: &str) -> Result<Option<ContactData>>;
    /// Missing contacts are skipped.
    async fn get_contacts(&self, contact_ids: &[String]) -> Result<Vec<ContactData>>;
    async fn get_trigger_last_check(&self, trigger_id: &str) -> Result<Option<CheckData>>;
    async fn get_triggers_last_check(&self, trigger_ids: &[String])
    -> Result<Vec<Option<CheckData>>>;

    /// Records the link in both directions.
    async fn add_child_event(&self, ancestor: &EventLink, child: &EventLink) -> Result<()>;
    async fn get_parent_events(&self, child: &EventLink) -> Result<Vec<EventLink>>;
    async fn delete_child_event(&self, ancestor: &EventLink, child: &EventLink) -> Result<()>;

    /// Stores escalation events and flags their metrics as pending.
    async fn add_escalations(&self, escalations: &[EscalationEvent]) -> Result<()>;
    async fn fetch_escalations(&self, to: i64) -> Result<Vec<EscalationEvent>>;
    async fn has_pending_escalations(&self, trigger_id: &str, metric: &str) -> Result<bool>;
    async fn register_processed_escalation(
        &self,
        trigger_id: &str,
        metric: &str,
        escalation_id: &str,
    ) -> Result<()>;
    async fn is_escalation_processed(
        &self,
        trigger_id: &str,
        metric: &str,
        escalation_id: &str,
    ) -> Result<bool>;
    /// Clears the pending flag; `resolved` also forgets processed steps.
    async fn ack_escalations(&self, trigger_id: &str, metric: &str, resolved: bool) -> Result<()>;

    async fn get_notifier_state(&self) -> Result<NotifierState>;
    async fn set_notifier_state(&self, state: NotifierState) -> Result<()>;

    async fn get_metrics_updates_count(&self) -> Result<i64>;
    async fn get_checks_updates_count(&self) -> Result<i64>;

    /// Takes `name` for `ttl` unless another holder has it.
    async fn acquire_lock(&self, name: &str, ttl: Duration) -> Result<bool>;

    async fn get_silent_patterns(&self) -> Result<SilencedPatternSnapshot>;

    async fn get_duty(&self, schedule: &str) -> Result<Option<DutyData>>;
    async fn get_group_members(&self, group: &str) -> Result<Vec<String>>;
}

/// Parent/child trigger relationships.
#[async_trait]
pub trait AncestorGraph: Send + Sync {
    /// Longest path length from any root to the trigger, 0 for roots.
    async fn max_depth(&self, trigger_id: &str) -> Result<usize>;
    /// Every root-to-trigger chain, root first, excluding the trigger itself.
    async fn ancestor_chains(&self, trigger_id: &str) -> Result<Vec<Vec<String>>>;
    async fn children(&self, trigger_id: &str) -> Result<Vec<String>>;
    async fn set_parents(&self, trigger_id: &str, parents: &[String]) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct FanProgress {
    pub done: bool,
    pub event: Option<NotificationEvent>,
    pub trigger: Option<TriggerData>,
}

/// External enrichment ("fan") service.
#[async_trait]
pub trait SaturationService: Send + Sync {
    async fn send_request(&self, event: &NotificationEvent, trigger: &TriggerData)
    -> Result<String>;
    async fn check_progress(&self, task_id: &str) -> Result<FanProgress>;
}

pub trait Silencer: Send + Sync {
    fn is_metric_silenced(&self, metric: &str, timestamp: i64) -> bool;
    fn is_tags_silenced(&self, tags: &[String], timestamp: i64) -> bool;
}
