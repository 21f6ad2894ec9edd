use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use alert_notifier::{
    clients::traits::{
        AncestorGraph, Database, EventLink, FanProgress, SaturationService, SilencedPatternSnapshot,
        Silencer,
    },
    config::SenderFanoutConfig,
    models::{
        check::CheckData,
        contact::{ContactData, DutyData},
        escalation::EscalationEvent,
        event::NotificationEvent,
        notification::ScheduledNotification,
        package::AncestorTarget,
        status::{NotifierState, State},
        subscription::{ScheduleData, SubscriptionData},
        trigger::TriggerData,
    },
    senders::{Sender, SenderError},
    services::{
        resolver::MacroResolver, scheduler::Scheduler, sender::SenderFanout,
        silencer::SilentPatterns,
    },
};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

/// Monday 2024-01-01 12:00:00 UTC.
pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
}

/// Polls `condition` for up to two seconds.
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

#[derive(Default)]
pub struct MemoryState {
    pub events: HashMap<bool, VecDeque<NotificationEvent>>,
    pub delayed: Vec<(i64, bool, NotificationEvent)>,
    pub notifications: Vec<ScheduledNotification>,
    pub throttling: HashMap<String, (i64, i64)>,
    pub event_counts: HashMap<String, i64>,
    pub triggers: HashMap<String, TriggerData>,
    pub subscriptions: HashMap<String, SubscriptionData>,
    pub contacts: HashMap<String, ContactData>,
    pub last_checks: HashMap<String, CheckData>,
    pub links: HashSet<(EventLink, EventLink)>,
    pub escalations: Vec<EscalationEvent>,
    pub pending_escalations: HashSet<(String, String)>,
    pub processed_escalations: HashMap<(String, String), HashSet<String>>,
    pub notifier_state: Option<NotifierState>,
    pub metrics_count: i64,
    pub checks_count: i64,
    pub counters_fail: bool,
    pub locks: HashSet<String>,
    pub silent: SilencedPatternSnapshot,
    pub duties: HashMap<String, DutyData>,
    pub groups: HashMap<String, Vec<String>>,
}

/// Store fake keeping everything in process memory.
#[derive(Default)]
pub struct MemoryDatabase {
    state: Mutex<MemoryState>,
}

impl MemoryDatabase {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap()
    }

    pub fn add_trigger(&self, trigger: TriggerData) {
        self.state().triggers.insert(trigger.id.clone(), trigger);
    }

    pub fn add_subscription(&self, subscription: SubscriptionData) {
        self.state()
            .subscriptions
            .insert(subscription.id.clone(), subscription);
    }

    pub fn add_contact(&self, contact: ContactData) {
        self.state().contacts.insert(contact.id.clone(), contact);
    }

    pub fn notifications(&self) -> Vec<ScheduledNotification> {
        self.state().notifications.clone()
    }

    pub fn delayed(&self) -> Vec<(i64, bool, NotificationEvent)> {
        self.state().delayed.clone()
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn ping(&self) -> Result<()> {
        if self.state().counters_fail {
            return Err(anyhow!("store unreachable"));
        }
        Ok(())
    }

    async fn fetch_notification_event(
        &self,
        with_saturations: bool,
        timeout: Duration,
    ) -> Result<Option<NotificationEvent>> {
        let popped = self
            .state()
            .events
            .get_mut(&with_saturations)
            .and_then(|queue| queue.pop_front());

        // Blocking pops wait out the timeout when the stream is empty.
        if popped.is_none() {
            tokio::time::sleep(timeout).await;
        }
        Ok(popped)
    }

    async fn push_notification_event(
        &self,
        event: &NotificationEvent,
        with_saturations: bool,
    ) -> Result<()> {
        self.state()
            .events
            .entry(with_saturations)
            .or_default()
            .push_back(event.clone());
        Ok(())
    }

    async fn push_delayed_notification_event(
        &self,
        event: &NotificationEvent,
        with_saturations: bool,
        until: i64,
    ) -> Result<()> {
        self.state()
            .delayed
            .push((until, with_saturations, event.clone()));
        Ok(())
    }

    async fn fetch_delayed_notification_events(
        &self,
        to: i64,
        with_saturations: bool,
    ) -> Result<Vec<NotificationEvent>> {
        let mut state = self.state();
        let (due, rest): (Vec<_>, Vec<_>) = state
            .delayed
            .drain(..)
            .partition(|(until, saturations, _)| *until <= to && *saturations == with_saturations);
        state.delayed = rest;
        Ok(due.into_iter().map(|(_, _, event)| event).collect())
    }

    async fn add_notifications(&self, notifications: &[ScheduledNotification]) -> Result<()> {
        self.state().notifications.extend_from_slice(notifications);
        Ok(())
    }

    async fn fetch_notifications(&self, to: i64) -> Result<Vec<ScheduledNotification>> {
        let mut state = self.state();
        let (due, rest): (Vec<_>, Vec<_>) = state
            .notifications
            .drain(..)
            .partition(|notification| notification.timestamp <= to);
        state.notifications = rest;
        Ok(due)
    }

    async fn get_trigger_throttling(&self, trigger_id: &str) -> Result<(i64, i64)> {
        Ok(self
            .state()
            .throttling
            .get(trigger_id)
            .copied()
            .unwrap_or_default())
    }

    async fn set_trigger_throttling(&self, trigger_id: &str, next: i64) -> Result<()> {
        self.state()
            .throttling
            .entry(trigger_id.to_string())
            .or_default()
            .0 = next;
        Ok(())
    }

    async fn get_notification_event_count(&self, trigger_id: &str, _from: i64) -> Result<i64> {
        Ok(self
            .state()
            .event_counts
            .get(trigger_id)
            .copied()
            .unwrap_or_default())
    }

    async fn get_trigger(&self, trigger_id: &str) -> Result<Option<TriggerData>> {
        Ok(self.state().triggers.get(trigger_id).cloned())
    }

    async fn get_subscription(&self, subscription_id: &str) -> Result<Option<SubscriptionData>> {
        Ok(self.state().subscriptions.get(subscription_id).cloned())
    }

    async fn get_tag_subscriptions(&self, tags: &[String]) -> Result<Vec<SubscriptionData>> {
        let mut subscriptions: Vec<SubscriptionData> = self
            .state()
            .subscriptions
            .values()
            .filter(|subscription| subscription.tags.iter().any(|tag| tags.contains(tag)))
            .cloned()
            .collect();
        subscriptions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(subscriptions)
    }

    async fn get_contact(&self, contact_id: &str) -> Result<Option<ContactData>> {
        Ok(self.state().contacts.get(contact_id).cloned())
    }

    async fn get_contacts(&self, contact_ids: &[String]) -> Result<Vec<ContactData>> {
        let state = self.state();
        Ok(contact_ids
            .iter()
            .filter_map(|id| state.contacts.get(id).cloned())
            .collect())
    }

    async fn get_trigger_last_check(&self, trigger_id: &str) -> Result<Option<CheckData>> {
        Ok(self.state().last_checks.get(trigger_id).cloned())
    }

    async fn get_triggers_last_check(
        &self,
        trigger_ids: &[String],
    ) -> Result<Vec<Option<CheckData>>> {
        let state = self.state();
        Ok(trigger_ids
            .iter()
            .map(|id| state.last_checks.get(id).cloned())
            .collect())
    }

    async fn add_child_event(&self, ancestor: &EventLink, child: &EventLink) -> Result<()> {
        self.state().links.insert((ancestor.clone(), child.clone()));
        Ok(())
    }

    async fn get_parent_events(&self, child: &EventLink) -> Result<Vec<EventLink>> {
        let mut parents: Vec<EventLink> = self
            .state()
            .links
            .iter()
            .filter(|(_, linked)| linked == child)
            .map(|(parent, _)| parent.clone())
            .collect();
        parents.sort_by(|a, b| a.trigger_id.cmp(&b.trigger_id));
        Ok(parents)
    }

    async fn delete_child_event(&self, ancestor: &EventLink, child: &EventLink) -> Result<()> {
        self.state()
            .links
            .remove(&(ancestor.clone(), child.clone()));
        Ok(())
    }

    async fn add_escalations(&self, escalations: &[EscalationEvent]) -> Result<()> {
        let mut state = self.state();
        for escalation in escalations {
            if !escalation.is_resolution {
                state.pending_escalations.insert((
                    escalation.event.trigger_id.clone(),
                    escalation.event.metric.clone(),
                ));
            }
            state.escalations.push(escalation.clone());
        }
        Ok(())
    }

    async fn fetch_escalations(&self, to: i64) -> Result<Vec<EscalationEvent>> {
        let mut state = self.state();
        let (due, rest): (Vec<_>, Vec<_>) = state
            .escalations
            .drain(..)
            .partition(|escalation| escalation.timestamp <= to);
        state.escalations = rest;
        Ok(due)
    }

    async fn has_pending_escalations(&self, trigger_id: &str, metric: &str) -> Result<bool> {
        Ok(self
            .state()
            .pending_escalations
            .contains(&(trigger_id.to_string(), metric.to_string())))
    }

    async fn register_processed_escalation(
        &self,
        trigger_id: &str,
        metric: &str,
        escalation_id: &str,
    ) -> Result<()> {
        self.state()
            .processed_escalations
            .entry((trigger_id.to_string(), metric.to_string()))
            .or_default()
            .insert(escalation_id.to_string());
        Ok(())
    }

    async fn is_escalation_processed(
        &self,
        trigger_id: &str,
        metric: &str,
        escalation_id: &str,
    ) -> Result<bool> {
        Ok(self
            .state()
            .processed_escalations
            .get(&(trigger_id.to_string(), metric.to_string()))
            .is_some_and(|processed| processed.contains(escalation_id)))
    }

    async fn ack_escalations(&self, trigger_id: &str, metric: &str, resolved: bool) -> Result<()> {
        let key = (trigger_id.to_string(), metric.to_string());
        let mut state = self.state();
        state.pending_escalations.remove(&key);
        if resolved {
            state.processed_escalations.remove(&key);
        }
        Ok(())
    }

    async fn get_notifier_state(&self) -> Result<NotifierState> {
        Ok(self.state().notifier_state.unwrap_or(NotifierState::Ok))
    }

    async fn set_notifier_state(&self, state: NotifierState) -> Result<()> {
        self.state().notifier_state = Some(state);
        Ok(())
    }

    async fn get_metrics_updates_count(&self) -> Result<i64> {
        let state = self.state();
        if state.counters_fail {
            return Err(anyhow!("store unreachable"));
        }
        Ok(state.metrics_count)
    }

    async fn get_checks_updates_count(&self) -> Result<i64> {
        let state = self.state();
        if state.counters_fail {
            return Err(anyhow!("store unreachable"));
        }
        Ok(state.checks_count)
    }

    async fn acquire_lock(&self, name: &str, _ttl: Duration) -> Result<bool> {
        Ok(self.state().locks.insert(name.to_string()))
    }

    async fn get_silent_patterns(&self) -> Result<SilencedPatternSnapshot> {
        Ok(self.state().silent.clone())
    }

    async fn get_duty(&self, schedule: &str) -> Result<Option<DutyData>> {
        Ok(self.state().duties.get(schedule).cloned())
    }

    async fn get_group_members(&self, group: &str) -> Result<Vec<String>> {
        Ok(self.state().groups.get(group).cloned().unwrap_or_default())
    }
}

/// Graph fake built from a child -> parents map.
#[derive(Default)]
pub struct FakeGraph {
    pub parents: HashMap<String, Vec<String>>,
    pub fail: bool,
}

impl FakeGraph {
    pub fn with_edges(edges: &[(&str, &[&str])]) -> Self {
        Self {
            parents: edges
                .iter()
                .map(|(id, parents)| (id.to_string(), parents.iter().map(|p| p.to_string()).collect()))
                .collect(),
            fail: false,
        }
    }

    fn depth(&self, trigger_id: &str) -> usize {
        self.parents
            .get(trigger_id)
            .map(|parents| parents.iter().map(|p| self.depth(p) + 1).max().unwrap_or(0))
            .unwrap_or(0)
    }

    fn chains(&self, trigger_id: &str) -> Vec<Vec<String>> {
        let parents = self.parents.get(trigger_id).cloned().unwrap_or_default();
        let mut chains = Vec::new();
        for parent in parents {
            let upper = self.chains(&parent);
            if upper.is_empty() {
                chains.push(vec![parent.clone()]);
            }
            for mut chain in upper {
                chain.push(parent.clone());
                chains.push(chain);
            }
        }
        chains
    }
}

#[async_trait]
impl AncestorGraph for FakeGraph {
    async fn max_depth(&self, trigger_id: &str) -> Result<usize> {
        if self.fail {
            return Err(anyhow!("graph unavailable"));
        }
        Ok(self.depth(trigger_id))
    }

    async fn ancestor_chains(&self, trigger_id: &str) -> Result<Vec<Vec<String>>> {
        if self.fail {
            return Err(anyhow!("graph unavailable"));
        }
        Ok(self.chains(trigger_id))
    }

    async fn children(&self, trigger_id: &str) -> Result<Vec<String>> {
        Ok(self
            .parents
            .iter()
            .filter(|(_, parents)| parents.iter().any(|p| p == trigger_id))
            .map(|(child, _)| child.clone())
            .collect())
    }

    async fn set_parents(&self, _trigger_id: &str, _parents: &[String]) -> Result<()> {
        Ok(())
    }
}

/// Saturation fake answering with a fixed task id and progress.
#[derive(Default)]
pub struct FakeSaturation {
    pub progress: Mutex<FanProgress>,
    pub requests: Mutex<Vec<String>>,
    pub fail_requests: bool,
}

#[async_trait]
impl SaturationService for FakeSaturation {
    async fn send_request(
        &self,
        _event: &NotificationEvent,
        trigger: &TriggerData,
    ) -> Result<String> {
        if self.fail_requests {
            return Err(anyhow!("fan unavailable"));
        }
        self.requests.lock().unwrap().push(trigger.id.clone());
        Ok("task-1".to_string())
    }

    async fn check_progress(&self, _task_id: &str) -> Result<FanProgress> {
        Ok(self.progress.lock().unwrap().clone())
    }
}

/// Silencer fake that never silences.
pub struct NoSilence;

impl Silencer for NoSilence {
    fn is_metric_silenced(&self, _metric: &str, _timestamp: i64) -> bool {
        false
    }

    fn is_tags_silenced(&self, _tags: &[String], _timestamp: i64) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub struct SentPackage {
    pub contact_value: String,
    pub events: Vec<NotificationEvent>,
    pub ancestor: Option<AncestorTarget>,
    pub need_ack: bool,
}

/// Channel fake recording every call and failing on demand.
#[derive(Default)]
pub struct RecordingSender {
    pub inheritance: bool,
    pub failure: Option<SenderError>,
    pub sent: Mutex<Vec<SentPackage>>,
}

impl RecordingSender {
    pub fn new(inheritance: bool) -> Arc<Self> {
        Arc::new(Self {
            inheritance,
            ..Default::default()
        })
    }

    pub fn failing(error: SenderError) -> Arc<Self> {
        Arc::new(Self {
            failure: Some(error),
            ..Default::default()
        })
    }

    pub fn sent(&self) -> Vec<SentPackage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sender for RecordingSender {
    async fn send_events(
        &self,
        events: &[NotificationEvent],
        contact: &ContactData,
        _trigger: &TriggerData,
        _throttled: bool,
        need_ack: bool,
    ) -> Result<(), SenderError> {
        self.sent.lock().unwrap().push(SentPackage {
            contact_value: contact.value.clone(),
            events: events.to_vec(),
            ancestor: None,
            need_ack,
        });
        match &self.failure {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn supports_inheritance(&self) -> bool {
        self.inheritance
    }

    async fn send_events_with_inheritance(
        &self,
        events: &[NotificationEvent],
        contact: &ContactData,
        _trigger: &TriggerData,
        ancestor: &AncestorTarget,
    ) -> Result<(), SenderError> {
        self.sent.lock().unwrap().push(SentPackage {
            contact_value: contact.value.clone(),
            events: events.to_vec(),
            ancestor: Some(ancestor.clone()),
            need_ack: false,
        });
        match &self.failure {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

pub fn fanout_config() -> SenderFanoutConfig {
    SenderFanoutConfig {
        sending_timeout: Duration::from_secs(1),
        resending_timeout: Duration::from_secs(24 * 60 * 60),
        queue_capacity: 16,
    }
}

pub fn build_fanout(database: &Arc<MemoryDatabase>, config: SenderFanoutConfig) -> Arc<SenderFanout> {
    let database: Arc<dyn Database> = database.clone();
    Arc::new(SenderFanout::new(
        Arc::clone(&database),
        Arc::new(Scheduler::new(Arc::clone(&database))),
        Arc::new(MacroResolver::new(Arc::clone(&database))),
        Arc::new(NoSilence),
        config,
    ))
}

pub fn build_silencer(database: &Arc<MemoryDatabase>) -> SilentPatterns {
    SilentPatterns::new(database.clone())
}

pub fn trigger(id: &str, tags: &[&str]) -> TriggerData {
    TriggerData {
        id: id.to_string(),
        name: format!("Trigger {}", id),
        tags: tags.iter().map(|t| t.to_string()).collect(),
        ..Default::default()
    }
}

pub fn contact(id: &str, kind: &str, value: &str) -> ContactData {
    ContactData {
        id: id.to_string(),
        kind: kind.to_string(),
        value: value.to_string(),
        ..Default::default()
    }
}

pub fn subscription(id: &str, tags: &[&str], contacts: &[&str]) -> SubscriptionData {
    SubscriptionData {
        id: id.to_string(),
        enabled: true,
        tags: tags.iter().map(|t| t.to_string()).collect(),
        contacts: contacts.iter().map(|c| c.to_string()).collect(),
        throttling_enabled: true,
        schedule: ScheduleData::all_week(),
        ..Default::default()
    }
}

pub fn event(trigger_id: &str, metric: &str, state: State, old_state: State, timestamp: i64) -> NotificationEvent {
    NotificationEvent {
        trigger_id: trigger_id.to_string(),
        metric: metric.to_string(),
        state,
        old_state,
        timestamp,
        ..Default::default()
    }
}

pub fn scheduled(event: NotificationEvent, trigger: TriggerData, contact: ContactData, timestamp: i64) -> ScheduledNotification {
    ScheduledNotification {
        event,
        trigger,
        contact,
        throttled: false,
        send_fail: 0,
        timestamp,
        need_ack: false,
    }
}
