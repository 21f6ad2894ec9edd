//! Turns raw state-change events into scheduled notifications.
//!
//! Each event goes through ancestor suppression, optional saturation and
//! subscription matching. Ancestor resolution may synthesize new events that
//! re-enter the pipeline, and saturation may park the event in the delayed
//! queue until the enrichment service answers.

use std::{
    collections::HashMap,
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use chrono::{DateTime, TimeDelta, Utc};
use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    clients::traits::{AncestorGraph, Database, EventLink, SaturationService},
    models::{
        check::CheckData,
        contact::ContactData,
        escalation::EscalationEvent,
        event::NotificationEvent,
        notification::ScheduledNotification,
        status::State,
        subscription::SubscriptionData,
        trigger::{SaturationType, TriggerData},
    },
    services::{scheduler::Scheduler, worker::run_every},
};

/// Seconds of delay per level of ancestor depth.
pub const ANCESTOR_DEPTH_DELAY: i64 = 60;
/// Max distance between an ancestor state change and the event it covers.
pub const ANCESTOR_STATE_WINDOW: i64 = 5 * 60;
pub const SATURATION_RETRY_DELAY: i64 = 10;
pub const SATURATION_TIMEOUT: i64 = 150;

enum Saturated {
    Pending,
    Done(NotificationEvent, TriggerData),
}

pub struct EventProcessor {
    database: Arc<dyn Database>,
    graph: Arc<dyn AncestorGraph>,
    saturation: Option<Arc<dyn SaturationService>>,
    scheduler: Arc<Scheduler>,
    with_saturations: bool,
}

impl EventProcessor {
    pub fn new(
        database: Arc<dyn Database>,
        graph: Arc<dyn AncestorGraph>,
        saturation: Option<Arc<dyn SaturationService>>,
        scheduler: Arc<Scheduler>,
        with_saturations: bool,
    ) -> Self {
        Self {
            database,
            graph,
            saturation,
            scheduler,
            with_saturations,
        }
    }

    pub fn with_saturations(&self) -> bool {
        self.with_saturations
    }

    pub async fn process_event(&self, event: NotificationEvent) -> Result<()> {
        self.process_event_at(event, Utc::now()).await
    }

    pub fn process_event_at(
        &self,
        event: NotificationEvent,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut event = event;

            debug!(
                trigger_id = %event.trigger_id,
                metric = %event.metric,
                state = %event.state,
                old_state = %event.old_state,
                "Processing notification event"
            );

            let Some(trigger) = self.load_trigger(&event).await? else {
                warn!(trigger_id = %event.trigger_id, "Trigger not found, skipping event");
                return Ok(());
            };

            if event.state != State::Test && !event.delayed_for_ancestor {
                if event.state == State::Ok && trigger.has_parents() {
                    event.delayed_for_ancestor = true;
                } else {
                    let delay = self.ancestor_delay(&event.trigger_id).await;
                    if delay > 0 {
                        event.delayed_for_ancestor = true;
                        let until = now.timestamp() + delay;

                        debug!(
                            trigger_id = %event.trigger_id,
                            metric = %event.metric,
                            until,
                            "Delaying event until ancestors are checked"
                        );

                        self.database
                            .push_delayed_notification_event(&event, self.with_saturations, until)
                            .await?;
                        return Ok(());
                    }
                }
            }

            if event.delayed_for_ancestor && event.ancestor_trigger_id.is_none() {
                let overrides = if event.state == State::Ok {
                    self.release_ancestor_links(&event).await
                } else {
                    self.find_ancestor_links(&event).await
                };

                if !overrides.is_empty() {
                    for overridden in overrides {
                        if let Err(e) = self.process_event_at(overridden, now).await {
                            error!(
                                trigger_id = %event.trigger_id,
                                metric = %event.metric,
                                error = %e,
                                "Failed to process event overridden by ancestor"
                            );
                        }
                    }
                    return Ok(());
                }
            }

            let mut trigger = trigger;
            if event.state == State::Ok {
                trigger
                    .saturation
                    .retain(|method| method.kind != SaturationType::TakeScreenshot);
            }

            let (event, trigger) = if trigger.saturation.is_empty() {
                (event, trigger)
            } else {
                match self.saturate(event, trigger, now).await {
                    Saturated::Pending => return Ok(()),
                    Saturated::Done(event, trigger) => (event, trigger),
                }
            };

            self.schedule_notifications(event, trigger, now).await
        })
    }

    async fn load_trigger(&self, event: &NotificationEvent) -> Result<Option<TriggerData>> {
        let trigger = self.database.get_trigger(&event.trigger_id).await?;

        if trigger.is_none() && event.state == State::Test {
            return Ok(Some(TriggerData {
                id: event.trigger_id.clone(),
                name: "Test notification".to_string(),
                ..Default::default()
            }));
        }

        Ok(trigger)
    }

    /// Inheritance is advisory, a graph failure only disables it for this event.
    async fn ancestor_delay(&self, trigger_id: &str) -> i64 {
        let depth = match self.graph.max_depth(trigger_id).await {
            Ok(depth) => depth as i64,
            Err(e) => {
                warn!(trigger_id, error = %e, "Failed to get ancestor depth, inheritance disabled");
                0
            }
        };

        if depth > 0 {
            depth * ANCESTOR_DEPTH_DELAY + ANCESTOR_DEPTH_DELAY
        } else {
            0
        }
    }

    /// Clears the links recorded for a recovered metric and re-emits the event
    /// once per ancestor that covered it.
    async fn release_ancestor_links(&self, event: &NotificationEvent) -> Vec<NotificationEvent> {
        let child = EventLink::new(&event.trigger_id, &event.metric);

        let parents = match self.database.get_parent_events(&child).await {
            Ok(parents) => parents,
            Err(e) => {
                warn!(
                    trigger_id = %event.trigger_id,
                    metric = %event.metric,
                    error = %e,
                    "Failed to read ancestor links, inheritance disabled"
                );
                return Vec::new();
            }
        };

        let mut overrides = Vec::with_capacity(parents.len());
        for parent in parents {
            if let Err(e) = self.database.delete_child_event(&parent, &child).await {
                warn!(
                    ancestor_trigger_id = %parent.trigger_id,
                    trigger_id = %event.trigger_id,
                    error = %e,
                    "Failed to delete ancestor link"
                );
            }
            overrides.push(event.overridden_by(&parent.trigger_id, &parent.metric));
        }

        overrides
    }

    /// Looks for ancestors that went to the same state around the same time.
    async fn find_ancestor_links(&self, event: &NotificationEvent) -> Vec<NotificationEvent> {
        let chains = match self.graph.ancestor_chains(&event.trigger_id).await {
            Ok(chains) => chains,
            Err(e) => {
                warn!(
                    trigger_id = %event.trigger_id,
                    error = %e,
                    "Failed to get ancestor chains, inheritance disabled"
                );
                return Vec::new();
            }
        };

        let mut ancestor_ids: Vec<String> = Vec::new();
        for ancestor_id in chains.iter().flatten() {
            if !ancestor_ids.contains(ancestor_id) {
                ancestor_ids.push(ancestor_id.clone());
            }
        }
        if ancestor_ids.is_empty() {
            return Vec::new();
        }

        let checks: HashMap<String, CheckData> =
            match self.database.get_triggers_last_check(&ancestor_ids).await {
                Ok(checks) => ancestor_ids
                    .iter()
                    .cloned()
                    .zip(checks)
                    .filter_map(|(id, check)| check.map(|check| (id, check)))
                    .collect(),
                Err(e) => {
                    warn!(
                        trigger_id = %event.trigger_id,
                        error = %e,
                        "Failed to get ancestor checks, inheritance disabled"
                    );
                    return Vec::new();
                }
            };

        let mut links: Vec<EventLink> = Vec::new();
        for chain in &chains {
            let found = chain.iter().find_map(|ancestor_id| {
                let check = checks.get(ancestor_id)?;
                matching_ancestor_metric(check, event)
                    .map(|metric| EventLink::new(ancestor_id, &metric))
            });

            if let Some(link) = found {
                if !links.contains(&link) {
                    links.push(link);
                }
            }
        }

        let child = EventLink::new(&event.trigger_id, &event.metric);
        let mut overrides = Vec::with_capacity(links.len());
        for link in links {
            if let Err(e) = self.database.add_child_event(&link, &child).await {
                warn!(
                    ancestor_trigger_id = %link.trigger_id,
                    trigger_id = %event.trigger_id,
                    error = %e,
                    "Failed to record ancestor link"
                );
            }

            info!(
                trigger_id = %event.trigger_id,
                metric = %event.metric,
                ancestor_trigger_id = %link.trigger_id,
                ancestor_metric = %link.metric,
                "Event is covered by ancestor"
            );
            overrides.push(event.overridden_by(&link.trigger_id, &link.metric));
        }

        overrides
    }

    async fn saturate(
        &self,
        mut event: NotificationEvent,
        mut trigger: TriggerData,
        now: DateTime<Utc>,
    ) -> Saturated {
        let service = match &self.saturation {
            Some(service) if self.with_saturations => Arc::clone(service),
            _ => {
                apply_saturation_fallbacks(&mut event, &mut trigger);
                return Saturated::Done(event, trigger);
            }
        };

        let now_ts = now.timestamp();

        let Some(task_id) = event.fan_task_id.clone() else {
            return match service.send_request(&event, &trigger).await {
                Ok(task_id) => {
                    event.fan_task_id = Some(task_id);
                    event.waiting_for_fan_since = now_ts;
                    self.retry_saturation(event, trigger, now).await
                }
                Err(e) => {
                    warn!(
                        trigger_id = %trigger.id,
                        error = %e,
                        "Failed to request saturation, using fallbacks"
                    );
                    apply_saturation_fallbacks(&mut event, &mut trigger);
                    Saturated::Done(event, trigger)
                }
            };
        };

        if now_ts - event.waiting_for_fan_since > SATURATION_TIMEOUT {
            warn!(
                trigger_id = %trigger.id,
                task_id = %task_id,
                waiting_since = event.waiting_for_fan_since,
                "Saturation timed out, using fallbacks"
            );
            apply_saturation_fallbacks(&mut event, &mut trigger);
            return Saturated::Done(event, trigger);
        }

        match service.check_progress(&task_id).await {
            Ok(progress) if progress.done => {
                debug!(trigger_id = %trigger.id, task_id = %task_id, "Saturation completed");
                Saturated::Done(
                    progress.event.unwrap_or(event),
                    progress.trigger.unwrap_or(trigger),
                )
            }
            Ok(_) => self.retry_saturation(event, trigger, now).await,
            Err(e) => {
                warn!(
                    trigger_id = %trigger.id,
                    task_id = %task_id,
                    error = %e,
                    "Failed to poll saturation progress"
                );
                self.retry_saturation(event, trigger, now).await
            }
        }
    }

    async fn retry_saturation(
        &self,
        mut event: NotificationEvent,
        mut trigger: TriggerData,
        now: DateTime<Utc>,
    ) -> Saturated {
        let until = now.timestamp() + SATURATION_RETRY_DELAY;

        match self
            .database
            .push_delayed_notification_event(&event, self.with_saturations, until)
            .await
        {
            Ok(()) => Saturated::Pending,
            Err(e) => {
                warn!(
                    trigger_id = %trigger.id,
                    error = %e,
                    "Failed to park event for saturation, using fallbacks"
                );
                apply_saturation_fallbacks(&mut event, &mut trigger);
                Saturated::Done(event, trigger)
            }
        }
    }

    async fn schedule_notifications(
        &self,
        event: NotificationEvent,
        trigger: TriggerData,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let subscriptions = if event.state == State::Test {
            self.test_subscriptions(&event).await?
        } else {
            self.matching_subscriptions(&event, &trigger).await?
        };

        if subscriptions.is_empty() {
            debug!(trigger_id = %trigger.id, metric = %event.metric, "No subscriptions matched");
            return Ok(());
        }

        let mut candidates = Vec::new();
        let mut escalations = Vec::new();

        for subscription in subscriptions {
            let mut event = event.clone();
            event.subscription_id = Some(subscription.id.clone());

            let (next, throttled) = self
                .scheduler
                .get_delivery_info(now, &event, Some(&subscription), false, 0)
                .await;

            let has_escalations = subscription.has_escalations() && event.state != State::Test;
            let mut need_ack = false;
            if has_escalations {
                escalations.extend(build_escalations(&event, &trigger, &subscription, now));
                need_ack = event.state.needs_ack();
            }

            let contacts = match self.subscription_contacts(&event, &subscription).await {
                Ok(contacts) => contacts,
                Err(e) => {
                    warn!(
                        subscription_id = %subscription.id,
                        error = %e,
                        "Failed to load subscription contacts"
                    );
                    continue;
                }
            };

            for contact in contacts {
                let notification = self.scheduler.build_notification(
                    event.clone(),
                    trigger.clone(),
                    contact,
                    next,
                    throttled,
                    0,
                    need_ack,
                );
                candidates.push((notification, has_escalations));
            }
        }

        if !escalations.is_empty() {
            if let Err(e) = self.database.add_escalations(&escalations).await {
                error!(trigger_id = %trigger.id, error = %e, "Failed to save escalations");
            }
        }

        let notifications = deduplicate_notifications(candidates);
        self.database.add_notifications(&notifications).await?;

        info!(
            trigger_id = %trigger.id,
            metric = %event.metric,
            state = %event.state,
            count = notifications.len(),
            "Notifications scheduled"
        );

        Ok(())
    }

    async fn matching_subscriptions(
        &self,
        event: &NotificationEvent,
        trigger: &TriggerData,
    ) -> Result<Vec<SubscriptionData>> {
        let mut tags = trigger.tags.clone();
        for tag in event.event_tags() {
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }

        let subscriptions = self.database.get_tag_subscriptions(&tags).await?;

        Ok(subscriptions
            .into_iter()
            .filter(|subscription| {
                subscription.enabled
                    && subscription.matches_tags(&tags)
                    && !subscription.must_ignore(event)
            })
            .collect())
    }

    async fn test_subscriptions(&self, event: &NotificationEvent) -> Result<Vec<SubscriptionData>> {
        if let Some(contact_id) = &event.contact_id {
            return Ok(vec![SubscriptionData {
                id: event.subscription_id.clone().unwrap_or_default(),
                enabled: true,
                contacts: vec![contact_id.clone()],
                ..Default::default()
            }]);
        }

        let Some(subscription_id) = &event.subscription_id else {
            warn!(trigger_id = %event.trigger_id, "Test event without subscription or contact");
            return Ok(Vec::new());
        };

        Ok(self
            .database
            .get_subscription(subscription_id)
            .await?
            .into_iter()
            .collect())
    }

    async fn subscription_contacts(
        &self,
        event: &NotificationEvent,
        subscription: &SubscriptionData,
    ) -> Result<Vec<ContactData>> {
        if event.state == State::Test {
            if let Some(contact_id) = &event.contact_id {
                return Ok(self.database.get_contact(contact_id).await?.into_iter().collect());
            }
        }

        self.database.get_contacts(&subscription.contacts).await
    }
}

/// Leading dot-segment of a metric name.
fn metric_tag(metric: &str) -> &str {
    metric.split('.').next().unwrap_or(metric)
}

/// Finds an ancestor metric that switched to the event state within the
/// window. A single-metric ancestor matches any metric, otherwise the metrics
/// must share their leading segment.
pub fn matching_ancestor_metric(check: &CheckData, event: &NotificationEvent) -> Option<String> {
    let single_metric = check.metrics.len() == 1;
    let tag = metric_tag(&event.metric);

    let mut names: Vec<&String> = check.metrics.keys().collect();
    names.sort();

    names
        .into_iter()
        .find(|name| {
            let Some(state) = check.metrics.get(*name) else {
                return false;
            };
            state.state == event.state
                && (event.timestamp - state.event_timestamp).abs() <= ANCESTOR_STATE_WINDOW
                && (single_metric || metric_tag(name) == tag)
        })
        .cloned()
}

pub fn apply_saturation_fallbacks(event: &mut NotificationEvent, trigger: &mut TriggerData) {
    for method in &trigger.saturation {
        let Some(fallback) = method.fallback.clone() else {
            continue;
        };

        match method.kind {
            SaturationType::TakeScreenshot => {
                event
                    .context
                    .images
                    .entry("screenshot".to_string())
                    .or_insert(fallback);
            }
            SaturationType::CheckPort => event.context.notes.push(fallback),
            SaturationType::RenderDescription => {
                if trigger.desc.is_empty() {
                    trigger.desc = fallback;
                }
            }
        }
    }
}

/// Non-OK events schedule every step, OK events schedule resolutions.
fn build_escalations(
    event: &NotificationEvent,
    trigger: &TriggerData,
    subscription: &SubscriptionData,
    now: DateTime<Utc>,
) -> Vec<EscalationEvent> {
    let last = subscription.escalations.len().saturating_sub(1);

    if event.state.needs_ack() {
        subscription
            .escalations
            .iter()
            .enumerate()
            .map(|(index, escalation)| EscalationEvent {
                escalation: escalation.clone(),
                event: event.clone(),
                trigger: trigger.clone(),
                subscription_id: subscription.id.clone(),
                timestamp: (now + TimeDelta::minutes(escalation.offset_in_minutes)).timestamp(),
                is_final: index == last,
                is_resolution: false,
            })
            .collect()
    } else if event.state == State::Ok {
        subscription
            .escalations
            .iter()
            .map(|escalation| EscalationEvent {
                escalation: escalation.clone(),
                event: event.clone(),
                trigger: trigger.clone(),
                subscription_id: subscription.id.clone(),
                timestamp: now.timestamp(),
                is_final: false,
                is_resolution: true,
            })
            .collect()
    } else {
        Vec::new()
    }
}

/// Keeps one notification per dedup key, preferring the copy whose
/// subscription carries escalations.
pub fn deduplicate_notifications(
    candidates: Vec<(ScheduledNotification, bool)>,
) -> Vec<ScheduledNotification> {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut unique: Vec<(ScheduledNotification, bool)> = Vec::new();

    for (notification, has_escalations) in candidates {
        let key = notification.dedup_key();

        match positions.get(&key) {
            Some(&index) => {
                if has_escalations && !unique[index].1 {
                    unique[index] = (notification, has_escalations);
                }
            }
            None => {
                positions.insert(key, unique.len());
                unique.push((notification, has_escalations));
            }
        }
    }

    unique.into_iter().map(|(notification, _)| notification).collect()
}

/// Blocking fetch loop over one of the raw event streams.
pub async fn run_event_fetcher(
    processor: Arc<EventProcessor>,
    database: Arc<dyn Database>,
    poll_interval: Duration,
    token: CancellationToken,
) {
    let with_saturations = processor.with_saturations();

    while !token.is_cancelled() {
        match database
            .fetch_notification_event(with_saturations, poll_interval)
            .await
        {
            Ok(Some(event)) => {
                if let Err(e) = processor.process_event(event).await {
                    error!(with_saturations, error = %e, "Failed to process notification event");
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(with_saturations, error = %e, "Failed to fetch notification event");
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        }
    }
}

/// Periodic loop re-submitting delayed events once they are due.
pub async fn run_delayed_event_fetcher(
    processor: Arc<EventProcessor>,
    database: Arc<dyn Database>,
    poll_interval: Duration,
    token: CancellationToken,
) {
    let with_saturations = processor.with_saturations();
    let name = if with_saturations {
        "delayed-events-saturation"
    } else {
        "delayed-events"
    };

    run_every(name, poll_interval, token, || {
        let processor = Arc::clone(&processor);
        let database = Arc::clone(&database);

        async move {
            let events = database
                .fetch_delayed_notification_events(Utc::now().timestamp(), with_saturations)
                .await?;

            for event in events {
                if let Err(e) = processor.process_event(event).await {
                    error!(with_saturations, error = %e, "Failed to process delayed event");
                }
            }

            Ok(())
        }
    })
    .await;
}
