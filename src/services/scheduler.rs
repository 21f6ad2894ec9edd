//! Delivery timing: retry backoff, alarm-fatigue throttling and weekly
//! quiet-hours clamping.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Datelike, TimeDelta, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    clients::traits::Database,
    models::{
        contact::ContactData,
        event::NotificationEvent,
        notification::ScheduledNotification,
        status::State,
        subscription::{ScheduleData, SubscriptionData},
        trigger::TriggerData,
    },
    utils::from_unix,
};

const MAX_BACKOFF_FAIL_COUNT: u32 = 7;
const MAX_BACKOFF_MINUTES: u64 = 64;
const MINUTES_PER_DAY: i64 = 24 * 60;

/// If a trigger switched at least `count` times during `window`, the next
/// delivery is postponed by `delay`.
#[derive(Debug, Clone, Copy)]
pub struct ThrottlingLevel {
    pub window: TimeDelta,
    pub delay: TimeDelta,
    pub count: i64,
}

pub fn throttling_levels() -> [ThrottlingLevel; 2] {
    [
        ThrottlingLevel {
            window: TimeDelta::hours(3),
            delay: TimeDelta::hours(1),
            count: 20,
        },
        ThrottlingLevel {
            window: TimeDelta::hours(1),
            delay: TimeDelta::minutes(30),
            count: 10,
        },
    ]
}

#[derive(Debug, Error, PartialEq)]
pub enum ScheduleError {
    #[error("invalid schedule: {0} days defined, expected 0 or 7")]
    InvalidDays(usize),

    #[error("no allowed day found in schedule")]
    NoAllowedDay,
}

/// `2^fail_count` minutes, capped at 64 minutes.
pub fn calculate_backoff(fail_count: u32) -> Duration {
    let minutes = if fail_count >= MAX_BACKOFF_FAIL_COUNT {
        MAX_BACKOFF_MINUTES
    } else {
        2u64.pow(fail_count).min(MAX_BACKOFF_MINUTES)
    };
    Duration::from_secs(minutes * 60)
}

fn truncate(ts: i64, step: i64) -> i64 {
    ts.div_euclid(step) * step
}

/// Moves `next` into the next allowed window of the weekly schedule.
pub fn calculate_next_delivery(
    schedule: &ScheduleData,
    next: DateTime<Utc>,
) -> Result<DateTime<Utc>, ScheduleError> {
    if schedule.days.is_empty() {
        return Ok(next);
    }
    if schedule.days.len() != 7 {
        return Err(ScheduleError::InvalidDays(schedule.days.len()));
    }

    let begin_offset = TimeDelta::minutes(schedule.start_offset);
    let mut end_offset = TimeDelta::minutes(schedule.end_offset);
    if schedule.end_offset < schedule.start_offset {
        end_offset += TimeDelta::minutes(MINUTES_PER_DAY);
    }
    let tz_offset = TimeDelta::minutes(schedule.timezone_offset);

    let local_next = from_unix(truncate((next - tz_offset).timestamp(), 60));
    let local_day = from_unix(truncate(local_next.timestamp(), MINUTES_PER_DAY * 60));
    let weekday = local_day.weekday().num_days_from_monday() as usize;

    if schedule.days[weekday].enabled
        && local_next >= local_day + begin_offset
        && local_next <= local_day + end_offset
    {
        return Ok(next);
    }

    for day in 0..8 {
        let day_begin = local_day + TimeDelta::days(day);
        let weekday = day_begin.weekday().num_days_from_monday() as usize;

        if local_next > day_begin + begin_offset {
            continue;
        }
        if !schedule.days[weekday].enabled {
            continue;
        }

        return Ok(day_begin + begin_offset + tz_offset);
    }

    Err(ScheduleError::NoAllowedDay)
}

pub struct Scheduler {
    database: Arc<dyn Database>,
}

impl Scheduler {
    pub fn new(database: Arc<dyn Database>) -> Self {
        Self { database }
    }

    /// Returns when the event should be delivered and whether the delivery is
    /// throttled.
    pub async fn get_delivery_info(
        &self,
        now: DateTime<Utc>,
        event: &NotificationEvent,
        subscription: Option<&SubscriptionData>,
        throttled: bool,
        fail_count: u32,
    ) -> (DateTime<Utc>, bool) {
        if fail_count > 0 {
            let backoff = calculate_backoff(fail_count);
            return (now + TimeDelta::seconds(backoff.as_secs() as i64), throttled);
        }

        if event.state == State::Test {
            return (now, false);
        }

        self.calculate_throttled_delivery(now, event, subscription)
            .await
    }

    async fn calculate_throttled_delivery(
        &self,
        now: DateTime<Utc>,
        event: &NotificationEvent,
        subscription: Option<&SubscriptionData>,
    ) -> (DateTime<Utc>, bool) {
        let trigger_id = event.trigger_id.as_str();

        let (throttled_until, beginning) =
            match self.database.get_trigger_throttling(trigger_id).await {
                Ok(throttling) => throttling,
                Err(e) => {
                    warn!(trigger_id, error = %e, "Failed to read trigger throttling");
                    (0, 0)
                }
            };

        let mut next = now;
        let mut alarm_fatigue = false;
        if throttled_until > now.timestamp() {
            next = from_unix(throttled_until);
            alarm_fatigue = true;
        }

        let loaded;
        let subscription = match subscription {
            Some(subscription) => subscription,
            None => {
                loaded = self.load_subscription(event).await;
                match loaded.as_ref() {
                    Some(subscription) => subscription,
                    None => return (next, alarm_fatigue),
                }
            }
        };

        if !subscription.throttling_enabled {
            next = now;
            alarm_fatigue = false;
        } else if !alarm_fatigue {
            let beginning = from_unix(beginning);

            for level in throttling_levels() {
                let from = std::cmp::max(now - level.window, beginning);

                let count = match self
                    .database
                    .get_notification_event_count(trigger_id, from.timestamp())
                    .await
                {
                    Ok(count) => count,
                    Err(e) => {
                        warn!(trigger_id, error = %e, "Failed to count trigger events");
                        0
                    }
                };

                if count >= level.count {
                    next = now + level.delay;
                    info!(
                        trigger_id,
                        count,
                        next = %next,
                        "Trigger switched too often, throttling notifications"
                    );

                    if let Err(e) = self
                        .database
                        .set_trigger_throttling(trigger_id, next.timestamp())
                        .await
                    {
                        warn!(trigger_id, error = %e, "Failed to save trigger throttling");
                    }

                    alarm_fatigue = true;
                    break;
                }
            }
        }

        match calculate_next_delivery(&subscription.schedule, next) {
            Ok(scheduled) => (scheduled, alarm_fatigue),
            Err(e) => {
                warn!(
                    subscription_id = %subscription.id,
                    error = %e,
                    "Failed to apply subscription schedule"
                );
                (next, alarm_fatigue)
            }
        }
    }

    async fn load_subscription(&self, event: &NotificationEvent) -> Option<SubscriptionData> {
        let subscription_id = event.subscription_id.as_deref()?;

        match self.database.get_subscription(subscription_id).await {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!(subscription_id, error = %e, "Failed to load subscription");
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn build_notification(
        &self,
        event: NotificationEvent,
        trigger: TriggerData,
        contact: ContactData,
        next: DateTime<Utc>,
        throttled: bool,
        send_fail: u32,
        need_ack: bool,
    ) -> ScheduledNotification {
        debug!(
            trigger_id = %trigger.id,
            metric = %event.metric,
            contact_type = %contact.kind,
            timestamp = next.timestamp(),
            throttled,
            "Scheduling notification"
        );

        ScheduledNotification {
            event,
            trigger,
            contact,
            throttled,
            send_fail,
            timestamp: next.timestamp(),
            need_ack,
        }
    }

    /// Builds the notification for a failed delivery attempt.
    #[allow(clippy::too_many_arguments)]
    pub async fn schedule_retry(
        &self,
        now: DateTime<Utc>,
        event: NotificationEvent,
        trigger: TriggerData,
        contact: ContactData,
        throttled: bool,
        send_fail: u32,
        need_ack: bool,
    ) -> ScheduledNotification {
        let (next, throttled) = self
            .get_delivery_info(now, &event, None, throttled, send_fail)
            .await;
        self.build_notification(event, trigger, contact, next, throttled, send_fail, need_ack)
    }
}
