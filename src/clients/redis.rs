use std::{collections::HashMap, time::Duration};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use redis::{AsyncCommands, Client, aio::MultiplexedConnection};
use serde::{Serialize, de::DeserializeOwned};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    clients::traits::{Database, EventLink, SilencedPatternSnapshot},
    config::Config,
    models::{
        check::CheckData,
        contact::{ContactData, DutyData},
        escalation::EscalationEvent,
        event::NotificationEvent,
        notification::ScheduledNotification,
        retry::RetryConfig,
        status::NotifierState,
        subscription::SubscriptionData,
        trigger::TriggerData,
    },
    utils::retry_with_backoff,
};

const NOTIFIER_STATE_KEY: &str = "notifier:state";
const NOTIFICATIONS_KEY: &str = "notifier:notifications";
const ESCALATIONS_KEY: &str = "notifier:escalations";
const METRICS_COUNTER_KEY: &str = "selfstate:metrics-heartbeat";
const CHECKS_COUNTER_KEY: &str = "selfstate:checks-counter";
const SILENT_METRICS_KEY: &str = "notifier:silent-metrics";
const SILENT_TAGS_KEY: &str = "notifier:silent-tags";

fn events_key(with_saturations: bool) -> &'static str {
    if with_saturations {
        "notifier:events-saturation"
    } else {
        "notifier:events"
    }
}

fn delayed_events_key(with_saturations: bool) -> &'static str {
    if with_saturations {
        "notifier:delayed-events-saturation"
    } else {
        "notifier:delayed-events"
    }
}

fn link_member(link: &EventLink) -> String {
    format!("{}:{}", link.trigger_id, link.metric)
}

// Trigger ids never contain ':', metrics may.
fn parse_link(member: &str) -> Option<EventLink> {
    member
        .split_once(':')
        .map(|(trigger_id, metric)| EventLink::new(trigger_id, metric))
}

fn decode<T: DeserializeOwned>(raw: &str) -> Result<T, Error> {
    serde_json::from_str(raw).map_err(|e| anyhow!("Failed to decode stored value: {}", e))
}

fn encode<T: Serialize>(value: &T) -> Result<String, Error> {
    serde_json::to_string(value).map_err(|e| anyhow!("Failed to encode value: {}", e))
}

async fn open_connection(client: &Client) -> Result<MultiplexedConnection, Error> {
    client
        .get_multiplexed_async_connection()
        .await
        .map_err(|_| anyhow!("Failed to connect to redis client"))
}

pub struct RedisClient {
    connection: MultiplexedConnection,
    /// BRPOP holds its connection until the pop returns, so each event stream
    /// blocks on a connection of its own.
    events_connection: MultiplexedConnection,
    saturation_events_connection: MultiplexedConnection,
    retry_config: RetryConfig,
    /// Value written into locks taken by this process.
    instance_id: Uuid,
}

impl RedisClient {
    pub async fn connect(config: &Config) -> Result<Self, Error> {
        Self::open(&config.redis_url, config.retry_config()).await
    }

    pub async fn open(redis_url: &str, retry_config: RetryConfig) -> Result<Self, Error> {
        info!("Connecting to Redis");

        let client = Client::open(redis_url).map_err(|_| anyhow!("Failed to create redis client"))?;

        let connection = open_connection(&client).await?;
        let events_connection = open_connection(&client).await?;
        let saturation_events_connection = open_connection(&client).await?;

        let instance_id = Uuid::new_v4();
        info!(instance_id = %instance_id, "Redis connection established");

        Ok(Self {
            connection,
            events_connection,
            saturation_events_connection,
            retry_config,
            instance_id,
        })
    }

    pub fn connection(&self) -> MultiplexedConnection {
        self.connection.clone()
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, Error> {
        let mut conn = self.connection.clone();
        let value: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| anyhow!("Failed to get {}: {}", key, e))?;

        value.as_deref().map(decode).transpose()
    }

    async fn mget_json<T: DeserializeOwned>(&self, keys: &[String]) -> Result<Vec<Option<T>>, Error> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.connection.clone();
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow!("Failed to mget: {}", e))?;

        values
            .iter()
            .map(|value| value.as_deref().map(decode).transpose())
            .collect()
    }

    async fn pop_due<T: DeserializeOwned>(&self, key: &str, to: i64) -> Result<Vec<T>, Error> {
        let mut conn = self.connection.clone();
        let (members, _removed): (Vec<String>, i64) = redis::pipe()
            .atomic()
            .zrangebyscore(key, "-inf", to)
            .zrembyscore(key, "-inf", to)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow!("Failed to fetch due items from {}: {}", key, e))?;

        let mut items = Vec::with_capacity(members.len());
        for member in members {
            match decode(&member) {
                Ok(item) => items.push(item),
                Err(e) => warn!(key, error = %e, "Dropping undecodable stored item"),
            }
        }

        Ok(items)
    }

    async fn get_counter(&self, key: &str) -> Result<i64, Error> {
        let mut conn = self.connection.clone();
        let value: Option<i64> = conn
            .get(key)
            .await
            .map_err(|e| anyhow!("Failed to read counter {}: {}", key, e))?;
        Ok(value.unwrap_or_default())
    }
}

#[async_trait]
impl Database for RedisClient {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn fetch_notification_event(
        &self,
        with_saturations: bool,
        timeout: Duration,
    ) -> Result<Option<NotificationEvent>> {
        let mut conn = if with_saturations {
            self.saturation_events_connection.clone()
        } else {
            self.events_connection.clone()
        };
        let popped: Option<(String, String)> = conn
            .brpop(events_key(with_saturations), timeout.as_secs_f64())
            .await
            .map_err(|e| anyhow!("Failed to pop notification event: {}", e))?;

        popped.map(|(_, raw)| decode(&raw)).transpose()
    }

    async fn push_notification_event(
        &self,
        event: &NotificationEvent,
        with_saturations: bool,
    ) -> Result<()> {
        let mut conn = self.connection.clone();
        conn.lpush::<_, _, ()>(events_key(with_saturations), encode(event)?)
            .await
            .map_err(|e| anyhow!("Failed to push notification event: {}", e))?;
        Ok(())
    }

    async fn push_delayed_notification_event(
        &self,
        event: &NotificationEvent,
        with_saturations: bool,
        until: i64,
    ) -> Result<()> {
        let mut conn = self.connection.clone();
        conn.zadd::<_, _, _, ()>(delayed_events_key(with_saturations), encode(event)?, until)
            .await
            .map_err(|e| anyhow!("Failed to push delayed event: {}", e))?;
        Ok(())
    }

    async fn fetch_delayed_notification_events(
        &self,
        to: i64,
        with_saturations: bool,
    ) -> Result<Vec<NotificationEvent>> {
        self.pop_due(delayed_events_key(with_saturations), to).await
    }

    async fn add_notifications(&self, notifications: &[ScheduledNotification]) -> Result<()> {
        if notifications.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for notification in notifications {
            pipe.zadd(NOTIFICATIONS_KEY, encode(notification)?, notification.timestamp)
                .ignore();
        }

        retry_with_backoff(&self.retry_config, || {
            let mut conn = self.connection.clone();
            let pipe = pipe.clone();

            async move {
                pipe.query_async::<()>(&mut conn)
                    .await
                    .map_err(|e| e.to_string())
            }
        })
        .await
        .map_err(|e| anyhow!("add_notifications failed: {}", e))?;

        Ok(())
    }

    async fn fetch_notifications(&self, to: i64) -> Result<Vec<ScheduledNotification>> {
        self.pop_due(NOTIFICATIONS_KEY, to).await
    }

    async fn get_trigger_throttling(&self, trigger_id: &str) -> Result<(i64, i64)> {
        let next = self
            .get_counter(&format!("notifier:throttling:{}", trigger_id))
            .await?;
        let beginning = self
            .get_counter(&format!("notifier:throttling-beginning:{}", trigger_id))
            .await?;
        Ok((next, beginning))
    }

    async fn set_trigger_throttling(&self, trigger_id: &str, next: i64) -> Result<()> {
        let mut conn = self.connection.clone();
        conn.set::<_, _, ()>(format!("notifier:throttling:{}", trigger_id), next)
            .await
            .map_err(|e| anyhow!("Failed to set trigger throttling: {}", e))?;
        Ok(())
    }

    async fn get_notification_event_count(&self, trigger_id: &str, from: i64) -> Result<i64> {
        let mut conn = self.connection.clone();
        let count: i64 = conn
            .zcount(format!("notifier:trigger-events:{}", trigger_id), from, "+inf")
            .await
            .map_err(|e| anyhow!("Failed to count trigger events: {}", e))?;
        Ok(count)
    }

    async fn get_trigger(&self, trigger_id: &str) -> Result<Option<TriggerData>> {
        self.get_json(&format!("trigger:{}", trigger_id)).await
    }

    async fn get_subscription(&self, subscription_id: &str) -> Result<Option<SubscriptionData>> {
        self.get_json(&format!("subscription:{}", subscription_id))
            .await
    }

    async fn get_tag_subscriptions(&self, tags: &[String]) -> Result<Vec<SubscriptionData>> {
        if tags.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.connection.clone();
        let keys: Vec<String> = tags
            .iter()
            .map(|tag| format!("tag-subscriptions:{}", tag))
            .collect();
        let ids: Vec<String> = conn
            .sunion(keys)
            .await
            .map_err(|e| anyhow!("Failed to read tag subscriptions: {}", e))?;

        let keys: Vec<String> = ids.iter().map(|id| format!("subscription:{}", id)).collect();
        let subscriptions = self.mget_json::<SubscriptionData>(&keys).await?;
        Ok(subscriptions.into_iter().flatten().collect())
    }

    async fn get_contact(&self, contact_id: &str) -> Result<Option<ContactData>> {
        self.get_json(&format!("contact:{}", contact_id)).await
    }

    async fn get_contacts(&self, contact_ids: &[String]) -> Result<Vec<ContactData>> {
        let keys: Vec<String> = contact_ids
            .iter()
            .map(|id| format!("contact:{}", id))
            .collect();
        let contacts = self.mget_json::<ContactData>(&keys).await?;
        Ok(contacts.into_iter().flatten().collect())
    }

    async fn get_trigger_last_check(&self, trigger_id: &str) -> Result<Option<CheckData>> {
        self.get_json(&format!("trigger-last-check:{}", trigger_id))
            .await
    }

    async fn get_triggers_last_check(
        &self,
        trigger_ids: &[String],
    ) -> Result<Vec<Option<CheckData>>> {
        let keys: Vec<String> = trigger_ids
            .iter()
            .map(|id| format!("trigger-last-check:{}", id))
            .collect();
        self.mget_json(&keys).await
    }

    async fn add_child_event(&self, ancestor: &EventLink, child: &EventLink) -> Result<()> {
        let mut conn = self.connection.clone();
        redis::pipe()
            .atomic()
            .sadd(
                format!("notifier:ancestor-children:{}", link_member(ancestor)),
                link_member(child),
            )
            .ignore()
            .sadd(
                format!("notifier:ancestor-parents:{}", link_member(child)),
                link_member(ancestor),
            )
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| anyhow!("Failed to add child event: {}", e))?;
        Ok(())
    }

    async fn get_parent_events(&self, child: &EventLink) -> Result<Vec<EventLink>> {
        let mut conn = self.connection.clone();
        let members: Vec<String> = conn
            .smembers(format!("notifier:ancestor-parents:{}", link_member(child)))
            .await
            .map_err(|e| anyhow!("Failed to read parent events: {}", e))?;
        Ok(members.iter().filter_map(|m| parse_link(m)).collect())
    }

    async fn delete_child_event(&self, ancestor: &EventLink, child: &EventLink) -> Result<()> {
        let mut conn = self.connection.clone();
        redis::pipe()
            .atomic()
            .srem(
                format!("notifier:ancestor-children:{}", link_member(ancestor)),
                link_member(child),
            )
            .ignore()
            .srem(
                format!("notifier:ancestor-parents:{}", link_member(child)),
                link_member(ancestor),
            )
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| anyhow!("Failed to delete child event: {}", e))?;
        Ok(())
    }

    async fn add_escalations(&self, escalations: &[EscalationEvent]) -> Result<()> {
        if escalations.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for escalation in escalations {
            pipe.zadd(ESCALATIONS_KEY, encode(escalation)?, escalation.timestamp)
                .ignore();
            if !escalation.is_resolution {
                pipe.set(
                    format!(
                        "notifier:escalation-pending:{}:{}",
                        escalation.event.trigger_id, escalation.event.metric
                    ),
                    1,
                )
                .ignore();
            }
        }

        let mut conn = self.connection.clone();
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| anyhow!("Failed to add escalations: {}", e))?;
        Ok(())
    }

    async fn fetch_escalations(&self, to: i64) -> Result<Vec<EscalationEvent>> {
        self.pop_due(ESCALATIONS_KEY, to).await
    }

    async fn has_pending_escalations(&self, trigger_id: &str, metric: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let exists: bool = conn
            .exists(format!("notifier:escalation-pending:{}:{}", trigger_id, metric))
            .await
            .map_err(|e| anyhow!("Failed to check pending escalations: {}", e))?;
        Ok(exists)
    }

    async fn register_processed_escalation(
        &self,
        trigger_id: &str,
        metric: &str,
        escalation_id: &str,
    ) -> Result<()> {
        let mut conn = self.connection.clone();
        conn.sadd::<_, _, ()>(
            format!("notifier:escalation-processed:{}:{}", trigger_id, metric),
            escalation_id,
        )
        .await
        .map_err(|e| anyhow!("Failed to register processed escalation: {}", e))?;
        Ok(())
    }

    async fn is_escalation_processed(
        &self,
        trigger_id: &str,
        metric: &str,
        escalation_id: &str,
    ) -> Result<bool> {
        let mut conn = self.connection.clone();
        let processed: bool = conn
            .sismember(
                format!("notifier:escalation-processed:{}:{}", trigger_id, metric),
                escalation_id,
            )
            .await
            .map_err(|e| anyhow!("Failed to read processed escalations: {}", e))?;
        Ok(processed)
    }

    async fn ack_escalations(&self, trigger_id: &str, metric: &str, resolved: bool) -> Result<()> {
        let mut conn = self.connection.clone();
        let mut keys = vec![format!(
            "notifier:escalation-pending:{}:{}",
            trigger_id, metric
        )];
        if resolved {
            keys.push(format!(
                "notifier:escalation-processed:{}:{}",
                trigger_id, metric
            ));
        }

        conn.del::<_, ()>(keys)
            .await
            .map_err(|e| anyhow!("Failed to ack escalations: {}", e))?;
        Ok(())
    }

    async fn get_notifier_state(&self) -> Result<NotifierState> {
        let mut conn = self.connection.clone();
        let value: Option<String> = conn
            .get(NOTIFIER_STATE_KEY)
            .await
            .map_err(|e| anyhow!("Failed to read notifier state: {}", e))?;

        Ok(value
            .map(|s| NotifierState::from_string(&s))
            .unwrap_or(NotifierState::Ok))
    }

    async fn set_notifier_state(&self, state: NotifierState) -> Result<()> {
        let mut conn = self.connection.clone();
        conn.set::<_, _, ()>(NOTIFIER_STATE_KEY, state.as_str())
            .await
            .map_err(|e| anyhow!("Failed to set notifier state: {}", e))?;
        Ok(())
    }

    async fn get_metrics_updates_count(&self) -> Result<i64> {
        self.get_counter(METRICS_COUNTER_KEY).await
    }

    async fn get_checks_updates_count(&self) -> Result<i64> {
        self.get_counter(CHECKS_COUNTER_KEY).await
    }

    async fn acquire_lock(&self, name: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(format!("notifier:lock:{}", name))
            .arg(self.instance_id.to_string())
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow!("Failed to acquire lock {}: {}", name, e))?;
        Ok(acquired.is_some())
    }

    async fn get_silent_patterns(&self) -> Result<SilencedPatternSnapshot> {
        let mut conn = self.connection.clone();
        let metrics: HashMap<String, i64> = conn
            .hgetall(SILENT_METRICS_KEY)
            .await
            .map_err(|e| anyhow!("Failed to read silent metrics: {}", e))?;
        let tags: HashMap<String, i64> = conn
            .hgetall(SILENT_TAGS_KEY)
            .await
            .map_err(|e| anyhow!("Failed to read silent tags: {}", e))?;
        Ok(SilencedPatternSnapshot { metrics, tags })
    }

    async fn get_duty(&self, schedule: &str) -> Result<Option<DutyData>> {
        self.get_json(&format!("duty:{}", schedule)).await
    }

    async fn get_group_members(&self, group: &str) -> Result<Vec<String>> {
        let mut conn = self.connection.clone();
        let members: Vec<String> = conn
            .smembers(format!("contact-group:{}", group))
            .await
            .map_err(|e| anyhow!("Failed to read group {}: {}", group, e))?;
        Ok(members)
    }
}
