use serde::{Deserialize, Serialize};

use crate::models::{contact::ContactData, event::NotificationEvent, trigger::TriggerData};

/// Persisted, time-ordered unit of delivery work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledNotification {
    pub event: NotificationEvent,
    pub trigger: TriggerData,
    pub contact: ContactData,

    #[serde(default)]
    pub throttled: bool,

    #[serde(default)]
    pub send_fail: u32,

    pub timestamp: i64,

    #[serde(default)]
    pub need_ack: bool,
}

impl ScheduledNotification {
    /// Key collapsing copies of the same delivery produced by different
    /// subscriptions.
    pub fn dedup_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.contact.kind,
            self.contact.value,
            self.trigger.id,
            self.event.identity()
        )
    }
}
