use serde::Serialize;

use crate::models::{contact::ContactData, event::NotificationEvent, trigger::TriggerData};

/// In-memory batch of events for a single contact and trigger.
#[derive(Debug, Clone)]
pub struct NotificationPackage {
    pub events: Vec<NotificationEvent>,
    pub trigger: TriggerData,
    pub contact: ContactData,
    pub throttled: bool,
    pub fail_count: u32,
    pub need_ack: bool,
    pub dont_resend: bool,
    pub ancestor: Option<AncestorTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct AncestorTarget {
    pub trigger_id: String,
    pub metric: String,
}

impl NotificationPackage {
    pub fn new(trigger: TriggerData, contact: ContactData) -> Self {
        Self {
            events: Vec::new(),
            trigger,
            contact,
            throttled: false,
            fail_count: 0,
            need_ack: false,
            dont_resend: false,
            ancestor: None,
        }
    }

    pub fn with_events(mut self, events: Vec<NotificationEvent>) -> Self {
        self.events = events;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Copy of the package carrying only the given events.
    pub fn with_only(&self, events: Vec<NotificationEvent>) -> Self {
        Self {
            events,
            ..self.clone()
        }
    }
}
