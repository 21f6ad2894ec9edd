use serde::{Deserialize, Serialize};

use crate::models::{event::NotificationEvent, subscription::EscalationData, trigger::TriggerData};

/// A scheduled follow-up for one escalation step of one subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationEvent {
    pub escalation: EscalationData,
    pub event: NotificationEvent,
    pub trigger: TriggerData,
    pub subscription_id: String,
    pub timestamp: i64,

    #[serde(default)]
    pub is_final: bool,

    #[serde(default)]
    pub is_resolution: bool,
}
