use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::status::State;

/// Opaque per-event context consumed by the contact resolver and channels.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventContext {
    #[serde(default)]
    pub deployers: Vec<String>,

    #[serde(default)]
    pub images: BTreeMap<String, String>,

    /// Channel hints per service kind, e.g. `slack -> [#team-alerts]`.
    #[serde(default)]
    pub service_channels: BTreeMap<String, Vec<String>>,

    #[serde(default)]
    pub notes: Vec<String>,
}

impl EventContext {
    pub fn fingerprint(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub trigger_id: String,
    pub metric: String,
    pub state: State,
    pub old_state: State,
    pub timestamp: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<String>,

    #[serde(default)]
    pub delayed_for_ancestor: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ancestor_trigger_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ancestor_metric: Option<String>,

    #[serde(default)]
    pub overridden_by_ancestor: bool,

    #[serde(default)]
    pub is_force_sent: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fan_task_id: Option<String>,

    #[serde(default)]
    pub waiting_for_fan_since: i64,

    #[serde(default)]
    pub context: EventContext,
}

impl NotificationEvent {
    /// Identity of the state transition, independent of routing fields.
    pub fn identity(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.trigger_id, self.metric, self.state, self.timestamp
        )
    }

    /// Tags derived from the transition itself, matched against subscriptions
    /// together with the trigger tags.
    pub fn event_tags(&self) -> Vec<String> {
        let mut tags = vec![self.state.to_string(), self.old_state.to_string()];

        let delta = self.state.weight() - self.old_state.weight();
        if delta > 0 {
            tags.push("DEGRADATION".to_string());
            if self.old_state == State::Ok
                && matches!(self.state, State::Error | State::Exception)
            {
                tags.push("HIGH DEGRADATION".to_string());
            }
        } else if delta < 0 {
            tags.push("PROGRESS".to_string());
        }

        tags
    }

    /// A copy of this event that is covered by an ancestor alert.
    pub fn overridden_by(&self, ancestor_trigger_id: &str, ancestor_metric: &str) -> Self {
        Self {
            delayed_for_ancestor: true,
            ancestor_trigger_id: Some(ancestor_trigger_id.to_string()),
            ancestor_metric: Some(ancestor_metric.to_string()),
            overridden_by_ancestor: true,
            ..self.clone()
        }
    }
}
