use serde::{Deserialize, Serialize};

use crate::models::{event::NotificationEvent, status::State};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDay {
    pub name: String,
    pub enabled: bool,
}

/// Weekly quiet-hours window. Offsets are minutes from local midnight,
/// `timezone_offset` is minutes west of UTC.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleData {
    #[serde(default)]
    pub days: Vec<ScheduleDay>,

    #[serde(default)]
    pub timezone_offset: i64,

    #[serde(default)]
    pub start_offset: i64,

    #[serde(default)]
    pub end_offset: i64,
}

impl ScheduleData {
    /// A schedule open every day around the clock.
    pub fn all_week() -> Self {
        const NAMES: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

        Self {
            days: NAMES
                .iter()
                .map(|name| ScheduleDay {
                    name: name.to_string(),
                    enabled: true,
                })
                .collect(),
            timezone_offset: 0,
            start_offset: 0,
            end_offset: 1439,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationData {
    pub id: String,
    pub offset_in_minutes: i64,
    pub contacts: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionData {
    pub id: String,

    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub contacts: Vec<String>,

    #[serde(default)]
    pub throttling_enabled: bool,

    #[serde(default)]
    pub schedule: ScheduleData,

    #[serde(default)]
    pub escalations: Vec<EscalationData>,

    #[serde(default)]
    pub ignore_warnings: bool,

    #[serde(default)]
    pub ignore_recoverings: bool,

    #[serde(default)]
    pub user: String,
}

impl SubscriptionData {
    pub fn has_escalations(&self) -> bool {
        !self.escalations.is_empty()
    }

    pub fn matches_tags(&self, tags: &[String]) -> bool {
        self.tags.iter().all(|tag| tags.contains(tag))
    }

    pub fn must_ignore(&self, event: &NotificationEvent) -> bool {
        let delta = event.state.weight() - event.old_state.weight();

        if delta < 0 {
            if delta == -1 && matches!(event.state, State::Ok | State::Warn) {
                return self.ignore_recoverings && self.ignore_warnings;
            }
            return self.ignore_recoverings;
        }

        if event.state == State::Warn && event.old_state == State::Ok {
            return self.ignore_warnings;
        }

        false
    }
}
