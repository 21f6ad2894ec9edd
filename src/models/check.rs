use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::models::status::State;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricState {
    pub state: State,

    #[serde(default)]
    pub timestamp: i64,

    /// Time of the last state change of this metric.
    #[serde(default)]
    pub event_timestamp: i64,
}

/// Last check result recorded by the checker for a trigger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckData {
    #[serde(default)]
    pub metrics: HashMap<String, MetricState>,

    #[serde(default)]
    pub state: State,

    #[serde(default)]
    pub timestamp: i64,
}
