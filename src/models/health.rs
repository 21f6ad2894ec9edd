use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checked_at: DateTime<Utc>,
    pub store: StoreHealth,
    pub notifier: NotifierHealth,
}

impl HealthReport {
    pub fn new(store: StoreHealth, notifier: NotifierHealth) -> Self {
        Self {
            status: store.status().max(notifier.status()),
            checked_at: Utc::now(),
            store,
            notifier,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreHealth {
    pub reachable: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StoreHealth {
    pub fn reachable(latency_ms: u64) -> Self {
        Self {
            reachable: true,
            latency_ms: Some(latency_ms),
            error: None,
        }
    }

    pub fn unreachable(error: String) -> Self {
        Self {
            reachable: false,
            latency_ms: None,
            error: Some(error),
        }
    }

    pub fn status(&self) -> HealthStatus {
        if self.reachable {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }
}

/// Kill switch as seen by the dispatcher.
#[derive(Debug, Clone, Serialize)]
pub struct NotifierHealth {
    /// Raw switch value, absent when it could not be read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    /// Whether due notifications are delivered rather than discarded.
    pub sending: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NotifierHealth {
    pub fn enabled(state: &str) -> Self {
        Self {
            state: Some(state.to_string()),
            sending: true,
            error: None,
        }
    }

    pub fn disabled(state: &str) -> Self {
        Self {
            state: Some(state.to_string()),
            sending: false,
            error: None,
        }
    }

    /// The dispatcher keeps sending when the switch cannot be read.
    pub fn unknown(error: String) -> Self {
        Self {
            state: None,
            sending: true,
            error: Some(error),
        }
    }

    pub fn status(&self) -> HealthStatus {
        match (self.sending, &self.state) {
            (false, _) => HealthStatus::Degraded,
            (true, None) => HealthStatus::Degraded,
            (true, Some(_)) => HealthStatus::Healthy,
        }
    }
}
