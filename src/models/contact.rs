use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContactData {
    pub id: String,

    #[serde(rename = "type")]
    pub kind: String,

    pub value: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_value: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,

    #[serde(default)]
    pub user: String,
}

/// One concrete destination produced by expanding a contact value.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedContact {
    pub replaced_value: String,
    pub rollback_value: String,
    pub expiration: Option<DateTime<Utc>>,
}

impl ResolvedContact {
    pub fn literal(value: &str) -> Self {
        Self {
            replaced_value: value.to_string(),
            rollback_value: value.to_string(),
            expiration: None,
        }
    }
}

/// On-call rotation entry kept by the lookup store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DutyData {
    #[serde(default)]
    pub persons: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
}
