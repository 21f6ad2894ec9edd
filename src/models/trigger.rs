use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SaturationType {
    TakeScreenshot,
    CheckPort,
    RenderDescription,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Saturation {
    #[serde(rename = "type")]
    pub kind: SaturationType,

    #[serde(default)]
    pub parameters: serde_json::Value,

    /// Value applied when the saturation service cannot deliver in time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerData {
    pub id: String,
    pub name: String,

    #[serde(default)]
    pub desc: String,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub targets: Vec<String>,

    #[serde(default)]
    pub parents: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warn_value: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_value: Option<f64>,

    #[serde(default)]
    pub dashboard: String,

    #[serde(default)]
    pub saturation: Vec<Saturation>,
}

impl TriggerData {
    pub fn has_parents(&self) -> bool {
        !self.parents.is_empty()
    }
}
