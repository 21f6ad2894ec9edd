//! Delivery channel contract and the registry building channels by kind.

pub mod script;
pub mod webhook;

use std::{collections::HashMap, path::Path, sync::Arc};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::models::{
    contact::ContactData, event::NotificationEvent, package::AncestorTarget, trigger::TriggerData,
};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SenderError {
    #[error("fatal delivery error: {0}")]
    Fatal(String),

    #[error("retryable delivery error: {0}")]
    Retryable(String),
}

impl SenderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SenderError::Retryable(_))
    }
}

/// A delivery channel implementation.
#[async_trait]
pub trait Sender: Send + Sync {
    async fn send_events(
        &self,
        events: &[NotificationEvent],
        contact: &ContactData,
        trigger: &TriggerData,
        throttled: bool,
        need_ack: bool,
    ) -> Result<(), SenderError>;

    /// Channels able to render "covered by ancestor" notices.
    fn supports_inheritance(&self) -> bool {
        false
    }

    async fn send_events_with_inheritance(
        &self,
        _events: &[NotificationEvent],
        _contact: &ContactData,
        _trigger: &TriggerData,
        _ancestor: &AncestorTarget,
    ) -> Result<(), SenderError> {
        Err(SenderError::Fatal(
            "channel does not support inheritance".to_string(),
        ))
    }
}

/// Body handed to webhook and script channels.
#[derive(Debug, Serialize)]
pub struct EventsPayload<'a> {
    pub trigger: &'a TriggerData,
    pub events: &'a [NotificationEvent],
    pub contact: &'a ContactData,
    pub throttled: bool,
    pub need_ack: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ancestor: Option<&'a AncestorTarget>,
}

/// Replaces contact placeholders in a channel setting.
pub fn render_contact_template(template: &str, contact: &ContactData) -> String {
    template
        .replace("${contact_value}", &contact.value)
        .replace("${contact_id}", &contact.id)
        .replace("${contact_type}", &contact.kind)
}

/// One configured channel: contacts of `contact_type` are delivered by an
/// implementation of `kind` initialized with `settings`.
#[derive(Debug, Clone, Deserialize)]
pub struct SenderSettings {
    #[serde(rename = "type")]
    pub contact_type: String,

    pub kind: String,

    #[serde(default)]
    pub settings: Value,
}

pub fn load_sender_settings(path: &Path) -> Result<Vec<SenderSettings>, Error> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("Failed to read senders file {}: {}", path.display(), e))?;

    serde_json::from_str(&raw).map_err(|e| anyhow!("Invalid senders file {}: {}", path.display(), e))
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown sender kind {0}")]
    UnknownKind(String),

    #[error("failed to init {kind} sender: {reason}")]
    Init { kind: String, reason: String },
}

pub type SenderFactory = Box<dyn Fn(&Value) -> Result<Arc<dyn Sender>> + Send + Sync>;

#[derive(Default)]
pub struct SenderRegistry {
    factories: HashMap<String, SenderFactory>,
}

impl SenderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry knowing the bundled channel kinds.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        registry.register(
            "webhook",
            Box::new(|settings: &Value| -> Result<Arc<dyn Sender>> {
                Ok(Arc::new(webhook::WebhookSender::init(settings)?))
            }),
        );
        registry.register(
            "script",
            Box::new(|settings: &Value| -> Result<Arc<dyn Sender>> {
                Ok(Arc::new(script::ScriptSender::init(settings)?))
            }),
        );

        registry
    }

    pub fn register(&mut self, kind: &str, factory: SenderFactory) {
        self.factories.insert(kind.to_string(), factory);
    }

    pub fn build(&self, settings: &SenderSettings) -> Result<Arc<dyn Sender>, RegistryError> {
        let factory = self
            .factories
            .get(&settings.kind)
            .ok_or_else(|| RegistryError::UnknownKind(settings.kind.clone()))?;

        let sender = factory(&settings.settings).map_err(|e| RegistryError::Init {
            kind: settings.kind.clone(),
            reason: e.to_string(),
        })?;

        info!(
            contact_type = %settings.contact_type,
            kind = %settings.kind,
            "Sender initialized"
        );

        Ok(sender)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_contact_placeholders() {
        let contact = ContactData {
            id: "c1".into(),
            kind: "hook".into(),
            value: "team-a".into(),
            ..Default::default()
        };

        assert_eq!(
            render_contact_template("https://hooks.local/${contact_type}/${contact_value}?id=${contact_id}", &contact),
            "https://hooks.local/hook/team-a?id=c1"
        );
    }

    #[test]
    fn payload_carries_ancestor() {
        let trigger = TriggerData {
            id: "child".into(),
            ..Default::default()
        };
        let contact = ContactData::default();
        let ancestor = AncestorTarget {
            trigger_id: "root".into(),
            metric: "web.cpu".into(),
        };

        let body = serde_json::to_value(EventsPayload {
            trigger: &trigger,
            events: &[],
            contact: &contact,
            throttled: false,
            need_ack: false,
            ancestor: Some(&ancestor),
        })
        .unwrap();

        assert_eq!(body["ancestor"]["trigger_id"], "root");
        assert_eq!(body["ancestor"]["metric"], "web.cpu");
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let registry = SenderRegistry::with_defaults();
        let settings = SenderSettings {
            contact_type: "sms".into(),
            kind: "carrier-pigeon".into(),
            settings: Value::Null,
        };

        assert!(matches!(
            registry.build(&settings),
            Err(RegistryError::UnknownKind(kind)) if kind == "carrier-pigeon"
        ));
    }

    #[test]
    fn init_failure_is_reported() {
        let registry = SenderRegistry::with_defaults();
        let settings = SenderSettings {
            contact_type: "hook".into(),
            kind: "webhook".into(),
            settings: serde_json::json!({}),
        };

        assert!(matches!(
            registry.build(&settings),
            Err(RegistryError::Init { .. })
        ));
    }
}
