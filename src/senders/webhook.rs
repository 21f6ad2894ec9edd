use std::{collections::HashMap, time::Duration};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    models::{
        contact::ContactData, event::NotificationEvent, package::AncestorTarget,
        trigger::TriggerData,
    },
    senders::{EventsPayload, Sender, SenderError, render_contact_template},
};

#[derive(Debug, Clone, Deserialize)]
struct WebhookSettings {
    url: String,

    #[serde(default)]
    user: Option<String>,

    #[serde(default)]
    password: Option<String>,

    #[serde(default)]
    headers: HashMap<String, String>,

    #[serde(default = "default_timeout_secs")]
    timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

/// Posts the events as JSON to a configured URL.
pub struct WebhookSender {
    http_client: Client,
    settings: WebhookSettings,
}

impl WebhookSender {
    pub fn init(settings: &Value) -> Result<Self, Error> {
        let settings: WebhookSettings = serde_json::from_value(settings.clone())
            .map_err(|e| anyhow!("Invalid webhook settings: {}", e))?;

        if settings.url.is_empty() {
            return Err(anyhow!("Webhook url is required"));
        }

        let http_client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|_| anyhow!("Failed to create HTTP client"))?;

        info!(url = %settings.url, "Webhook sender initialized");

        Ok(Self {
            http_client,
            settings,
        })
    }

    async fn post(&self, contact: &ContactData, payload: &EventsPayload<'_>) -> Result<(), SenderError> {
        let url = render_contact_template(&self.settings.url, contact);

        let mut request = self.http_client.post(&url).json(payload);
        for (name, value) in &self.settings.headers {
            request = request.header(name, value);
        }
        if let Some(user) = &self.settings.user {
            request = request.basic_auth(user, self.settings.password.as_ref());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                SenderError::Retryable(format!("webhook request failed: {}", e))
            } else {
                SenderError::Fatal(format!("webhook request failed: {}", e))
            }
        })?;

        let status = response.status();
        if status.is_success() {
            debug!(url = %url, events = payload.events.len(), "Webhook delivered");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        warn!(url = %url, status = %status, "Webhook rejected notification");

        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Err(SenderError::Retryable(format!("webhook returned {}: {}", status, body)))
        } else {
            Err(SenderError::Fatal(format!("webhook returned {}: {}", status, body)))
        }
    }
}

#[async_trait]
impl Sender for WebhookSender {
    async fn send_events(
        &self,
        events: &[NotificationEvent],
        contact: &ContactData,
        trigger: &TriggerData,
        throttled: bool,
        need_ack: bool,
    ) -> Result<(), SenderError> {
        let payload = EventsPayload {
            trigger,
            events,
            contact,
            throttled,
            need_ack,
            ancestor: None,
        };
        self.post(contact, &payload).await
    }

    fn supports_inheritance(&self) -> bool {
        true
    }

    async fn send_events_with_inheritance(
        &self,
        events: &[NotificationEvent],
        contact: &ContactData,
        trigger: &TriggerData,
        ancestor: &AncestorTarget,
    ) -> Result<(), SenderError> {
        let payload = EventsPayload {
            trigger,
            events,
            contact,
            throttled: false,
            need_ack: false,
            ancestor: Some(ancestor),
        };
        self.post(contact, &payload).await
    }
}
