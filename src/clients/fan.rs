use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    clients::traits::{FanProgress, SaturationService},
    config::Config,
    models::{event::NotificationEvent, trigger::TriggerData},
};

#[derive(Debug, Serialize)]
struct FanRequest<'a> {
    event: &'a NotificationEvent,
    trigger: &'a TriggerData,
}

#[derive(Debug, Deserialize)]
struct FanRequestResponse {
    request_id: String,
}

#[derive(Debug, Deserialize)]
struct FanProgressResponse {
    done: bool,

    #[serde(default)]
    notification_event: Option<NotificationEvent>,

    #[serde(default)]
    trigger_data: Option<TriggerData>,
}

/// HTTP client of the saturation ("fan") service.
pub struct FanClient {
    http_client: Client,
    base_url: String,
}

impl FanClient {
    pub fn new(config: &Config) -> Result<Self, Error> {
        Self::with_base_url(&config.fan_url, Duration::from_secs(config.fan_timeout_secs))
    }

    pub fn with_base_url(base_url: &str, timeout: Duration) -> Result<Self, Error> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|_| anyhow!("Failed to create HTTP client"))?;

        info!(base_url = %base_url, "Fan client initialized");

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl SaturationService for FanClient {
    async fn send_request(
        &self,
        event: &NotificationEvent,
        trigger: &TriggerData,
    ) -> Result<String> {
        let url = format!("{}/request", self.base_url);

        debug!(trigger_id = %trigger.id, metric = %event.metric, "Sending saturation request");

        let response = self
            .http_client
            .post(&url)
            .json(&FanRequest { event, trigger })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("Fan returned status {} on request", status));
        }

        let body: FanRequestResponse = response
            .json()
            .await
            .map_err(|e| anyhow!("Failed to parse fan response: {}", e))?;

        Ok(body.request_id)
    }

    async fn check_progress(&self, task_id: &str) -> Result<FanProgress> {
        let url = format!("{}/request", self.base_url);

        let response = self
            .http_client
            .get(&url)
            .query(&[("id", task_id)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("Fan returned status {} for task {}", status, task_id));
        }

        let body: FanProgressResponse = response
            .json()
            .await
            .map_err(|e| anyhow!("Failed to parse fan progress: {}", e))?;

        Ok(FanProgress {
            done: body.done,
            event: body.notification_event,
            trigger: body.trigger_data,
        })
    }
}
