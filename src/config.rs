use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use dotenvy::dotenv;
use serde::Deserialize;

use crate::models::{contact::ContactData, retry::RetryConfig};

#[derive(Clone, Deserialize, Debug)]
pub struct Config {
    pub redis_url: String,

    #[serde(default = "default_poll_interval_ms")]
    pub event_poll_interval_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub delayed_poll_interval_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub notification_interval_ms: u64,
    #[serde(default = "default_escalation_interval_ms")]
    pub escalation_interval_ms: u64,

    #[serde(default = "default_sending_timeout_secs")]
    pub sending_timeout_secs: u64,
    #[serde(default = "default_resending_timeout_secs")]
    pub resending_timeout_secs: u64,
    #[serde(default = "default_sender_queue_capacity")]
    pub sender_queue_capacity: usize,

    #[serde(default)]
    pub fan_url: String,
    #[serde(default = "default_fan_timeout_secs")]
    pub fan_timeout_secs: u64,

    #[serde(default)]
    pub senders_file: String,

    #[serde(default)]
    pub self_state_enabled: bool,
    #[serde(default = "default_self_state_check_interval_secs")]
    pub self_state_check_interval_secs: u64,
    #[serde(default = "default_redis_disconnect_delay_secs")]
    pub redis_disconnect_delay_secs: i64,
    #[serde(default = "default_last_metric_received_delay_secs")]
    pub last_metric_received_delay_secs: i64,
    #[serde(default = "default_last_check_delay_secs")]
    pub last_check_delay_secs: i64,
    #[serde(default = "default_notice_interval_secs")]
    pub notice_interval_secs: i64,
    #[serde(default = "default_self_state_contacts")]
    pub self_state_contacts: String,

    #[serde(default = "default_silencer_refresh_interval_secs")]
    pub silencer_refresh_interval_secs: u64,

    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    #[serde(default = "default_server_port")]
    pub server_port: u16,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_escalation_interval_ms() -> u64 {
    5000
}

fn default_sending_timeout_secs() -> u64 {
    20
}

fn default_resending_timeout_secs() -> u64 {
    24 * 60 * 60
}

fn default_sender_queue_capacity() -> usize {
    128
}

fn default_fan_timeout_secs() -> u64 {
    10
}

fn default_self_state_check_interval_secs() -> u64 {
    10
}

fn default_redis_disconnect_delay_secs() -> i64 {
    30
}

fn default_last_metric_received_delay_secs() -> i64 {
    60
}

fn default_last_check_delay_secs() -> i64 {
    120
}

fn default_notice_interval_secs() -> i64 {
    300
}

fn default_self_state_contacts() -> String {
    "[]".to_string()
}

fn default_silencer_refresh_interval_secs() -> u64 {
    5
}

fn default_shutdown_timeout_secs() -> u64 {
    5
}

fn default_server_port() -> u16 {
    8080
}

/// Settings for the per-channel sender queues.
#[derive(Debug, Clone)]
pub struct SenderFanoutConfig {
    pub sending_timeout: Duration,
    pub resending_timeout: Duration,
    pub queue_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct SelfStateConfig {
    pub enabled: bool,
    pub check_interval: Duration,
    pub redis_disconnect_delay_secs: i64,
    pub last_metric_received_delay_secs: i64,
    pub last_check_delay_secs: i64,
    pub notice_interval_secs: i64,
    pub contacts: Vec<ContactData>,
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        dotenv().ok();

        let config = envy::from_env::<Self>()
            .map_err(|e| anyhow!("Invalid or missing environmental variable: {}", e))?;
        Ok(config)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::default()
    }

    pub fn event_poll_interval(&self) -> Duration {
        Duration::from_millis(self.event_poll_interval_ms)
    }

    pub fn delayed_poll_interval(&self) -> Duration {
        Duration::from_millis(self.delayed_poll_interval_ms)
    }

    pub fn notification_interval(&self) -> Duration {
        Duration::from_millis(self.notification_interval_ms)
    }

    pub fn escalation_interval(&self) -> Duration {
        Duration::from_millis(self.escalation_interval_ms)
    }

    pub fn silencer_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.silencer_refresh_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn fan_enabled(&self) -> bool {
        !self.fan_url.is_empty()
    }

    pub fn sender_fanout_config(&self) -> SenderFanoutConfig {
        SenderFanoutConfig {
            sending_timeout: Duration::from_secs(self.sending_timeout_secs),
            resending_timeout: Duration::from_secs(self.resending_timeout_secs),
            queue_capacity: self.sender_queue_capacity,
        }
    }

    pub fn self_state_config(&self) -> Result<SelfStateConfig, Error> {
        let contacts = serde_json::from_str::<Vec<ContactData>>(&self.self_state_contacts)
            .map_err(|e| anyhow!("Invalid self state contacts: {}", e))?;

        Ok(SelfStateConfig {
            enabled: self.self_state_enabled,
            check_interval: Duration::from_secs(self.self_state_check_interval_secs),
            redis_disconnect_delay_secs: self.redis_disconnect_delay_secs,
            last_metric_received_delay_secs: self.last_metric_received_delay_secs,
            last_check_delay_secs: self.last_check_delay_secs,
            notice_interval_secs: self.notice_interval_secs,
            contacts,
        })
    }
}
