use std::{process::Stdio, time::Duration};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::{io::AsyncWriteExt, process::Command, time::timeout};
use tracing::{debug, info, warn};

use crate::{
    models::{contact::ContactData, event::NotificationEvent, trigger::TriggerData},
    senders::{EventsPayload, Sender, SenderError, render_contact_template},
};

#[derive(Debug, Clone, Deserialize)]
struct ScriptSettings {
    exec: String,

    #[serde(default = "default_timeout_secs")]
    timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

/// Runs a local executable with the events as JSON on stdin.
pub struct ScriptSender {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ScriptSender {
    pub fn init(settings: &Value) -> Result<Self, Error> {
        let settings: ScriptSettings = serde_json::from_value(settings.clone())
            .map_err(|e| anyhow!("Invalid script settings: {}", e))?;

        let mut parts = settings.exec.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| anyhow!("Script exec is required"))?;

        info!(program = %program, "Script sender initialized");

        Ok(Self {
            program,
            args: parts.collect(),
            timeout: Duration::from_secs(settings.timeout_secs),
        })
    }
}

#[async_trait]
impl Sender for ScriptSender {
    async fn send_events(
        &self,
        events: &[NotificationEvent],
        contact: &ContactData,
        trigger: &TriggerData,
        throttled: bool,
        need_ack: bool,
    ) -> Result<(), SenderError> {
        let payload = serde_json::to_vec(&EventsPayload {
            trigger,
            events,
            contact,
            throttled,
            need_ack,
            ancestor: None,
        })
        .map_err(|e| SenderError::Fatal(format!("failed to encode payload: {}", e)))?;

        let args: Vec<String> = self
            .args
            .iter()
            .map(|arg| render_contact_template(arg, contact))
            .collect();

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SenderError::Fatal(format!("failed to run {}: {}", self.program, e)))?;

        let stdin = child.stdin.take();
        let run = async {
            // stdin is closed before waiting so the script sees EOF.
            if let Some(mut stdin) = stdin {
                stdin.write_all(&payload).await.map_err(|e| {
                    warn!(program = %self.program, error = %e, "Failed to write script input");
                    SenderError::Retryable(format!("failed to write input of {}: {}", self.program, e))
                })?;
            }

            let output = child
                .wait_with_output()
                .await
                .map_err(|e| SenderError::Retryable(format!("failed to wait for {}: {}", self.program, e)))?;
            Ok::<_, SenderError>(output)
        };

        let output = timeout(self.timeout, run).await.map_err(|_| {
            SenderError::Retryable(format!("{} timed out after {:?}", self.program, self.timeout))
        })??;

        if output.status.success() {
            debug!(program = %self.program, events = events.len(), "Script delivered");
            Ok(())
        } else {
            Err(SenderError::Retryable(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}
