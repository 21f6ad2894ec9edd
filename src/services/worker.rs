//! Supervised long-running tasks with a kill-then-wait shutdown.

use std::{future::Future, time::Duration};

use anyhow::Result;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub struct Worker {
    name: String,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Worker {
    /// Spawns `run` with a token cancelled either by `stop` or by `parent`.
    pub fn start<F, Fut>(name: &str, parent: &CancellationToken, run: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = parent.child_token();
        let handle = tokio::spawn(run(token.clone()));

        info!(worker = name, "Worker started");

        Self {
            name: name.to_string(),
            token,
            handle,
        }
    }

    pub async fn stop(self) {
        self.token.cancel();

        if let Err(e) = self.handle.await {
            error!(worker = %self.name, error = %e, "Worker terminated abnormally");
        } else {
            info!(worker = %self.name, "Worker stopped");
        }
    }
}

/// Runs `tick` every `period` until the token is cancelled. Failed cycles are
/// logged and the loop carries on.
pub async fn run_every<F, Fut>(name: &str, period: Duration, token: CancellationToken, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = tick().await {
                    error!(worker = name, error = %e, "Worker cycle failed");
                }
            }
        }
    }
}
