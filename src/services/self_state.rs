//! Watches liveness counters and alerts administrators when the pipeline
//! looks stalled.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    clients::traits::Database,
    config::SelfStateConfig,
    models::{
        event::NotificationEvent, package::NotificationPackage, status::State,
        trigger::TriggerData,
    },
    services::sender::SenderFanout,
};

const NOTICE_LOCK: &str = "selfstate-notice";
const SELF_STATE_TRIGGER_ID: &str = "notifier-self-state";

#[derive(Debug, Error, PartialEq)]
pub enum SelfStateError {
    #[error("self state contact {contact_id} has unregistered type {contact_type}")]
    UnknownContactType {
        contact_id: String,
        contact_type: String,
    },
}

/// Last observed counters and the time each one last moved.
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatState {
    pub last_successful_check: i64,
    pub last_metric_received: i64,
    pub metrics_count: i64,
    pub last_check_performed: i64,
    pub checks_count: i64,
    pub last_alert: i64,
}

impl HeartbeatState {
    pub fn new(now: i64) -> Self {
        Self {
            last_successful_check: now,
            last_metric_received: now,
            metrics_count: 0,
            last_check_performed: now,
            checks_count: 0,
            last_alert: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct Problem {
    metric: &'static str,
    message: String,
    elapsed: i64,
}

pub struct SelfStateMonitor {
    database: Arc<dyn Database>,
    fanout: Arc<SenderFanout>,
    config: SelfStateConfig,
}

impl SelfStateMonitor {
    /// Fails if any admin contact has no registered sender.
    pub fn new(
        database: Arc<dyn Database>,
        fanout: Arc<SenderFanout>,
        config: SelfStateConfig,
    ) -> Result<Self, SelfStateError> {
        for contact in &config.contacts {
            if !fanout.has_sender(&contact.kind) {
                return Err(SelfStateError::UnknownContactType {
                    contact_id: contact.id.clone(),
                    contact_type: contact.kind.clone(),
                });
            }
        }

        Ok(Self {
            database,
            fanout,
            config,
        })
    }

    /// Runs one heartbeat cycle. Returns whether a notice was sent.
    pub async fn check(&self, now: i64, state: &mut HeartbeatState) -> bool {
        let metrics = self.database.get_metrics_updates_count().await;
        let checks = self.database.get_checks_updates_count().await;

        let store_reachable = match (metrics, checks) {
            (Ok(metrics_count), Ok(checks_count)) => {
                state.last_successful_check = now;
                if metrics_count != state.metrics_count {
                    state.metrics_count = metrics_count;
                    state.last_metric_received = now;
                }
                if checks_count != state.checks_count {
                    state.checks_count = checks_count;
                    state.last_check_performed = now;
                }
                true
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "Failed to read liveness counters");
                false
            }
        };

        let problems = self.detect_problems(now, store_reachable, state);
        if problems.is_empty() {
            return false;
        }

        if now - state.last_alert < self.config.notice_interval_secs {
            debug!(problems = problems.len(), "Self state notice is cooling down");
            return false;
        }

        let ttl = Duration::from_secs(self.config.notice_interval_secs.max(1) as u64);
        match self.database.acquire_lock(NOTICE_LOCK, ttl).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Self state notice already sent by another instance");
                state.last_alert = now;
                return false;
            }
            Err(e) => {
                warn!(error = %e, "Failed to acquire self state lock, notifying anyway");
            }
        }

        state.last_alert = now;
        self.notify(now, &problems);
        true
    }

    fn detect_problems(
        &self,
        now: i64,
        store_reachable: bool,
        state: &HeartbeatState,
    ) -> Vec<Problem> {
        let mut problems = Vec::new();

        let disconnected = now - state.last_successful_check;
        if disconnected > self.config.redis_disconnect_delay_secs {
            problems.push(Problem {
                metric: "redis-disconnected",
                message: format!("Redis disconnected for {} seconds", disconnected),
                elapsed: disconnected,
            });
        }

        if !store_reachable {
            return problems;
        }

        let metrics_silence = now - state.last_metric_received;
        if metrics_silence > self.config.last_metric_received_delay_secs {
            problems.push(Problem {
                metric: "metrics-not-received",
                message: format!("No metrics received for {} seconds", metrics_silence),
                elapsed: metrics_silence,
            });
        }

        let checks_silence = now - state.last_check_performed;
        if checks_silence > self.config.last_check_delay_secs {
            problems.push(Problem {
                metric: "checks-not-performed",
                message: format!("No checks performed for {} seconds", checks_silence),
                elapsed: checks_silence,
            });
        }

        problems
    }

    fn notify(&self, now: i64, problems: &[Problem]) {
        let trigger = TriggerData {
            id: SELF_STATE_TRIGGER_ID.to_string(),
            name: "Notifier health check".to_string(),
            ..Default::default()
        };

        let events: Vec<NotificationEvent> = problems
            .iter()
            .map(|problem| NotificationEvent {
                trigger_id: SELF_STATE_TRIGGER_ID.to_string(),
                metric: problem.metric.to_string(),
                state: State::Error,
                old_state: State::Ok,
                timestamp: now,
                value: Some(problem.elapsed as f64),
                message: Some(problem.message.clone()),
                ..Default::default()
            })
            .collect();

        for problem in problems {
            error!(metric = problem.metric, elapsed = problem.elapsed, "{}", problem.message);
        }

        for contact in &self.config.contacts {
            let mut package =
                NotificationPackage::new(trigger.clone(), contact.clone()).with_events(events.clone());
            package.dont_resend = true;
            self.fanout.send(package);
        }

        info!(
            problems = problems.len(),
            contacts = self.config.contacts.len(),
            "Self state notice sent"
        );
    }

    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut state = HeartbeatState::new(Utc::now().timestamp());
        let mut interval = tokio::time::interval(self.config.check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    self.check(Utc::now().timestamp(), &mut state).await;
                }
            }
        }

        debug!("Self state monitor loop finished");
    }
}
