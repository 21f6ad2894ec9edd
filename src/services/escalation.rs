use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    clients::traits::Database,
    models::{
        contact::ContactData, escalation::EscalationEvent, package::NotificationPackage,
        status::State,
    },
    services::{sender::SenderFanout, worker::run_every},
};

/// Fires follow-up notifications for alerts nobody acknowledged in time.
pub struct EscalationProcessor {
    database: Arc<dyn Database>,
    fanout: Arc<SenderFanout>,
}

enum Decision {
    Skip,
    Send,
    SendAndAck(PendingAck),
}

#[derive(Debug, Clone, PartialEq)]
struct PendingAck {
    trigger_id: String,
    metric: String,
    resolved: bool,
}

impl EscalationProcessor {
    pub fn new(database: Arc<dyn Database>, fanout: Arc<SenderFanout>) -> Self {
        Self { database, fanout }
    }

    pub async fn process_escalations(&self, now: DateTime<Utc>) -> Result<usize> {
        let escalations = self.database.fetch_escalations(now.timestamp()).await?;
        if escalations.is_empty() {
            return Ok(0);
        }

        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut packages: Vec<NotificationPackage> = Vec::new();
        let mut acks: Vec<PendingAck> = Vec::new();

        for escalation in escalations {
            match self.accept(&escalation).await {
                Decision::Skip => continue,
                Decision::Send => {}
                Decision::SendAndAck(ack) => {
                    if !acks.contains(&ack) {
                        acks.push(ack);
                    }
                }
            }

            let contacts = match self.database.get_contacts(&escalation.escalation.contacts).await {
                Ok(contacts) => contacts,
                Err(e) => {
                    warn!(
                        escalation_id = %escalation.escalation.id,
                        error = %e,
                        "Failed to load escalation contacts"
                    );
                    continue;
                }
            };

            for contact in contacts {
                add_to_package(&mut positions, &mut packages, &escalation, contact);
            }
        }

        let dispatched = packages.len();
        for package in packages {
            self.fanout.send(package);
        }

        for ack in acks {
            if let Err(e) = self
                .database
                .ack_escalations(&ack.trigger_id, &ack.metric, ack.resolved)
                .await
            {
                warn!(
                    trigger_id = %ack.trigger_id,
                    metric = %ack.metric,
                    error = %e,
                    "Failed to acknowledge escalations"
                );
            }
        }

        info!(packages = dispatched, "Escalations dispatched");
        Ok(dispatched)
    }

    async fn accept(&self, escalation: &EscalationEvent) -> Decision {
        let trigger_id = escalation.event.trigger_id.as_str();
        let metric = escalation.event.metric.as_str();
        let escalation_id = escalation.escalation.id.as_str();

        match self.database.has_pending_escalations(trigger_id, metric).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(trigger_id, metric, escalation_id, "No pending escalations, skipping");
                return Decision::Skip;
            }
            Err(e) => {
                warn!(trigger_id, metric, error = %e, "Failed to check pending escalations");
                return Decision::Skip;
            }
        }

        if escalation.is_resolution {
            match self
                .database
                .is_escalation_processed(trigger_id, metric, escalation_id)
                .await
            {
                Ok(true) => {}
                Ok(false) => return Decision::Skip,
                Err(e) => {
                    warn!(trigger_id, metric, error = %e, "Failed to check processed escalation");
                    return Decision::Skip;
                }
            }

            return Decision::SendAndAck(PendingAck {
                trigger_id: trigger_id.to_string(),
                metric: metric.to_string(),
                resolved: true,
            });
        }

        match self.database.get_trigger_last_check(trigger_id).await {
            Ok(Some(check)) => {
                if check
                    .metrics
                    .get(metric)
                    .is_some_and(|state| state.state == State::Ok)
                {
                    debug!(trigger_id, metric, escalation_id, "Metric recovered, skipping escalation");
                    return Decision::Skip;
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(trigger_id, error = %e, "Failed to read last check, escalating anyway");
            }
        }

        if let Err(e) = self
            .database
            .register_processed_escalation(trigger_id, metric, escalation_id)
            .await
        {
            warn!(trigger_id, metric, escalation_id, error = %e, "Failed to register escalation");
        }

        if escalation.is_final {
            Decision::SendAndAck(PendingAck {
                trigger_id: trigger_id.to_string(),
                metric: metric.to_string(),
                resolved: false,
            })
        } else {
            Decision::Send
        }
    }

    pub async fn run(self: Arc<Self>, interval: Duration, token: CancellationToken) {
        run_every("escalations", interval, token, || {
            let processor = Arc::clone(&self);
            async move {
                processor.process_escalations(Utc::now()).await?;
                Ok(())
            }
        })
        .await;
    }
}

fn add_to_package(
    positions: &mut HashMap<String, usize>,
    packages: &mut Vec<NotificationPackage>,
    escalation: &EscalationEvent,
    contact: ContactData,
) {
    let key = format!(
        "{}:{}:{}:{}",
        contact.kind,
        contact.value,
        escalation.trigger.id,
        escalation.event.context.fingerprint()
    );

    let index = match positions.get(&key) {
        Some(&index) => index,
        None => {
            let mut package = NotificationPackage::new(escalation.trigger.clone(), contact);
            package.need_ack = !escalation.is_resolution && escalation.event.state.needs_ack();
            packages.push(package);
            positions.insert(key, packages.len() - 1);
            packages.len() - 1
        }
    };

    let package = &mut packages[index];
    let identity = escalation.event.identity();
    if !package.events.iter().any(|event| event.identity() == identity) {
        package.events.push(escalation.event.clone());
    }
}
