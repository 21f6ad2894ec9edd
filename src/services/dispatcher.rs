use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    clients::traits::Database,
    models::{
        notification::ScheduledNotification,
        package::{AncestorTarget, NotificationPackage},
        status::NotifierState,
    },
    services::{sender::SenderFanout, worker::run_every},
};

/// Drains due notifications and hands them to the sender fan-out.
pub struct NotificationDispatcher {
    database: Arc<dyn Database>,
    fanout: Arc<SenderFanout>,
}

impl NotificationDispatcher {
    pub fn new(database: Arc<dyn Database>, fanout: Arc<SenderFanout>) -> Self {
        Self { database, fanout }
    }

    /// Returns the number of packages dispatched.
    pub async fn process_notifications(&self, now: DateTime<Utc>) -> Result<usize> {
        let notifications = self.database.fetch_notifications(now.timestamp()).await?;
        if notifications.is_empty() {
            return Ok(0);
        }

        match self.database.get_notifier_state().await {
            Ok(NotifierState::Ok) => {}
            Ok(state) => {
                warn!(
                    state = state.as_str(),
                    count = notifications.len(),
                    "Notifier is not active, dropping due notifications"
                );
                return Ok(0);
            }
            Err(e) => {
                warn!(error = %e, "Failed to read notifier state, sending anyway");
            }
        }

        let count = notifications.len();
        let packages = build_packages(notifications);
        let dispatched = packages.len();

        for package in packages {
            self.fanout.send(package);
        }

        info!(notifications = count, packages = dispatched, "Notifications dispatched");
        Ok(dispatched)
    }

    pub async fn run(self: Arc<Self>, interval: Duration, token: CancellationToken) {
        run_every("notifications", interval, token, || {
            let dispatcher = Arc::clone(&self);
            async move {
                dispatcher.process_notifications(Utc::now()).await?;
                Ok(())
            }
        })
        .await;

        debug!("Notification dispatcher loop finished");
    }
}

fn package_key(notification: &ScheduledNotification) -> String {
    format!(
        "{}:{}:{}:{}:{}",
        notification.contact.kind,
        notification.contact.value,
        notification.trigger.id,
        notification.need_ack,
        notification.event.context.fingerprint()
    )
}

/// Coalesces notifications into packages. Triggers with parents also get one
/// package per ancestor holding only the events that ancestor covers, sent in
/// addition to the full package.
pub fn build_packages(notifications: Vec<ScheduledNotification>) -> Vec<NotificationPackage> {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut packages: Vec<NotificationPackage> = Vec::new();

    for notification in notifications {
        let key = package_key(&notification);

        let index = *positions.entry(key).or_insert_with(|| {
            let mut package = NotificationPackage::new(
                notification.trigger.clone(),
                notification.contact.clone(),
            );
            package.need_ack = notification.need_ack;
            packages.push(package);
            packages.len() - 1
        });

        let package = &mut packages[index];
        package.throttled |= notification.throttled;
        package.fail_count = package.fail_count.max(notification.send_fail);
        package.events.push(notification.event);
    }

    let mut ancestor_packages = Vec::new();
    for package in packages.iter().filter(|package| package.trigger.has_parents()) {
        let mut order: Vec<AncestorTarget> = Vec::new();
        let mut grouped: HashMap<AncestorTarget, Vec<_>> = HashMap::new();

        for event in &package.events {
            let (Some(trigger_id), Some(metric)) = (&event.ancestor_trigger_id, &event.ancestor_metric)
            else {
                continue;
            };

            let target = AncestorTarget {
                trigger_id: trigger_id.clone(),
                metric: metric.clone(),
            };
            if !grouped.contains_key(&target) {
                order.push(target.clone());
            }
            grouped.entry(target).or_default().push(event.clone());
        }

        for target in order {
            let events = grouped.remove(&target).unwrap_or_default();
            let mut ancestor_package = package.with_only(events);
            ancestor_package.ancestor = Some(target);
            ancestor_packages.push(ancestor_package);
        }
    }

    packages.extend(ancestor_packages);
    packages
}
