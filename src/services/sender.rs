//! Per-channel outbound queues and the resend loop.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use chrono::Utc;
use futures_util::future::join_all;
use tokio::{sync::mpsc, time::timeout};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::{
    clients::traits::{Database, Silencer},
    config::SenderFanoutConfig,
    models::package::NotificationPackage,
    senders::{Sender, SenderError},
    services::{
        resolver::ContactResolver,
        scheduler::{Scheduler, calculate_backoff},
    },
};

struct FanoutCore {
    database: Arc<dyn Database>,
    scheduler: Arc<Scheduler>,
    resolver: Arc<dyn ContactResolver>,
    silencer: Arc<dyn Silencer>,
    config: SenderFanoutConfig,
}

pub struct SenderFanout {
    core: Arc<FanoutCore>,
    queues: RwLock<HashMap<String, mpsc::Sender<NotificationPackage>>>,
    tracker: TaskTracker,
}

impl SenderFanout {
    pub fn new(
        database: Arc<dyn Database>,
        scheduler: Arc<Scheduler>,
        resolver: Arc<dyn ContactResolver>,
        silencer: Arc<dyn Silencer>,
        config: SenderFanoutConfig,
    ) -> Self {
        Self {
            core: Arc::new(FanoutCore {
                database,
                scheduler,
                resolver,
                silencer,
                config,
            }),
            queues: RwLock::new(HashMap::new()),
            tracker: TaskTracker::new(),
        }
    }

    /// Starts the queue worker delivering contacts of `contact_type`.
    pub fn register_sender(&self, contact_type: &str, sender: Arc<dyn Sender>) {
        let (tx, mut rx) = mpsc::channel::<NotificationPackage>(self.core.config.queue_capacity);

        self.queues
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(contact_type.to_string(), tx);

        let core = Arc::clone(&self.core);
        let tracker = self.tracker.clone();
        let name = contact_type.to_string();

        self.tracker.spawn(async move {
            while let Some(package) = rx.recv().await {
                let core = Arc::clone(&core);
                let sender = Arc::clone(&sender);
                tracker.spawn(async move { core.deliver(sender, package).await });
            }
            debug!(contact_type = %name, "Sender queue closed");
        });

        info!(contact_type, "Sender registered");
    }

    pub fn has_sender(&self, contact_type: &str) -> bool {
        self.queues
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(contact_type)
    }

    /// Hands a package to its channel queue in the background.
    pub fn send(&self, package: NotificationPackage) {
        let queue = self
            .queues
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&package.contact.kind)
            .cloned();
        let core = Arc::clone(&self.core);

        match queue {
            Some(queue) => {
                self.tracker.spawn(async move { core.enqueue(queue, package).await });
            }
            None => {
                self.tracker
                    .spawn(async move { core.resend(package, "unknown contact type").await });
            }
        }
    }

    /// Closes every queue and waits for in-flight deliveries.
    pub async fn stop(&self) {
        self.queues
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();

        self.tracker.close();
        self.tracker.wait().await;

        info!("Sender fan-out stopped");
    }
}

impl FanoutCore {
    async fn enqueue(&self, queue: mpsc::Sender<NotificationPackage>, mut package: NotificationPackage) {
        let tags = &package.trigger.tags;
        let silencer = &self.silencer;

        package.events.retain(|event| {
            let silenced = silencer.is_metric_silenced(&event.metric, event.timestamp)
                || silencer.is_tags_silenced(tags, event.timestamp);
            if silenced {
                debug!(
                    trigger_id = %event.trigger_id,
                    metric = %event.metric,
                    "Event is silenced"
                );
            }
            !silenced
        });

        if package.is_empty() {
            debug!(trigger_id = %package.trigger.id, "Every event is silenced, dropping package");
            return;
        }

        match timeout(self.config.sending_timeout, queue.reserve()).await {
            Ok(Ok(permit)) => permit.send(package),
            Ok(Err(_)) => self.resend(package, "sender queue closed").await,
            Err(_) => self.resend(package, "sender queue timeout").await,
        }
    }

    async fn deliver(&self, sender: Arc<dyn Sender>, mut package: NotificationPackage) {
        let inherited = sender.supports_inheritance();
        if !inherited {
            package.events.retain(|event| !event.is_force_sent);
        } else if package.ancestor.is_none() {
            package.events.retain(|event| !event.overridden_by_ancestor);
        }

        if package.is_empty() {
            return;
        }

        let resolved = match self
            .resolver
            .unwrap_contact(&package.contact, &package.events)
            .await
        {
            Ok(resolved) => resolved,
            Err(e) if e.is_retryable() => {
                let reason = e.to_string();
                self.resend(package, &reason).await;
                return;
            }
            Err(e) => {
                warn!(
                    contact_id = %package.contact.id,
                    trigger_id = %package.trigger.id,
                    error = %e,
                    "Failed to resolve contact, dropping package"
                );
                return;
            }
        };

        let now = Utc::now();
        let package = &package;
        let attempts = resolved.into_iter().map(|target| {
            let sender = Arc::clone(&sender);
            async move {
                let mut contact = package.contact.clone();
                contact.value = target.replaced_value.clone();

                let result = if target.expiration.is_some_and(|expiration| expiration < now) {
                    Err(SenderError::Retryable(format!(
                        "resolved contact {} has expired",
                        target.replaced_value
                    )))
                } else if let Some(ancestor) = package.ancestor.as_ref().filter(|_| inherited) {
                    sender
                        .send_events_with_inheritance(&package.events, &contact, &package.trigger, ancestor)
                        .await
                } else {
                    sender
                        .send_events(
                            &package.events,
                            &contact,
                            &package.trigger,
                            package.throttled,
                            package.need_ack,
                        )
                        .await
                };

                (target, result)
            }
        });

        for (target, result) in join_all(attempts).await {
            match result {
                Ok(()) => {
                    debug!(
                        contact_type = %package.contact.kind,
                        contact_value = %target.replaced_value,
                        trigger_id = %package.trigger.id,
                        events = package.events.len(),
                        "Notification sent"
                    );
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        contact_value = %target.replaced_value,
                        trigger_id = %package.trigger.id,
                        error = %e,
                        "Failed to send notification, resending"
                    );

                    let mut failed = package.clone();
                    failed.contact.value = target.rollback_value;
                    self.resend(failed, &e.to_string()).await;
                }
                Err(e) => {
                    error!(
                        contact_value = %target.replaced_value,
                        trigger_id = %package.trigger.id,
                        error = %e,
                        "Failed to send notification, dropping"
                    );
                }
            }
        }
    }

    async fn resend(&self, mut package: NotificationPackage, reason: &str) {
        if package.dont_resend {
            warn!(
                contact_type = %package.contact.kind,
                trigger_id = %package.trigger.id,
                reason,
                "Package is not resendable, dropping"
            );
            return;
        }

        package.fail_count += 1;
        let backoff = calculate_backoff(package.fail_count);
        if backoff > self.config.resending_timeout {
            error!(
                contact_id = %package.contact.id,
                trigger_id = %package.trigger.id,
                fail_count = package.fail_count,
                reason,
                "Stop resending package"
            );
            return;
        }

        let now = Utc::now();
        let mut notifications = Vec::with_capacity(package.events.len());
        for event in &package.events {
            notifications.push(
                self.scheduler
                    .schedule_retry(
                        now,
                        event.clone(),
                        package.trigger.clone(),
                        package.contact.clone(),
                        package.throttled,
                        package.fail_count,
                        package.need_ack,
                    )
                    .await,
            );
        }

        match self.database.add_notifications(&notifications).await {
            Ok(()) => info!(
                contact_id = %package.contact.id,
                trigger_id = %package.trigger.id,
                fail_count = package.fail_count,
                reason,
                "Package rescheduled"
            ),
            Err(e) => error!(
                contact_id = %package.contact.id,
                trigger_id = %package.trigger.id,
                error = %e,
                "Failed to reschedule package"
            ),
        }
    }
}
