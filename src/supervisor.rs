//! Builds the notifier components and supervises their workers.
//!
//! Shutdown is ordered: event, escalation and self-state producers stop
//! first, then the dispatcher, and finally the sender fan-out drains its
//! in-flight deliveries within the configured budget.

use std::{path::Path, sync::Arc};

use anyhow::{Error, Result};
use chrono::Utc;
use tokio::{signal, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    api::run_api_server,
    clients::traits::{AncestorGraph, Database, SaturationService, Silencer},
    config::Config,
    senders::{SenderRegistry, load_sender_settings},
    services::{
        dispatcher::NotificationDispatcher,
        escalation::EscalationProcessor,
        events::{EventProcessor, run_delayed_event_fetcher, run_event_fetcher},
        resolver::{ContactResolver, MacroResolver},
        scheduler::Scheduler,
        self_state::SelfStateMonitor,
        sender::SenderFanout,
        silencer::SilentPatterns,
        worker::{Worker, run_every},
    },
};

pub struct Supervisor {
    config: Config,
    database: Arc<dyn Database>,
    graph: Arc<dyn AncestorGraph>,
    saturation: Option<Arc<dyn SaturationService>>,
    registry: SenderRegistry,
}

impl Supervisor {
    pub fn new(
        config: Config,
        database: Arc<dyn Database>,
        graph: Arc<dyn AncestorGraph>,
        saturation: Option<Arc<dyn SaturationService>>,
    ) -> Self {
        Self {
            config,
            database,
            graph,
            saturation,
            registry: SenderRegistry::with_defaults(),
        }
    }

    pub fn with_registry(mut self, registry: SenderRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Runs every worker until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), Error> {
        let database = Arc::clone(&self.database);
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&database)));

        let silencer = Arc::new(SilentPatterns::new(Arc::clone(&database)));
        if let Err(e) = silencer.refresh().await {
            warn!(error = %e, "Failed to load silent patterns, starting without them");
        }

        let resolver: Arc<dyn ContactResolver> = Arc::new(MacroResolver::new(Arc::clone(&database)));
        let fanout = Arc::new(SenderFanout::new(
            Arc::clone(&database),
            Arc::clone(&scheduler),
            resolver,
            Arc::clone(&silencer) as Arc<dyn Silencer>,
            self.config.sender_fanout_config(),
        ));

        if self.config.senders_file.is_empty() {
            warn!("No senders file configured, every notification will be rescheduled");
        } else {
            for settings in load_sender_settings(Path::new(&self.config.senders_file))? {
                let sender = self.registry.build(&settings)?;
                fanout.register_sender(&settings.contact_type, sender);
            }
        }

        let self_state_config = self.config.self_state_config()?;
        let self_state = if self_state_config.enabled {
            Some(Arc::new(SelfStateMonitor::new(
                Arc::clone(&database),
                Arc::clone(&fanout),
                self_state_config,
            )?))
        } else {
            None
        };

        let workers = CancellationToken::new();
        let mut producers = Vec::new();

        for with_saturations in [false, true] {
            let processor = Arc::new(EventProcessor::new(
                Arc::clone(&database),
                Arc::clone(&self.graph),
                self.saturation.clone(),
                Arc::clone(&scheduler),
                with_saturations,
            ));
            let suffix = if with_saturations { "-saturation" } else { "" };

            let (fetch_processor, fetch_database) = (Arc::clone(&processor), Arc::clone(&database));
            let poll_interval = self.config.event_poll_interval();
            producers.push(Worker::start(&format!("events{}", suffix), &workers, move |token| {
                run_event_fetcher(fetch_processor, fetch_database, poll_interval, token)
            }));

            let delayed_database = Arc::clone(&database);
            let delayed_interval = self.config.delayed_poll_interval();
            producers.push(Worker::start(
                &format!("delayed-events{}", suffix),
                &workers,
                move |token| run_delayed_event_fetcher(processor, delayed_database, delayed_interval, token),
            ));
        }

        let escalations = Arc::new(EscalationProcessor::new(Arc::clone(&database), Arc::clone(&fanout)));
        let escalation_interval = self.config.escalation_interval();
        producers.push(Worker::start("escalations", &workers, move |token| {
            escalations.run(escalation_interval, token)
        }));

        let refresh_interval = self.config.silencer_refresh_interval();
        let refreshed = Arc::clone(&silencer);
        producers.push(Worker::start("silent-patterns", &workers, move |token| async move {
            run_every("silent-patterns", refresh_interval, token, || {
                let silencer = Arc::clone(&refreshed);
                async move { silencer.refresh().await }
            })
            .await
        }));

        if let Some(monitor) = self_state {
            producers.push(Worker::start("self-state", &workers, move |token| monitor.run(token)));
        }

        let dispatcher = Arc::new(NotificationDispatcher::new(Arc::clone(&database), Arc::clone(&fanout)));
        let notification_interval = self.config.notification_interval();
        let dispatcher_worker = Worker::start("notifications", &workers, move |token| {
            dispatcher.run(notification_interval, token)
        });

        let api_shutdown = shutdown.clone();
        let api_database = Arc::clone(&database);
        let port = self.config.server_port;
        let api = tokio::spawn(async move {
            if let Err(e) = run_api_server(port, api_database, api_shutdown).await {
                error!(error = %e, "Health check server failed");
            }
        });

        info!(workers = producers.len() + 1, started_at = %Utc::now(), "Notifier started");

        shutdown.cancelled().await;
        info!("Shutting down notifier");

        for worker in producers {
            worker.stop().await;
        }
        dispatcher_worker.stop().await;

        if timeout(self.config.shutdown_timeout(), fanout.stop())
            .await
            .is_err()
        {
            warn!("Shutdown timeout reached, abandoning in-flight deliveries");
        }

        if let Err(e) = api.await {
            error!(error = %e, "Health check server task failed");
        }

        info!("Notifier stopped");
        Ok(())
    }
}

/// Cancels `token` on SIGINT or SIGTERM.
pub async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to register SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("SIGINT received, initiating graceful shutdown"),
        _ = terminate => info!("SIGTERM received, initiating graceful shutdown"),
    }

    token.cancel();
}
