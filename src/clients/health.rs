use std::{sync::Arc, time::Instant};

use tracing::{debug, warn};

use crate::{
    clients::traits::Database,
    models::{
        health::{HealthReport, NotifierHealth, StoreHealth},
        status::NotifierState,
    },
};

pub struct HealthChecker {
    database: Arc<dyn Database>,
}

impl HealthChecker {
    pub fn new(database: Arc<dyn Database>) -> Self {
        Self { database }
    }

    pub async fn check_all(&self) -> HealthReport {
        let store = self.check_store().await;
        let notifier = self.check_notifier().await;

        HealthReport::new(store, notifier)
    }

    async fn check_store(&self) -> StoreHealth {
        let start = Instant::now();

        match self.database.ping().await {
            Ok(_) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(response_time_ms = elapsed, "Store health check passed");
                StoreHealth::reachable(elapsed)
            }
            Err(e) => {
                warn!(error = %e, "Store health check failed");
                StoreHealth::unreachable(format!("Ping failed: {}", e))
            }
        }
    }

    async fn check_notifier(&self) -> NotifierHealth {
        match self.database.get_notifier_state().await {
            Ok(state @ NotifierState::Ok) => NotifierHealth::enabled(state.as_str()),
            Ok(state) => NotifierHealth::disabled(state.as_str()),
            Err(e) => {
                warn!(error = %e, "Failed to read notifier state");
                NotifierHealth::unknown(format!("Cannot read notifier state: {}", e))
            }
        }
    }
}
