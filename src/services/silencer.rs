use std::sync::{Arc, RwLock};

use anyhow::Result;
use tracing::debug;

use crate::clients::traits::{Database, SilencedPatternSnapshot, Silencer};

/// In-memory snapshot of silenced metrics and tags, refreshed from the store.
pub struct SilentPatterns {
    database: Arc<dyn Database>,
    patterns: RwLock<SilencedPatternSnapshot>,
}

impl SilentPatterns {
    pub fn new(database: Arc<dyn Database>) -> Self {
        Self {
            database,
            patterns: RwLock::new(SilencedPatternSnapshot::default()),
        }
    }

    pub async fn refresh(&self) -> Result<()> {
        let patterns = self.database.get_silent_patterns().await?;

        debug!(
            metrics = patterns.metrics.len(),
            tags = patterns.tags.len(),
            "Silent patterns refreshed"
        );

        *self.patterns.write().unwrap_or_else(|e| e.into_inner()) = patterns;
        Ok(())
    }
}

impl Silencer for SilentPatterns {
    fn is_metric_silenced(&self, metric: &str, timestamp: i64) -> bool {
        let patterns = self.patterns.read().unwrap_or_else(|e| e.into_inner());
        patterns
            .metrics
            .get(metric)
            .is_some_and(|until| *until >= timestamp)
    }

    fn is_tags_silenced(&self, tags: &[String], timestamp: i64) -> bool {
        let patterns = self.patterns.read().unwrap_or_else(|e| e.into_inner());
        tags.iter().any(|tag| {
            patterns
                .tags
                .get(tag)
                .is_some_and(|until| *until >= timestamp)
        })
    }
}
