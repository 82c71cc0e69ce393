//! Per-source tick scheduling and background store maintenance.

use crate::config::AppConfig;
use crate::scrape::ScraperEngine;
use crate::store::ScrapeStore;
use crate::telemetry::Telemetry;
use crate::timeutil::{self, TimeError};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub struct Scheduler {
    config: Arc<AppConfig>,
    engine: Arc<ScraperEngine>,
    store: Arc<dyn ScrapeStore>,
    telemetry: Arc<Telemetry>,
}

impl Scheduler {
    pub fn new(
        config: Arc<AppConfig>,
        engine: Arc<ScraperEngine>,
        store: Arc<dyn ScrapeStore>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            config,
            engine,
            store,
            telemetry,
        }
    }

    /// Spawn one tick task per source plus the fingerprint GC loop. The
    /// first tick of every source fires immediately.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> Result<Vec<JoinHandle<()>>, TimeError> {
        let mut handles = Vec::new();

        for source in &self.config.sources {
            let period = timeutil::parse_frequency(&source.frequency)?
                .to_std()
                .map_err(|_| TimeError::InvalidFrequency(source.frequency.clone()))?;
            tracing::info!(
                source = %source.name,
                period_seconds = period.as_secs(),
                "scheduling source"
            );
            let engine = self.engine.clone();
            let source = source.clone();
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            engine.scrape_source(&source).await;
                        }
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
                tracing::info!(source = %source.name, "tick task stopped");
            }));
        }

        handles.push(self.spawn_gc_loop(shutdown));
        Ok(handles)
    }

    fn spawn_gc_loop(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let store = self.store.clone();
        let telemetry = self.telemetry.clone();
        let store_cfg = self.config.scraper.fingerprint_store.clone();
        let period = std::time::Duration::from_secs(store_cfg.cleanup_interval_seconds.max(1));
        tokio::spawn(async move {
            let backend = store_cfg.backend.as_str();
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The immediate first tick would duplicate the startup GC.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let started = Instant::now();
                        match store.gc_expired().await {
                            Ok(removed) => {
                                telemetry.record_cleanup(
                                    "fingerprint_cleanup",
                                    backend,
                                    started.elapsed().as_secs_f64(),
                                    Some(removed),
                                );
                                tracing::debug!(removed, "fingerprint cleanup cycle done");
                            }
                            Err(e) => {
                                telemetry.record_cleanup(
                                    "fingerprint_cleanup",
                                    backend,
                                    started.elapsed().as_secs_f64(),
                                    None,
                                );
                                tracing::warn!(error = %e, "fingerprint cleanup failed");
                            }
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("cleanup task stopped");
        })
    }
}
