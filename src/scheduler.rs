//! Pipeline Scheduler
//!
//! Drives one polling loop per enabled feed source, each on its own cadence.
//! Two semaphore pools bound the expensive stages independently: feed fetches
//! against remote servers, and analyses against the LLM backend. A saturated
//! analysis pool delays cycle completion instead of dropping records.
//!
//! The stop signal is observed at every await point, including inside a
//! running cycle; a raised signal aborts in-flight work immediately.
//! Documents not yet committed when it fires are simply dropped, because
//! ingestion is idempotent against re-fetched content.
//!
//! A config reload stops the current loops at a safe point and respawns them
//! with the new feed set; pool sizes are fixed at construction.

use crate::alerts::AlertSink;
use crate::analysis::{AnalysisOrchestrator, Summarizer};
use crate::config::{FeedSource, PipelineConfig};
use crate::extractor::ExtractionWorker;
use crate::fetcher::FetchFeed;
use crate::ingest::{IngestOutcome, IngestionCoordinator};
use crate::store::ThreatStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub cycles: AtomicU64,
    pub fetch_failures: AtomicU64,
    pub documents: AtomicU64,
}

/// Shared pipeline stages, one instance across all source loops.
struct Core {
    fetcher: Arc<dyn FetchFeed>,
    extractor: ExtractionWorker,
    coordinator: IngestionCoordinator,
    orchestrator: AnalysisOrchestrator,
    fetch_pool: Arc<Semaphore>,
    analysis_pool: Arc<Semaphore>,
    stats: SchedulerStats,
}

impl Core {
    /// One full cycle for one source: fetch, extract, ingest, and analyze
    /// whatever is new. Duplicate documents stop at the ingest stage and
    /// never reach the analysis pool. A raised stop signal aborts the cycle
    /// at the next await point, abandoning in-flight and not-yet-committed
    /// work.
    async fn run_cycle(&self, source: &FeedSource, stop: &mut watch::Receiver<bool>) {
        self.stats.cycles.fetch_add(1, Ordering::Relaxed);

        let documents = {
            let _permit = tokio::select! {
                permit = self.fetch_pool.acquire() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
                _ = wait_for_stop(stop) => return,
            };
            let fetched = tokio::select! {
                fetched = self.fetcher.fetch(source) => fetched,
                _ = wait_for_stop(stop) => return,
            };
            match fetched {
                Ok(documents) => documents,
                Err(e) => {
                    self.stats.fetch_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(source = %source.name, error = %e, "fetch cycle failed");
                    return;
                }
            }
        };

        self.stats
            .documents
            .fetch_add(documents.len() as u64, Ordering::Relaxed);

        for document in documents {
            if *stop.borrow() {
                return;
            }
            let draft = self.extractor.extract(document);
            let record = match self.coordinator.ingest(draft).await {
                Ok(IngestOutcome::Created(record)) => record,
                Ok(IngestOutcome::Skipped(_)) => continue,
                Err(e) => {
                    error!(source = %source.name, error = %e, "ingest failed");
                    continue;
                }
            };

            let _permit = tokio::select! {
                permit = self.analysis_pool.acquire() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
                _ = wait_for_stop(stop) => return,
            };
            tokio::select! {
                result = self.orchestrator.analyze(&record) => {
                    if let Err(e) = result {
                        error!(threat_id = %record.id, error = %e, "analysis failed");
                    }
                }
                _ = wait_for_stop(stop) => return,
            }
        }
    }

    /// Re-analyze fallback records, one analysis-pool permit per record so
    /// the pass competes with regular cycles instead of exceeding the bound.
    /// Returns how many records were re-submitted.
    async fn run_reanalysis_pass(&self, stop: &mut watch::Receiver<bool>) -> usize {
        let failed = match self.orchestrator.failed_threats().await {
            Ok(failed) => failed,
            Err(e) => {
                error!(error = %e, "re-analysis pass failed");
                return 0;
            }
        };

        let mut count = 0;
        for record in failed {
            if *stop.borrow() {
                break;
            }
            let _permit = tokio::select! {
                permit = self.analysis_pool.acquire() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = wait_for_stop(stop) => break,
            };
            tokio::select! {
                result = self.orchestrator.analyze(&record) => match result {
                    Ok(_) => count += 1,
                    Err(e) => {
                        error!(threat_id = %record.id, error = %e, "re-analysis failed")
                    }
                },
                _ = wait_for_stop(stop) => break,
            }
        }
        count
    }
}

/// Loops spawned for one configuration; replaced wholesale on reload.
struct Generation {
    stop: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

pub struct PipelineScheduler {
    core: Arc<Core>,
    feeds: parking_lot::Mutex<Vec<FeedSource>>,
    reanalyze_interval: parking_lot::Mutex<Duration>,
    generation: Mutex<Option<Generation>>,
}

impl PipelineScheduler {
    pub fn new(
        config: &PipelineConfig,
        fetcher: Arc<dyn FetchFeed>,
        store: Arc<dyn ThreatStore>,
        summarizer: Arc<dyn Summarizer>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let core = Core {
            fetcher,
            extractor: ExtractionWorker::new(),
            coordinator: IngestionCoordinator::new(store.clone()),
            orchestrator: AnalysisOrchestrator::new(config, summarizer, store, alerts),
            fetch_pool: Arc::new(Semaphore::new(config.fetch_pool_size.max(1))),
            analysis_pool: Arc::new(Semaphore::new(config.analysis_pool_size.max(1))),
            stats: SchedulerStats::default(),
        };
        Self {
            core: Arc::new(core),
            feeds: parking_lot::Mutex::new(config.feeds.clone()),
            reanalyze_interval: parking_lot::Mutex::new(Duration::from_secs(
                config.reanalyze_interval_secs,
            )),
            generation: Mutex::new(None),
        }
    }

    /// Spawn the polling loops. Idempotent: a second call while running
    /// replaces the current loops, same as a reload.
    pub async fn start(&self) {
        let mut generation = self.generation.lock().await;
        if let Some(old) = generation.take() {
            stop_generation(old).await;
        }
        *generation = Some(self.spawn_generation());
    }

    /// Swap in a new feed set and re-analysis cadence. Loops restart against
    /// the new configuration.
    pub async fn apply_config(&self, config: &PipelineConfig) {
        *self.feeds.lock() = config.feeds.clone();
        *self.reanalyze_interval.lock() = Duration::from_secs(config.reanalyze_interval_secs);

        let mut generation = self.generation.lock().await;
        if let Some(old) = generation.take() {
            stop_generation(old).await;
            *generation = Some(self.spawn_generation());
            info!("configuration reloaded, polling loops restarted");
        }
    }

    /// Stop all loops, aborting in-flight cycles at their next await point.
    pub async fn shutdown(&self) {
        let mut generation = self.generation.lock().await;
        if let Some(old) = generation.take() {
            stop_generation(old).await;
            info!("scheduler stopped");
        }
    }

    pub fn cycles(&self) -> u64 {
        self.core.stats.cycles.load(Ordering::Relaxed)
    }

    pub fn fetch_failures(&self) -> u64 {
        self.core.stats.fetch_failures.load(Ordering::Relaxed)
    }

    pub fn documents_seen(&self) -> u64 {
        self.core.stats.documents.load(Ordering::Relaxed)
    }

    fn spawn_generation(&self) -> Generation {
        let (stop, _) = watch::channel(false);
        let mut handles = Vec::new();

        let feeds = self.feeds.lock().clone();
        for source in feeds {
            if !source.enabled {
                debug!(source = %source.name, "source disabled, not polling");
                continue;
            }
            let core = self.core.clone();
            let stop_rx = stop.subscribe();
            handles.push(tokio::spawn(run_source_loop(core, source, stop_rx)));
        }

        let reanalyze_interval = *self.reanalyze_interval.lock();
        if !reanalyze_interval.is_zero() {
            let core = self.core.clone();
            let stop_rx = stop.subscribe();
            handles.push(tokio::spawn(run_reanalysis_loop(
                core,
                reanalyze_interval,
                stop_rx,
            )));
        }

        Generation { stop, handles }
    }
}

async fn stop_generation(generation: Generation) {
    let _ = generation.stop.send(true);
    for handle in generation.handles {
        if let Err(e) = handle.await {
            if !e.is_cancelled() {
                error!(error = %e, "scheduler task panicked");
            }
        }
    }
}

/// Completes when the stop signal is raised or its sender is gone.
async fn wait_for_stop(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}

async fn run_source_loop(core: Arc<Core>, source: FeedSource, mut stop: watch::Receiver<bool>) {
    let interval = Duration::from_secs(source.interval_secs.max(1));
    info!(
        source = %source.name,
        interval_secs = interval.as_secs(),
        "polling loop started"
    );

    loop {
        core.run_cycle(&source, &mut stop).await;
        if *stop.borrow() {
            debug!(source = %source.name, "polling loop stopped");
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = wait_for_stop(&mut stop) => {
                debug!(source = %source.name, "polling loop stopped");
                return;
            }
        }
    }
}

async fn run_reanalysis_loop(core: Arc<Core>, interval: Duration, mut stop: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = wait_for_stop(&mut stop) => return,
        }

        match core.run_reanalysis_pass(&mut stop).await {
            0 => {}
            count => info!(count, "re-analyzed fallback records"),
        }
    }
}
