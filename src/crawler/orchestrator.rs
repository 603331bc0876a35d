//! Pipeline orchestration
//!
//! The orchestrator owns the worker pool and drives every work item through
//! its lifecycle:
//!
//! ```text
//! Discovered -> Queued -> Fetching -> Parsing -> Persisted
//!                  ^         |           \
//!                  |         v            -> DeadLettered
//!                  +---- Retrying
//!                            \
//!                             -> DeadLettered
//! ```
//!
//! Workers never sleep on a retry: a failed item goes back to the frontier
//! with a future eligibility time and the worker moves on. A supervisor task
//! refills items spilled to the work log and closes the frontier once the
//! job is drained.

use crate::config::Config;
use crate::crawler::assets::AssetStore;
use crate::crawler::breaker::{BreakerDecision, CircuitBreaker};
use crate::crawler::events::{EventBus, PipelineEvent, DEFAULT_EVENT_CAPACITY};
use crate::crawler::extractor::{Extraction, Extractor, ASSET_KIND};
use crate::crawler::fetcher::{Document, FetchError, FetchOutcome, Fetcher};
use crate::crawler::frontier::{Admission, Frontier, WorkItem};
use crate::crawler::persister::{OutcomeCounts, Persister};
use crate::crawler::retry::RetryPolicy;
use crate::crawler::visited::VisitedStore;
use crate::output::{load_summary, JobSummary};
use crate::state::{FailureClass, ItemState};
use crate::storage::{EntityStore, RunStatus, SqliteStorage, Transition, WorkLog};
use crate::url::{normalize_url, Scope};
use crate::{LurkerError, Result};
use chrono::Utc;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// How long a worker backs off when another worker already holds its item
const CONTENDED_DELAY: Duration = Duration::from_millis(100);

/// How often the supervisor refills the frontier and checks for drain
const SUPERVISOR_INTERVAL: Duration = Duration::from_millis(50);

/// State shared by the worker pool
struct Shared {
    frontier: Frontier,
    visited: Arc<VisitedStore>,
    work_log: Arc<dyn WorkLog>,
    fetcher: Fetcher,
    extractor: Extractor,
    persister: Persister,
    assets: Option<AssetStore>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    scope: Scope,
    events: EventBus,
    cancel: CancellationToken,
    /// First fatal error seen by any task
    fatal: Mutex<Option<LurkerError>>,
}

/// Runs the fetch, extract and persist pipeline over a pool of workers
pub struct Orchestrator {
    shared: Arc<Shared>,
    workers: usize,
    shutdown_timeout: Duration,
    config_hash: String,
}

impl Orchestrator {
    /// Creates an orchestrator over the given stores
    ///
    /// Items left active by an interrupted run are reset to `Discovered` here,
    /// so they are picked up again once `run` starts.
    pub fn new(
        config: Config,
        work_log: Arc<dyn WorkLog>,
        entity_store: Arc<dyn EntityStore>,
    ) -> Result<Self> {
        let reset = work_log.reset_active()?;
        if reset > 0 {
            tracing::info!("Resuming {} items interrupted by a previous run", reset);
        }

        let visited = Arc::new(VisitedStore::new(work_log.clone()));
        let shared = Shared {
            frontier: Frontier::new(config.frontier.clone(), visited.clone()),
            visited,
            work_log,
            fetcher: Fetcher::new(&config.fetch, config.pipeline.requests_per_second)?,
            extractor: Extractor::new(&config.extract)?,
            persister: Persister::new(entity_store),
            assets: config
                .storage
                .asset_dir
                .as_deref()
                .map(|dir| AssetStore::new(dir)),
            breaker: CircuitBreaker::new(&config.circuit_breaker),
            retry: RetryPolicy::from_config(&config.retry),
            scope: Scope::new(&config.scope),
            events: EventBus::new(DEFAULT_EVENT_CAPACITY),
            cancel: CancellationToken::new(),
            fatal: Mutex::new(None),
        };

        Ok(Self {
            shared: Arc::new(shared),
            workers: config.pipeline.workers,
            shutdown_timeout: config.pipeline.shutdown_timeout(),
            config_hash: String::new(),
        })
    }

    /// Creates an orchestrator backed by the SQLite database named in the config
    pub fn open(config: Config) -> Result<Self> {
        let storage = Arc::new(SqliteStorage::new(Path::new(&config.storage.database_path))?);
        Self::new(config, storage.clone(), storage)
    }

    /// Sets the config hash recorded with each run
    pub fn with_config_hash(mut self, hash: impl Into<String>) -> Self {
        self.config_hash = hash.into();
        self
    }

    /// Subscribes to per-item pipeline events
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.shared.events.subscribe()
    }

    /// Token that stops the pipeline when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Requests a cooperative shutdown
    ///
    /// Workers finish the item they hold; anything still running after the
    /// shutdown timeout is aborted and left `Queued` for the next run.
    pub fn shutdown(&self) {
        tracing::info!("Shutdown requested");
        self.shared.cancel.cancel();
    }

    /// Admits seed identifiers, returning how many were new
    ///
    /// Identifiers are normalized and scope-filtered first. Invalid ones are
    /// logged and skipped; already known ones are not counted. Seeds beyond
    /// the frontier bound are spilled to the work log and loaded as room frees.
    pub fn seed<I, S>(&self, identifiers: I) -> Result<usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut admitted = 0;
        for item in identifiers.into_iter().filter_map(|raw| self.prepare(raw.as_ref())) {
            if self.shared.frontier.enqueue(item)?.is_new() {
                admitted += 1;
            }
        }

        tracing::info!("Admitted {} seeds", admitted);
        Ok(admitted)
    }

    /// Feeds identifiers into a running pipeline, waiting for frontier room
    ///
    /// Unlike `seed`, nothing is spilled: each identifier waits until the
    /// frontier has capacity. Stops early if the pipeline shuts down.
    pub async fn submit<I, S>(&self, identifiers: I) -> Result<usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut admitted = 0;
        for item in identifiers.into_iter().filter_map(|raw| self.prepare(raw.as_ref())) {
            match self.shared.frontier.enqueue_wait(item, &self.shared.cancel).await? {
                Admission::Closed => break,
                admission if admission.is_new() => admitted += 1,
                _ => {}
            }
        }
        Ok(admitted)
    }

    /// Normalizes a raw identifier into an in-scope work item
    fn prepare(&self, raw: &str) -> Option<WorkItem> {
        let url = match normalize_url(raw) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!("Skipping seed {}: {}", raw, e);
                return None;
            }
        };
        let item = WorkItem::from_url(&url, None)?;
        if !self.shared.scope.permits(&item.host) {
            tracing::warn!("Skipping out-of-scope seed {}", url);
            return None;
        }
        Some(item)
    }

    /// Runs the pipeline until the job drains or shutdown is requested
    ///
    /// Returns the job summary, or the first fatal error. A fatal persistence
    /// error stops every worker; the item being persisted stays `Queued`.
    pub async fn run(&self) -> Result<JobSummary> {
        let shared = &self.shared;
        if let Some(previous) = shared.work_log.get_latest_run()? {
            if config_changed(&previous.config_hash, &self.config_hash) {
                tracing::warn!(
                    "Configuration changed since run {}; queued items follow the new rules",
                    previous.id
                );
            }
        }
        let run_id = shared.work_log.create_run(&self.config_hash)?;
        tracing::info!("Starting run {} with {} workers", run_id, self.workers);

        let mut tasks = JoinSet::new();
        for worker_id in 0..self.workers {
            let shared = self.shared.clone();
            tasks.spawn(async move { shared.worker_loop(worker_id).await });
        }
        {
            let shared = self.shared.clone();
            tasks.spawn(async move { shared.supervise().await });
        }

        let drained = {
            let drain = drain(&mut tasks, shared);
            tokio::pin!(drain);

            let drained = tokio::select! {
                _ = &mut drain => true,
                _ = shared.cancel.cancelled() => false,
            };
            drained
                || tokio::time::timeout(self.shutdown_timeout, &mut drain)
                    .await
                    .is_ok()
        };
        if !drained {
            tracing::warn!(
                "Workers still busy after {:?}, aborting",
                self.shutdown_timeout
            );
            tasks.shutdown().await;
        }

        let parked = shared.visited.park_in_flight()?;
        if parked > 0 {
            tracing::info!("Left {} interrupted items queued for the next run", parked);
        }

        if let Some(err) = shared.take_fatal() {
            if let Err(e) = shared.work_log.finish_run(run_id, RunStatus::Failed) {
                tracing::warn!("Failed to mark run {} failed: {}", run_id, e);
            }
            tracing::error!("Run {} failed: {}", run_id, err);
            return Err(err);
        }

        let status = if shared.cancel.is_cancelled() {
            RunStatus::Interrupted
        } else {
            RunStatus::Completed
        };
        shared.work_log.finish_run(run_id, status)?;
        tracing::info!("Run {} finished: {}", run_id, status.to_db_string());

        self.summary()
    }

    /// Reads the current job summary from storage
    pub fn summary(&self) -> Result<JobSummary> {
        let shared = &self.shared;
        Ok(load_summary(
            shared.work_log.as_ref(),
            shared.persister.store().as_ref(),
        )?)
    }
}

/// Joins every task, turning a panicked task into a fatal error
async fn drain(tasks: &mut JoinSet<()>, shared: &Shared) {
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            if e.is_panic() {
                shared.fail(LurkerError::Worker(e.to_string()));
            }
        }
    }
}

impl Shared {
    fn fail(&self, err: LurkerError) {
        let mut fatal = self.fatal.lock().unwrap_or_else(|p| p.into_inner());
        if fatal.is_none() {
            *fatal = Some(err);
        }
        drop(fatal);
        self.cancel.cancel();
    }

    fn take_fatal(&self) -> Option<LurkerError> {
        self.fatal.lock().unwrap_or_else(|p| p.into_inner()).take()
    }

    async fn worker_loop(&self, worker_id: usize) {
        tracing::debug!("Worker {} started", worker_id);

        while let Some(item) = self.frontier.dequeue(&self.cancel).await {
            let host = item.host.clone();
            let identifier = item.identifier.clone();

            if let Err(e) = self.process(item).await {
                tracing::error!("Worker {} stopping on {}: {}", worker_id, identifier, e);
                self.frontier.complete(&host);
                self.fail(e);
                break;
            }
        }

        tracing::debug!("Worker {} stopped", worker_id);
    }

    /// Takes one dequeued item to its next state
    async fn process(&self, item: WorkItem) -> Result<()> {
        let decision = self.breaker.check(&item.host);
        if let BreakerDecision::Open { retry_in } = decision {
            self.events.emit(PipelineEvent::Deferred {
                identifier: item.identifier.clone(),
                host: item.host.clone(),
                delay: retry_in,
            });
            self.frontier.defer(item, retry_in);
            return Ok(());
        }
        let trial = decision == BreakerDecision::Trial;

        let claimed = match self
            .visited
            .mark_in_flight(&item.identifier, item.attempt_count)
        {
            Ok(claimed) => claimed,
            Err(e) => {
                if trial {
                    self.breaker.release_trial(&item.host);
                }
                return Err(e.into());
            }
        };
        if !claimed {
            if trial {
                self.breaker.release_trial(&item.host);
            }
            self.frontier.defer(item, CONTENDED_DELAY);
            return Ok(());
        }

        let result = self.fetcher.fetch(&item.identifier).await;
        match result.outcome {
            FetchOutcome::Success(document) => {
                self.breaker.record_success(&item.host);
                self.events.emit(PipelineEvent::Fetched {
                    identifier: item.identifier.clone(),
                    host: item.host.clone(),
                    attempt: item.attempt_count + 1,
                    bytes: document.body.len(),
                });
                self.handle_document(item, &document).await
            }
            FetchOutcome::Failed(FetchError::Retryable { message, .. }) => {
                if self.breaker.record_failure(&item.host) {
                    tracing::warn!("Circuit opened for host {}", item.host);
                }
                self.handle_retryable(item, &message)
            }
            FetchOutcome::Failed(FetchError::Permanent { status, message }) => {
                if status.is_some() {
                    // The host answered, so it is healthy
                    self.breaker.record_success(&item.host);
                } else if trial {
                    self.breaker.release_trial(&item.host);
                }
                let attempts = item.attempt_count;
                self.dead_letter(item, attempts, FailureClass::PermanentFetch, &message)
            }
        }
    }

    fn handle_retryable(&self, item: WorkItem, reason: &str) -> Result<()> {
        let failures = item.attempt_count + 1;
        if self.retry.is_exhausted(failures) {
            let reason = format!("gave up after {} attempts: {}", failures, reason);
            return self.dead_letter(item, failures, FailureClass::RetryableFetch, &reason);
        }

        let delay = self.retry.delay(failures);
        let eligible_at = chrono::Duration::from_std(delay)
            .map(|d| Utc::now() + d)
            .unwrap_or_else(|_| Utc::now());

        self.visited.record(
            &item.identifier,
            &Transition::to(ItemState::Retrying, item.attempt_count),
        )?;
        self.visited.release(
            &item.identifier,
            &Transition::to(ItemState::Queued, failures)
                .eligible_at(eligible_at)
                .with_failure(FailureClass::RetryableFetch, reason),
        )?;

        self.events.emit(PipelineEvent::Retried {
            identifier: item.identifier.clone(),
            attempt: failures,
            delay,
            reason: reason.to_string(),
        });
        self.frontier.requeue_with_delay(item, delay);
        Ok(())
    }

    async fn handle_document(&self, item: WorkItem, document: &Document) -> Result<()> {
        self.visited.record(
            &item.identifier,
            &Transition::to(ItemState::Parsing, item.attempt_count),
        )?;

        let mut extraction = match self.extractor.extract_document(document) {
            Ok(extraction) => extraction,
            Err(e) => {
                let attempts = item.attempt_count;
                return self.dead_letter(item, attempts, FailureClass::Extraction, &e.to_string());
            }
        };

        if let Some(store) = &self.assets {
            if let Err(e) = store_asset_files(store, &mut extraction, &document.body).await {
                let message = format!("asset directory {}: {}", store.dir().display(), e);
                return Err(self.park_fatal(item, message));
            }
        }

        let outcomes = match self.persister.persist(&extraction.entities) {
            Ok(outcomes) => outcomes,
            Err(fatal) => return Err(self.park_fatal(item, fatal.to_string())),
        };

        let mut discovered = 0;
        for url in extraction.discovered.iter().chain(&extraction.assets) {
            let Some(next) = WorkItem::from_url(url, Some(item.identifier.clone())) else {
                continue;
            };
            if !self.scope.permits(&next.host) {
                continue;
            }
            if self.frontier.enqueue(next)?.is_new() {
                discovered += 1;
            }
        }

        self.visited.mark_done(
            &item.identifier,
            &Transition::to(ItemState::Persisted, item.attempt_count),
        )?;
        self.frontier.complete(&item.host);

        let counts = OutcomeCounts::tally(&outcomes);
        self.events.emit(PipelineEvent::Persisted {
            identifier: item.identifier,
            inserted: counts.inserted,
            updated: counts.updated,
            unchanged: counts.unchanged,
            conflicts: counts.conflicts,
            discovered,
        });
        Ok(())
    }

    /// Returns an item to `Queued` after local storage failed under it
    fn park_fatal(&self, item: WorkItem, message: String) -> LurkerError {
        let parked = self.visited.release(
            &item.identifier,
            &Transition::to(ItemState::Queued, item.attempt_count)
                .with_failure(FailureClass::PersistenceFatal, &message),
        );
        if let Err(e) = parked {
            tracing::warn!("Could not park {}: {}", item.identifier, e);
        }
        LurkerError::PersistenceFatal {
            identifier: item.identifier,
            message,
        }
    }

    fn dead_letter(
        &self,
        item: WorkItem,
        attempts: u32,
        class: FailureClass,
        reason: &str,
    ) -> Result<()> {
        self.visited.mark_done(
            &item.identifier,
            &Transition::to(ItemState::DeadLettered, attempts).with_failure(class, reason),
        )?;
        self.frontier.complete(&item.host);
        self.events.emit(PipelineEvent::DeadLettered {
            identifier: item.identifier,
            class,
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Refills spilled items and closes the frontier once the job is drained
    async fn supervise(&self) {
        let mut interval = tokio::time::interval(SUPERVISOR_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.tick() {
                Ok(true) => {
                    tracing::info!("All work drained");
                    break;
                }
                Ok(false) => {}
                Err(e) => {
                    self.fail(e);
                    break;
                }
            }
        }
    }

    /// One supervisor step; returns true once the frontier has been closed
    fn tick(&self) -> Result<bool> {
        let room = self.frontier.room();
        if room > 0 {
            let records = self.work_log.load_discovered(room)?;
            if !records.is_empty() {
                tracing::debug!("Refilling {} items from the work log", records.len());
            }
            for record in &records {
                self.frontier.readmit(record)?;
            }
        }

        if self.frontier.is_idle()
            && self.work_log.count_by_state(ItemState::Discovered)? == 0
            && self.frontier.close_if_idle()
        {
            return Ok(true);
        }
        Ok(false)
    }
}

/// Writes downloaded media to the asset directory and records where
async fn store_asset_files(
    store: &AssetStore,
    extraction: &mut Extraction,
    body: &[u8],
) -> std::io::Result<()> {
    for entity in extraction.entities.iter_mut() {
        if entity.kind != ASSET_KIND {
            continue;
        }
        let file_name = store.save(entity, body).await?;
        *entity = entity.clone().with_field("path", file_name)?;
    }
    Ok(())
}

/// Runs started without a hash never count as a change
fn config_changed(previous: &str, current: &str) -> bool {
    !previous.is_empty() && !current.is_empty() && previous != current
}
