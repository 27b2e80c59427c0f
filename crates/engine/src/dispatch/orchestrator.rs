//! Dispatch orchestrator
//!
//! Runs the phased schedule: one fast pass over every pending item, then up to
//! `max_drain_iterations` passes over the retry queue at a rate reduced from
//! the fast-pass rate. The orchestrator is the only writer of the ledger and
//! the failure list; workers hand results back through their join handles.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::progress::{Phase, ProgressTracker, RunTally};
use crate::config::EngineConfig;
use crate::credential::CredentialManager;
use crate::error::{EngineError, Result};
use crate::ledger::CheckpointLedger;
use crate::model::{dedupe_last_write_wins, Deduped, FailureRecord, Outcome, RetryReason, WorkItem};
use crate::payload::{MergeFields, PayloadBuilder};
use crate::reliability::{AdaptiveRateLimiter, LimiterSnapshot};
use crate::remote::RemoteApi;
use crate::worker::{Attempt, MutationWorker};

const PERSISTENT_RATE_LIMITING: &str = "persistent rate limiting";
const PERSISTENT_TRANSIENT: &str = "persistent transient failure";
const WORKER_PANICKED: &str = "worker panicked";
const INVALID_ENTITY_ID: &str = "invalid entity id";

/// Final result of [`Dispatcher::run`]
#[derive(Debug, Clone)]
pub struct RunReport {
    pub tally: RunTally,
    /// Permanent failures, in the order they were decided
    pub failures: Vec<FailureRecord>,
    /// Items never completed because the run was cancelled
    pub unscheduled: Vec<String>,
    /// Candidates skipped because the ledger already lists them
    pub skipped_completed: usize,
    /// Drain iterations actually run
    pub drain_iterations: u32,
    pub cancelled: bool,
    pub elapsed: Duration,
    pub limiter: LimiterSnapshot,
}

/// Buffers successes and appends them to the ledger in batches
struct Checkpointer {
    ledger: Arc<CheckpointLedger>,
    batch_size: usize,
    pending: Vec<String>,
}

impl Checkpointer {
    fn new(ledger: Arc<CheckpointLedger>, batch_size: usize) -> Self {
        Self {
            ledger,
            batch_size,
            pending: Vec::with_capacity(batch_size.min(4096)),
        }
    }

    async fn record(&mut self, entity_id: String) -> Result<()> {
        self.pending.push(entity_id);
        if self.pending.len() >= self.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.ledger.append_batch(&self.pending).await?;
        self.pending.clear();
        Ok(())
    }
}

/// Mutable bookkeeping owned by one run
struct RunState {
    tally: RunTally,
    checkpoint: Checkpointer,
    failures: Vec<FailureRecord>,
    unscheduled: Vec<String>,
    progress: ProgressTracker,
    cancelled: bool,
    drain_iterations: u32,
}

impl RunState {
    fn fail(&mut self, entity_id: String, reason: impl Into<String>, status_code: Option<u16>) {
        self.tally.failed += 1;
        self.failures.push(FailureRecord {
            entity_id,
            reason: reason.into(),
            status_code,
        });
    }
}

/// Dispatch orchestrator for one remote account
///
/// # Example
///
/// ```ignore
/// let dispatcher = Dispatcher::new(config, remote, credentials, ledger)?
///     .with_cancellation(shutdown.clone());
///
/// let report = dispatcher.run(candidates).await?;
/// for failure in &report.failures {
///     println!("{}: {}", failure.entity_id, failure.reason);
/// }
/// ```
pub struct Dispatcher {
    config: EngineConfig,
    remote: RemoteApi,
    credentials: Arc<CredentialManager>,
    limiter: Arc<AdaptiveRateLimiter>,
    ledger: Arc<CheckpointLedger>,
    payload: Arc<dyn PayloadBuilder>,
    cancel: CancellationToken,
}

impl Dispatcher {
    /// Validate `config` and wire a fresh limiter from it
    pub fn new(
        config: EngineConfig,
        remote: RemoteApi,
        credentials: Arc<CredentialManager>,
        ledger: CheckpointLedger,
    ) -> Result<Self> {
        config.validate()?;
        let limiter = Arc::new(AdaptiveRateLimiter::new(config.limiter.clone()));
        Ok(Self {
            config,
            remote,
            credentials,
            limiter,
            ledger: Arc::new(ledger),
            payload: Arc::new(MergeFields),
            cancel: CancellationToken::new(),
        })
    }

    /// Replace the default [`MergeFields`] builder
    pub fn with_payload_builder(mut self, payload: Arc<dyn PayloadBuilder>) -> Self {
        self.payload = payload;
        self
    }

    /// Stop admitting work when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn limiter(&self) -> &Arc<AdaptiveRateLimiter> {
        &self.limiter
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Execute the full schedule over `candidates`
    ///
    /// Fails only on run-level problems: unusable credentials at start-up or
    /// ledger I/O. Per-item failures are reported in [`RunReport::failures`].
    /// A ledger write that fails mid-run returns [`EngineError::Checkpoint`]
    /// carrying the report collected up to that point.
    #[instrument(skip(self, candidates), fields(candidates = candidates.len()))]
    pub async fn run(&self, candidates: Vec<WorkItem>) -> Result<RunReport> {
        if let Err(e) = self.credentials.get_credential().await {
            error!(error = %e, "Credential validation failed, aborting run");
            return Err(EngineError::Credential(e));
        }

        let completed = self.ledger.load().await?;
        let Deduped { items, invalid } = dedupe_last_write_wins(candidates);
        let total = items.len();
        let mut pending: Vec<WorkItem> = items
            .into_iter()
            .filter(|item| !completed.contains(&item.entity_id))
            .collect();
        let skipped_completed = total - pending.len();
        if self.config.shuffle {
            pending.shuffle(&mut rand::thread_rng());
        }

        info!(
            pending = pending.len(),
            skipped_completed,
            invalid = invalid.len(),
            max_concurrency = self.config.max_concurrency,
            rate = self.limiter.current_rate(),
            "Starting bulk mutation run"
        );

        let worker = MutationWorker::new(
            self.remote.clone(),
            Arc::clone(&self.credentials),
            Arc::clone(&self.limiter),
            Arc::clone(&self.payload),
        )
        .with_default_throttle_pause(self.config.default_throttle_pause);

        let mut state = RunState {
            tally: RunTally::default(),
            checkpoint: Checkpointer::new(
                Arc::clone(&self.ledger),
                self.config.checkpoint_batch_size,
            ),
            failures: Vec::new(),
            unscheduled: Vec::new(),
            progress: ProgressTracker::new(),
            cancelled: false,
            drain_iterations: 0,
        };
        for entity_id in invalid {
            state.fail(entity_id, INVALID_ENTITY_ID, None);
        }

        let outcome = self.schedule(pending, &worker, &mut state).await;
        let report = RunReport {
            tally: state.tally,
            failures: state.failures,
            unscheduled: state.unscheduled,
            skipped_completed,
            drain_iterations: state.drain_iterations,
            cancelled: state.cancelled,
            elapsed: state.progress.elapsed(),
            limiter: self.limiter.snapshot(),
        };

        match outcome {
            Ok(()) => {
                info!(
                    submitted = report.tally.submitted,
                    succeeded = report.tally.succeeded,
                    retried = report.tally.retried,
                    failed = report.tally.failed,
                    unscheduled = report.unscheduled.len(),
                    drain_iterations = report.drain_iterations,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "Run finished"
                );
                Ok(report)
            }
            Err(EngineError::Ledger(source)) => {
                error!(
                    error = %source,
                    succeeded = report.tally.succeeded,
                    failed = report.tally.failed,
                    "Checkpoint write failed, stopping run"
                );
                Err(EngineError::Checkpoint {
                    source,
                    report: Box::new(report),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Initial phase, drain phases, then the drain-cap verdicts and final flush
    async fn schedule(
        &self,
        pending: Vec<WorkItem>,
        worker: &MutationWorker,
        state: &mut RunState,
    ) -> Result<()> {
        let mut queue = self.run_phase(Phase::Initial, pending, worker, state).await?;
        let phase1_rate = self.limiter.current_rate();

        for iteration in 1..=self.config.max_drain_iterations {
            if queue.is_empty() {
                break;
            }
            if state.cancelled || !self.drain_pause().await {
                state.cancelled = true;
                break;
            }

            let rate = phase1_rate * self.config.queue_reduction_factor.powi(iteration as i32);
            self.limiter.set_rate(rate);
            state.drain_iterations = iteration;
            info!(
                iteration,
                queued = queue.len(),
                rate = self.limiter.current_rate(),
                "Draining retry queue"
            );

            let items = queue.into_iter().map(|(item, _)| item).collect();
            queue = self
                .run_phase(Phase::Drain(iteration), items, worker, state)
                .await?;
        }

        if state.cancelled {
            state
                .unscheduled
                .extend(queue.into_iter().map(|(item, _)| item.entity_id));
        } else {
            for (item, reason) in queue {
                let label = match reason {
                    RetryReason::RateLimited => PERSISTENT_RATE_LIMITING,
                    RetryReason::Transient => PERSISTENT_TRANSIENT,
                };
                warn!(entity_id = %item.entity_id, reason = label, "Giving up after drain cap");
                state.fail(item.entity_id, label, None);
            }
        }

        state.checkpoint.flush().await
    }

    /// Wait `drain_pause`; false if cancelled meanwhile
    async fn drain_pause(&self) -> bool {
        if self.config.drain_pause.is_zero() {
            return !self.cancel.is_cancelled();
        }
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(self.config.drain_pause) => true,
        }
    }

    /// Push `items` through a bounded pool and collect what needs another pass
    #[instrument(skip(self, items, worker, state), fields(phase = %phase, items = items.len()))]
    async fn run_phase(
        &self,
        phase: Phase,
        items: Vec<WorkItem>,
        worker: &MutationWorker,
        state: &mut RunState,
    ) -> Result<Vec<(WorkItem, RetryReason)>> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let mut tasks: JoinSet<(WorkItem, Attempt)> = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, String> = HashMap::new();
        let mut retry = Vec::new();

        let mut pending = items.into_iter();
        let mut next_item = pending.next();
        let mut shutdown_deadline: Option<Instant> = None;

        let interval = self.config.progress_interval;
        let mut progress = tokio::time::interval_at(Instant::now() + interval, interval);
        progress.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if next_item.is_none() && tasks.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                _ = self.cancel.cancelled(), if shutdown_deadline.is_none() => {
                    let not_admitted: Vec<String> = next_item
                        .take()
                        .into_iter()
                        .chain(pending.by_ref())
                        .map(|item| item.entity_id)
                        .collect();
                    info!(
                        not_admitted = not_admitted.len(),
                        in_flight = tasks.len(),
                        "Cancellation requested, no new work will be admitted"
                    );
                    state.unscheduled.extend(not_admitted);
                    state.cancelled = true;
                    shutdown_deadline = Some(Instant::now() + self.config.shutdown_timeout);
                }

                _ = tokio::time::sleep_until(shutdown_deadline.unwrap_or_else(Instant::now)),
                    if shutdown_deadline.is_some() =>
                {
                    warn!(in_flight = tasks.len(), "Shutdown timeout elapsed, aborting in-flight work");
                    tasks.abort_all();
                    while let Some(joined) = tasks.join_next_with_id().await {
                        self.handle_joined(phase, joined, &mut in_flight, &mut retry, state)
                            .await?;
                    }
                    break;
                }

                Some(joined) = tasks.join_next_with_id(), if !tasks.is_empty() => {
                    self.handle_joined(phase, joined, &mut in_flight, &mut retry, state)
                        .await?;
                }

                permit = Arc::clone(&semaphore).acquire_owned(), if next_item.is_some() => {
                    let Ok(permit) = permit else { break };
                    let Some(item) = next_item.take() else { continue };
                    next_item = pending.next();

                    state.tally.submitted += 1;
                    let entity_id = item.entity_id.clone();
                    let worker = worker.clone();
                    let handle = tasks.spawn(async move {
                        let _permit = permit;
                        let attempt = worker.execute(&item).await;
                        (item, attempt)
                    });
                    in_flight.insert(handle.id(), entity_id);
                }

                _ = progress.tick() => {
                    let snapshot = state.progress.sample(state.tally, self.limiter.snapshot());
                    info!(
                        phase = %phase,
                        submitted = snapshot.tally.submitted,
                        succeeded = snapshot.tally.succeeded,
                        retried = snapshot.tally.retried,
                        failed = snapshot.tally.failed,
                        in_flight = tasks.len(),
                        observed_rate = snapshot.observed_rate,
                        limiter_rate = snapshot.limiter.current_rate,
                        utilization = snapshot.utilization(),
                        consecutive_throttles = snapshot.limiter.consecutive_throttles,
                        circuit = %snapshot.limiter.circuit,
                        "Progress"
                    );
                }
            }
        }

        info!(phase = %phase, requeued = retry.len(), "Phase complete");
        Ok(retry)
    }

    async fn handle_joined(
        &self,
        phase: Phase,
        joined: std::result::Result<(tokio::task::Id, (WorkItem, Attempt)), tokio::task::JoinError>,
        in_flight: &mut HashMap<tokio::task::Id, String>,
        retry: &mut Vec<(WorkItem, RetryReason)>,
        state: &mut RunState,
    ) -> Result<()> {
        match joined {
            Ok((id, (item, attempt))) => {
                in_flight.remove(&id);
                self.record(phase, item, attempt, retry, state).await
            }
            Err(e) => {
                let Some(entity_id) = in_flight.remove(&e.id()) else {
                    return Ok(());
                };
                if e.is_cancelled() {
                    state.unscheduled.push(entity_id);
                } else {
                    error!(entity_id = %entity_id, error = %e, "Worker task panicked");
                    state.fail(entity_id, WORKER_PANICKED, None);
                }
                Ok(())
            }
        }
    }

    async fn record(
        &self,
        phase: Phase,
        item: WorkItem,
        attempt: Attempt,
        retry: &mut Vec<(WorkItem, RetryReason)>,
        state: &mut RunState,
    ) -> Result<()> {
        let diagnostics = &attempt.diagnostics;
        match attempt.outcome {
            Outcome::Success => {
                debug!(entity_id = %item.entity_id, status = ?diagnostics.status, "Mutation succeeded");
                state.tally.succeeded += 1;
                state.checkpoint.record(item.entity_id).await?;
            }
            Outcome::Retryable { reason } => {
                let requeue = !phase.is_drain()
                    || reason == RetryReason::RateLimited
                    || self.config.requeue_transient_in_drain;
                if requeue {
                    if phase.is_drain() {
                        debug!(entity_id = %item.entity_id, %reason, status = ?diagnostics.status, "Requeued");
                    } else {
                        warn!(
                            entity_id = %item.entity_id,
                            %reason,
                            status = ?diagnostics.status,
                            error = ?diagnostics.error,
                            "Mutation deferred to retry queue"
                        );
                    }
                    state.tally.retried += 1;
                    retry.push((item, reason));
                } else {
                    warn!(
                        entity_id = %item.entity_id,
                        %reason,
                        status = ?diagnostics.status,
                        body = %diagnostics.body,
                        "Mutation failed during drain"
                    );
                    state.fail(item.entity_id, reason.to_string(), diagnostics.status);
                }
            }
            Outcome::Terminal {
                reason,
                status_code,
            } => {
                warn!(
                    entity_id = %item.entity_id,
                    %reason,
                    status = ?status_code,
                    body = %diagnostics.body,
                    error = ?diagnostics.error,
                    "Mutation failed permanently"
                );
                state.fail(item.entity_id, reason, status_code);
            }
        }
        Ok(())
    }
}
