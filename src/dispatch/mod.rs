//! Concurrent generation dispatch.
//!
//! Every task runs as its own tokio task. In-flight attempts are bounded by a
//! semaphore; the permit is held only for the gateway call, never across a
//! backoff sleep. A failed attempt penalizes the backend and moves the task to
//! a substitute chosen by [`retry::decide_next`] from a freshly resolved role
//! list. Tasks never abort their siblings.

pub mod retry;
pub mod trace;

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::artifact::{recover_document, ArtifactKind, GeneratedDocument, RepairStep};
use crate::catalog::CatalogSnapshot;
use crate::gateway::{GenerationClient, PromptPayload, ProviderError, SendOptions};
use crate::roles::{Role, RoleResolver};
use crate::trust::TrustLedger;

pub use retry::{
    decide_next, BackoffConfig, FailureKind, RateLimitTracker, RetryContext, RetryDecision,
};
pub use trace::{AttemptTrace, JsonlTraceSink, TraceError, TraceSink, TraceWorker};

// =============================================================================
// TASKS AND OUTCOMES
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct GenerationTask {
    pub task_id: String,
    pub role: Role,
    pub kind: ArtifactKind,
    pub payload: PromptPayload,
    /// First backend to try. `None` takes the head of the resolved role list.
    pub backend_id: Option<String>,
}

impl GenerationTask {
    pub fn new(task_id: impl Into<String>, role: Role, kind: ArtifactKind, payload: PromptPayload) -> Self {
        Self {
            task_id: task_id.into(),
            role,
            kind,
            payload,
            backend_id: None,
        }
    }

    pub fn on_backend(mut self, backend_id: impl Into<String>) -> Self {
        self.backend_id = Some(backend_id.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskSuccess {
    pub task_id: String,
    pub backend_id: String,
    pub attempts: u32,
    pub attempted_backends: Vec<String>,
    pub repair_step: RepairStep,
    pub document: GeneratedDocument,
}

/// A task whose retry budget ran out (or that hit a terminal failure).
#[derive(Debug, Clone, Serialize)]
pub struct TaskFailure {
    pub task_id: String,
    pub kind: FailureKind,
    /// Kind of the final attempt's failure.
    pub last_cause: Option<FailureKind>,
    pub attempted_backends: Vec<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Succeeded(TaskSuccess),
    Failed(TaskFailure),
    /// Cancelled before finishing. Never counted as a failure.
    NotAttempted {
        task_id: String,
        attempted_backends: Vec<String>,
    },
}

impl TaskOutcome {
    pub fn task_id(&self) -> &str {
        match self {
            TaskOutcome::Succeeded(s) => &s.task_id,
            TaskOutcome::Failed(f) => &f.task_id,
            TaskOutcome::NotAttempted { task_id, .. } => task_id,
        }
    }

    pub fn attempted_backends(&self) -> &[String] {
        match self {
            TaskOutcome::Succeeded(s) => &s.attempted_backends,
            TaskOutcome::Failed(f) => &f.attempted_backends,
            TaskOutcome::NotAttempted {
                attempted_backends, ..
            } => attempted_backends,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Succeeded(_))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    /// One outcome per submitted task, in submission order.
    pub outcomes: Vec<TaskOutcome>,
    pub cancelled: bool,
    #[serde(with = "crate::gateway::types::duration_ms")]
    pub elapsed: Duration,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &TaskSuccess> {
        self.outcomes.iter().filter_map(|o| match o {
            TaskOutcome::Succeeded(s) => Some(s),
            _ => None,
        })
    }

    pub fn failed(&self) -> impl Iterator<Item = &TaskFailure> {
        self.outcomes.iter().filter_map(|o| match o {
            TaskOutcome::Failed(f) => Some(f),
            _ => None,
        })
    }

    pub fn not_attempted(&self) -> impl Iterator<Item = &str> {
        self.outcomes.iter().filter_map(|o| match o {
            TaskOutcome::NotAttempted { task_id, .. } => Some(task_id.as_str()),
            _ => None,
        })
    }

    pub fn get(&self, task_id: &str) -> Option<&TaskOutcome> {
        self.outcomes.iter().find(|o| o.task_id() == task_id)
    }

    /// "N of M produced".
    pub fn summary(&self) -> String {
        format!("{} of {} produced", self.succeeded().count(), self.total())
    }
}

// =============================================================================
// DISPATCHER
// =============================================================================

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub attempt_timeout: Duration,
    pub backoff: BackoffConfig,
    pub send: SendOptions,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(90),
            backoff: BackoffConfig::default(),
            send: SendOptions::default(),
        }
    }
}

pub struct Dispatcher {
    client: Arc<dyn GenerationClient>,
    ledger: Arc<TrustLedger>,
    resolver: RoleResolver,
    settings: DispatchSettings,
    rate_limits: Arc<RateLimitTracker>,
    trace: Option<Arc<dyn TraceSink>>,
}

/// Everything a worker needs, shared across the batch.
struct Shared {
    client: Arc<dyn GenerationClient>,
    ledger: Arc<TrustLedger>,
    resolver: RoleResolver,
    settings: DispatchSettings,
    rate_limits: Arc<RateLimitTracker>,
    trace: Option<Arc<dyn TraceSink>>,
    snapshot: Arc<CatalogSnapshot>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    max_attempts: u32,
}

enum Attempt {
    Parsed {
        document: GeneratedDocument,
        step: RepairStep,
    },
    Failed {
        kind: FailureKind,
        retry_after: Option<Duration>,
        message: String,
    },
}

impl Dispatcher {
    pub fn new(
        client: Arc<dyn GenerationClient>,
        ledger: Arc<TrustLedger>,
        resolver: RoleResolver,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            client,
            ledger,
            resolver,
            settings,
            rate_limits: Arc::new(RateLimitTracker::default()),
            trace: None,
        }
    }

    pub fn with_trace(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.trace = Some(sink);
        self
    }

    pub fn ledger(&self) -> &Arc<TrustLedger> {
        &self.ledger
    }

    pub fn resolver(&self) -> &RoleResolver {
        &self.resolver
    }

    /// Count a parsed response that failed validation against its backend.
    pub async fn record_rejected(&self, backend: &str) {
        update_ledger(&self.ledger, backend, TrustUpdate::Rejected).await;
    }

    /// Run `tasks` with at most `concurrency_limit` gateway calls in flight.
    ///
    /// Returns when every task has succeeded, exhausted its budget, or been
    /// cancelled through `cancel`.
    pub async fn run_concurrent(
        &self,
        snapshot: Arc<CatalogSnapshot>,
        tasks: Vec<GenerationTask>,
        concurrency_limit: usize,
        max_attempts_per_task: u32,
        cancel: &CancellationToken,
    ) -> BatchReport {
        let started = Instant::now();
        let order: Vec<String> = tasks.iter().map(|t| t.task_id.clone()).collect();

        let shared = Arc::new(Shared {
            client: self.client.clone(),
            ledger: self.ledger.clone(),
            resolver: self.resolver.clone(),
            settings: self.settings.clone(),
            rate_limits: self.rate_limits.clone(),
            trace: self.trace.clone(),
            snapshot,
            semaphore: Arc::new(Semaphore::new(concurrency_limit.max(1))),
            cancel: cancel.clone(),
            max_attempts: max_attempts_per_task.max(1),
        });

        // Results are slotted by submission index; task ids need not be unique.
        let mut join_set = JoinSet::new();
        for (index, task) in tasks.into_iter().enumerate() {
            let shared = shared.clone();
            join_set.spawn(async move { (index, shared.run_task(task).await) });
        }

        let mut results: Vec<Option<TaskOutcome>> = order.iter().map(|_| None).collect();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, outcome)) => results[index] = Some(outcome),
                Err(e) => tracing::error!(error = %e, "dispatch worker panicked"),
            }
        }

        let outcomes = order
            .into_iter()
            .zip(results)
            .map(|(task_id, result)| {
                result.unwrap_or_else(|| {
                    TaskOutcome::Failed(TaskFailure {
                        task_id,
                        kind: FailureKind::Exhausted,
                        last_cause: None,
                        attempted_backends: Vec::new(),
                        message: "worker ended without a result".to_string(),
                    })
                })
            })
            .collect();

        let report = BatchReport {
            outcomes,
            cancelled: cancel.is_cancelled(),
            elapsed: started.elapsed(),
        };
        tracing::info!(
            summary = %report.summary(),
            failed = report.failed().count(),
            not_attempted = report.not_attempted().count(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "batch finished"
        );
        report
    }

    /// Single task, no concurrency.
    pub async fn run_one(
        &self,
        snapshot: Arc<CatalogSnapshot>,
        task: GenerationTask,
        max_attempts: u32,
        cancel: &CancellationToken,
    ) -> TaskOutcome {
        let task_id = task.task_id.clone();
        let mut report = self
            .run_concurrent(snapshot, vec![task], 1, max_attempts, cancel)
            .await;
        report.outcomes.pop().unwrap_or(TaskOutcome::NotAttempted {
            task_id,
            attempted_backends: Vec::new(),
        })
    }
}

impl Shared {
    fn candidates(&self, role: Role) -> Vec<String> {
        self.resolver
            .resolve(role, &self.snapshot, &self.ledger)
            .ordered_backend_ids
    }

    async fn run_task(&self, task: GenerationTask) -> TaskOutcome {
        let mut tried: Vec<String> = Vec::new();
        let not_attempted = |tried: Vec<String>| TaskOutcome::NotAttempted {
            task_id: task.task_id.clone(),
            attempted_backends: tried,
        };

        let first = task
            .backend_id
            .clone()
            .or_else(|| self.candidates(task.role).into_iter().next());
        let Some(mut backend) = first else {
            return TaskOutcome::Failed(TaskFailure {
                task_id: task.task_id.clone(),
                kind: FailureKind::Exhausted,
                last_cause: None,
                attempted_backends: tried,
                message: format!("role {} resolved to no backend", task.role),
            });
        };

        let mut attempt: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                return not_attempted(tried);
            }
            attempt += 1;

            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return not_attempted(tried),
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => return not_attempted(tried),
                },
            };

            tried.push(backend.clone());
            let started = Instant::now();
            let sent = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                r = tokio::time::timeout(
                    self.settings.attempt_timeout,
                    self.client.send(&backend, &task.payload, &self.settings.send),
                ) => Some(r),
            };
            drop(permit);

            let Some(sent) = sent else {
                tracing::debug!(task = %task.task_id, backend = %backend, "attempt abandoned on cancel");
                return not_attempted(tried);
            };
            let latency = started.elapsed();

            let (attempt_result, raw) = match sent {
                Ok(Ok(raw)) => (classify_raw(&raw), Some(raw)),
                Ok(Err(err)) => (classify_error(&err), None),
                Err(_) => (
                    Attempt::Failed {
                        kind: FailureKind::Transport,
                        retry_after: None,
                        message: format!("timed out after {:?}", self.settings.attempt_timeout),
                    },
                    None,
                ),
            };

            self.emit_trace(&task, attempt, &backend, &attempt_result, raw.as_deref(), latency);

            let (kind, retry_after, message) = match attempt_result {
                Attempt::Parsed { document, step } => {
                    self.record(&backend, true).await;
                    self.rate_limits.reset(&backend);
                    tracing::debug!(
                        task = %task.task_id,
                        backend = %backend,
                        attempt,
                        repair = step.as_str(),
                        "attempt succeeded"
                    );
                    return TaskOutcome::Succeeded(TaskSuccess {
                        task_id: task.task_id.clone(),
                        backend_id: backend,
                        attempts: attempt,
                        attempted_backends: tried,
                        repair_step: step,
                        document,
                    });
                }
                Attempt::Failed {
                    kind,
                    retry_after,
                    message,
                } => (kind, retry_after, message),
            };

            if kind.penalizes_backend() {
                self.record(&backend, false).await;
            }
            tracing::warn!(
                task = %task.task_id,
                backend = %backend,
                attempt,
                kind = kind.as_str(),
                error = %message,
                "attempt failed"
            );

            let rate_limit_delay = (kind == FailureKind::RateLimited).then(|| {
                let streak = self.rate_limits.note(&backend);
                let computed = self.settings.backoff.delay_for(streak);
                retry_after
                    .map(|hint| hint.max(computed))
                    .unwrap_or(computed)
                    .min(self.settings.backoff.max)
            });

            let candidates = self.candidates(task.role);
            let decision = decide_next(&RetryContext {
                attempt,
                max_attempts: self.max_attempts,
                last_backend: &backend,
                last_failure: kind,
                tried: &tried,
                candidates: &candidates,
                rate_limit_delay,
            });

            match decision {
                RetryDecision::Retry { backend: next, delay } => {
                    if !delay.is_zero() {
                        tokio::select! {
                            biased;
                            _ = self.cancel.cancelled() => return not_attempted(tried),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    tracing::debug!(task = %task.task_id, from = %backend, to = %next, "substituting backend");
                    backend = next;
                }
                RetryDecision::GiveUp { kind: give_up, reason } => {
                    let failure = TaskFailure {
                        task_id: task.task_id.clone(),
                        kind: give_up,
                        last_cause: Some(kind),
                        attempted_backends: tried,
                        message: format!("{reason}: {message}"),
                    };
                    tracing::warn!(
                        task = %failure.task_id,
                        kind = failure.kind.as_str(),
                        attempts = attempt,
                        backends = ?failure.attempted_backends,
                        "task gave up"
                    );
                    return TaskOutcome::Failed(failure);
                }
            }
        }
    }

    async fn record(&self, backend: &str, success: bool) {
        let update = if success {
            TrustUpdate::Success
        } else {
            TrustUpdate::Failure
        };
        update_ledger(&self.ledger, backend, update).await;
    }

    fn emit_trace(
        &self,
        task: &GenerationTask,
        attempt: u32,
        backend: &str,
        result: &Attempt,
        raw: Option<&str>,
        latency: Duration,
    ) {
        let Some(sink) = &self.trace else {
            return;
        };
        let (outcome, repair_step, error) = match result {
            Attempt::Parsed { step, .. } => ("ok".to_string(), Some(step.as_str().to_string()), None),
            Attempt::Failed { kind, message, .. } => {
                (kind.as_str().to_string(), None, Some(message.clone()))
            }
        };
        let event = AttemptTrace {
            timestamp_ms: trace::now_epoch_ms(),
            task_id: task.task_id.clone(),
            role: task.role.to_string(),
            attempt,
            backend_id: backend.to_string(),
            outcome,
            latency_ms: latency.as_millis() as u64,
            response_hash: raw.map(trace::hash_response),
            response_chars: raw.map(|r| r.chars().count()),
            repair_step,
            error,
        };
        if let Err(e) = sink.record(event) {
            tracing::warn!(error = %e, "failed to record attempt trace");
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum TrustUpdate {
    Success,
    Failure,
    Rejected,
}

fn apply(ledger: &TrustLedger, backend: &str, update: TrustUpdate) {
    match update {
        TrustUpdate::Success => {
            ledger.record_success(backend);
        }
        TrustUpdate::Failure => {
            ledger.record_failure(backend);
        }
        TrustUpdate::Rejected => {
            ledger.record_rejected(backend);
        }
    }
}

/// Persisting ledgers write to disk, so their updates go to the blocking pool.
async fn update_ledger(ledger: &Arc<TrustLedger>, backend: &str, update: TrustUpdate) {
    if ledger.path().is_none() {
        apply(ledger, backend, update);
        return;
    }
    let shared = ledger.clone();
    let id = backend.to_string();
    if let Err(e) = tokio::task::spawn_blocking(move || apply(&shared, &id, update)).await {
        tracing::warn!(backend, error = %e, "trust update task failed");
    }
}

fn classify_raw(raw: &str) -> Attempt {
    match recover_document(raw) {
        Ok(repaired) => Attempt::Parsed {
            document: repaired.value,
            step: repaired.step,
        },
        Err(e) => Attempt::Failed {
            kind: FailureKind::MalformedOutput,
            retry_after: None,
            message: e.to_string(),
        },
    }
}

fn classify_error(err: &ProviderError) -> Attempt {
    let retry_after = match err {
        ProviderError::RateLimited { retry_after, .. } => Some(*retry_after),
        _ => None,
    };
    Attempt::Failed {
        kind: FailureKind::from(err),
        retry_after,
        message: err.to_string(),
    }
}
