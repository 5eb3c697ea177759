//! Brief → site pipeline.
//!
//! The coordinator drives one run through an explicit state machine:
//!
//! ```text
//! Idle → CatalogReady → RoleResolved → Dispatched → Validating → Done
//!                                          ↑             │
//!                                          └── Retry ←───┤
//!                                                        └→ Failed
//! ```
//!
//! 1. **Foundation**: one authoritative task produces the shell (entry page,
//!    shared chrome, stylesheet). It is required.
//! 2. **Pages**: bulk tasks run concurrently, each given the foundation's
//!    shared chrome.
//! 3. **Escalation**: outputs that parse but fail validation are re-dispatched
//!    under the escalation role with the problems appended, up to
//!    `max_escalations` rounds. Dispatcher-level failures are final.
//!
//! Usage:
//! ```bash
//! pagesmith generate --brief brief.json --out session.json
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::artifact::{
    sanitize_colors_into, styles, ArtifactKind, ArtifactSet, GeneratedDocument, IssueCode,
    ParsedArtifact, RepairStep, ValidationIssue, Validator,
};
use crate::catalog::{BackendCatalog, CatalogError, CatalogSnapshot};
use crate::dispatch::{Dispatcher, FailureKind, GenerationTask, TaskOutcome};
use crate::prompts::{self, ContentBrief, SharedChrome};
use crate::roles::{Role, RoleAssignment};

const FOUNDATION_TASK_ID: &str = "foundation";

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    CatalogReady,
    RoleResolved,
    Dispatched,
    Validating,
    Retry,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: PipelineState,
    pub to: PipelineState,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Produced,
    Failed,
    NotAttempted,
}

/// Per-task outcome as recorded in the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: String,
    pub kind: ArtifactKind,
    pub required: bool,
    pub status: TaskStatus,
    #[serde(default)]
    pub failure_kind: Option<FailureKind>,
    #[serde(default)]
    pub last_cause: Option<FailureKind>,
    /// Every backend tried, across escalation rounds.
    pub attempted_backends: Vec<String>,
    pub escalations: u32,
    #[serde(default)]
    pub backend_id: Option<String>,
    #[serde(default)]
    pub repair_step: Option<RepairStep>,
    #[serde(default)]
    pub issues: Vec<ValidationIssue>,
    #[serde(default)]
    pub message: Option<String>,
}

impl TaskReport {
    fn pending(task_id: &str, kind: ArtifactKind, required: bool) -> Self {
        Self {
            task_id: task_id.to_string(),
            kind,
            required,
            status: TaskStatus::NotAttempted,
            failure_kind: None,
            last_cause: None,
            attempted_backends: Vec::new(),
            escalations: 0,
            backend_id: None,
            repair_step: None,
            issues: Vec::new(),
            message: None,
        }
    }
}

/// Full pipeline session output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSession {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub brief: ContentBrief,
    pub state: PipelineState,
    pub transitions: Vec<StateTransition>,
    pub roles: Vec<RoleAssignment>,
    pub tasks: Vec<TaskReport>,
    pub produced: usize,
    pub total: usize,
    pub summary: String,
    pub timed_out: bool,
    pub cancelled: bool,
    pub artifacts: ArtifactSet,
}

impl PipelineSession {
    fn new(brief: &ContentBrief) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            brief: brief.clone(),
            state: PipelineState::Idle,
            transitions: Vec::new(),
            roles: Vec::new(),
            tasks: Vec::new(),
            produced: 0,
            total: 0,
            summary: String::new(),
            timed_out: false,
            cancelled: false,
            artifacts: ArtifactSet::new(),
        }
    }

    fn transition(&mut self, to: PipelineState, note: Option<String>) {
        let from = self.state;
        tracing::info!(session = %self.id, ?from, ?to, note = note.as_deref().unwrap_or(""), "pipeline state");
        self.transitions.push(StateTransition {
            from,
            to,
            at: Utc::now(),
            note,
        });
        self.state = to;
    }

    pub fn task(&self, task_id: &str) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    pub fn is_done(&self) -> bool {
        self.state == PipelineState::Done
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub catalog_max_age: Duration,
    pub concurrency_limit: usize,
    pub max_attempts_per_task: u32,
    pub max_escalations: u32,
    pub pipeline_timeout: Duration,
    pub min_body_chars: usize,
    pub sanitize_styles: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            catalog_max_age: Duration::from_secs(6 * 60 * 60),
            concurrency_limit: 4,
            max_attempts_per_task: 3,
            max_escalations: 1,
            pipeline_timeout: Duration::from_secs(600),
            min_body_chars: 120,
            sanitize_styles: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("brief has no site name")]
    EmptyBrief,
    #[error("duplicate page path in brief: {0}")]
    DuplicatePage(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl PipelineError {
    /// Failure taxonomy kind, for errors that have one.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            PipelineError::Catalog(CatalogError::Unavailable { .. }) => {
                Some(FailureKind::CatalogUnavailable)
            }
            _ => None,
        }
    }
}

// =============================================================================
// Coordinator
// =============================================================================

/// One task in a stage, with what the coordinator needs to escalate it.
struct StageTask {
    task: GenerationTask,
    required: bool,
    original_payload: crate::gateway::PromptPayload,
}

pub struct PipelineCoordinator {
    catalog: Arc<BackendCatalog>,
    dispatcher: Dispatcher,
    validator: Validator,
    settings: PipelineSettings,
}

impl PipelineCoordinator {
    pub fn new(catalog: Arc<BackendCatalog>, dispatcher: Dispatcher, settings: PipelineSettings) -> Self {
        Self {
            catalog,
            dispatcher,
            validator: Validator::new(settings.min_body_chars),
            settings,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Run the brief to completion, cancellation, or timeout.
    ///
    /// Only an unavailable catalog (or an unusable brief) is an error; every
    /// other outcome, including failure, is reported in the session.
    pub async fn run(
        &self,
        brief: &ContentBrief,
        cancel: &CancellationToken,
    ) -> Result<PipelineSession, PipelineError> {
        check_brief(brief)?;

        let run_token = cancel.child_token();
        let timer = {
            let token = run_token.clone();
            let timeout = self.settings.pipeline_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                token.cancel();
            })
        };

        let mut session = PipelineSession::new(brief);
        let result = self.drive(brief, &run_token, &mut session).await;
        timer.abort();

        session.cancelled = cancel.is_cancelled();
        session.timed_out = run_token.is_cancelled() && !session.cancelled;
        session.finished_at = Some(Utc::now());
        if session.timed_out {
            tracing::warn!(session = %session.id, timeout = ?self.settings.pipeline_timeout, "pipeline timed out");
        }
        result.map(|()| session)
    }

    async fn drive(
        &self,
        brief: &ContentBrief,
        cancel: &CancellationToken,
        session: &mut PipelineSession,
    ) -> Result<(), PipelineError> {
        let snapshot = match self.catalog.refresh(self.settings.catalog_max_age).await {
            Ok(s) => s,
            Err(e) => {
                session.transition(PipelineState::Failed, Some(e.to_string()));
                return Err(e.into());
            }
        };
        session.transition(
            PipelineState::CatalogReady,
            Some(format!("{} backends", snapshot.backends.len())),
        );

        let resolver = self.dispatcher.resolver();
        let ledger = self.dispatcher.ledger();
        let authoritative = resolver.resolve(Role::Authoritative, &snapshot, ledger);
        let bulk = resolver.resolve(Role::Bulk, &snapshot, ledger);
        session.transition(
            PipelineState::RoleResolved,
            Some(format!(
                "authoritative={} bulk={}",
                authoritative.head().unwrap_or("-"),
                bulk.ordered_backend_ids.len()
            )),
        );
        session.roles = vec![authoritative, bulk.clone()];

        // Foundation
        let foundation_payload = prompts::foundation_payload(brief);
        let foundation = StageTask {
            task: GenerationTask::new(
                FOUNDATION_TASK_ID,
                Role::Authoritative,
                ArtifactKind::Foundation,
                foundation_payload.clone(),
            ),
            required: true,
            original_payload: foundation_payload,
        };
        let (mut reports, mut artifacts) = self
            .run_stage(&snapshot, vec![foundation], cancel, session)
            .await;

        let Some(foundation_artifact) = artifacts.remove(FOUNDATION_TASK_ID) else {
            session.tasks.append(&mut reports);
            for page in &brief.pages {
                session.tasks.push(TaskReport::pending(&page.path, ArtifactKind::Page, page.required));
            }
            self.finish(session, None, Vec::new());
            return Ok(());
        };
        session.tasks.append(&mut reports);

        // Pages
        let chrome = shared_chrome(&foundation_artifact);
        let pages: Vec<StageTask> = brief
            .pages
            .iter()
            .enumerate()
            .map(|(i, page)| {
                let payload = prompts::page_payload(brief, page, &chrome);
                let mut task =
                    GenerationTask::new(page.path.clone(), Role::Bulk, ArtifactKind::Page, payload.clone());
                // Spread pages across the bulk list instead of piling onto its head.
                if !bulk.is_empty() {
                    task = task.on_backend(bulk.ordered_backend_ids[i % bulk.ordered_backend_ids.len()].clone());
                }
                StageTask {
                    task,
                    required: page.required,
                    original_payload: payload,
                }
            })
            .collect();

        let mut page_artifacts = if pages.is_empty() {
            HashMap::new()
        } else {
            let (mut page_reports, page_artifacts) = self.run_stage(&snapshot, pages, cancel, session).await;
            session.tasks.append(&mut page_reports);
            page_artifacts
        };

        let ordered_pages: Vec<ParsedArtifact> = brief
            .pages
            .iter()
            .filter_map(|p| page_artifacts.remove(&p.path))
            .collect();
        self.finish(session, Some(foundation_artifact), ordered_pages);
        Ok(())
    }

    /// Dispatch, validate, and escalate a set of tasks until each is settled.
    async fn run_stage(
        &self,
        snapshot: &Arc<CatalogSnapshot>,
        stage: Vec<StageTask>,
        cancel: &CancellationToken,
        session: &mut PipelineSession,
    ) -> (Vec<TaskReport>, HashMap<String, ParsedArtifact>) {
        let order: Vec<String> = stage.iter().map(|s| s.task.task_id.clone()).collect();
        let mut reports: HashMap<String, TaskReport> = stage
            .iter()
            .map(|s| {
                (
                    s.task.task_id.clone(),
                    TaskReport::pending(&s.task.task_id, s.task.kind, s.required),
                )
            })
            .collect();
        let mut by_id: HashMap<String, StageTask> =
            stage.into_iter().map(|s| (s.task.task_id.clone(), s)).collect();
        let mut artifacts: HashMap<String, ParsedArtifact> = HashMap::new();

        let mut pending: Vec<GenerationTask> = order
            .iter()
            .filter_map(|id| by_id.get(id).map(|s| s.task.clone()))
            .collect();
        let mut round: u32 = 0;

        while !pending.is_empty() {
            session.transition(
                PipelineState::Dispatched,
                Some(format!("{} task(s), round {}", pending.len(), round)),
            );
            let batch = self
                .dispatcher
                .run_concurrent(
                    snapshot.clone(),
                    pending,
                    self.settings.concurrency_limit,
                    self.settings.max_attempts_per_task,
                    cancel,
                )
                .await;

            session.transition(PipelineState::Validating, Some(batch.summary()));
            let mut retry: Vec<GenerationTask> = Vec::new();

            for outcome in batch.outcomes {
                let Some(report) = reports.get_mut(outcome.task_id()) else {
                    continue;
                };
                report
                    .attempted_backends
                    .extend(outcome.attempted_backends().iter().cloned());

                match outcome {
                    TaskOutcome::Succeeded(success) => {
                        let kind = report.kind;
                        let files = document_files(&success.document);
                        let entry = success.document.entry.clone();
                        let validation = self.validator.validate(kind, &files, entry.as_deref());
                        report.backend_id = Some(success.backend_id.clone());
                        report.repair_step = Some(success.repair_step);
                        report.issues = validation.issues.clone();

                        if validation.is_valid() {
                            let warnings: Vec<ValidationIssue> = validation.warnings().cloned().collect();
                            report.status = TaskStatus::Produced;
                            report.failure_kind = None;
                            report.message = None;
                            artifacts.insert(
                                success.task_id.clone(),
                                ParsedArtifact {
                                    task_id: success.task_id.clone(),
                                    backend_id: success.backend_id,
                                    kind,
                                    files,
                                    entry: entry.unwrap_or_default(),
                                    notes: success.document.notes.clone(),
                                    warnings,
                                    repair_step: success.repair_step,
                                },
                            );
                            continue;
                        }

                        let problems = validation.error_summary();
                        tracing::warn!(
                            task = %success.task_id,
                            backend = %success.backend_id,
                            round,
                            problems = %problems,
                            "validation failed"
                        );
                        self.dispatcher.record_rejected(&success.backend_id).await;
                        report.status = TaskStatus::Failed;
                        report.failure_kind = Some(FailureKind::ValidationError);
                        report.message = Some(problems.clone());

                        if round >= self.settings.max_escalations || cancel.is_cancelled() {
                            continue;
                        }
                        if let Some(stage_task) = by_id.get_mut(&success.task_id) {
                            report.escalations += 1;
                            let payload = prompts::escalation_payload(&stage_task.original_payload, &problems);
                            let task = GenerationTask::new(
                                success.task_id.clone(),
                                Role::Escalation,
                                kind,
                                payload,
                            );
                            stage_task.task = task.clone();
                            retry.push(task);
                        }
                    }
                    TaskOutcome::Failed(failure) => {
                        report.status = TaskStatus::Failed;
                        report.failure_kind = Some(failure.kind);
                        report.last_cause = failure.last_cause;
                        report.message = Some(failure.message);
                    }
                    TaskOutcome::NotAttempted { .. } => {
                        // An earlier round's validation failure stays the verdict.
                        if report.status != TaskStatus::Failed {
                            report.status = TaskStatus::NotAttempted;
                        }
                    }
                }
            }

            if !retry.is_empty() {
                session.transition(PipelineState::Retry, Some(format!("{} escalation(s)", retry.len())));
                round += 1;
            }
            pending = retry;
        }

        let ordered = order.iter().filter_map(|id| reports.remove(id)).collect();
        (ordered, artifacts)
    }

    fn finish(
        &self,
        session: &mut PipelineSession,
        foundation: Option<ParsedArtifact>,
        pages: Vec<ParsedArtifact>,
    ) {
        let mut set = ArtifactSet::new();
        for artifact in foundation.iter().chain(pages.iter()) {
            let conflicts = set.merge(artifact);
            if !conflicts.is_empty() {
                tracing::warn!(
                    task = %artifact.task_id,
                    paths = ?conflicts,
                    "path conflict; keeping earlier file"
                );
            }
        }
        if self.settings.sanitize_styles {
            // One pass over the merged set: generated names stay unique across
            // pages and land in the foundation's stylesheet.
            let root_file = foundation.as_ref().map(|f| {
                shared_chrome(f)
                    .stylesheets
                    .into_iter()
                    .next()
                    .unwrap_or_else(|| f.entry.clone())
            });
            let sanitized = sanitize_colors_into(&mut set.files, root_file.as_deref());
            if sanitized.replaced > 0 {
                tracing::debug!(
                    replaced = sanitized.replaced,
                    declared = sanitized.declared.len(),
                    "sanitized literal colors"
                );
                for task in session.tasks.iter_mut().filter(|t| t.status == TaskStatus::Produced) {
                    task.issues.retain(|w| w.code != IssueCode::LiteralColor);
                }
            }
        }
        session.artifacts = set;

        session.total = session.tasks.len();
        session.produced = session
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Produced)
            .count();
        session.summary = format!("{} of {} produced", session.produced, session.total);

        let missing_required: Vec<&str> = session
            .tasks
            .iter()
            .filter(|t| t.required && t.status != TaskStatus::Produced)
            .map(|t| t.task_id.as_str())
            .collect();

        if missing_required.is_empty() {
            let note = session.summary.clone();
            session.transition(PipelineState::Done, Some(note));
        } else {
            let note = format!("{}; missing required: {}", session.summary, missing_required.join(", "));
            session.transition(PipelineState::Failed, Some(note));
        }
    }
}

fn check_brief(brief: &ContentBrief) -> Result<(), PipelineError> {
    if brief.site_name.trim().is_empty() {
        return Err(PipelineError::EmptyBrief);
    }
    let mut seen: Vec<&str> = Vec::new();
    for page in &brief.pages {
        if page.path == FOUNDATION_TASK_ID || seen.contains(&page.path.as_str()) {
            return Err(PipelineError::DuplicatePage(page.path.clone()));
        }
        seen.push(&page.path);
    }
    Ok(())
}

fn document_files(doc: &GeneratedDocument) -> BTreeMap<String, String> {
    doc.files.clone().map(|f| f.into_map()).unwrap_or_default()
}

fn shared_chrome(foundation: &ParsedArtifact) -> SharedChrome {
    SharedChrome {
        entry: foundation.entry.clone(),
        stylesheets: foundation
            .files
            .keys()
            .filter(|p| p.to_ascii_lowercase().ends_with(".css"))
            .cloned()
            .collect(),
        custom_properties: styles::root_custom_properties(&foundation.files),
    }
}

/// Write the session as pretty JSON.
pub fn write_session(path: impl AsRef<Path>, session: &PipelineSession) -> Result<(), PipelineError> {
    let json = serde_json::to_string_pretty(session)?;
    std::fs::write(path, json)?;
    Ok(())
}
