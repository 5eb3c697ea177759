#![forbid(unsafe_code)]

//! # pagesmith
//!
//! Turns a content brief into a small static site by fanning generation work
//! out across free OpenRouter backends, none of which can be relied on.
//!
//! A backend catalog lists what is currently free and ranks it by an offline
//! quality table. A persistent trust ledger remembers which backends have been
//! misbehaving. Roles (authoritative, escalation, bulk, auxiliary) are resolved
//! fresh against both whenever a task needs a backend, so a task that fails on
//! one backend moves to the next without the caller noticing. Model output is
//! repaired leniently, then validated strictly, and failed validations are
//! escalated to the authoritative role with the problems spelled out.

pub mod artifact;
pub mod catalog;
pub mod config;
pub mod dispatch;
pub mod gateway;
pub mod pipeline;
pub mod prompts;
pub mod roles;
pub mod store;
pub mod trust;

pub use artifact::{ArtifactKind, ArtifactSet, GeneratedDocument, ParsedArtifact, Validator};
pub use catalog::{BackendCatalog, BackendDescriptor, CatalogSnapshot, QualityTable, Tier};
pub use config::HarnessConfig;
pub use dispatch::{
    BatchReport, Dispatcher, FailureKind, GenerationTask, JsonlTraceSink, TaskOutcome, TraceSink,
    TraceWorker,
};
pub use gateway::{CatalogSource, GenerationClient, OpenRouterAdapter, ProviderError};
pub use pipeline::{PipelineCoordinator, PipelineSession, PipelineState};
pub use prompts::ContentBrief;
pub use roles::{Role, RoleAssignment, RoleResolver};
pub use trust::{TrustLedger, TrustRecord};
