//! Role resolution: abstract role → ordered backend ids.
//!
//! Always derived from the current catalog snapshot and trust ledger; nothing
//! here is cached, so a trust flip takes effect on the very next resolution.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::catalog::{BackendDescriptor, CatalogSnapshot, Tier};
use crate::trust::TrustLedger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Single best backend for structural work; the rest of the list are substitutes.
    Authoritative,
    /// Same selection as authoritative, used after a validation failure.
    Escalation,
    /// Fan-out work. Never includes the authoritative head.
    Bulk,
    /// Small low-risk tasks; mid-tier first.
    Auxiliary,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Authoritative => "authoritative",
            Role::Escalation => "escalation",
            Role::Bulk => "bulk",
            Role::Auxiliary => "auxiliary",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "authoritative" => Ok(Role::Authoritative),
            "escalation" => Ok(Role::Escalation),
            "bulk" | "bulk-parallel" | "bulk_parallel" => Ok(Role::Bulk),
            "auxiliary" => Ok(Role::Auxiliary),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub role: Role,
    pub ordered_backend_ids: Vec<String>,
    /// The list is a single untrusted backend picked because nothing was eligible.
    pub last_resort: bool,
    /// The list is the configured bulk fallback.
    pub fallback: bool,
}

impl RoleAssignment {
    fn new(role: Role, ids: Vec<String>) -> Self {
        Self {
            role,
            ordered_backend_ids: ids,
            last_resort: false,
            fallback: false,
        }
    }

    pub fn head(&self) -> Option<&str> {
        self.ordered_backend_ids.first().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.ordered_backend_ids.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ordered_backend_ids.iter().any(|b| b == id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleSettings {
    /// Backends with a smaller context window are never selected.
    pub min_context_tokens: u32,
    /// Used for bulk when nothing else resolves.
    pub bulk_fallback: Vec<String>,
}

impl Default for RoleSettings {
    fn default() -> Self {
        Self {
            min_context_tokens: 8_192,
            bulk_fallback: vec![
                "meta-llama/llama-3.3-70b-instruct:free".to_string(),
                "mistralai/mistral-7b-instruct:free".to_string(),
            ],
        }
    }
}

/// Tier descending, then quality descending, then id.
pub fn rank_order(a: &BackendDescriptor, b: &BackendDescriptor) -> Ordering {
    b.tier
        .cmp(&a.tier)
        .then_with(|| b.quality_score.total_cmp(&a.quality_score))
        .then_with(|| a.id.cmp(&b.id))
}

#[derive(Debug, Clone, Default)]
pub struct RoleResolver {
    settings: RoleSettings,
}

impl RoleResolver {
    pub fn new(settings: RoleSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &RoleSettings {
        &self.settings
    }

    /// Catalog backends that fit the context requirement, in rank order.
    pub fn ranked_candidates<'a>(&self, snapshot: &'a CatalogSnapshot) -> Vec<&'a BackendDescriptor> {
        let mut out: Vec<&BackendDescriptor> = snapshot
            .backends
            .iter()
            .filter(|b| b.context_limit >= self.settings.min_context_tokens)
            .collect();
        out.sort_by(|a, b| rank_order(a, b));
        out
    }

    pub fn resolve(&self, role: Role, snapshot: &CatalogSnapshot, ledger: &TrustLedger) -> RoleAssignment {
        let candidates = self.ranked_candidates(snapshot);
        let eligible: Vec<&BackendDescriptor> = candidates
            .iter()
            .copied()
            .filter(|b| ledger.is_trusted(&b.id))
            .collect();

        match role {
            Role::Authoritative | Role::Escalation => {
                if !eligible.is_empty() {
                    return RoleAssignment::new(role, ids(&eligible));
                }
                last_resort_assignment(role, &candidates, ledger)
            }
            Role::Bulk => self.resolve_bulk(&candidates, &eligible, ledger),
            Role::Auxiliary => {
                if eligible.is_empty() {
                    return last_resort_assignment(role, &candidates, ledger);
                }
                let (mid, rest): (Vec<_>, Vec<_>) =
                    eligible.iter().copied().partition(|b| b.tier == Tier::Mid);
                let ordered: Vec<&BackendDescriptor> = mid.into_iter().chain(rest).collect();
                RoleAssignment::new(role, ids(&ordered))
            }
        }
    }

    fn resolve_bulk(
        &self,
        candidates: &[&BackendDescriptor],
        eligible: &[&BackendDescriptor],
        ledger: &TrustLedger,
    ) -> RoleAssignment {
        // The authoritative head is whatever authoritative resolution would pick.
        let head: Option<&str> = match eligible.first() {
            Some(b) => Some(b.id.as_str()),
            None => last_resort(candidates, ledger).map(|b| b.id.as_str()),
        };

        let rest: Vec<&BackendDescriptor> = eligible
            .iter()
            .copied()
            .filter(|b| Some(b.id.as_str()) != head)
            .collect();
        if !rest.is_empty() {
            return RoleAssignment::new(Role::Bulk, ids(&rest));
        }

        let others: Vec<&BackendDescriptor> = candidates
            .iter()
            .copied()
            .filter(|b| Some(b.id.as_str()) != head)
            .collect();
        let assignment = last_resort_assignment(Role::Bulk, &others, ledger);
        if !assignment.is_empty() {
            return assignment;
        }

        let mut fallback: Vec<String> = self
            .settings
            .bulk_fallback
            .iter()
            .filter(|id| Some(id.as_str()) != head)
            .cloned()
            .collect();
        if fallback.is_empty() {
            fallback = self.settings.bulk_fallback.clone();
        }
        tracing::warn!(ids = ?fallback, "bulk role resolved to hard-coded fallback");
        RoleAssignment {
            role: Role::Bulk,
            ordered_backend_ids: fallback,
            last_resort: false,
            fallback: true,
        }
    }
}

fn ids(backends: &[&BackendDescriptor]) -> Vec<String> {
    backends.iter().map(|b| b.id.clone()).collect()
}

/// Least-recently-failed untrusted backend. Never-observed backends count as
/// never failed and win; ties keep rank order.
fn last_resort<'a>(
    candidates: &[&'a BackendDescriptor],
    ledger: &TrustLedger,
) -> Option<&'a BackendDescriptor> {
    candidates
        .iter()
        .copied()
        .filter(|b| !ledger.is_trusted(&b.id))
        .map(|b| (b, ledger.record(&b.id).map(|r| r.last_updated)))
        .min_by(|(_, a), (_, b)| match (a, b) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => a.cmp(b),
        })
        .map(|(b, _)| b)
}

fn last_resort_assignment(
    role: Role,
    candidates: &[&BackendDescriptor],
    ledger: &TrustLedger,
) -> RoleAssignment {
    match last_resort(candidates, ledger) {
        Some(b) => {
            tracing::debug!(role = %role, backend = %b.id, "no trusted backend; using last resort");
            RoleAssignment {
                role,
                ordered_backend_ids: vec![b.id.clone()],
                last_resort: true,
                fallback: false,
            }
        }
        None => RoleAssignment::new(role, Vec::new()),
    }
}
