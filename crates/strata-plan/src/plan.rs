use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use strata_domain::{
    CheckStatus, CheckableAddr, DeposedKey, Diagnostics, Marks, ProviderConfigAddr,
    ResourceInstance, Value,
};
use strata_state::State;

use crate::options::PlanMode;

// ── Actions ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    NoOp,
    Create,
    /// Data source read deferred to apply time.
    Read,
    Update,
    Delete,
    DeleteThenCreate,
    CreateThenDelete,
    /// Drop from state without destroying the remote object.
    Forget,
}

impl Action {
    pub fn is_replace(&self) -> bool {
        matches!(self, Action::DeleteThenCreate | Action::CreateThenDelete)
    }

    /// Anything that would touch the remote object at apply time.
    pub fn is_pending(&self) -> bool {
        !matches!(self, Action::NoOp)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Action::NoOp => "no-op",
            Action::Create => "create",
            Action::Read => "read",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::DeleteThenCreate => "delete-then-create",
            Action::CreateThenDelete => "create-then-delete",
            Action::Forget => "forget",
        };
        write!(f, "{}", s)
    }
}

/// Why an action was chosen, for actions whose cause isn't evident from the
/// diff itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionReason {
    #[default]
    NoReason,
    ReadBecauseDependencyPending,
    DeleteBecauseNoResourceConfig,
    DeleteBecauseNoModule,
    DeleteBecauseWrongRepetition,
    DeleteBecauseNoMoveTarget,
    DestroyBecauseDestroyMode,
    ReplaceBecauseTainted,
    ReplaceByRequest,
    ReplaceBecauseCannotUpdate,
}

// ── Changes ───────────────────────────────────────────────────────────────────

/// Import metadata attached to a change that adopts an existing object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Importing {
    pub id: String,
}

/// One planned change to one resource-instance object. References addresses,
/// never objects, so records stay valid after state mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceInstanceChange {
    pub addr: ResourceInstance,
    /// Where this instance lived in the previous run (differs after a move).
    pub prev_run_addr: ResourceInstance,
    /// Which object generation this change concerns; None means current.
    pub deposed: Option<DeposedKey>,
    pub action: Action,
    pub reason: ActionReason,
    pub before: Value,
    pub after: Value,
    pub before_marks: Marks,
    pub after_marks: Marks,
    pub importing: Option<Importing>,
    /// Generated configuration text for import targets without config.
    pub generated_config: Option<String>,
    pub provider: ProviderConfigAddr,
}

impl std::fmt::Display for ResourceInstanceChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.deposed {
            None => write!(f, "{} ({})", self.addr, self.action),
            Some(key) => write!(f, "{} (deposed {}, {})", self.addr, key, self.action),
        }
    }
}

/// A record of out-of-band drift: the refreshed value differs from the value
/// the previous run left behind, regardless of whether configuration forces a
/// further change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftedResource {
    pub addr: ResourceInstance,
    pub action: Action,
    pub before: Value,
    pub after: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputAction {
    NoOp,
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputChange {
    pub name: String,
    pub action: OutputAction,
    pub before: Value,
    pub after: Value,
    pub sensitive: bool,
}

// ── Check results ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectCheckResult {
    pub status: CheckStatus,
    pub failure_messages: Vec<String>,
}

impl Default for ObjectCheckResult {
    fn default() -> Self {
        ObjectCheckResult { status: CheckStatus::Pass, failure_messages: Vec::new() }
    }
}

/// Outcomes per checkable object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckResults {
    pub results: BTreeMap<CheckableAddr, ObjectCheckResult>,
}

impl CheckResults {
    pub fn status_of(&self, addr: &CheckableAddr) -> Option<CheckStatus> {
        self.results.get(addr).map(|r| r.status)
    }
}

// ── The plan ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Changes {
    pub resources: Vec<ResourceInstanceChange>,
}

impl Changes {
    /// The change for an instance's current object.
    pub fn for_addr(&self, addr: &ResourceInstance) -> Option<&ResourceInstanceChange> {
        self.resources
            .iter()
            .find(|c| &c.addr == addr && c.deposed.is_none())
    }

    pub fn deposed_for_addr(&self, addr: &ResourceInstance) -> Vec<&ResourceInstanceChange> {
        self.resources
            .iter()
            .filter(|c| &c.addr == addr && c.deposed.is_some())
            .collect()
    }

    pub fn pending(&self) -> impl Iterator<Item = &ResourceInstanceChange> {
        self.resources.iter().filter(|c| c.action.is_pending())
    }
}

/// Everything one plan operation produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub mode: PlanMode,
    pub changes: Changes,
    pub drifted_resources: Vec<DriftedResource>,
    /// State after refresh; the baseline changes were planned against.
    pub prior_state: State,
    /// State after schema upgrade, before refresh. Never mutated after
    /// refresh begins; preserved for postmortem.
    pub prev_run_state: State,
    pub checks: CheckResults,
    pub output_changes: BTreeMap<String, OutputChange>,
    /// True if any fatal diagnostic occurred. Partial changes are still
    /// reported, but the plan must not be applied.
    pub errored: bool,
    pub timestamp: DateTime<Utc>,
}

impl Plan {
    pub fn applyable(&self) -> bool {
        !self.errored && self.mode != PlanMode::RefreshOnly
    }
}

/// The result pair callers receive: the plan plus every diagnostic, sorted.
#[derive(Debug)]
pub struct PlanRun {
    pub plan: Plan,
    pub diagnostics: Diagnostics,
}
