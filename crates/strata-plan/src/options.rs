use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use strata_domain::{ResourceInstance, TargetAddr, Value};

/// The overall posture of one plan operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanMode {
    /// Reconcile configuration against prior state.
    #[default]
    Normal,
    /// Refresh and report drift only; propose no changes.
    RefreshOnly,
    /// Plan the destruction of everything in prior state.
    Destroy,
}

impl std::fmt::Display for PlanMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanMode::Normal => write!(f, "normal"),
            PlanMode::RefreshOnly => write!(f, "refresh-only"),
            PlanMode::Destroy => write!(f, "destroy"),
        }
    }
}

/// Where a root-module variable value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputSource {
    CommandLine,
    Environment,
    File,
    Caller,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputValue {
    pub value: Value,
    pub source: InputSource,
}

impl InputValue {
    pub fn caller(value: impl Into<Value>) -> Self {
        InputValue { value: value.into(), source: InputSource::Caller }
    }
}

/// Options consumed by the planner. No CLI, file format or environment
/// variable lives here; callers translate their surfaces into this.
#[derive(Debug, Clone, Default)]
pub struct PlanOpts {
    pub mode: PlanMode,
    pub skip_refresh: bool,
    /// Mutually exclusive with `excludes`.
    pub targets: Vec<TargetAddr>,
    pub excludes: Vec<TargetAddr>,
    /// Instances to replace regardless of diff.
    pub force_replace: Vec<ResourceInstance>,
    pub set_variables: BTreeMap<String, InputValue>,
    /// Non-empty activates config generation for import targets without
    /// configuration.
    pub generate_config_path: Option<String>,
}

impl PlanOpts {
    pub fn normal() -> Self {
        PlanOpts::default()
    }

    pub fn refresh_only() -> Self {
        PlanOpts { mode: PlanMode::RefreshOnly, ..PlanOpts::default() }
    }

    pub fn destroy() -> Self {
        PlanOpts { mode: PlanMode::Destroy, ..PlanOpts::default() }
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_variables.insert(name.into(), InputValue::caller(value));
        self
    }
}
