use serde::{Deserialize, Serialize};

use crate::addrs::{ModuleInstance, ResourceInstance};

// ── Checkable objects ─────────────────────────────────────────────────────────

/// Any object that can carry check rules: a resource or data-source instance,
/// an output value, an input variable, or a `check` block.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckableAddr {
    Resource(ResourceInstance),
    Output { module: ModuleInstance, name: String },
    InputVariable { module: ModuleInstance, name: String },
    CheckBlock { module: ModuleInstance, name: String },
}

impl std::fmt::Display for CheckableAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckableAddr::Resource(addr) => write!(f, "{}", addr),
            CheckableAddr::Output { module, name } => {
                if module.is_root() {
                    write!(f, "output.{}", name)
                } else {
                    write!(f, "{}.output.{}", module, name)
                }
            }
            CheckableAddr::InputVariable { module, name } => {
                if module.is_root() {
                    write!(f, "var.{}", name)
                } else {
                    write!(f, "{}.var.{}", module, name)
                }
            }
            CheckableAddr::CheckBlock { module, name } => {
                if module.is_root() {
                    write!(f, "check.{}", name)
                } else {
                    write!(f, "{}.check.{}", module, name)
                }
            }
        }
    }
}

// ── Rule addressing ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckRuleKind {
    ResourcePrecondition,
    ResourcePostcondition,
    OutputPrecondition,
    CheckAssertion,
    VariableValidation,
}

impl std::fmt::Display for CheckRuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CheckRuleKind::ResourcePrecondition => "precondition",
            CheckRuleKind::ResourcePostcondition => "postcondition",
            CheckRuleKind::OutputPrecondition => "precondition",
            CheckRuleKind::CheckAssertion => "assert",
            CheckRuleKind::VariableValidation => "validation",
        };
        write!(f, "{}", s)
    }
}

/// Stable address of one condition within a checkable object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CheckRuleAddr {
    pub container: CheckableAddr,
    pub kind: CheckRuleKind,
    pub index: usize,
}

impl CheckRuleAddr {
    pub fn new(container: CheckableAddr, kind: CheckRuleKind, index: usize) -> Self {
        CheckRuleAddr { container, kind, index }
    }
}

impl std::fmt::Display for CheckRuleAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}[{}]", self.container, self.kind, self.index)
    }
}

// ── Outcomes ──────────────────────────────────────────────────────────────────

/// Outcome of evaluating one check rule, or the aggregate over a checkable
/// object (worst rule outcome wins: Error > Fail > Unknown > Pass).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Unknown,
    Fail,
    Error,
}

impl CheckStatus {
    /// Combine two statuses, keeping the more severe one.
    pub fn worst(self, other: CheckStatus) -> CheckStatus {
        self.max(other)
    }
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CheckStatus::Pass => "pass",
            CheckStatus::Unknown => "unknown",
            CheckStatus::Fail => "fail",
            CheckStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}
