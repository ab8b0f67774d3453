use std::collections::BTreeMap;
use std::sync::Mutex;

use strata_config::CheckRuleConfig;
use strata_domain::{
    CheckRuleAddr, CheckRuleKind, CheckStatus, CheckableAddr, Diagnostic, Diagnostics, Mark,
    Severity, Value,
};
use strata_eval::{eval_expr, EvalData, Scope};

use crate::plan::{CheckResults, ObjectCheckResult};

// ── Registry ──────────────────────────────────────────────────────────────────

/// Tracks every declared checkable object and the aggregate outcome of its
/// rules. Worst status wins per object; failure messages accumulate.
#[derive(Debug, Default)]
pub struct CheckRegistry {
    results: Mutex<BTreeMap<CheckableAddr, ObjectCheckResult>>,
}

impl CheckRegistry {
    pub fn new() -> Self {
        CheckRegistry::default()
    }

    /// Declare a checkable object up front so objects whose rules never ran
    /// still appear in the results.
    pub fn declare(&self, addr: CheckableAddr) {
        self.results.lock().unwrap().entry(addr).or_default();
    }

    pub fn record(&self, rule: &CheckRuleAddr, status: CheckStatus, message: Option<String>) {
        let mut results = self.results.lock().unwrap();
        let entry = results.entry(rule.container.clone()).or_default();
        entry.status = entry.status.worst(status);
        if let Some(message) = message {
            entry.failure_messages.push(message);
        }
    }

    pub fn into_results(self) -> CheckResults {
        CheckResults { results: self.results.into_inner().unwrap() }
    }
}

// ── Rule evaluation ───────────────────────────────────────────────────────────

fn failure_summary(kind: CheckRuleKind) -> &'static str {
    match kind {
        CheckRuleKind::ResourcePrecondition => "Resource precondition failed",
        CheckRuleKind::ResourcePostcondition => "Resource postcondition failed",
        CheckRuleKind::OutputPrecondition => "Module output value precondition failed",
        CheckRuleKind::CheckAssertion => "Check block assertion failed",
        CheckRuleKind::VariableValidation => "Invalid value for variable",
    }
}

/// Evaluate one condition. `failure_severity` is Error in normal planning and
/// Warning in refresh-only mode; check-block assertions always fail as
/// warnings and additionally warn when their result is unknown.
pub fn evaluate_rule(
    rule: &CheckRuleConfig,
    addr: &CheckRuleAddr,
    scope: &Scope,
    data: &EvalData,
    failure_severity: Severity,
) -> (CheckStatus, Option<String>, Diagnostics) {
    let mut diags = Diagnostics::new();

    let condition = match eval_expr(&rule.condition, scope, data) {
        Ok(mv) => mv,
        Err(errs) => {
            diags.append(errs);
            return (CheckStatus::Error, None, diags);
        }
    };

    // Marks are stripped before status determination; a sensitive condition
    // result is still a bool.
    let (value, _marks) = condition.strip();
    match value {
        Value::Unknown => {
            if addr.kind == CheckRuleKind::CheckAssertion {
                let mut diag = Diagnostic::warning(
                    "Check block assertion known only after apply",
                    format!(
                        "The condition for {} can only be determined once the plan \
                         has been applied.",
                        addr
                    ),
                )
                .with_address(&addr.container);
                if let Some(source) = &rule.source {
                    diag = diag.with_source(source.clone());
                }
                diags.push(diag);
            }
            (CheckStatus::Unknown, None, diags)
        }
        Value::Bool(true) => (CheckStatus::Pass, None, diags),
        Value::Bool(false) => {
            let (message, message_diags) = failure_message(rule, scope, data);
            diags.append(message_diags);
            let detail = message
                .clone()
                .unwrap_or_else(|| "This check failed, but has an invalid error message.".into());
            let mut diag = Diagnostic {
                severity: failure_severity,
                summary: failure_summary(addr.kind).to_string(),
                detail,
                address: Some(addr.container.to_string()),
                source: rule.source.clone(),
                extra: None,
            };
            if addr.kind == CheckRuleKind::CheckAssertion {
                // Check blocks observe, they never gate.
                diag.severity = Severity::Warning;
            }
            diags.push(diag);
            (CheckStatus::Fail, message, diags)
        }
        Value::Null => {
            diags.push(
                Diagnostic::error(
                    "Invalid condition result",
                    "The condition expression produced null; a bool is required.",
                )
                .with_address(&addr.container),
            );
            (CheckStatus::Error, None, diags)
        }
        _ => {
            diags.push(
                Diagnostic::error(
                    "Invalid condition result",
                    "The condition expression did not produce a bool.",
                )
                .with_address(&addr.container),
            );
            (CheckStatus::Error, None, diags)
        }
    }
}

/// Evaluate the error message for a failed rule. Sensitive or unknown message
/// values are never surfaced; the failure is reported without the text.
fn failure_message(
    rule: &CheckRuleConfig,
    scope: &Scope,
    data: &EvalData,
) -> (Option<String>, Diagnostics) {
    let mut diags = Diagnostics::new();
    match eval_expr(&rule.error_message, scope, data) {
        Err(errs) => {
            diags.append(errs);
            (None, diags)
        }
        Ok(mv) => {
            if mv.marks.contains(Mark::Sensitive) || mv.value.is_unknown() {
                diags.warning(
                    "Error message refers to sensitive values",
                    "The error message includes sensitive or not-yet-known values, so it \
                     will not be displayed.",
                );
                return (None, diags);
            }
            match mv.value {
                Value::String(s) => (Some(s), diags),
                _ => {
                    diags.warning(
                        "Invalid error message",
                        "The error message expression did not produce a string.",
                    );
                    (None, diags)
                }
            }
        }
    }
}
