//! Executors for the pure-evaluation node kinds: module expansion,
//! variables, locals, outputs and check blocks.

use tracing::debug;

use strata_domain::{
    CheckRuleAddr, CheckRuleKind, CheckableAddr, Diagnostic, Diagnostics, Mark, MarkedValue,
    Module, Severity, Value,
};
use strata_eval::{eval_expr, eval_repetition, Scope};
use strata_state::OutputValue;

use crate::checks::evaluate_rule;
use crate::plan::{OutputAction, OutputChange};
use crate::synth::values_equal;

use super::PlanCtx;

// ── Module expansion ──────────────────────────────────────────────────────────

pub async fn exec_module_expand(ctx: &PlanCtx, parent: &Module, call: &str) -> Diagnostics {
    let mut diags = Diagnostics::new();
    let Some(parent_config) = ctx.module_config(parent) else {
        return diags;
    };
    let Some(module_call) = parent_config.module_calls.get(call) else {
        return diags;
    };

    for mi in ctx.expander.module_instances(parent) {
        let scope = ctx.scope_for_instance(&mi);
        match eval_repetition(
            module_call.count.as_ref(),
            module_call.for_each.as_ref(),
            &scope,
            &ctx.data,
        ) {
            Ok(rep) => {
                debug!(module = %mi, call, "expanded module call");
                ctx.expander.expand_module(&mi, call, rep.expansion());
                ctx.module_reps
                    .lock()
                    .unwrap()
                    .insert((mi, call.to_string()), rep);
            }
            Err(errs) => {
                ctx.expander
                    .expand_module(&mi, call, strata_eval::Expansion::Unknown);
                diags.append(errs);
            }
        }
    }
    diags
}

// ── Variables ─────────────────────────────────────────────────────────────────

pub async fn exec_variable(ctx: &PlanCtx, module: &Module, name: &str) -> Diagnostics {
    let mut diags = Diagnostics::new();
    let Some(mc) = ctx.module_config(module) else {
        return diags;
    };
    let Some(vc) = mc.variables.get(name) else {
        return diags;
    };

    for mi in ctx.expander.module_instances(module) {
        let mut value: Option<MarkedValue> = None;

        if mi.is_root() {
            if let Some(input) = ctx.opts.set_variables.get(name) {
                value = Some(MarkedValue::unmarked(input.value.clone()));
            }
        } else if let Some(step) = mi.0.last() {
            // Child-module variables take their value from the call argument,
            // evaluated in the parent instance's scope with the call's own
            // each/count binding.
            let parent = strata_domain::ModuleInstance(mi.0[..mi.0.len() - 1].to_vec());
            let parent_path = parent.module();
            let arg = ctx
                .module_config(&parent_path)
                .and_then(|pc| pc.module_calls.get(&step.name))
                .and_then(|call| call.args.get(name).cloned());
            if let Some(arg) = arg {
                let each_value = ctx
                    .module_reps
                    .lock()
                    .unwrap()
                    .get(&(parent.clone(), step.name.clone()))
                    .and_then(|rep| rep.each_value(&step.key));
                let scope = Scope::module(parent).with_key(&step.key, each_value);
                match eval_expr(&arg, &scope, &ctx.data) {
                    Ok(mv) => value = Some(mv),
                    Err(errs) => {
                        diags.append(errs);
                        continue;
                    }
                }
            }
        }

        let mut value = match (value, &vc.default) {
            (Some(v), _) => v,
            (None, Some(default)) => MarkedValue::unmarked(default.clone()),
            (None, None) => {
                diags.push(
                    Diagnostic::error(
                        "No value for required variable",
                        format!("The input variable {:?} has no value and no default.", name),
                    )
                    .with_address(format!("var.{}", name)),
                );
                continue;
            }
        };
        if vc.sensitive {
            value = value.with_root_mark(Mark::Sensitive);
        }
        ctx.data.set_variable(&mi, name, value);

        // Validations run with the variable bound.
        let checkable = CheckableAddr::InputVariable { module: mi.clone(), name: name.into() };
        if !vc.validations.is_empty() {
            ctx.builder.checks.declare(checkable.clone());
        }
        let scope = ctx.scope_for_instance(&mi);
        for (index, rule) in vc.validations.iter().enumerate() {
            let rule_addr =
                CheckRuleAddr::new(checkable.clone(), CheckRuleKind::VariableValidation, index);
            let (status, message, rule_diags) =
                evaluate_rule(rule, &rule_addr, &scope, &ctx.data, ctx.condition_severity());
            ctx.builder.checks.record(&rule_addr, status, message);
            diags.append(rule_diags);
        }
    }
    diags
}

// ── Locals ────────────────────────────────────────────────────────────────────

pub async fn exec_local(ctx: &PlanCtx, module: &Module, name: &str) -> Diagnostics {
    let mut diags = Diagnostics::new();
    let Some(expr) = ctx
        .module_config(module)
        .and_then(|mc| mc.locals.get(name).cloned())
    else {
        return diags;
    };

    for mi in ctx.expander.module_instances(module) {
        let scope = ctx.scope_for_instance(&mi);
        match eval_expr(&expr, &scope, &ctx.data) {
            Ok(mv) => ctx.data.set_local(&mi, name, mv),
            Err(errs) => {
                diags.append(errs);
            }
        }
    }
    diags
}

// ── Outputs ───────────────────────────────────────────────────────────────────

pub async fn exec_output(ctx: &PlanCtx, module: &Module, name: &str) -> Diagnostics {
    let mut diags = Diagnostics::new();
    let Some(oc) = ctx
        .module_config(module)
        .and_then(|mc| mc.outputs.get(name).cloned())
    else {
        return diags;
    };

    for mi in ctx.expander.module_instances(module) {
        let scope = ctx.scope_for_instance(&mi);

        let checkable = CheckableAddr::Output { module: mi.clone(), name: name.into() };
        if !oc.preconditions.is_empty() {
            ctx.builder.checks.declare(checkable.clone());
        }
        let mut failed = false;
        for (index, rule) in oc.preconditions.iter().enumerate() {
            let rule_addr =
                CheckRuleAddr::new(checkable.clone(), CheckRuleKind::OutputPrecondition, index);
            let (status, message, rule_diags) =
                evaluate_rule(rule, &rule_addr, &scope, &ctx.data, ctx.condition_severity());
            ctx.builder.checks.record(&rule_addr, status, message);
            failed = failed || rule_diags.has_errors();
            diags.append(rule_diags);
        }
        if failed {
            continue;
        }

        let mut mv = match eval_expr(&oc.value, &scope, &ctx.data) {
            Ok(mv) => mv,
            Err(errs) => {
                diags.append(errs);
                continue;
            }
        };
        if oc.sensitive {
            mv = mv.with_root_mark(Mark::Sensitive);
        }
        ctx.data.set_module_output(&mi, name, mv.clone());

        if mi.is_root() {
            let before = ctx
                .prior
                .read(|s| s.root_output(name).map(|o| Value::from_json(o.value.clone())))
                .await
                .unwrap_or(Value::Null);
            let after = mv.value.clone();
            let action = match (before.is_null(), after.is_null()) {
                (true, false) => OutputAction::Create,
                (false, true) => OutputAction::Delete,
                _ if values_equal(&before, &after) => OutputAction::NoOp,
                _ => OutputAction::Update,
            };
            let sensitive = oc.sensitive || mv.is_sensitive();
            ctx.builder.record_output_change(OutputChange {
                name: name.to_string(),
                action,
                before,
                after: after.clone(),
                sensitive,
            });
            if let Some(known) = after.to_json() {
                ctx.working
                    .set_output_value(name, OutputValue { value: known, sensitive })
                    .await;
            }
        }
    }
    diags
}

// ── Check blocks ──────────────────────────────────────────────────────────────

pub async fn exec_check_block(ctx: &PlanCtx, module: &Module, name: &str) -> Diagnostics {
    let mut diags = Diagnostics::new();
    let Some(check) = ctx
        .module_config(module)
        .and_then(|mc| mc.checks.get(name).cloned())
    else {
        return diags;
    };

    for mi in ctx.expander.module_instances(module) {
        let checkable = CheckableAddr::CheckBlock { module: mi.clone(), name: name.into() };
        ctx.builder.checks.declare(checkable.clone());
        let scope = ctx.scope_for_instance(&mi);
        for (index, rule) in check.asserts.iter().enumerate() {
            let rule_addr =
                CheckRuleAddr::new(checkable.clone(), CheckRuleKind::CheckAssertion, index);
            // Check blocks observe, never gate: always warning severity.
            let (status, message, rule_diags) =
                evaluate_rule(rule, &rule_addr, &scope, &ctx.data, Severity::Warning);
            ctx.builder.checks.record(&rule_addr, status, message);
            diags.append(rule_diags);
        }
    }
    diags
}
