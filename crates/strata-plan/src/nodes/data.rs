//! Data-source node: eager reads during plan, deferred to apply time when a
//! managed dependency has pending changes.

use std::collections::BTreeSet;

use tracing::debug;

use strata_config::Reference;
use strata_domain::{
    AbsResource, CheckRuleKind, CheckableAddr, Diagnostic, Diagnostics, Mark, MarkedValue,
    Marks, Module, Resource, ResourceMode, Value,
};
use strata_eval::{eval_body, eval_repetition, Expansion, ExpandedKeys};
use strata_state::{ObjectState, ObjectStatus};

use crate::options::PlanMode;
use crate::plan::{Action, ActionReason, ResourceInstanceChange};
use crate::synth::proposed_new;

use super::resource::{resolve_provider_key, run_condition_set};
use super::{provider_failure, PlanCtx};

pub async fn exec_data(ctx: &PlanCtx, module: &Module, resource: &Resource) -> Diagnostics {
    let mut diags = Diagnostics::new();
    let Some(rc) = ctx
        .module_config(module)
        .and_then(|mc| mc.resource(resource).cloned())
    else {
        return diags;
    };
    let cr = strata_domain::ConfigResource {
        module: module.clone(),
        resource: resource.clone(),
    };
    if !ctx.filter.selects(&cr) {
        super::resource::register_filtered(ctx, module, resource, &rc).await;
        return diags;
    }

    let provider_addr = ctx.resolve_provider_config(module, &rc);

    for mi in ctx.expander.module_instances(module) {
        let abs = mi.resource(resource.clone());
        let scope = ctx.scope_for_instance(&mi);

        let schema = match ctx.pool.schema(&ctx.cancel, &provider_addr.source).await {
            Ok(schema) => schema,
            Err(e) => {
                ctx.expander.expand_resource(&abs, Expansion::Unknown);
                provider_failure(&mut diags, &abs, e);
                continue;
            }
        };
        let Some(block) = schema.data_source(&rc.type_name).cloned() else {
            ctx.expander.expand_resource(&abs, Expansion::Unknown);
            diags.push(
                Diagnostic::error(
                    "Unsupported data source type",
                    format!(
                        "The provider {} does not support data source {:?}.",
                        provider_addr.source, rc.type_name
                    ),
                )
                .with_address(&abs),
            );
            continue;
        };

        let rep = match eval_repetition(rc.count.as_ref(), rc.for_each.as_ref(), &scope, &ctx.data)
        {
            Ok(rep) => rep,
            Err(errs) => {
                ctx.expander.expand_resource(&abs, Expansion::Unknown);
                diags.append(errs);
                continue;
            }
        };
        ctx.expander.expand_resource(&abs, rep.expansion());

        let desired = match rep.expansion().keys() {
            ExpandedKeys::Unknown => continue,
            ExpandedKeys::Keys(keys) => keys,
        };

        // Which managed resources this block leans on, split by how: direct
        // references (including depends_on) always defer a pending read; with
        // conditions declared, dependencies reached indirectly through locals
        // defer too. Two blocks describing the same remote object without any
        // reference never defer each other; that gap is documented behavior.
        let ref_deps = managed_deps(&mi, rc.references().iter());
        let cond_deps = {
            let mut all_refs = rc.references();
            all_refs.extend(rc.depends_on.iter().cloned());
            transitive_managed_deps(ctx.module_config(module), &mi, &all_refs)
        };
        let has_conditions =
            !rc.lifecycle.preconditions.is_empty() || !rc.lifecycle.postconditions.is_empty();

        for key in desired {
            let addr = abs.instance(key.clone());
            let scope = scope.clone().with_key(&key, rep.each_value(&key));

            let checkable = CheckableAddr::Resource(addr.clone());
            if has_conditions {
                ctx.builder.checks.declare(checkable.clone());
            }

            let precondition_failed = run_condition_set(
                ctx,
                &rc.lifecycle.preconditions,
                CheckRuleKind::ResourcePrecondition,
                &checkable,
                &scope,
                ctx.condition_severity(),
                &mut diags,
            );
            if precondition_failed {
                continue;
            }

            let config_mv = match eval_body(&rc.body, &scope, &ctx.data) {
                Ok(mv) => mv,
                Err(errs) => {
                    diags.append(errs);
                    continue;
                }
            };

            let mut pending = ref_deps
                .iter()
                .any(|dep| ctx.builder.resource_has_pending_change(dep));
            if has_conditions {
                pending = pending
                    || cond_deps
                        .iter()
                        .any(|dep| ctx.builder.resource_has_pending_change(dep));
            }
            let deferred = pending || !config_mv.value.is_known_deep();

            let before = ctx
                .prior
                .read(|s| {
                    s.instance(&addr)
                        .and_then(|i| i.current.as_ref().map(|o| Value::from_json(o.attrs.clone())))
                })
                .await
                .unwrap_or(Value::Null);

            if deferred && ctx.opts.mode != PlanMode::RefreshOnly {
                debug!(addr = %addr, "deferring data read until apply");
                let after = proposed_new(&block, &Value::Null, &config_mv.value);
                let marks = config_mv.marks.clone();
                ctx.data
                    .set_resource_value(&addr, MarkedValue::new(after.clone(), marks.clone()));
                ctx.working.forget_instance(&addr).await;
                ctx.builder.record_change(ResourceInstanceChange {
                    addr: addr.clone(),
                    prev_run_addr: addr.clone(),
                    deposed: None,
                    action: Action::Read,
                    reason: ActionReason::ReadBecauseDependencyPending,
                    before,
                    after,
                    before_marks: Marks::new(),
                    after_marks: marks,
                    importing: None,
                    generated_config: None,
                    provider: provider_addr.clone(),
                });
                continue;
            }

            // Eager read during plan.
            let Some(provider_key) =
                resolve_provider_key(ctx, &rc, &provider_addr, &addr, &scope, &mut diags).await
            else {
                continue;
            };
            let provider = match ctx.provider_instance(&provider_addr, &provider_key).await {
                Ok(provider) => provider,
                Err(e) => {
                    provider_failure(&mut diags, &addr, e);
                    continue;
                }
            };
            let (config_value, config_marks) = config_mv.strip();
            let response = match provider
                .read_data_source(&ctx.cancel, &rc.type_name, config_value)
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    provider_failure(&mut diags, &addr, e);
                    continue;
                }
            };
            diags.append_with_address(response.diagnostics, addr.to_string());
            if diags.has_errors() {
                continue;
            }

            let mut result_marks = config_marks;
            result_marks.merge(Marks::from_paths(block.sensitive_paths(), Mark::Sensitive));
            let result = MarkedValue::new(response.state.clone(), result_marks);
            ctx.data.set_resource_value(&addr, result.clone());

            if let Some(attrs) = response.state.to_json() {
                ctx.working
                    .set_resource_provider(&abs, provider_addr.clone())
                    .await;
                ctx.working
                    .set_instance_current(
                        &addr,
                        Some(ObjectState::new(attrs).with_status(ObjectStatus::Ready)),
                    )
                    .await;
            }

            run_condition_set(
                ctx,
                &rc.lifecycle.postconditions,
                CheckRuleKind::ResourcePostcondition,
                &checkable,
                &scope.clone().with_self(result),
                ctx.condition_severity(),
                &mut diags,
            );
        }
    }
    diags
}

fn managed_deps<'a>(
    mi: &strata_domain::ModuleInstance,
    refs: impl Iterator<Item = &'a Reference>,
) -> BTreeSet<AbsResource> {
    refs.filter_map(|r| match r {
        Reference::Resource(resource) if resource.mode == ResourceMode::Managed => {
            Some(mi.resource(resource.clone()))
        }
        _ => None,
    })
    .collect()
}

/// Managed dependencies reachable through local-value indirection as well as
/// direct references.
fn transitive_managed_deps(
    mc: Option<&strata_config::ModuleConfig>,
    mi: &strata_domain::ModuleInstance,
    refs: &[Reference],
) -> BTreeSet<AbsResource> {
    let mut out = BTreeSet::new();
    let mut seen_locals: BTreeSet<String> = BTreeSet::new();
    let mut queue: Vec<Reference> = refs.to_vec();
    while let Some(r) = queue.pop() {
        match r {
            Reference::Resource(resource) if resource.mode == ResourceMode::Managed => {
                out.insert(mi.resource(resource));
            }
            Reference::Local(name) => {
                if seen_locals.insert(name.clone()) {
                    if let Some(expr) = mc.and_then(|mc| mc.locals.get(&name)) {
                        queue.extend(expr.references());
                    }
                }
            }
            _ => {}
        }
    }
    out
}
