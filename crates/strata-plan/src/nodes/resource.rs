//! Managed-resource node: expansion, the provider conversation for every
//! instance (upgrade, refresh, plan), condition checks and change recording.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use strata_config::{CheckRuleConfig, ResourceConfig};
use strata_domain::{
    AbsResource, CheckRuleAddr, CheckRuleKind, CheckableAddr, Diagnostic, Diagnostics,
    InstanceKey, Mark, MarkedValue, Marks, Module, ProviderConfigAddr, Resource,
    ResourceInstance, Value,
};
use strata_eval::{eval_body, eval_repetition, Expansion, ExpandedKeys, Repetition, Scope};
use strata_provider::{
    PlanResourceChangeRequest, Provider, ProviderError, ResourceSchema,
};
use strata_state::{canonical_hash, ObjectState, ObjectStatus};

use crate::checks::evaluate_rule;
use crate::imports::resolve_imports;
use crate::options::PlanMode;
use crate::plan::{
    Action, ActionReason, DriftedResource, Importing, ResourceInstanceChange,
};
use crate::synth::{derive_action, normalize, proposed_new};

use super::{provider_failure, PlanCtx};

pub async fn exec_resource(ctx: &PlanCtx, module: &Module, resource: &Resource) -> Diagnostics {
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
        register_filtered(ctx, module, resource, &rc).await;
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
        let Some(resource_schema) = schema.resource(&rc.type_name).cloned() else {
            ctx.expander.expand_resource(&abs, Expansion::Unknown);
            diags.push(
                Diagnostic::error(
                    "Unsupported resource type",
                    format!(
                        "The provider {} does not support resource type {:?}.",
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

        // Import blocks are root-only; placement is validated before the
        // walk, so a non-root instance simply has none.
        let imports: HashMap<InstanceKey, String> = if mi.is_root() {
            let blocks: Vec<_> = ctx
                .config
                .root
                .imports
                .iter()
                .filter(|b| &b.to == resource)
                .collect();
            if blocks.is_empty() {
                HashMap::new()
            } else {
                let (resolved, import_diags) =
                    resolve_imports(resource, &blocks, &scope, &ctx.data);
                diags.append(import_diags);
                resolved.into_iter().map(|r| (r.key, r.id)).collect()
            }
        } else {
            HashMap::new()
        };

        let prior_keys: Vec<InstanceKey> = ctx
            .prior
            .read(|s| {
                s.resource(&abs)
                    .map(|r| r.instances.keys().cloned().collect())
                    .unwrap_or_default()
            })
            .await;

        if ctx.opts.mode == PlanMode::Destroy {
            for key in prior_keys {
                let instance_diags = plan_destroy_instance(
                    ctx,
                    &rc,
                    &resource_schema,
                    &provider_addr,
                    abs.instance(key),
                )
                .await;
                diags.append(instance_diags);
            }
            continue;
        }

        let desired = match rep.expansion().keys() {
            ExpandedKeys::Unknown => {
                // The repetition is undecidable this plan; instances are
                // deferred and downstream references observe unknown.
                debug!(resource = %abs, "expansion unknown, deferring instances");
                continue;
            }
            ExpandedKeys::Keys(keys) => keys,
        };

        for key in &desired {
            let import_id = imports.get(key).cloned();
            let instance_diags = plan_instance(
                ctx,
                &rc,
                &resource_schema,
                &provider_addr,
                &abs,
                &rep,
                &scope,
                key.clone(),
                import_id,
            )
            .await;
            diags.append(instance_diags);
        }

        // Prior instances outside the current expansion are doomed: their
        // repetition key no longer exists.
        for key in prior_keys {
            if !desired.contains(&key) {
                let instance_diags = plan_stale_instance(
                    ctx,
                    &rc,
                    &resource_schema,
                    &provider_addr,
                    abs.instance(key),
                )
                .await;
                diags.append(instance_diags);
            }
        }
    }
    diags
}

/// A resource pruned by targeting still registers its expansion and exposes
/// its prior values, so references elsewhere keep resolving; it just holds no
/// provider conversation and records no changes.
pub(crate) async fn register_filtered(
    ctx: &PlanCtx,
    module: &Module,
    resource: &Resource,
    rc: &ResourceConfig,
) {
    for mi in ctx.expander.module_instances(module) {
        let abs = mi.resource(resource.clone());
        let scope = ctx.scope_for_instance(&mi);
        let rep = eval_repetition(rc.count.as_ref(), rc.for_each.as_ref(), &scope, &ctx.data)
            .unwrap_or(Repetition::Unknown);
        ctx.expander.expand_resource(&abs, rep.expansion());
        if let ExpandedKeys::Keys(keys) = rep.expansion().keys() {
            for key in keys {
                let addr = abs.instance(key);
                let value = ctx
                    .prior
                    .read(|s| {
                        s.instance(&addr)
                            .and_then(|i| i.current.as_ref().map(|o| o.marked_value()))
                    })
                    .await
                    .unwrap_or_else(|| MarkedValue::unmarked(Value::Unknown));
                ctx.data.set_resource_value(&addr, value);
            }
        }
    }
}

/// Resolve and validate the provider instance key for one resource instance,
/// enforcing the pool contract: keys must match the provider block's current
/// for_each, and state-recorded keys must not silently outlive it.
pub(crate) async fn resolve_provider_key(
    ctx: &PlanCtx,
    rc: &ResourceConfig,
    provider_addr: &ProviderConfigAddr,
    addr: &ResourceInstance,
    scope: &Scope,
    diags: &mut Diagnostics,
) -> Option<InstanceKey> {
    let declared = ctx
        .provider_keys
        .lock()
        .unwrap()
        .get(provider_addr)
        .cloned()
        .unwrap_or(None);

    let key = match rc.provider.as_ref().and_then(|p| p.key_expr.as_ref()) {
        None => InstanceKey::NoKey,
        Some(expr) => match strata_eval::eval_expr(expr, scope, &ctx.data) {
            Err(errs) => {
                diags.append(errs);
                return None;
            }
            Ok(mv) => match mv.value {
                Value::String(s) => InstanceKey::Str(s),
                Value::Unknown => {
                    diags.push(
                        Diagnostic::error(
                            "Invalid provider instance key",
                            "The provider instance key must be known at plan time.",
                        )
                        .with_address(addr),
                    );
                    return None;
                }
                _ => {
                    diags.push(
                        Diagnostic::error(
                            "Invalid provider instance key",
                            "The provider instance key must be a string.",
                        )
                        .with_address(addr),
                    );
                    return None;
                }
            },
        },
    };

    match (&declared, &key) {
        (None, InstanceKey::NoKey) => {}
        (None, other) => {
            diags.push(
                Diagnostic::error(
                    "Provider instance not declared",
                    ProviderError::UnknownInstanceKey {
                        provider: provider_addr.to_string(),
                        key: other.to_string(),
                    }
                    .to_string(),
                )
                .with_address(addr),
            );
            return None;
        }
        (Some(keys), InstanceKey::Str(_)) if keys.contains(&key) => {}
        (Some(_), _) => {
            diags.push(
                Diagnostic::error(
                    "Provider instance not declared",
                    ProviderError::UnknownInstanceKey {
                        provider: provider_addr.to_string(),
                        key: key.to_string(),
                    }
                    .to_string(),
                )
                .with_address(addr),
            );
            return None;
        }
    }

    // A state-recorded key from a previous run must still be declared; it is
    // never silently migrated.
    let recorded = ctx
        .prior
        .read(|s| s.instance(addr).map(|i| i.provider_key.clone()))
        .await;
    if let Some(recorded) = recorded {
        let stale = match (&declared, &recorded) {
            (_, InstanceKey::NoKey) => false,
            (None, _) => true,
            (Some(keys), recorded) => !keys.contains(recorded),
        };
        if stale {
            diags.push(
                Diagnostic::error(
                    "Stale provider instance key",
                    ProviderError::StaleInstanceKey {
                        resource: addr.to_string(),
                        key: recorded.to_string(),
                    }
                    .to_string(),
                )
                .with_address(addr),
            );
            return None;
        }
    }

    Some(key)
}

/// Upgrade a stored object to the provider's current schema version and, when
/// permitted, refresh it against the real world. Writes the upgraded value to
/// the previous-run state and the refreshed value to prior and working
/// states; records drift. Returns the surviving object, or None when the
/// remote object is gone.
pub(crate) async fn upgrade_and_refresh(
    ctx: &PlanCtx,
    provider: &Arc<dyn Provider>,
    schema: &ResourceSchema,
    type_name: &str,
    addr: &ResourceInstance,
    prior_obj: Option<ObjectState>,
    refresh_allowed: bool,
    diags: &mut Diagnostics,
) -> Option<ObjectState> {
    let mut object = prior_obj?;

    if object.schema_version != schema.version {
        let response = provider
            .upgrade_resource_state(
                &ctx.cancel,
                type_name,
                object.schema_version,
                object.attrs.clone(),
            )
            .await;
        match response {
            Err(e) => {
                provider_failure(diags, addr, e);
                return None;
            }
            Ok(response) => {
                diags.append_with_address(response.diagnostics, addr.to_string());
                if diags.has_errors() {
                    return None;
                }
                let Some(upgraded) = response.upgraded.to_json() else {
                    diags.push(
                        Diagnostic::error(
                            "Invalid upgrade result",
                            "The provider returned an unknown value from state upgrade.",
                        )
                        .with_address(addr),
                    );
                    return None;
                };
                object.attrs = upgraded;
                object.schema_version = schema.version;
                ctx.prev_run
                    .set_instance_current(addr, Some(object.clone()))
                    .await;
                ctx.prior
                    .set_instance_current(addr, Some(object.clone()))
                    .await;
                ctx.working
                    .set_instance_current(addr, Some(object.clone()))
                    .await;
            }
        }
    }

    if !refresh_allowed {
        return Some(object);
    }

    let response = provider
        .read_resource(
            &ctx.cancel,
            type_name,
            Value::from_json(object.attrs.clone()),
            object.private.clone(),
        )
        .await;
    let response = match response {
        Ok(response) => response,
        Err(e) => {
            provider_failure(diags, addr, e);
            return None;
        }
    };
    diags.append_with_address(response.diagnostics, addr.to_string());
    if diags.has_errors() {
        return None;
    }

    if response.new_state.is_null() {
        // Deleted out-of-band.
        debug!(addr = %addr, "object gone during refresh");
        ctx.builder.record_drift(DriftedResource {
            addr: addr.clone(),
            action: Action::Delete,
            before: Value::from_json(object.attrs.clone()),
            after: Value::Null,
        });
        ctx.prior.set_instance_current(addr, None).await;
        ctx.working.set_instance_current(addr, None).await;
        return None;
    }

    let Some(refreshed) = response.new_state.to_json() else {
        diags.push(
            Diagnostic::error(
                "Invalid refresh result",
                "The provider returned an unknown value from refresh.",
            )
            .with_address(addr),
        );
        return None;
    };
    if canonical_hash(&refreshed) != canonical_hash(&object.attrs) {
        ctx.builder.record_drift(DriftedResource {
            addr: addr.clone(),
            action: Action::Update,
            before: Value::from_json(object.attrs.clone()),
            after: Value::from_json(refreshed.clone()),
        });
    }
    object.attrs = refreshed;
    object.private = response.private;
    ctx.prior
        .set_instance_current(addr, Some(object.clone()))
        .await;
    ctx.working
        .set_instance_current(addr, Some(object.clone()))
        .await;
    Some(object)
}

fn object_marks(object: &ObjectState, schema: &ResourceSchema) -> Marks {
    let mut marks = Marks::from_paths(object.sensitive_paths.iter().cloned(), Mark::Sensitive);
    marks.merge(Marks::from_paths(schema.block.sensitive_paths(), Mark::Sensitive));
    marks
}

pub(crate) fn run_condition_set(
    ctx: &PlanCtx,
    rules: &[CheckRuleConfig],
    kind: CheckRuleKind,
    checkable: &CheckableAddr,
    scope: &Scope,
    severity: strata_domain::Severity,
    diags: &mut Diagnostics,
) -> bool {
    let mut fatal = false;
    for (index, rule) in rules.iter().enumerate() {
        let rule_addr = CheckRuleAddr::new(checkable.clone(), kind, index);
        let (status, message, rule_diags) =
            evaluate_rule(rule, &rule_addr, scope, &ctx.data, severity);
        ctx.builder.checks.record(&rule_addr, status, message);
        fatal = fatal || rule_diags.has_errors();
        diags.append(rule_diags);
    }
    fatal
}

#[allow(clippy::too_many_arguments)]
async fn plan_instance(
    ctx: &PlanCtx,
    rc: &ResourceConfig,
    schema: &ResourceSchema,
    provider_addr: &ProviderConfigAddr,
    abs: &AbsResource,
    rep: &Repetition,
    base_scope: &Scope,
    key: InstanceKey,
    import_id: Option<String>,
) -> Diagnostics {
    let mut diags = Diagnostics::new();
    let addr = abs.instance(key.clone());
    let scope = base_scope.clone().with_key(&key, rep.each_value(&key));

    let Some(provider_key) =
        resolve_provider_key(ctx, rc, provider_addr, &addr, &scope, &mut diags).await
    else {
        return diags;
    };
    let provider = match ctx.provider_instance(provider_addr, &provider_key).await {
        Ok(provider) => provider,
        Err(e) => {
            provider_failure(&mut diags, &addr, e);
            return diags;
        }
    };

    let mut prior_obj = ctx
        .prior
        .read(|s| s.instance(&addr).and_then(|i| i.current.clone()))
        .await;
    let deposed_keys: Vec<strata_domain::DeposedKey> = ctx
        .prior
        .read(|s| {
            s.instance(&addr)
                .map(|i| i.deposed.keys().cloned().collect())
                .unwrap_or_default()
        })
        .await;

    // Import seeds the prior state before anything else looks at it.
    let mut importing = None;
    if prior_obj.is_none() {
        if let Some(id) = import_id {
            match provider
                .import_resource_state(&ctx.cancel, &rc.type_name, &id)
                .await
            {
                Err(e) => {
                    provider_failure(&mut diags, &addr, e);
                    return diags;
                }
                Ok(response) => {
                    diags.append_with_address(response.diagnostics, addr.to_string());
                    if diags.has_errors() {
                        return diags;
                    }
                    let Some(imported) = response.imported.into_iter().next() else {
                        diags.push(
                            Diagnostic::error(
                                "Import returned no resources",
                                format!("The provider returned nothing for import ID {:?}.", id),
                            )
                            .with_address(&addr),
                        );
                        return diags;
                    };
                    let Some(attrs) = imported.state.to_json() else {
                        diags.push(
                            Diagnostic::error(
                                "Invalid import result",
                                "The provider returned an unknown value from import.",
                            )
                            .with_address(&addr),
                        );
                        return diags;
                    };
                    let mut object = ObjectState::new(attrs).with_schema_version(schema.version);
                    object.private = imported.private;
                    for state in [&ctx.prior, &ctx.working] {
                        state
                            .set_resource_provider(abs, provider_addr.clone())
                            .await;
                        state.set_instance_current(&addr, Some(object.clone())).await;
                    }
                    debug!(addr = %addr, id = %id, "seeded prior state from import");
                    prior_obj = Some(object);
                    importing = Some(Importing { id });
                }
            }
        }
    }

    let refresh_allowed = !ctx.opts.skip_refresh && prior_obj.is_some();
    let current = upgrade_and_refresh(
        ctx,
        &provider,
        schema,
        &rc.type_name,
        &addr,
        prior_obj,
        refresh_allowed,
        &mut diags,
    )
    .await;
    if diags.has_errors() {
        return diags;
    }

    let prior_value = current
        .as_ref()
        .map(|o| normalize(&schema.block, Value::from_json(o.attrs.clone())))
        .unwrap_or(Value::Null);
    let prior_marks = current
        .as_ref()
        .map(|o| object_marks(o, schema))
        .unwrap_or_default();
    let tainted = current
        .as_ref()
        .is_some_and(|o| o.status == ObjectStatus::Tainted);

    let checkable = CheckableAddr::Resource(addr.clone());
    let has_conditions =
        !rc.lifecycle.preconditions.is_empty() || !rc.lifecycle.postconditions.is_empty();
    if has_conditions {
        ctx.builder.checks.declare(checkable.clone());
    }

    if ctx.opts.mode == PlanMode::RefreshOnly {
        // Drift reporting only: no proposed changes, conditions demoted to
        // warnings against the refreshed value.
        ctx.data.set_resource_value(
            &addr,
            MarkedValue::new(prior_value.clone(), prior_marks.clone()),
        );
        let self_scope = scope
            .clone()
            .with_self(MarkedValue::new(prior_value, prior_marks));
        run_condition_set(
            ctx,
            &rc.lifecycle.preconditions,
            CheckRuleKind::ResourcePrecondition,
            &checkable,
            &scope,
            ctx.condition_severity(),
            &mut diags,
        );
        run_condition_set(
            ctx,
            &rc.lifecycle.postconditions,
            CheckRuleKind::ResourcePostcondition,
            &checkable,
            &self_scope,
            ctx.condition_severity(),
            &mut diags,
        );
        return diags;
    }

    // Preconditions gate the provider plan call.
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
        return diags;
    }

    let config_mv = match eval_body(&rc.body, &scope, &ctx.data) {
        Ok(mv) => mv,
        Err(errs) => {
            diags.append(errs);
            return diags;
        }
    };
    if importing.is_some() && !config_mv.value.is_known_deep() {
        diags.push(
            Diagnostic::error(
                "Invalid import configuration",
                format!(
                    "The configuration for {} depends on values that cannot be determined \
                     until apply, so it cannot be used to import an existing object.",
                    addr
                ),
            )
            .with_address(&addr),
        );
        return diags;
    }
    let (config_value, config_marks) = config_mv.strip();
    let proposed = proposed_new(&schema.block, &prior_value, &config_value);

    let response = provider
        .plan_resource_change(
            &ctx.cancel,
            PlanResourceChangeRequest {
                type_name: rc.type_name.clone(),
                prior: prior_value.clone(),
                proposed,
                config: config_value,
                prior_private: current.as_ref().map(|o| o.private.clone()).unwrap_or_default(),
            },
        )
        .await;
    let response = match response {
        Ok(response) => response,
        Err(e) => {
            provider_failure(&mut diags, &addr, e);
            return diags;
        }
    };
    diags.append_with_address(response.diagnostics, addr.to_string());
    if diags.has_errors() {
        return diags;
    }
    let planned = response.planned;

    // Re-mark the provider's unmarked result: configuration marks, schema
    // sensitivity and path marks recorded in prior state all apply.
    let mut after_marks = config_marks;
    after_marks.merge(Marks::from_paths(schema.block.sensitive_paths(), Mark::Sensitive));
    after_marks.merge(prior_marks.clone());

    let force = ctx.opts.force_replace.iter().any(|fr| fr == &addr);
    let (action, reason) = derive_action(
        &prior_value,
        &planned,
        &response.requires_replace,
        force,
        rc.lifecycle.create_before_destroy,
        tainted,
    );

    let self_value = MarkedValue::new(planned.clone(), after_marks.clone());
    run_condition_set(
        ctx,
        &rc.lifecycle.postconditions,
        CheckRuleKind::ResourcePostcondition,
        &checkable,
        &scope.clone().with_self(self_value.clone()),
        ctx.condition_severity(),
        &mut diags,
    );

    debug!(addr = %addr, action = %action, "planned resource instance");
    ctx.builder.record_change(ResourceInstanceChange {
        addr: addr.clone(),
        prev_run_addr: ctx.moves.prev_run_addr(&addr),
        deposed: None,
        action,
        reason,
        before: prior_value,
        after: planned.clone(),
        before_marks: prior_marks,
        after_marks: after_marks.clone(),
        importing,
        generated_config: None,
        provider: provider_addr.clone(),
    });

    // Downstream nodes see the planned value.
    ctx.data
        .set_resource_value(&addr, MarkedValue::new(planned.clone(), after_marks));
    match (&action, planned.to_json()) {
        (Action::Delete, _) => {
            ctx.working.set_instance_current(&addr, None).await;
        }
        (_, Some(attrs)) => {
            ctx.working.set_resource_provider(abs, provider_addr.clone()).await;
            ctx.working
                .set_instance_current(
                    &addr,
                    Some(
                        ObjectState::new(attrs)
                            .with_status(ObjectStatus::Planned)
                            .with_schema_version(schema.version),
                    ),
                )
                .await;
        }
        // Partially-unknown planned values stay out of the working state;
        // the shared value table above carries them instead.
        (_, None) => {}
    }

    // Deposed generations of a configured instance are always planned away.
    for deposed_key in deposed_keys {
        let before = ctx
            .prior
            .read(|s| {
                s.instance(&addr)
                    .and_then(|i| i.deposed.get(&deposed_key).cloned())
            })
            .await;
        let Some(before) = before else { continue };
        ctx.builder.record_change(ResourceInstanceChange {
            addr: addr.clone(),
            prev_run_addr: addr.clone(),
            deposed: Some(deposed_key),
            action: Action::Delete,
            reason: ActionReason::NoReason,
            before: Value::from_json(before.attrs),
            after: Value::Null,
            before_marks: Marks::new(),
            after_marks: Marks::new(),
            importing: None,
            generated_config: None,
            provider: provider_addr.clone(),
        });
    }

    diags
}

/// Destroy-mode planning for one instance: refresh (unless skipped), then a
/// Delete change for the current object and every deposed generation.
async fn plan_destroy_instance(
    ctx: &PlanCtx,
    rc: &ResourceConfig,
    schema: &ResourceSchema,
    provider_addr: &ProviderConfigAddr,
    addr: ResourceInstance,
) -> Diagnostics {
    plan_removal(
        ctx,
        &rc.type_name,
        schema,
        provider_addr,
        addr,
        Action::Delete,
        ActionReason::DestroyBecauseDestroyMode,
    )
    .await
}

/// A prior instance whose key fell outside the current expansion.
async fn plan_stale_instance(
    ctx: &PlanCtx,
    rc: &ResourceConfig,
    schema: &ResourceSchema,
    provider_addr: &ProviderConfigAddr,
    addr: ResourceInstance,
) -> Diagnostics {
    plan_removal(
        ctx,
        &rc.type_name,
        schema,
        provider_addr,
        addr,
        Action::Delete,
        ActionReason::DeleteBecauseWrongRepetition,
    )
    .await
}

/// Shared removal planning used by destroy mode, wrong-repetition instances
/// and orphans: upgrade + refresh, then a removal change for whatever
/// survived, plus each deposed generation.
pub(crate) async fn plan_removal(
    ctx: &PlanCtx,
    type_name: &str,
    schema: &ResourceSchema,
    provider_addr: &ProviderConfigAddr,
    addr: ResourceInstance,
    action: Action,
    reason: ActionReason,
) -> Diagnostics {
    let mut diags = Diagnostics::new();
    let provider = match ctx.provider_instance(provider_addr, &InstanceKey::NoKey).await {
        Ok(provider) => provider,
        Err(e) => {
            provider_failure(&mut diags, &addr, e);
            return diags;
        }
    };

    let prior_obj = ctx
        .prior
        .read(|s| s.instance(&addr).and_then(|i| i.current.clone()))
        .await;
    let deposed: Vec<(strata_domain::DeposedKey, ObjectState)> = ctx
        .prior
        .read(|s| {
            s.instance(&addr)
                .map(|i| i.deposed.clone().into_iter().collect())
                .unwrap_or_default()
        })
        .await;

    let refresh_allowed =
        !ctx.opts.skip_refresh && prior_obj.is_some() && action != Action::Forget;
    let current = upgrade_and_refresh(
        ctx,
        &provider,
        schema,
        type_name,
        &addr,
        prior_obj,
        refresh_allowed,
        &mut diags,
    )
    .await;
    if diags.has_errors() {
        return diags;
    }

    if let Some(object) = current {
        let marks = object_marks(&object, schema);
        ctx.builder.record_change(ResourceInstanceChange {
            addr: addr.clone(),
            prev_run_addr: ctx.moves.prev_run_addr(&addr),
            deposed: None,
            action,
            reason,
            before: Value::from_json(object.attrs),
            after: Value::Null,
            before_marks: marks,
            after_marks: Marks::new(),
            importing: None,
            generated_config: None,
            provider: provider_addr.clone(),
        });
    }

    for (deposed_key, object) in deposed {
        ctx.builder.record_change(ResourceInstanceChange {
            addr: addr.clone(),
            prev_run_addr: addr.clone(),
            deposed: Some(deposed_key),
            action,
            reason: ActionReason::NoReason,
            before: Value::from_json(object.attrs),
            after: Value::Null,
            before_marks: Marks::new(),
            after_marks: Marks::new(),
            importing: None,
            generated_config: None,
            provider: provider_addr.clone(),
        });
    }

    // Whatever the action, the working state no longer contains the
    // instance; downstream evaluation must not see it.
    ctx.working.forget_instance(&addr).await;
    ctx.data
        .set_resource_value(&addr, MarkedValue::unmarked(Value::Null));
    diags
}
