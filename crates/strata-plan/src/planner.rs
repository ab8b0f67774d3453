//! The plan orchestrator: directive preprocessing, graph construction,
//! the parallel walk, and plan assembly.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use strata_config::Config;
use strata_domain::{Diagnostic, Diagnostics, InstanceKey, ProviderConfigAddr};
use strata_eval::{EvalData, Expander, Scope};
use strata_provider::{ProviderPool, ProviderRegistry};
use strata_state::{ObjectState, State, SyncState};

use crate::builder::PlanBuilder;
use crate::error::PlanError;
use crate::generate::generate_config;
use crate::graph_build::build_graph;
use crate::imports::{resolve_imports, validate_import_placement};
use crate::moves::apply_moves;
use crate::nodes::{exec_node, PlanCtx};
use crate::options::PlanOpts;
use crate::plan::{Action, ActionReason, Importing, Plan, PlanRun, ResourceInstanceChange};
use crate::removed::{removed_index, validate_removed};
use crate::targeting::apply_targeting;

fn walk_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn finished_run(
    opts: &PlanOpts,
    prior_state: State,
    prev_run_state: State,
    builder: PlanBuilder,
    mut diagnostics: Diagnostics,
) -> PlanRun {
    diagnostics.sort();
    let (changes, drifted_resources, output_changes, checks) = builder.into_parts();
    let plan = Plan {
        mode: opts.mode,
        changes,
        drifted_resources,
        prior_state,
        prev_run_state,
        checks,
        output_changes,
        errored: diagnostics.has_errors(),
        timestamp: Utc::now(),
    };
    PlanRun { plan, diagnostics }
}

/// Produce a plan from a validated configuration, the prior state and the
/// plan options. Provider plugins are reached through the factories in
/// `registry`; `cancel` aborts in-flight provider calls cooperatively.
///
/// Structural impossibilities (conflicting options, a dependency cycle)
/// return `Err`; everything else is reported through diagnostics on the
/// returned plan, which carries `errored = true` and whatever partial
/// changes were computed.
pub async fn plan(
    config: Config,
    prior_state: State,
    opts: PlanOpts,
    registry: Arc<ProviderRegistry>,
    cancel: CancellationToken,
) -> Result<PlanRun, PlanError> {
    if !opts.targets.is_empty() && !opts.excludes.is_empty() {
        return Err(PlanError::InvalidOptions(
            "targets and excludes are mutually exclusive".into(),
        ));
    }
    info!(mode = %opts.mode, "starting plan");
    let mut diagnostics = Diagnostics::new();

    // Structural contradictions abort before anything runs: a removed block
    // naming a still-configured object, or an import block declared outside
    // the root module.
    let mut precheck = validate_removed(&config);
    precheck.append(validate_import_placement(&config));
    if precheck.has_errors() {
        diagnostics.append(precheck);
        return Ok(finished_run(
            &opts,
            prior_state.clone(),
            prior_state,
            PlanBuilder::new(),
            diagnostics,
        ));
    }
    diagnostics.append(precheck);

    let pool = ProviderPool::new(registry);

    // Directive preprocessing in fixed order: moved first, then removed
    // (indexed for the orphan planner), then imports (resolved during the
    // walk, where their referenced values exist).
    let mut moved_state = prior_state;
    let (moves, move_diags) = apply_moves(&config, &mut moved_state, &pool, &cancel).await;
    diagnostics.append(move_diags);
    let removed = removed_index(&config);

    let graph = build_graph(&config, &moved_state)?;
    graph.check_acyclic()?;
    debug!(nodes = graph.node_count(), "graph built");

    let (filter, targeting_diags) = apply_targeting(&graph, &config, &opts);
    let targeting_failed = targeting_diags.has_errors();
    diagnostics.append(targeting_diags);
    if targeting_failed {
        return Ok(finished_run(
            &opts,
            moved_state.clone(),
            moved_state,
            PlanBuilder::new(),
            diagnostics,
        ));
    }

    let expander = Arc::new(Expander::new());
    let ctx = Arc::new(PlanCtx {
        data: EvalData::new(expander.clone()),
        expander,
        opts,
        pool,
        prev_run: SyncState::new(moved_state.clone()),
        prior: SyncState::new(moved_state.clone()),
        working: SyncState::new(moved_state),
        builder: PlanBuilder::new(),
        cancel: cancel.clone(),
        moves,
        removed,
        filter,
        config,
        module_reps: Mutex::new(HashMap::new()),
        provider_keys: Mutex::new(HashMap::new()),
        default_providers: tokio::sync::Mutex::new(HashSet::new()),
    });

    let report = strata_graph::walk(&graph, walk_concurrency(), &cancel, &HashSet::new(), {
        let ctx = ctx.clone();
        move |_, node| {
            let ctx = ctx.clone();
            let node = node.clone();
            exec_node(ctx, node)
        }
    })
    .await;
    debug!(
        executed = report.executed,
        skipped = report.skipped.len(),
        "walk finished"
    );
    diagnostics.append(report.diagnostics);

    // Imports whose target has no configuration block: generate config or
    // refuse, after the walk so their expressions can see evaluated values.
    let import_diags = process_configless_imports(&ctx).await;
    diagnostics.append(import_diags);

    ctx.pool.close_all().await;
    let ctx = Arc::try_unwrap(ctx).unwrap_or_else(|_| {
        unreachable!("plan context still shared after walk completion")
    });
    let prior_final = ctx.prior.into_inner();
    let prev_run_final = ctx.prev_run.into_inner();

    let run = finished_run(&ctx.opts, prior_final, prev_run_final, ctx.builder, diagnostics);
    info!(
        changes = run.plan.changes.resources.len(),
        errored = run.plan.errored,
        "plan complete"
    );
    Ok(run)
}

/// Handle import blocks whose `to` address has no resource configuration:
/// either generate configuration text (root module, no repetition, opted in)
/// or report the missing configuration.
async fn process_configless_imports(ctx: &PlanCtx) -> Diagnostics {
    let mut diags = Diagnostics::new();

    for block in &ctx.config.root.imports {
        if ctx.config.root.resource(&block.to).is_some() {
            continue;
        }
        let cr = strata_domain::ConfigResource {
            module: strata_domain::Module::root(),
            resource: block.to.clone(),
        };
        if !ctx.filter.selects(&cr) {
            continue;
        }

        if ctx.opts.generate_config_path.is_none() {
            diags.push(
                Diagnostic::error(
                    "Configuration for import target does not exist",
                    format!(
                        "The target {} does not have a resource configuration block. Add \
                         one, or enable configuration generation.",
                        block.to
                    ),
                )
                .with_address(&block.to),
            );
            continue;
        }
        if block.to_key_expr.is_some() || block.for_each.is_some() {
            diags.push(
                Diagnostic::error(
                    "Configuration generation not supported for repeated resources",
                    format!(
                        "Cannot generate configuration for {} because the import uses \
                         count or for_each addressing.",
                        block.to
                    ),
                )
                .with_address(&block.to),
            );
            continue;
        }

        let (resolved, resolve_diags) =
            resolve_imports(&block.to, &[block], &Scope::root(), &ctx.data);
        diags.append(resolve_diags);
        let Some(resolved) = resolved.into_iter().next() else {
            continue;
        };

        // The implied default provider for the target's type.
        let local_name = block
            .to
            .type_name
            .split('_')
            .next()
            .unwrap_or(&block.to.type_name);
        let provider_addr = ProviderConfigAddr {
            source: ctx.config.root.provider_source(local_name),
            module: strata_domain::Module::root(),
            alias: None,
        };
        let provider = match ctx
            .provider_instance(&provider_addr, &InstanceKey::NoKey)
            .await
        {
            Ok(provider) => provider,
            Err(e) => {
                crate::nodes::provider_failure(&mut diags, &block.to, e);
                continue;
            }
        };
        let schema = match ctx.pool.schema(&ctx.cancel, &provider_addr.source).await {
            Ok(schema) => schema,
            Err(e) => {
                crate::nodes::provider_failure(&mut diags, &block.to, e);
                continue;
            }
        };
        let Some(resource_schema) = schema.resource(&block.to.type_name) else {
            diags.push(
                Diagnostic::error(
                    "Unsupported resource type",
                    format!(
                        "The provider {} does not support resource type {:?}.",
                        provider_addr.source, block.to.type_name
                    ),
                )
                .with_address(&block.to),
            );
            continue;
        };

        let response = match provider
            .import_resource_state(&ctx.cancel, &block.to.type_name, &resolved.id)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                crate::nodes::provider_failure(&mut diags, &block.to, e);
                continue;
            }
        };
        let failed = response.diagnostics.has_errors();
        diags.append_with_address(response.diagnostics, block.to.to_string());
        if failed {
            continue;
        }
        let Some(imported) = response.imported.into_iter().next() else {
            diags.push(
                Diagnostic::error(
                    "Import returned no resources",
                    format!(
                        "The provider returned nothing for import ID {:?}.",
                        resolved.id
                    ),
                )
                .with_address(&block.to),
            );
            continue;
        };
        let Some(attrs) = imported.state.to_json() else {
            diags.push(
                Diagnostic::error(
                    "Invalid import result",
                    "The provider returned an unknown value from import.",
                )
                .with_address(&block.to),
            );
            continue;
        };

        let addr = strata_domain::ModuleInstance::root()
            .resource(block.to.clone())
            .instance(InstanceKey::NoKey);
        let generated = generate_config(&block.to, &resource_schema.block, &imported.state);
        let object = ObjectState::new(attrs.clone()).with_schema_version(resource_schema.version);
        for state in [&ctx.prior, &ctx.working] {
            state
                .set_resource_provider(&addr.abs_resource(), provider_addr.clone())
                .await;
            state.set_instance_current(&addr, Some(object.clone())).await;
        }

        debug!(addr = %addr, id = %resolved.id, "generated configuration for import");
        let value = strata_domain::Value::from_json(attrs);
        ctx.builder.record_change(ResourceInstanceChange {
            addr: addr.clone(),
            prev_run_addr: addr,
            deposed: None,
            action: Action::NoOp,
            reason: ActionReason::NoReason,
            before: value.clone(),
            after: value,
            before_marks: Default::default(),
            after_marks: Default::default(),
            importing: Some(Importing { id: resolved.id }),
            generated_config: Some(generated),
            provider: provider_addr,
        });
    }
    diags
}
