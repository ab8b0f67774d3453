//! Orphan node: prior-state resources with no configuration counterpart.

use tracing::debug;

use strata_domain::{AbsResource, Diagnostic, Diagnostics, ResourceMode};

use crate::options::PlanMode;
use crate::plan::{Action, ActionReason};

use super::resource::plan_removal;
use super::PlanCtx;

pub async fn exec_orphan(ctx: &PlanCtx, addr: &AbsResource) -> Diagnostics {
    let mut diags = Diagnostics::new();

    let cr = strata_domain::ConfigResource {
        module: addr.module.module(),
        resource: addr.resource.clone(),
    };
    if !ctx.filter.selects(&cr) {
        return diags;
    }

    let Some((provider_addr, keys)) = ctx
        .prior
        .read(|s| {
            s.resource(addr).map(|r| {
                (
                    r.provider_config.clone(),
                    r.instances.keys().cloned().collect::<Vec<_>>(),
                )
            })
        })
        .await
    else {
        return diags;
    };

    // Stale data results carry no remote object; they fall out of state
    // without ceremony.
    if addr.resource.mode == ResourceMode::Data {
        for key in keys {
            ctx.working.forget_instance(&addr.instance(key)).await;
        }
        return diags;
    }

    let schema = match ctx.pool.schema(&ctx.cancel, &provider_addr.source).await {
        Ok(schema) => schema,
        Err(e) => {
            super::provider_failure(&mut diags, addr, e);
            return diags;
        }
    };
    let Some(resource_schema) = schema.resource(&addr.resource.type_name).cloned() else {
        diags.push(
            Diagnostic::error(
                "Unsupported resource type",
                format!(
                    "The provider {} no longer supports resource type {:?}, which is still \
                     tracked in state.",
                    provider_addr.source, addr.resource.type_name
                ),
            )
            .with_address(addr),
        );
        return diags;
    };

    let removed = ctx.removed.covers(&addr.module, &addr.resource);
    let (action, reason) = if removed {
        let reason = if ctx.moves.unmoved_sources.contains(&cr) {
            ActionReason::DeleteBecauseNoMoveTarget
        } else {
            ActionReason::DeleteBecauseNoResourceConfig
        };
        (Action::Forget, reason)
    } else if ctx.opts.mode == PlanMode::Destroy {
        (Action::Delete, ActionReason::DestroyBecauseDestroyMode)
    } else if ctx
        .config
        .module(&addr.module.module())
        .is_none()
    {
        (Action::Delete, ActionReason::DeleteBecauseNoModule)
    } else {
        (Action::Delete, ActionReason::DeleteBecauseNoResourceConfig)
    };

    debug!(addr = %addr, action = %action, "planning orphaned resource");
    for key in keys {
        let instance_diags = plan_removal(
            ctx,
            &addr.resource.type_name,
            &resource_schema,
            &provider_addr,
            addr.instance(key),
            action,
            reason,
        )
        .await;
        diags.append(instance_diags);
    }
    diags
}
