//! Provider-config node: evaluate the block (for_each-aware), then validate
//! and configure each instance through the pool.

use tracing::debug;

use strata_domain::{Diagnostic, Diagnostics, InstanceKey, Module, ProviderConfigAddr};
use strata_eval::{eval_body, eval_repetition, Repetition};

use super::{provider_failure, PlanCtx};

pub async fn exec_provider_config(ctx: &PlanCtx, module: &Module, index: usize) -> Diagnostics {
    let mut diags = Diagnostics::new();
    let Some(mc) = ctx.module_config(module) else {
        return diags;
    };
    let Some(block) = mc.provider_configs.get(index).cloned() else {
        return diags;
    };

    let addr = ProviderConfigAddr {
        source: mc.provider_source(&block.local_name),
        module: module.clone(),
        alias: block.alias.clone(),
    };

    // Provider blocks evaluate once per module path, not per instance:
    // a provider instance is shared by every instance of its module.
    let Some(mi) = ctx.expander.module_instances(module).into_iter().next() else {
        return diags;
    };
    let scope = ctx.scope_for_instance(&mi);

    let rep = match eval_repetition(None, block.for_each.as_ref(), &scope, &ctx.data) {
        Ok(rep) => rep,
        Err(errs) => {
            diags.append(errs);
            return diags;
        }
    };

    let keys: Vec<InstanceKey> = match &rep {
        Repetition::Single => {
            ctx.provider_keys.lock().unwrap().insert(addr.clone(), None);
            vec![InstanceKey::NoKey]
        }
        Repetition::ForEach(entries) => {
            let keys: Vec<InstanceKey> = entries
                .iter()
                .map(|(k, _)| InstanceKey::Str(k.clone()))
                .collect();
            ctx.provider_keys
                .lock()
                .unwrap()
                .insert(addr.clone(), Some(keys.clone()));
            keys
        }
        Repetition::Count(_) => {
            diags.push(
                Diagnostic::error(
                    "Invalid provider repetition",
                    "Provider blocks support for_each, not count.",
                )
                .with_address(&addr),
            );
            return diags;
        }
        Repetition::Unknown => {
            diags.push(
                Diagnostic::error(
                    "Invalid provider for_each argument",
                    "The for_each value for a provider block must be known at plan time.",
                )
                .with_address(&addr),
            );
            return diags;
        }
    };

    for key in keys {
        let scope = scope.clone().with_key(&key, rep.each_value(&key));
        let body = match eval_body(&block.body, &scope, &ctx.data) {
            Ok(mv) => mv,
            Err(errs) => {
                diags.append(errs);
                continue;
            }
        };
        // Providers always receive unmarked values.
        let (value, _marks) = body.strip();

        if let Err(e) = ctx.pool.init(&addr, &key).await {
            provider_failure(&mut diags, &addr, e);
            continue;
        }
        debug!(provider = %addr, key = %key, "validating and configuring provider");
        match ctx
            .pool
            .validate_config(&ctx.cancel, &addr, &key, value.clone())
            .await
        {
            Ok(validate_diags) => {
                diags.append_with_address(validate_diags, &addr);
            }
            Err(e) => {
                provider_failure(&mut diags, &addr, e);
                continue;
            }
        }
        if diags.has_errors() {
            continue;
        }
        match ctx.pool.configure(&ctx.cancel, &addr, &key, value).await {
            Ok(configure_diags) => {
                diags.append_with_address(configure_diags, &addr);
            }
            Err(e) => provider_failure(&mut diags, &addr, e),
        }
    }
    diags
}
