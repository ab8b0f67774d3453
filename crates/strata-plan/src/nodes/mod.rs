//! Per-node-kind execution logic for the plan walk.

mod data;
mod eval_nodes;
mod orphan;
mod provider;
mod resource;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use strata_config::{Config, ModuleConfig, ResourceConfig};
use strata_domain::{
    Diagnostic, Diagnostics, InstanceKey, Module, ModuleInstance, ProviderConfigAddr,
    ResourceMode, Severity,
};
use strata_eval::{EvalData, Expander, Repetition, Scope};
use strata_provider::{Provider, ProviderError, ProviderPool};
use strata_state::SyncState;

use crate::builder::PlanBuilder;
use crate::moves::MoveOutcome;
use crate::node::NodeKind;
use crate::options::{PlanMode, PlanOpts};
use crate::removed::RemovedIndex;
use crate::targeting::TargetFilter;

/// Everything node execution needs, shared across the walk.
pub struct PlanCtx {
    pub config: Config,
    pub opts: PlanOpts,
    pub pool: ProviderPool,
    pub expander: Arc<Expander>,
    pub data: EvalData,
    /// Upgraded-but-unrefreshed snapshot; never written after refresh begins.
    pub prev_run: SyncState,
    /// Refreshed truth; the baseline changes are planned against.
    pub prior: SyncState,
    /// Refreshed state plus planned values, what downstream evaluation sees.
    pub working: SyncState,
    pub builder: PlanBuilder,
    pub cancel: CancellationToken,
    pub moves: MoveOutcome,
    pub removed: RemovedIndex,
    pub filter: TargetFilter,
    /// Module call repetitions, recorded by expand nodes for each-binding
    /// reconstruction in child scopes.
    pub module_reps: Mutex<HashMap<(ModuleInstance, String), Repetition>>,
    /// Instance keys declared by each provider block: None = no for_each.
    pub provider_keys: Mutex<HashMap<ProviderConfigAddr, Option<Vec<InstanceKey>>>>,
    /// Provider instances configured implicitly because no block exists.
    pub default_providers: tokio::sync::Mutex<HashSet<(ProviderConfigAddr, InstanceKey)>>,
}

impl PlanCtx {
    /// The failure severity for condition checks under the current mode.
    pub fn condition_severity(&self) -> Severity {
        match self.opts.mode {
            PlanMode::RefreshOnly => Severity::Warning,
            _ => Severity::Error,
        }
    }

    pub fn module_config(&self, path: &Module) -> Option<&ModuleConfig> {
        self.config.module(path)
    }

    /// Reconstruct the evaluation scope for a module instance, including the
    /// each/count binding of its own call.
    pub fn scope_for_instance(&self, mi: &ModuleInstance) -> Scope {
        let mut scope = Scope::module(mi.clone());
        if let Some(step) = mi.0.last() {
            let parent = ModuleInstance(mi.0[..mi.0.len() - 1].to_vec());
            let each_value = self
                .module_reps
                .lock()
                .unwrap()
                .get(&(parent, step.name.clone()))
                .and_then(|rep| rep.each_value(&step.key));
            scope = scope.with_key(&step.key, each_value);
        }
        scope
    }

    /// Resolve the provider configuration a resource uses: the nearest
    /// provider block with the matching local name and alias, searching from
    /// the resource's module up to the root; falling back to a default
    /// (block-less) root configuration for the implied source.
    pub fn resolve_provider_config(
        &self,
        module: &Module,
        rc: &ResourceConfig,
    ) -> ProviderConfigAddr {
        let local_name = rc.provider_local_name();
        let alias = rc.provider.as_ref().and_then(|p| p.alias.clone());

        let mut path = module.clone();
        loop {
            if let Some(mc) = self.config.module(&path) {
                let found = mc
                    .provider_configs
                    .iter()
                    .any(|b| b.local_name == local_name && b.alias == alias);
                if found {
                    return ProviderConfigAddr {
                        source: mc.provider_source(local_name),
                        module: path,
                        alias,
                    };
                }
            }
            match path.split_call() {
                Some((parent, _)) => path = parent,
                None => break,
            }
        }

        let source = self
            .config
            .module(module)
            .map(|mc| mc.provider_source(local_name))
            .unwrap_or_else(|| {
                strata_domain::ProviderSource::default_registry("builtin", local_name)
            });
        ProviderConfigAddr { source, module: Module::root(), alias }
    }

    /// Fetch a provider instance, lazily initializing and configuring a
    /// default (empty-config) instance when no provider block declared it.
    pub async fn provider_instance(
        &self,
        addr: &ProviderConfigAddr,
        key: &InstanceKey,
    ) -> Result<Arc<dyn Provider>, ProviderError> {
        match self.pool.get(addr, key).await {
            Ok(provider) => Ok(provider),
            Err(ProviderError::NotInitialized { .. }) => {
                let mut defaults = self.default_providers.lock().await;
                self.pool.init(addr, key).await?;
                if defaults.insert((addr.clone(), key.clone())) {
                    let diags = self
                        .pool
                        .configure(&self.cancel, addr, key, strata_domain::Value::Null)
                        .await?;
                    if diags.has_errors() {
                        return Err(ProviderError::Transport(format!(
                            "default configuration of {} failed",
                            addr
                        )));
                    }
                }
                self.pool.get(addr, key).await
            }
            Err(e) => Err(e),
        }
    }
}

/// Append a provider RPC failure as a diagnostic with address context.
pub(crate) fn provider_failure(
    diags: &mut Diagnostics,
    addr: impl std::fmt::Display,
    error: ProviderError,
) {
    diags.push(
        Diagnostic::error("Provider call failed", error.to_string()).with_address(addr),
    );
}

/// Dispatch one graph node to its executor.
pub async fn exec_node(ctx: Arc<PlanCtx>, node: NodeKind) -> Diagnostics {
    match node {
        NodeKind::ModuleExpand { parent, call } => {
            eval_nodes::exec_module_expand(&ctx, &parent, &call).await
        }
        NodeKind::Variable { module, name } => {
            eval_nodes::exec_variable(&ctx, &module, &name).await
        }
        NodeKind::Local { module, name } => eval_nodes::exec_local(&ctx, &module, &name).await,
        NodeKind::Output { module, name } => eval_nodes::exec_output(&ctx, &module, &name).await,
        NodeKind::CheckBlock { module, name } => {
            eval_nodes::exec_check_block(&ctx, &module, &name).await
        }
        NodeKind::ProviderConfig { module, index } => {
            provider::exec_provider_config(&ctx, &module, index).await
        }
        NodeKind::Resource { module, resource } => match resource.mode {
            ResourceMode::Managed => resource::exec_resource(&ctx, &module, &resource).await,
            ResourceMode::Data => data::exec_data(&ctx, &module, &resource).await,
        },
        NodeKind::Orphan { addr } => orphan::exec_orphan(&ctx, &addr).await,
    }
}
