//! Processing of `moved` blocks and implied address moves, ahead of the
//! main graph walk. Each block applies within the module that declares it,
//! across every instance of that module present in state.

use std::collections::HashSet;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use strata_config::Config;
use strata_domain::{
    ConfigResource, Diagnostic, Diagnostics, InstanceKey, ModuleInstance, ResourceInstance,
};
use strata_provider::{MoveResourceStateRequest, ProviderPool};
use strata_state::State;

/// What move processing did to the state, for later phases: removed-block
/// handling keys forget reasons off `unmoved_sources`, and instance planning
/// keys `prev_run_addr` off `moved`.
#[derive(Debug, Default)]
pub struct MoveOutcome {
    pub moved: Vec<(ResourceInstance, ResourceInstance)>,
    pub blocked: Vec<(ResourceInstance, ResourceInstance)>,
    /// Resources named as a move source whose move did not execute.
    pub unmoved_sources: HashSet<ConfigResource>,
}

impl MoveOutcome {
    /// The previous-run address for an instance: where it came from if a move
    /// rewrote it, otherwise itself.
    pub fn prev_run_addr(&self, addr: &ResourceInstance) -> ResourceInstance {
        self.moved
            .iter()
            .find(|(_, to)| to == addr)
            .map(|(from, _)| from.clone())
            .unwrap_or_else(|| addr.clone())
    }
}

/// Reconcile state addresses with `moved` blocks and with repetition changes
/// before anything touches providers. Mutates `state` in place; the caller
/// seeds every working state from the result.
pub async fn apply_moves(
    config: &Config,
    state: &mut State,
    pool: &ProviderPool,
    cancel: &CancellationToken,
) -> (MoveOutcome, Diagnostics) {
    let mut outcome = MoveOutcome::default();
    let mut diags = Diagnostics::new();

    for (path, mc) in config.modules() {
        // The state module instances this module's blocks apply to.
        let instances: Vec<ModuleInstance> = state
            .modules
            .keys()
            .filter(|mi| mi.module() == path)
            .cloned()
            .collect();

        // Explicit moved blocks first, in declaration order.
        for block in &mc.moved {
            let mut pairs: Vec<(ResourceInstance, ResourceInstance)> = Vec::new();
            for mi in &instances {
                match (&block.from.key, &block.to.key) {
                    (Some(from_key), to_key) => pairs.push((
                        mi.resource(block.from.resource.clone())
                            .instance(from_key.clone()),
                        mi.resource(block.to.resource.clone())
                            .instance(to_key.clone().unwrap_or(InstanceKey::NoKey)),
                    )),
                    (None, _) => {
                        // Whole-resource move: every instance keeps its key.
                        let abs = mi.resource(block.from.resource.clone());
                        let keys: Vec<InstanceKey> = state
                            .resource(&abs)
                            .map(|r| r.instances.keys().cloned().collect())
                            .unwrap_or_default();
                        for key in keys {
                            pairs.push((
                                abs.instance(key.clone()),
                                mi.resource(block.to.resource.clone()).instance(key),
                            ));
                        }
                    }
                }
            }
            if pairs.is_empty() {
                // Nothing at the source; removed-block handling classifies
                // this as a missing move target.
                outcome.unmoved_sources.insert(ConfigResource {
                    module: path.clone(),
                    resource: block.from.resource.clone(),
                });
                continue;
            }

            for (from, to) in pairs {
                if state.instance(&from).is_none() {
                    outcome.unmoved_sources.insert(from.config_resource());
                    continue;
                }
                if block.from.resource.type_name != block.to.resource.type_name {
                    if let Err(failure) =
                        translate_across_types(state, pool, cancel, &from, &to).await
                    {
                        diags.append(failure);
                        outcome.unmoved_sources.insert(from.config_resource());
                        continue;
                    }
                }
                move_one(state, &mut outcome, from, to);
            }
        }

        // Implied moves: a resource whose repetition argument changed shape
        // gets its zero instance reconciled between no-key and [0].
        for rc in mc.managed.values() {
            let resource = rc.addr();
            for mi in &instances {
                let abs = mi.resource(resource.clone());
                let keys: Vec<InstanceKey> = state
                    .resource(&abs)
                    .map(|r| r.instances.keys().cloned().collect())
                    .unwrap_or_default();
                let has_no_key = keys.contains(&InstanceKey::NoKey);
                let has_zero = keys.contains(&InstanceKey::Int(0));

                if rc.count.is_some() && has_no_key {
                    move_one(
                        state,
                        &mut outcome,
                        abs.instance(InstanceKey::NoKey),
                        abs.instance(InstanceKey::Int(0)),
                    );
                } else if rc.count.is_none() && rc.for_each.is_none() && has_zero {
                    move_one(
                        state,
                        &mut outcome,
                        abs.instance(InstanceKey::Int(0)),
                        abs.instance(InstanceKey::NoKey),
                    );
                }
            }
        }
    }

    if !outcome.blocked.is_empty() {
        let detail = outcome
            .blocked
            .iter()
            .map(|(from, to)| format!("  - {} could not move to {}", from, to))
            .collect::<Vec<_>>()
            .join("\n");
        diags.push(Diagnostic::warning(
            "Unresolved resource instance address changes",
            format!(
                "The following address changes could not be applied because the target \
                 address is already in use:\n{}",
                detail
            ),
        ));
    }

    (outcome, diags)
}

fn move_one(
    state: &mut State,
    outcome: &mut MoveOutcome,
    from: ResourceInstance,
    to: ResourceInstance,
) {
    if state.move_resource_instance(&from, &to) {
        debug!(from = %from, to = %to, "moved resource instance");
        outcome.moved.push((from, to));
    } else {
        warn!(from = %from, to = %to, "move blocked: target address occupied");
        outcome.unmoved_sources.insert(from.config_resource());
        outcome.blocked.push((from, to));
    }
}

/// For a move between resource types, ask the target type's provider to
/// translate the stored attributes before the state key is rewritten.
async fn translate_across_types(
    state: &mut State,
    pool: &ProviderPool,
    cancel: &CancellationToken,
    from: &ResourceInstance,
    to: &ResourceInstance,
) -> Result<(), Diagnostics> {
    let mut failure = Diagnostics::new();
    let Some(resource_state) = state.resource(&from.abs_resource()) else {
        return Ok(());
    };
    let provider_config = resource_state.provider_config.clone();
    let Some(object) = state
        .instance(from)
        .and_then(|i| i.current.clone())
    else {
        return Ok(());
    };

    // Moves run before provider-config nodes; the translation call does not
    // require a configured instance.
    let provider = match pool.init(&provider_config, &InstanceKey::NoKey).await {
        Ok(()) => pool.get(&provider_config, &InstanceKey::NoKey).await,
        Err(e) => Err(e),
    };
    let provider = match provider {
        Ok(p) => p,
        Err(e) => {
            failure.push(
                Diagnostic::error("Failed to move resource state", e.to_string())
                    .with_address(from),
            );
            return Err(failure);
        }
    };

    let response = provider
        .move_resource_state(
            cancel,
            MoveResourceStateRequest {
                source_type: from.resource.type_name.clone(),
                source_schema_version: object.schema_version,
                source_raw: object.attrs.clone(),
                target_type: to.resource.type_name.clone(),
            },
        )
        .await;

    match response {
        Err(e) => {
            failure.push(
                Diagnostic::error("Failed to move resource state", e.to_string())
                    .with_address(from),
            );
            Err(failure)
        }
        Ok(response) => {
            if response.diagnostics.has_errors() {
                failure.append_with_address(response.diagnostics, from.to_string());
                return Err(failure);
            }
            match response.target_state.to_json() {
                Some(attrs) => {
                    let mut translated = object;
                    translated.attrs = attrs;
                    state.set_instance_current(from, Some(translated));
                    Ok(())
                }
                None => {
                    failure.push(
                        Diagnostic::error(
                            "Failed to move resource state",
                            "The provider returned an unknown value for the translated state.",
                        )
                        .with_address(from),
                    );
                    Err(failure)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use strata_config::{ModuleCall, ModuleConfig, MoveEndpoint, MovedBlock, ResourceConfig};
    use strata_domain::{Module, ProviderConfigAddr, ProviderSource, Resource};
    use strata_provider::{MockProvider, ProviderRegistry};
    use strata_state::ObjectState;

    fn root_instance(resource: &Resource, key: InstanceKey) -> ResourceInstance {
        ModuleInstance::root().resource(resource.clone()).instance(key)
    }

    fn provider_addr() -> ProviderConfigAddr {
        ProviderConfigAddr::root(ProviderSource::default_registry("core", "test"))
    }

    fn pool() -> ProviderPool {
        let mock = Arc::new(MockProvider::new());
        let mut registry = ProviderRegistry::new();
        registry.register(ProviderSource::default_registry("core", "test"), move || {
            mock.clone()
        });
        ProviderPool::new(Arc::new(registry))
    }

    fn seed_at(
        state: &mut State,
        addr: &ResourceInstance,
        attrs: serde_json::Value,
    ) {
        state.set_resource_provider(&addr.abs_resource(), provider_addr());
        state.set_instance_current(addr, Some(ObjectState::new(attrs)));
    }

    #[tokio::test]
    async fn explicit_move_rewrites_state() {
        let a = Resource::managed("test_object", "a");
        let b = Resource::managed("test_object", "b");
        let mut state = State::new();
        seed_at(
            &mut state,
            &root_instance(&a, InstanceKey::NoKey),
            serde_json::json!({"id": "1"}),
        );

        let mut root = ModuleConfig::default();
        root.moved.push(MovedBlock {
            from: MoveEndpoint::resource(a.clone()),
            to: MoveEndpoint::resource(b.clone()),
            source: None,
        });

        let cancel = CancellationToken::new();
        let (outcome, diags) =
            apply_moves(&Config::new(root), &mut state, &pool(), &cancel).await;

        assert!(diags.is_empty());
        assert_eq!(outcome.moved.len(), 1);
        assert!(state
            .instance(&root_instance(&a, InstanceKey::NoKey))
            .is_none());
        assert!(state
            .instance(&root_instance(&b, InstanceKey::NoKey))
            .is_some());
    }

    #[tokio::test]
    async fn implied_move_collision_warns() {
        // Prior holds both test_object.a and test_object.a[0]; config has the
        // unkeyed block only.
        let a = Resource::managed("test_object", "a");
        let mut state = State::new();
        seed_at(
            &mut state,
            &root_instance(&a, InstanceKey::NoKey),
            serde_json::json!({"id": "no-key"}),
        );
        seed_at(
            &mut state,
            &root_instance(&a, InstanceKey::Int(0)),
            serde_json::json!({"id": "zero"}),
        );

        let mut root = ModuleConfig::default();
        root.add_managed(ResourceConfig::managed("test_object", "a"));

        let cancel = CancellationToken::new();
        let (outcome, diags) =
            apply_moves(&Config::new(root), &mut state, &pool(), &cancel).await;

        assert_eq!(outcome.blocked.len(), 1);
        let warning = diags.iter().next().unwrap();
        assert_eq!(warning.summary, "Unresolved resource instance address changes");
        assert!(warning
            .detail
            .contains("test_object.a[0] could not move to test_object.a"));
        // Both instances remain for the planner: a as-is, a[0] doomed to a
        // wrong-repetition delete.
        assert!(state.instance(&root_instance(&a, InstanceKey::NoKey)).is_some());
        assert!(state.instance(&root_instance(&a, InstanceKey::Int(0))).is_some());
    }

    #[tokio::test]
    async fn missing_source_is_recorded_not_fatal() {
        let a = Resource::managed("test_object", "a");
        let b = Resource::managed("test_object", "b");
        let mut root = ModuleConfig::default();
        root.moved.push(MovedBlock {
            from: MoveEndpoint::resource(a.clone()),
            to: MoveEndpoint::resource(b),
            source: None,
        });

        let mut state = State::new();
        let cancel = CancellationToken::new();
        let (outcome, diags) =
            apply_moves(&Config::new(root), &mut state, &pool(), &cancel).await;

        assert!(diags.is_empty());
        assert!(outcome.moved.is_empty());
        // With nothing at the source the resource is left for removed-block
        // handling to classify.
        assert!(outcome.unmoved_sources.contains(&ConfigResource {
            module: Module::root(),
            resource: a,
        }));
    }

    #[tokio::test]
    async fn child_module_moved_block_applies_in_its_module() {
        // A moved block declared inside module.net rewrites that module
        // instance's state, not the root's.
        let a = Resource::managed("test_object", "a");
        let b = Resource::managed("test_object", "b");
        let mi = ModuleInstance::root().child("net", InstanceKey::NoKey);
        let from = mi.resource(a.clone()).instance(InstanceKey::NoKey);
        let to = mi.resource(b.clone()).instance(InstanceKey::NoKey);

        let mut state = State::new();
        seed_at(&mut state, &from, serde_json::json!({"id": "child"}));

        let mut child = ModuleConfig::default();
        child.moved.push(MovedBlock {
            from: MoveEndpoint::resource(a),
            to: MoveEndpoint::resource(b),
            source: None,
        });
        let mut root = ModuleConfig::default();
        root.module_calls.insert(
            "net".into(),
            ModuleCall {
                name: "net".into(),
                child: Box::new(child),
                count: None,
                for_each: None,
                args: BTreeMap::new(),
                source: None,
            },
        );

        let cancel = CancellationToken::new();
        let (outcome, diags) =
            apply_moves(&Config::new(root), &mut state, &pool(), &cancel).await;

        assert!(diags.is_empty());
        assert_eq!(outcome.moved, vec![(from.clone(), to.clone())]);
        assert!(state.instance(&from).is_none());
        assert!(state.instance(&to).is_some());
    }
}
