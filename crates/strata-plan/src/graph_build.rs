//! Construction of the plan graph: one node per logical config object plus
//! orphan nodes for prior-state resources with no configuration, with edges
//! from every expression reference and lifecycle rule.

use std::collections::HashMap;

use strata_config::{Config, ModuleConfig, Reference, ResourceConfig};
use strata_domain::{Module, ProviderConfigAddr, Resource};
use strata_graph::{DepGraph, GraphError, NodeIndex};
use strata_state::State;

use crate::node::NodeKind;

#[derive(Default)]
struct Indexes {
    vars: HashMap<(Module, String), NodeIndex>,
    locals: HashMap<(Module, String), NodeIndex>,
    outputs: HashMap<(Module, String), NodeIndex>,
    resources: HashMap<(Module, Resource), NodeIndex>,
    module_expands: HashMap<(Module, String), NodeIndex>,
    providers: HashMap<(Module, String, Option<String>), NodeIndex>,
    checks: HashMap<(Module, String), NodeIndex>,
}

pub fn build_graph(config: &Config, prior: &State) -> Result<DepGraph<NodeKind>, GraphError> {
    let mut graph = DepGraph::new();
    let mut ix = Indexes::default();

    let modules = config.modules();

    // Nodes first, so forward references resolve.
    for (path, mc) in &modules {
        for name in mc.variables.keys() {
            let idx = graph.add_node(NodeKind::Variable { module: path.clone(), name: name.clone() });
            ix.vars.insert((path.clone(), name.clone()), idx);
        }
        for name in mc.locals.keys() {
            let idx = graph.add_node(NodeKind::Local { module: path.clone(), name: name.clone() });
            ix.locals.insert((path.clone(), name.clone()), idx);
        }
        for name in mc.outputs.keys() {
            let idx = graph.add_node(NodeKind::Output { module: path.clone(), name: name.clone() });
            ix.outputs.insert((path.clone(), name.clone()), idx);
        }
        for rc in mc.managed.values().chain(mc.data.values()) {
            let resource = rc.addr();
            let idx = graph.add_node(NodeKind::Resource {
                module: path.clone(),
                resource: resource.clone(),
            });
            ix.resources.insert((path.clone(), resource), idx);
        }
        for (index, block) in mc.provider_configs.iter().enumerate() {
            let idx = graph.add_node(NodeKind::ProviderConfig { module: path.clone(), index });
            ix.providers.insert(
                (path.clone(), block.local_name.clone(), block.alias.clone()),
                idx,
            );
        }
        for call in mc.module_calls.keys() {
            let idx = graph.add_node(NodeKind::ModuleExpand {
                parent: path.clone(),
                call: call.clone(),
            });
            ix.module_expands.insert((path.clone(), call.clone()), idx);
        }
        for name in mc.checks.keys() {
            let idx =
                graph.add_node(NodeKind::CheckBlock { module: path.clone(), name: name.clone() });
            ix.checks.insert((path.clone(), name.clone()), idx);
        }
    }

    // Edges.
    for (path, mc) in &modules {
        let base = base_dep(&ix, path);

        for (name, _) in &mc.variables {
            let idx = ix.vars[&(path.clone(), name.clone())];
            add_edges(&mut graph, base, idx)?;
            // Child-module variables read their call argument in the parent.
            if let Some((parent, call)) = path.split_call() {
                if let Some(parent_mc) = config.module(&parent) {
                    if let Some(arg) = parent_mc
                        .module_calls
                        .get(call)
                        .and_then(|c| c.args.get(name))
                    {
                        for r in arg.references() {
                            for dep in resolve_ref(&ix, &parent, &r) {
                                add_edge_checked(&mut graph, dep, idx)?;
                            }
                        }
                    }
                }
            }
        }

        for (name, expr) in &mc.locals {
            let idx = ix.locals[&(path.clone(), name.clone())];
            add_edges(&mut graph, base, idx)?;
            for r in expr.references() {
                for dep in resolve_ref(&ix, path, &r) {
                    add_edge_checked(&mut graph, dep, idx)?;
                }
            }
        }

        for (name, oc) in &mc.outputs {
            let idx = ix.outputs[&(path.clone(), name.clone())];
            add_edges(&mut graph, base, idx)?;
            let mut refs = oc.value.references();
            for rule in &oc.preconditions {
                refs.extend(rule.references());
            }
            for r in refs {
                for dep in resolve_ref(&ix, path, &r) {
                    add_edge_checked(&mut graph, dep, idx)?;
                }
            }
        }

        for block in &mc.provider_configs {
            let idx = ix.providers[&(path.clone(), block.local_name.clone(), block.alias.clone())];
            add_edges(&mut graph, base, idx)?;
            for r in block.references() {
                for dep in resolve_ref(&ix, path, &r) {
                    add_edge_checked(&mut graph, dep, idx)?;
                }
            }
        }

        for (call, module_call) in &mc.module_calls {
            let idx = ix.module_expands[&(path.clone(), call.clone())];
            add_edges(&mut graph, base, idx)?;
            let mut refs = Vec::new();
            if let Some(count) = &module_call.count {
                refs.extend(count.references());
            }
            if let Some(for_each) = &module_call.for_each {
                refs.extend(for_each.references());
            }
            for r in refs {
                for dep in resolve_ref(&ix, path, &r) {
                    add_edge_checked(&mut graph, dep, idx)?;
                }
            }
        }

        for rc in mc.managed.values().chain(mc.data.values()) {
            let resource = rc.addr();
            let idx = ix.resources[&(path.clone(), resource.clone())];
            add_edges(&mut graph, base, idx)?;
            for r in rc.references() {
                for dep in resolve_ref(&ix, path, &r) {
                    add_edge_checked(&mut graph, dep, idx)?;
                }
            }
            if let Some(provider_idx) = resolve_provider_node(config, &ix, path, rc) {
                add_edge_checked(&mut graph, provider_idx, idx)?;
            }
            // Import blocks targeting this resource contribute their
            // reference edges so ids and keys are decidable when it runs.
            if path.is_root() {
                for block in &config.root.imports {
                    if block.to != resource {
                        continue;
                    }
                    let mut refs = block.id.references();
                    if let Some(for_each) = &block.for_each {
                        refs.extend(for_each.references());
                    }
                    if let Some(key_expr) = &block.to_key_expr {
                        refs.extend(key_expr.references());
                    }
                    for r in refs {
                        for dep in resolve_ref(&ix, path, &r) {
                            add_edge_checked(&mut graph, dep, idx)?;
                        }
                    }
                }
            }
        }

        for (name, check) in &mc.checks {
            let idx = ix.checks[&(path.clone(), name.clone())];
            add_edges(&mut graph, base, idx)?;
            for r in check.references() {
                for dep in resolve_ref(&ix, path, &r) {
                    add_edge_checked(&mut graph, dep, idx)?;
                }
            }
        }
    }

    // Orphans: state resources with no configuration counterpart.
    for (mi, module_state) in &prior.modules {
        let module_path = mi.module();
        for resource in module_state.resources.keys() {
            let configured = config
                .module(&module_path)
                .and_then(|mc| mc.resource(resource))
                .is_some();
            if configured {
                continue;
            }
            let addr = mi.resource(resource.clone());
            let idx = graph.add_node(NodeKind::Orphan { addr });
            let provider_config = &module_state.resources[resource].provider_config;
            if let Some(provider_idx) = provider_node_for_addr(config, &ix, provider_config) {
                add_edge_checked(&mut graph, provider_idx, idx)?;
            }
        }
    }

    Ok(graph)
}

fn base_dep(ix: &Indexes, path: &Module) -> Option<NodeIndex> {
    let (parent, call) = path.split_call()?;
    ix.module_expands.get(&(parent, call.to_string())).copied()
}

fn add_edges(
    graph: &mut DepGraph<NodeKind>,
    base: Option<NodeIndex>,
    to: NodeIndex,
) -> Result<(), GraphError> {
    if let Some(base) = base {
        add_edge_checked(graph, base, to)?;
    }
    Ok(())
}

fn add_edge_checked(
    graph: &mut DepGraph<NodeKind>,
    from: NodeIndex,
    to: NodeIndex,
) -> Result<(), GraphError> {
    if from == to {
        // A block referring to itself (e.g. postcondition self) is not an
        // ordering constraint.
        return Ok(());
    }
    graph.add_edge(from, to)
}

fn resolve_ref(ix: &Indexes, module: &Module, reference: &Reference) -> Vec<NodeIndex> {
    match reference {
        Reference::Var(name) => ix
            .vars
            .get(&(module.clone(), name.clone()))
            .copied()
            .into_iter()
            .collect(),
        Reference::Local(name) => ix
            .locals
            .get(&(module.clone(), name.clone()))
            .copied()
            .into_iter()
            .collect(),
        Reference::Resource(resource) => ix
            .resources
            .get(&(module.clone(), resource.clone()))
            .copied()
            .into_iter()
            .collect(),
        Reference::ModuleCall(name) => {
            let mut out: Vec<NodeIndex> = ix
                .module_expands
                .get(&(module.clone(), name.clone()))
                .copied()
                .into_iter()
                .collect();
            let child = module.child(name.clone());
            out.extend(
                ix.outputs
                    .iter()
                    .filter(|((m, _), _)| m == &child)
                    .map(|(_, idx)| *idx),
            );
            out
        }
        _ => Vec::new(),
    }
}

/// The provider-config node a resource will use, mirroring the runtime
/// resolution: nearest matching block from the resource's module up to root.
fn resolve_provider_node(
    config: &Config,
    ix: &Indexes,
    module: &Module,
    rc: &ResourceConfig,
) -> Option<NodeIndex> {
    let local_name = rc.provider_local_name();
    let alias = rc.provider.as_ref().and_then(|p| p.alias.clone());
    let mut path = module.clone();
    loop {
        if config.module(&path).is_some() {
            if let Some(idx) = ix
                .providers
                .get(&(path.clone(), local_name.to_string(), alias.clone()))
            {
                return Some(*idx);
            }
        }
        match path.split_call() {
            Some((parent, _)) => path = parent,
            None => return None,
        }
    }
}

fn provider_node_for_addr(
    config: &Config,
    ix: &Indexes,
    addr: &ProviderConfigAddr,
) -> Option<NodeIndex> {
    let mc = config.module(&addr.module)?;
    for block in &mc.provider_configs {
        if block.alias == addr.alias && mc.provider_source(&block.local_name) == addr.source {
            return ix
                .providers
                .get(&(addr.module.clone(), block.local_name.clone(), block.alias.clone()))
                .copied();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_config::{Expr, ProviderConfigBlock};
    use strata_domain::{InstanceKey, ModuleInstance, ProviderSource, Value};
    use strata_state::ObjectState;

    fn graph_nodes(graph: &DepGraph<NodeKind>) -> Vec<String> {
        graph
            .node_indices()
            .map(|idx| graph.node(idx).to_string())
            .collect()
    }

    #[test]
    fn references_become_edges() {
        let mut root = ModuleConfig::default();
        root.locals.insert("name".into(), Expr::lit("web"));
        root.add_managed(
            ResourceConfig::managed("test_object", "a").with_attr("arg", Expr::local("name")),
        );
        let config = Config::new(root);

        let graph = build_graph(&config, &State::new()).unwrap();
        graph.check_acyclic().unwrap();

        let local_idx = graph
            .node_indices()
            .find(|i| graph.node(*i).to_string() == "local.name")
            .unwrap();
        let resource_idx = graph
            .node_indices()
            .find(|i| graph.node(*i).to_string() == "test_object.a")
            .unwrap();
        assert!(graph.successors(local_idx).contains(&resource_idx));
    }

    #[test]
    fn provider_block_precedes_resources() {
        let mut root = ModuleConfig::default();
        root.provider_configs.push(ProviderConfigBlock::new("test"));
        root.add_managed(ResourceConfig::managed("test_object", "a"));
        let config = Config::new(root);

        let graph = build_graph(&config, &State::new()).unwrap();
        let provider_idx = graph
            .node_indices()
            .find(|i| matches!(graph.node(*i), NodeKind::ProviderConfig { .. }))
            .unwrap();
        let resource_idx = graph
            .node_indices()
            .find(|i| matches!(graph.node(*i), NodeKind::Resource { .. }))
            .unwrap();
        assert!(graph.successors(provider_idx).contains(&resource_idx));
    }

    #[test]
    fn orphans_appear_for_unconfigured_state() {
        let config = Config::default();
        let mut state = State::new();
        let addr = ModuleInstance::root()
            .resource(Resource::managed("test_object", "gone"))
            .instance(InstanceKey::NoKey);
        state.set_resource_provider(
            &addr.abs_resource(),
            ProviderConfigAddr::root(ProviderSource::default_registry("core", "test")),
        );
        state.set_instance_current(&addr, Some(ObjectState::new(serde_json::json!({}))));

        let graph = build_graph(&config, &state).unwrap();
        assert!(graph_nodes(&graph)
            .iter()
            .any(|n| n == "test_object.gone (orphan)"));
    }

    #[test]
    fn dependency_cycle_detected() {
        let mut root = ModuleConfig::default();
        root.add_managed(
            ResourceConfig::managed("test_object", "a").with_attr(
                "arg",
                Expr::resource_attr(Resource::managed("test_object", "b"), "id"),
            ),
        );
        root.add_managed(
            ResourceConfig::managed("test_object", "b").with_attr(
                "arg",
                Expr::resource_attr(Resource::managed("test_object", "a"), "id"),
            ),
        );
        let config = Config::new(root);

        let graph = build_graph(&config, &State::new()).unwrap();
        let err = graph.check_acyclic().unwrap_err();
        assert!(err.to_string().contains("cycle detected"));
    }

    #[test]
    fn module_expand_gates_child_contents() {
        let mut child = ModuleConfig::default();
        child.locals.insert("x".into(), Expr::lit(Value::int(1)));
        let mut root = ModuleConfig::default();
        root.module_calls.insert(
            "net".into(),
            strata_config::ModuleCall {
                name: "net".into(),
                child: Box::new(child),
                count: None,
                for_each: None,
                args: Default::default(),
                source: None,
            },
        );
        let config = Config::new(root);

        let graph = build_graph(&config, &State::new()).unwrap();
        let expand_idx = graph
            .node_indices()
            .find(|i| matches!(graph.node(*i), NodeKind::ModuleExpand { .. }))
            .unwrap();
        let local_idx = graph
            .node_indices()
            .find(|i| matches!(graph.node(*i), NodeKind::Local { .. }))
            .unwrap();
        assert!(graph.successors(expand_idx).contains(&local_idx));
    }
}
