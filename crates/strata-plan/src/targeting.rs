//! Target/exclude filtering: which resources actually plan, and the guard
//! that refuses to silently skip addresses named by refactoring directives.

use std::collections::HashSet;

use strata_config::{Config, RemoveEndpoint};
use strata_domain::{ConfigResource, Diagnostic, Diagnostics, Module};
use strata_graph::{DepGraph, NodeIndex};

use crate::node::NodeKind;
use crate::options::PlanOpts;

/// The resolved answer to "does this resource participate in the plan".
/// Selection is closed over dependencies: targeting a resource pulls in
/// everything it needs; excluding one pushes out everything needing it.
#[derive(Debug, Default)]
pub struct TargetFilter {
    active: bool,
    selected: HashSet<ConfigResource>,
}

impl TargetFilter {
    pub fn all() -> Self {
        TargetFilter::default()
    }

    pub fn selects(&self, addr: &ConfigResource) -> bool {
        !self.active || self.selected.contains(addr)
    }
}

fn node_config_resource(node: &NodeKind) -> Option<ConfigResource> {
    match node {
        NodeKind::Resource { module, resource } => Some(ConfigResource {
            module: module.clone(),
            resource: resource.clone(),
        }),
        NodeKind::Orphan { addr } => Some(ConfigResource {
            module: addr.module.module(),
            resource: addr.resource.clone(),
        }),
        _ => None,
    }
}

fn descendants_of(graph: &DepGraph<NodeKind>, roots: &HashSet<NodeIndex>) -> HashSet<NodeIndex> {
    let mut seen = roots.clone();
    let mut stack: Vec<NodeIndex> = roots.iter().copied().collect();
    while let Some(idx) = stack.pop() {
        for succ in graph.successors(idx) {
            if seen.insert(succ) {
                stack.push(succ);
            }
        }
    }
    seen
}

/// Build the filter from options, and verify that every address named by a
/// moved/removed/import directive is still in the executing set.
pub fn apply_targeting(
    graph: &DepGraph<NodeKind>,
    config: &Config,
    opts: &PlanOpts,
) -> (TargetFilter, Diagnostics) {
    let mut diags = Diagnostics::new();
    if opts.targets.is_empty() && opts.excludes.is_empty() {
        return (TargetFilter::all(), diags);
    }

    let resource_nodes: Vec<(NodeIndex, ConfigResource)> = graph
        .node_indices()
        .filter_map(|idx| node_config_resource(graph.node(idx)).map(|cr| (idx, cr)))
        .collect();

    let selected: HashSet<ConfigResource> = if !opts.targets.is_empty() {
        let matched: HashSet<NodeIndex> = resource_nodes
            .iter()
            .filter(|(_, cr)| opts.targets.iter().any(|t| t.matches_config(cr)))
            .map(|(idx, _)| *idx)
            .collect();
        // Keeping a resource keeps everything it depends on.
        let closure = graph.ancestors_of(&matched);
        resource_nodes
            .iter()
            .filter(|(idx, _)| closure.contains(idx))
            .map(|(_, cr)| cr.clone())
            .collect()
    } else {
        let matched: HashSet<NodeIndex> = resource_nodes
            .iter()
            .filter(|(_, cr)| opts.excludes.iter().any(|t| t.matches_config(cr)))
            .map(|(idx, _)| *idx)
            .collect();
        // Excluding a resource excludes everything that needs it.
        let denied = descendants_of(graph, &matched);
        resource_nodes
            .iter()
            .filter(|(idx, _)| !denied.contains(idx))
            .map(|(_, cr)| cr.clone())
            .collect()
    };

    let filter = TargetFilter { active: true, selected };

    // Directive-named addresses must execute; a silent skip would leave the
    // plan disagreeing with the configuration's own bookkeeping. Moved and
    // removed blocks are scoped to their declaring module; import blocks are
    // root-only.
    let mut missing: Vec<ConfigResource> = Vec::new();
    let mut note = |cr: ConfigResource| {
        if !filter.selects(&cr) && !missing.contains(&cr) {
            missing.push(cr);
        }
    };
    for (path, mc) in config.modules() {
        for block in &mc.moved {
            note(ConfigResource { module: path.clone(), resource: block.from.resource.clone() });
            note(ConfigResource { module: path.clone(), resource: block.to.resource.clone() });
        }
        for block in &mc.removed {
            if let RemoveEndpoint::Resource(resource) = &block.from {
                note(ConfigResource { module: path.clone(), resource: resource.clone() });
            }
        }
    }
    for block in &config.root.imports {
        note(ConfigResource { module: Module::root(), resource: block.to.clone() });
    }

    if !missing.is_empty() {
        let fixes = missing
            .iter()
            .map(|cr| {
                if !opts.targets.is_empty() {
                    format!("  -target={:?}", cr.to_string())
                } else {
                    format!("  remove -exclude={:?}", cr.to_string())
                }
            })
            .collect::<Vec<_>>()
            .join("\n");
        diags.push(Diagnostic::error(
            "Moved resource instances excluded by targeting",
            format!(
                "Resource instances referenced by moved, removed or import blocks must be \
                 included in the plan. To proceed, adjust the targeting options:\n{}",
                fixes
            ),
        ));
    }

    (filter, diags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph_build::build_graph;
    use strata_config::{Expr, ModuleConfig, MoveEndpoint, MovedBlock, ResourceConfig};
    use strata_domain::{Resource, TargetAddr};
    use strata_state::State;

    fn two_resource_config() -> Config {
        let mut root = ModuleConfig::default();
        root.add_managed(ResourceConfig::managed("test_object", "a"));
        root.add_managed(
            ResourceConfig::managed("test_object", "b").with_attr(
                "arg",
                Expr::resource_attr(Resource::managed("test_object", "a"), "id"),
            ),
        );
        Config::new(root)
    }

    #[test]
    fn target_pulls_in_dependencies() {
        let config = two_resource_config();
        let graph = build_graph(&config, &State::new()).unwrap();
        let opts = PlanOpts {
            targets: vec![TargetAddr::resource(
                Module::root(),
                Resource::managed("test_object", "b"),
            )],
            ..PlanOpts::default()
        };

        let (filter, diags) = apply_targeting(&graph, &config, &opts);
        assert!(diags.is_empty());
        assert!(filter.selects(&ConfigResource {
            module: Module::root(),
            resource: Resource::managed("test_object", "a"),
        }));
        assert!(filter.selects(&ConfigResource {
            module: Module::root(),
            resource: Resource::managed("test_object", "b"),
        }));
    }

    #[test]
    fn exclude_pushes_out_dependents() {
        let config = two_resource_config();
        let graph = build_graph(&config, &State::new()).unwrap();
        let opts = PlanOpts {
            excludes: vec![TargetAddr::resource(
                Module::root(),
                Resource::managed("test_object", "a"),
            )],
            ..PlanOpts::default()
        };

        let (filter, _) = apply_targeting(&graph, &config, &opts);
        assert!(!filter.selects(&ConfigResource {
            module: Module::root(),
            resource: Resource::managed("test_object", "a"),
        }));
        assert!(!filter.selects(&ConfigResource {
            module: Module::root(),
            resource: Resource::managed("test_object", "b"),
        }));
    }

    #[test]
    fn directive_addresses_must_stay_targeted() {
        let mut root = ModuleConfig::default();
        root.add_managed(ResourceConfig::managed("test_object", "a"));
        root.add_managed(ResourceConfig::managed("test_object", "b"));
        root.moved.push(MovedBlock {
            from: MoveEndpoint::resource(Resource::managed("test_object", "old")),
            to: MoveEndpoint::resource(Resource::managed("test_object", "b")),
            source: None,
        });
        let config = Config::new(root);
        let graph = build_graph(&config, &State::new()).unwrap();
        let opts = PlanOpts {
            targets: vec![TargetAddr::resource(
                Module::root(),
                Resource::managed("test_object", "a"),
            )],
            ..PlanOpts::default()
        };

        let (_, diags) = apply_targeting(&graph, &config, &opts);
        assert!(diags.has_errors());
        let diag = diags.iter().find(|d| d.is_error()).unwrap();
        assert_eq!(diag.summary, "Moved resource instances excluded by targeting");
        assert!(diag.detail.contains("-target=\"test_object.b\""), "{}", diag.detail);
    }
}
