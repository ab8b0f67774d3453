//! `removed` block handling: validation against live configuration and the
//! index the orphan planner keys forget decisions off. Blocks are honored in
//! every module of the tree, scoped to the module that declares them.

use std::collections::HashSet;

use strata_config::{Config, RemoveEndpoint};
use strata_domain::{Diagnostic, Diagnostics, Module, ModuleInstance, Resource};

#[derive(Debug, Default)]
pub struct RemovedIndex {
    /// Removed resources, keyed by the declaring module's path.
    pub resources: HashSet<(Module, Resource)>,
    /// Removed module calls, as the full path of the removed module.
    pub modules: HashSet<Module>,
}

impl RemovedIndex {
    /// Whether a state object at this address should be forgotten rather
    /// than destroyed.
    pub fn covers(&self, module: &ModuleInstance, resource: &Resource) -> bool {
        let path = module.module();
        if self.resources.contains(&(path.clone(), resource.clone())) {
            return true;
        }
        // A removed module covers everything at or below its path.
        self.modules.iter().any(|m| path.0.starts_with(&m.0))
    }
}

pub fn removed_index(config: &Config) -> RemovedIndex {
    let mut index = RemovedIndex::default();
    for (path, mc) in config.modules() {
        for block in &mc.removed {
            match &block.from {
                RemoveEndpoint::Resource(resource) => {
                    index.resources.insert((path.clone(), resource.clone()));
                }
                RemoveEndpoint::ModuleCall(name) => {
                    index.modules.insert(path.child(name.clone()));
                }
            }
        }
    }
    index
}

fn prefixed(path: &Module, rest: impl std::fmt::Display) -> String {
    if path.is_root() {
        rest.to_string()
    } else {
        format!("{}.{}", path, rest)
    }
}

/// A removed block naming something still declared in its own module is a
/// contradiction and aborts the plan; it must never silently win.
pub fn validate_removed(config: &Config) -> Diagnostics {
    let mut diags = Diagnostics::new();
    for (path, mc) in config.modules() {
        for block in &mc.removed {
            match &block.from {
                RemoveEndpoint::Resource(resource) => {
                    if mc.resource(resource).is_some() {
                        let addr = prefixed(&path, resource);
                        let mut diag = Diagnostic::error(
                            "Removed resource block still exists",
                            format!(
                                "A removed block for {} is declared, but the resource block \
                                 is still in configuration. Delete the resource block to \
                                 forget the object, or delete the removed block to keep \
                                 managing it.",
                                addr
                            ),
                        )
                        .with_address(addr);
                        if let Some(source) = &block.source {
                            diag = diag.with_source(source.clone());
                        }
                        diags.push(diag);
                    }
                }
                RemoveEndpoint::ModuleCall(name) => {
                    if mc.module_calls.contains_key(name) {
                        let addr = prefixed(&path, format_args!("module.{}", name));
                        let mut diag = Diagnostic::error(
                            "Removed module block still exists",
                            format!(
                                "A removed block for {} is declared, but the module call is \
                                 still in configuration. Delete the module block to forget \
                                 its objects, or delete the removed block to keep managing \
                                 them.",
                                addr
                            ),
                        );
                        if let Some(source) = &block.source {
                            diag = diag.with_source(source.clone());
                        }
                        diags.push(diag);
                    }
                }
            }
        }
    }
    diags
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use strata_config::{ModuleCall, ModuleConfig, RemovedBlock, ResourceConfig};
    use strata_domain::InstanceKey;

    fn call(child: ModuleConfig) -> ModuleCall {
        ModuleCall {
            name: "net".into(),
            child: Box::new(child),
            count: None,
            for_each: None,
            args: BTreeMap::new(),
            source: None,
        }
    }

    #[test]
    fn removed_while_configured_is_an_error() {
        let mut root = ModuleConfig::default();
        root.add_managed(ResourceConfig::managed("test_object", "a"));
        root.removed.push(RemovedBlock {
            from: RemoveEndpoint::Resource(Resource::managed("test_object", "a")),
            source: None,
        });

        let diags = validate_removed(&Config::new(root));
        assert!(diags.has_errors());
        assert!(diags
            .iter()
            .any(|d| d.summary == "Removed resource block still exists"));
    }

    #[test]
    fn removed_module_while_configured_is_an_error() {
        let mut root = ModuleConfig::default();
        root.module_calls.insert("net".into(), call(ModuleConfig::default()));
        root.removed.push(RemovedBlock {
            from: RemoveEndpoint::ModuleCall("net".into()),
            source: None,
        });

        let diags = validate_removed(&Config::new(root));
        assert!(diags
            .iter()
            .any(|d| d.summary == "Removed module block still exists"));
    }

    #[test]
    fn child_module_removed_while_configured_is_an_error() {
        let mut child = ModuleConfig::default();
        child.add_managed(ResourceConfig::managed("test_object", "x"));
        child.removed.push(RemovedBlock {
            from: RemoveEndpoint::Resource(Resource::managed("test_object", "x")),
            source: None,
        });
        let mut root = ModuleConfig::default();
        root.module_calls.insert("net".into(), call(child));

        let diags = validate_removed(&Config::new(root));
        assert!(diags.has_errors());
        assert!(diags
            .iter()
            .any(|d| d.detail.contains("module.net.test_object.x")));
    }

    #[test]
    fn index_covers_module_descendants() {
        let mut root = ModuleConfig::default();
        root.removed.push(RemovedBlock {
            from: RemoveEndpoint::ModuleCall("net".into()),
            source: None,
        });
        let index = removed_index(&Config::new(root));

        let inside = ModuleInstance::root().child("net", InstanceKey::NoKey);
        assert!(index.covers(&inside, &Resource::managed("test_object", "x")));
        let deeper = inside.child("sub", InstanceKey::NoKey);
        assert!(index.covers(&deeper, &Resource::managed("test_object", "x")));
        assert!(!index.covers(&ModuleInstance::root(), &Resource::managed("test_object", "x")));
    }

    #[test]
    fn index_scopes_resources_to_declaring_module() {
        let mut child = ModuleConfig::default();
        child.removed.push(RemovedBlock {
            from: RemoveEndpoint::Resource(Resource::managed("test_object", "x")),
            source: None,
        });
        let mut root = ModuleConfig::default();
        root.module_calls.insert("net".into(), call(child));
        let index = removed_index(&Config::new(root));

        let x = Resource::managed("test_object", "x");
        let inside = ModuleInstance::root().child("net", InstanceKey::NoKey);
        assert!(index.covers(&inside, &x));
        // The same resource name at the root is untouched.
        assert!(!index.covers(&ModuleInstance::root(), &x));
    }
}
