use std::collections::HashMap;
use std::sync::RwLock;

use strata_domain::{AbsResource, InstanceKey, Module, ModuleInstance, ResourceInstance};

// ── Expansions ────────────────────────────────────────────────────────────────

/// How one module call or resource block expanded: no repetition argument,
/// `count`, `for_each`, or a repetition whose keys are not yet decidable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expansion {
    Single,
    Count(usize),
    /// for_each keys in their original order.
    ForEach(Vec<String>),
    Unknown,
}

impl Expansion {
    pub fn keys(&self) -> ExpandedKeys {
        match self {
            Expansion::Single => ExpandedKeys::Keys(vec![InstanceKey::NoKey]),
            Expansion::Count(n) => {
                ExpandedKeys::Keys((0..*n as i64).map(InstanceKey::Int).collect())
            }
            Expansion::ForEach(keys) => ExpandedKeys::Keys(
                keys.iter().map(|k| InstanceKey::Str(k.clone())).collect(),
            ),
            Expansion::Unknown => ExpandedKeys::Unknown,
        }
    }
}

/// The answer to "which instance keys exist for this address". The Unknown
/// sentinel surfaces expansions whose controlling argument is not yet known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpandedKeys {
    Keys(Vec<InstanceKey>),
    Unknown,
}

impl ExpandedKeys {
    pub fn known(self) -> Vec<InstanceKey> {
        match self {
            ExpandedKeys::Keys(keys) => keys,
            ExpandedKeys::Unknown => Vec::new(),
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, ExpandedKeys::Unknown)
    }
}

// ── Expander ──────────────────────────────────────────────────────────────────

/// The authority on which module-call and resource instance keys exist.
/// Nodes register expansions as they evaluate repetition arguments; everyone
/// downstream queries. Querying an expansion that was never registered is a
/// graph-ordering bug: it panics in development builds and returns an empty
/// set in release builds.
#[derive(Debug, Default)]
pub struct Expander {
    modules: RwLock<HashMap<(ModuleInstance, String), Expansion>>,
    resources: RwLock<HashMap<AbsResource, Expansion>>,
}

impl Expander {
    pub fn new() -> Self {
        Expander::default()
    }

    /// Record the instance keys a module call produced in one parent module
    /// instance.
    pub fn expand_module(&self, parent: &ModuleInstance, call: &str, expansion: Expansion) {
        self.modules
            .write()
            .unwrap()
            .insert((parent.clone(), call.to_string()), expansion);
    }

    /// Record the instance keys a resource block produced.
    pub fn expand_resource(&self, addr: &AbsResource, expansion: Expansion) {
        self.resources
            .write()
            .unwrap()
            .insert(addr.clone(), expansion);
    }

    pub fn resource_expansion(&self, addr: &AbsResource) -> Option<Expansion> {
        self.resources.read().unwrap().get(addr).cloned()
    }

    pub fn module_expansion(&self, parent: &ModuleInstance, call: &str) -> Option<Expansion> {
        self.modules
            .read()
            .unwrap()
            .get(&(parent.clone(), call.to_string()))
            .cloned()
    }

    /// Instance keys for a resource. Declared-but-absent keys simply don't
    /// appear; asking for them downstream yields an empty result, never an
    /// error.
    pub fn resource_keys(&self, addr: &AbsResource) -> ExpandedKeys {
        match self.resource_expansion(addr) {
            Some(expansion) => expansion.keys(),
            None => {
                debug_assert!(
                    false,
                    "expansion queried before registration: {}",
                    addr
                );
                ExpandedKeys::Keys(Vec::new())
            }
        }
    }

    pub fn resource_instances(&self, addr: &AbsResource) -> Vec<ResourceInstance> {
        self.resource_keys(addr)
            .known()
            .into_iter()
            .map(|key| addr.instance(key))
            .collect()
    }

    /// All module instances for a configuration path, the cartesian product
    /// of every call expansion along the way. Unknown expansions contribute
    /// no instances.
    pub fn module_instances(&self, path: &Module) -> Vec<ModuleInstance> {
        let mut current = vec![ModuleInstance::root()];
        let modules = self.modules.read().unwrap();
        for call in &path.0 {
            let mut next = Vec::new();
            for parent in &current {
                let expansion = match modules.get(&(parent.clone(), call.clone())) {
                    Some(e) => e.clone(),
                    None => {
                        debug_assert!(
                            false,
                            "module expansion queried before registration: {} in {}",
                            call, parent
                        );
                        continue;
                    }
                };
                for key in expansion.keys().known() {
                    next.push(parent.child(call.clone(), key));
                }
            }
            current = next;
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_domain::Resource;

    #[test]
    fn single_resource_has_no_key() {
        let expander = Expander::new();
        let addr = ModuleInstance::root().resource(Resource::managed("test_object", "a"));
        expander.expand_resource(&addr, Expansion::Single);
        assert_eq!(
            expander.resource_keys(&addr),
            ExpandedKeys::Keys(vec![InstanceKey::NoKey])
        );
    }

    #[test]
    fn for_each_keys_preserve_order() {
        let expander = Expander::new();
        let addr = ModuleInstance::root().resource(Resource::managed("test_object", "a"));
        expander.expand_resource(
            &addr,
            Expansion::ForEach(vec!["key1".into(), "key2".into(), "key3".into()]),
        );
        let keys = expander.resource_keys(&addr).known();
        assert_eq!(
            keys,
            vec![
                InstanceKey::Str("key1".into()),
                InstanceKey::Str("key2".into()),
                InstanceKey::Str("key3".into()),
            ]
        );
    }

    #[test]
    fn unknown_expansion_surfaces_sentinel() {
        let expander = Expander::new();
        let addr = ModuleInstance::root().resource(Resource::managed("test_object", "a"));
        expander.expand_resource(&addr, Expansion::Unknown);
        assert!(expander.resource_keys(&addr).is_unknown());
        assert!(expander.resource_instances(&addr).is_empty());
    }

    #[test]
    #[should_panic(expected = "expansion queried before registration")]
    #[cfg(debug_assertions)]
    fn unregistered_query_panics_in_dev() {
        let expander = Expander::new();
        let addr = ModuleInstance::root().resource(Resource::managed("test_object", "a"));
        expander.resource_keys(&addr);
    }

    #[test]
    fn module_instances_cartesian_product() {
        let expander = Expander::new();
        let root = ModuleInstance::root();
        expander.expand_module(&root, "net", Expansion::ForEach(vec!["a".into(), "b".into()]));
        for key in ["a", "b"] {
            let parent = root.child("net", InstanceKey::Str(key.into()));
            expander.expand_module(&parent, "sub", Expansion::Count(2));
        }

        let path = Module::root().child("net").child("sub");
        let instances = expander.module_instances(&path);
        assert_eq!(instances.len(), 4);
        assert_eq!(
            instances[0].to_string(),
            "module.net[\"a\"].module.sub[0]"
        );
    }
}
