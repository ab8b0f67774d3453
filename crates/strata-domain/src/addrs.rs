use serde::{Deserialize, Serialize};

// ── Resource mode ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceMode {
    Managed,
    Data,
}

impl std::fmt::Display for ResourceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceMode::Managed => write!(f, "managed"),
            ResourceMode::Data => write!(f, "data"),
        }
    }
}

// ── Instance keys ─────────────────────────────────────────────────────────────

/// The discriminator that distinguishes instances within a single resource or
/// module-call block: none, an integer (`count`), or a string (`for_each`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceKey {
    #[default]
    NoKey,
    Int(i64),
    Str(String),
}

impl InstanceKey {
    pub fn is_no_key(&self) -> bool {
        matches!(self, InstanceKey::NoKey)
    }
}

impl std::fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceKey::NoKey => Ok(()),
            InstanceKey::Int(i) => write!(f, "[{}]", i),
            InstanceKey::Str(s) => write!(f, "[{:?}]", s),
        }
    }
}

// ── Resources ─────────────────────────────────────────────────────────────────

/// A resource block identity within one module: mode, type and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Resource {
    pub mode: ResourceMode,
    pub type_name: String,
    pub name: String,
}

impl Resource {
    pub fn managed(type_name: impl Into<String>, name: impl Into<String>) -> Self {
        Resource {
            mode: ResourceMode::Managed,
            type_name: type_name.into(),
            name: name.into(),
        }
    }

    pub fn data(type_name: impl Into<String>, name: impl Into<String>) -> Self {
        Resource {
            mode: ResourceMode::Data,
            type_name: type_name.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.mode {
            ResourceMode::Managed => write!(f, "{}.{}", self.type_name, self.name),
            ResourceMode::Data => write!(f, "data.{}.{}", self.type_name, self.name),
        }
    }
}

// ── Modules ───────────────────────────────────────────────────────────────────

/// A module path in configuration space: call names only, no instance keys.
/// Empty means the root module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Module(pub Vec<String>);

impl Module {
    pub fn root() -> Self {
        Module(Vec::new())
    }

    pub fn child(&self, call_name: impl Into<String>) -> Self {
        let mut path = self.0.clone();
        path.push(call_name.into());
        Module(path)
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// The containing module and the final call name, or None for the root.
    pub fn split_call(&self) -> Option<(Module, &str)> {
        let (last, parent) = self.0.split_last()?;
        Some((Module(parent.to_vec()), last.as_str()))
    }
}

impl std::fmt::Display for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, name) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "module.{}", name)?;
        }
        Ok(())
    }
}

/// One step of a module instance path: the call name plus the instance key
/// produced by that call's `count`/`for_each`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleInstanceStep {
    pub name: String,
    pub key: InstanceKey,
}

/// A fully-expanded module path in instance space. Empty means the root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleInstance(pub Vec<ModuleInstanceStep>);

impl ModuleInstance {
    pub fn root() -> Self {
        ModuleInstance(Vec::new())
    }

    pub fn child(&self, name: impl Into<String>, key: InstanceKey) -> Self {
        let mut steps = self.0.clone();
        steps.push(ModuleInstanceStep { name: name.into(), key });
        ModuleInstance(steps)
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Project the instance path down to configuration space.
    pub fn module(&self) -> Module {
        Module(self.0.iter().map(|s| s.name.clone()).collect())
    }

    pub fn resource(&self, resource: Resource) -> AbsResource {
        AbsResource { module: self.clone(), resource }
    }
}

impl std::fmt::Display for ModuleInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, step) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "module.{}{}", step.name, step.key)?;
        }
        Ok(())
    }
}

// ── Absolute resource addresses ───────────────────────────────────────────────

/// A resource block within a specific module instance (all instance keys of
/// the containing modules resolved, the resource's own key not yet).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AbsResource {
    pub module: ModuleInstance,
    pub resource: Resource,
}

impl AbsResource {
    pub fn instance(&self, key: InstanceKey) -> ResourceInstance {
        ResourceInstance {
            module: self.module.clone(),
            resource: self.resource.clone(),
            key,
        }
    }
}

impl std::fmt::Display for AbsResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.module.is_root() {
            write!(f, "{}", self.resource)
        } else {
            write!(f, "{}.{}", self.module, self.resource)
        }
    }
}

/// A resource block within a module configuration path (no instance keys
/// anywhere). The unit the graph builder plans around.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfigResource {
    pub module: Module,
    pub resource: Resource,
}

impl std::fmt::Display for ConfigResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.module.is_root() {
            write!(f, "{}", self.resource)
        } else {
            write!(f, "{}.{}", self.module, self.resource)
        }
    }
}

/// A fully-expanded resource instance address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceInstance {
    pub module: ModuleInstance,
    pub resource: Resource,
    pub key: InstanceKey,
}

impl ResourceInstance {
    pub fn abs_resource(&self) -> AbsResource {
        AbsResource {
            module: self.module.clone(),
            resource: self.resource.clone(),
        }
    }

    pub fn config_resource(&self) -> ConfigResource {
        ConfigResource {
            module: self.module.module(),
            resource: self.resource.clone(),
        }
    }
}

impl std::fmt::Display for ResourceInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.module.is_root() {
            write!(f, "{}{}", self.resource, self.key)
        } else {
            write!(f, "{}.{}{}", self.module, self.resource, self.key)
        }
    }
}

// ── Provider addresses ────────────────────────────────────────────────────────

/// Fully-qualified provider source: registry hostname, namespace and type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProviderSource {
    pub hostname: String,
    pub namespace: String,
    pub type_name: String,
}

pub const DEFAULT_REGISTRY_HOST: &str = "registry.strata.dev";

impl ProviderSource {
    pub fn new(
        hostname: impl Into<String>,
        namespace: impl Into<String>,
        type_name: impl Into<String>,
    ) -> Self {
        ProviderSource {
            hostname: hostname.into(),
            namespace: namespace.into(),
            type_name: type_name.into(),
        }
    }

    /// Source under the default registry host.
    pub fn default_registry(namespace: impl Into<String>, type_name: impl Into<String>) -> Self {
        ProviderSource::new(DEFAULT_REGISTRY_HOST, namespace, type_name)
    }
}

impl std::fmt::Display for ProviderSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.hostname, self.namespace, self.type_name)
    }
}

/// One `provider` block: source plus the declaring module and optional alias.
/// Unique per module.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProviderConfigAddr {
    pub source: ProviderSource,
    pub module: Module,
    pub alias: Option<String>,
}

impl ProviderConfigAddr {
    pub fn root(source: ProviderSource) -> Self {
        ProviderConfigAddr { source, module: Module::root(), alias: None }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn instance(&self, key: InstanceKey) -> ProviderInstanceAddr {
        ProviderInstanceAddr { config: self.clone(), key }
    }
}

impl std::fmt::Display for ProviderConfigAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.module.is_root() {
            write!(f, "{}.", self.module)?;
        }
        write!(f, "provider[{:?}]", self.source.to_string())?;
        if let Some(alias) = &self.alias {
            write!(f, ".{}", alias)?;
        }
        Ok(())
    }
}

/// A provider configuration instance: the block plus the key selected by the
/// block's `for_each`, if any.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProviderInstanceAddr {
    pub config: ProviderConfigAddr,
    pub key: InstanceKey,
}

impl std::fmt::Display for ProviderInstanceAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.config, self.key)
    }
}

// ── Deposed keys ──────────────────────────────────────────────────────────────

/// Identifies a deposed object within a resource instance.
///
/// The contract is opaque equality: callers must not assume any lexical
/// structure of the contained token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeposedKey(String);

impl DeposedKey {
    /// Mint a fresh key, unique within the instance with overwhelming
    /// probability.
    pub fn new() -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        DeposedKey(id[..8].to_string())
    }

    /// Reconstruct a key previously obtained from [`DeposedKey::as_str`],
    /// e.g. when decoding persisted state.
    pub fn from_existing(token: impl Into<String>) -> Self {
        DeposedKey(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for DeposedKey {
    fn default() -> Self {
        DeposedKey::new()
    }
}

impl std::fmt::Display for DeposedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Targeting ─────────────────────────────────────────────────────────────────

/// An address given to `-target=`/`-exclude=`: a module path, optionally
/// narrowed to one resource, optionally narrowed to one instance key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetAddr {
    pub module: Module,
    pub resource: Option<Resource>,
    pub key: Option<InstanceKey>,
}

impl TargetAddr {
    pub fn module(module: Module) -> Self {
        TargetAddr { module, resource: None, key: None }
    }

    pub fn resource(module: Module, resource: Resource) -> Self {
        TargetAddr { module, resource: Some(resource), key: None }
    }

    pub fn instance(module: Module, resource: Resource, key: InstanceKey) -> Self {
        TargetAddr { module, resource: Some(resource), key: Some(key) }
    }

    /// Whether this target covers the given config-space resource. A module
    /// target covers everything at or below its path.
    pub fn matches_config(&self, addr: &ConfigResource) -> bool {
        if !addr.module.0.starts_with(&self.module.0) {
            return false;
        }
        match &self.resource {
            None => true,
            Some(r) => addr.module.0.len() == self.module.0.len() && r == &addr.resource,
        }
    }

    /// Whether this target covers the given expanded instance.
    pub fn matches_instance(&self, addr: &ResourceInstance) -> bool {
        if !self.matches_config(&addr.config_resource()) {
            return false;
        }
        match &self.key {
            None => true,
            Some(k) => k == &addr.key,
        }
    }
}

impl std::fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.resource, self.module.is_root()) {
            (None, _) => write!(f, "{}", self.module),
            (Some(r), true) => {
                write!(f, "{}", r)?;
                if let Some(k) = &self.key {
                    write!(f, "{}", k)?;
                }
                Ok(())
            }
            (Some(r), false) => {
                write!(f, "{}.{}", self.module, r)?;
                if let Some(k) = &self.key {
                    write!(f, "{}", k)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_display_modes() {
        assert_eq!(Resource::managed("test_object", "a").to_string(), "test_object.a");
        assert_eq!(
            Resource::data("test_data_source", "a").to_string(),
            "data.test_data_source.a"
        );
    }

    #[test]
    fn instance_key_display() {
        assert_eq!(InstanceKey::NoKey.to_string(), "");
        assert_eq!(InstanceKey::Int(3).to_string(), "[3]");
        assert_eq!(InstanceKey::Str("k".into()).to_string(), "[\"k\"]");
    }

    #[test]
    fn instance_address_display() {
        let addr = ModuleInstance::root()
            .child("net", InstanceKey::Str("a".into()))
            .resource(Resource::managed("test_object", "x"))
            .instance(InstanceKey::Int(0));
        assert_eq!(addr.to_string(), "module.net[\"a\"].test_object.x[0]");
    }

    #[test]
    fn canonical_strings_are_distinct() {
        // The canonical rendering must be a bijection: distinct addresses
        // must never render identically.
        let a = ModuleInstance::root()
            .resource(Resource::managed("t", "n"))
            .instance(InstanceKey::Str("0".into()));
        let b = ModuleInstance::root()
            .resource(Resource::managed("t", "n"))
            .instance(InstanceKey::Int(0));
        assert_ne!(a.to_string(), b.to_string());
    }

    #[test]
    fn provider_config_display() {
        let addr = ProviderConfigAddr::root(ProviderSource::default_registry("core", "test"))
            .with_alias("eu");
        assert_eq!(
            addr.to_string(),
            format!("provider[\"{}/core/test\"].eu", DEFAULT_REGISTRY_HOST)
        );
    }

    #[test]
    fn deposed_keys_are_unique_and_opaque() {
        let a = DeposedKey::new();
        let b = DeposedKey::new();
        assert_ne!(a, b);
        assert_eq!(a, DeposedKey::from_existing(a.as_str()));
    }

    #[test]
    fn target_matching() {
        let inst = ModuleInstance::root()
            .child("net", InstanceKey::NoKey)
            .resource(Resource::managed("test_object", "x"))
            .instance(InstanceKey::Int(1));

        let module_target = TargetAddr::module(Module::root().child("net"));
        assert!(module_target.matches_instance(&inst));

        let resource_target = TargetAddr::resource(
            Module::root().child("net"),
            Resource::managed("test_object", "x"),
        );
        assert!(resource_target.matches_instance(&inst));

        let wrong_key = TargetAddr::instance(
            Module::root().child("net"),
            Resource::managed("test_object", "x"),
            InstanceKey::Int(0),
        );
        assert!(!wrong_key.matches_instance(&inst));

        let other_resource = TargetAddr::resource(
            Module::root(),
            Resource::managed("test_object", "x"),
        );
        assert!(!other_resource.matches_instance(&inst));
    }
}
