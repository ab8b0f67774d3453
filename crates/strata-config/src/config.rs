use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use strata_domain::{
    InstanceKey, Module, ProviderSource, Resource, ResourceMode, SourceRange, Value,
};

use crate::expr::{Expr, Reference};

// ── Root ──────────────────────────────────────────────────────────────────────

/// A fully-loaded, already-validated configuration tree. Produced by the
/// external loader; the core never parses text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub root: ModuleConfig,
}

impl Config {
    pub fn new(root: ModuleConfig) -> Self {
        Config { root }
    }

    /// Walk down to the module config at the given call path, if it exists.
    pub fn module(&self, path: &Module) -> Option<&ModuleConfig> {
        let mut current = &self.root;
        for name in &path.0 {
            current = &current.module_calls.get(name)?.child;
        }
        Some(current)
    }

    /// Every module in the tree with its configuration path, root included.
    pub fn modules(&self) -> Vec<(Module, &ModuleConfig)> {
        let mut out = Vec::new();
        let mut stack = vec![(Module::root(), &self.root)];
        while let Some((path, mc)) = stack.pop() {
            for (name, call) in &mc.module_calls {
                stack.push((path.child(name.clone()), &call.child));
            }
            out.push((path, mc));
        }
        out
    }
}

// ── Module contents ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub variables: BTreeMap<String, VariableConfig>,
    pub locals: BTreeMap<String, Expr>,
    pub outputs: BTreeMap<String, OutputConfig>,
    /// Managed resources keyed by "type.name".
    pub managed: BTreeMap<String, ResourceConfig>,
    /// Data resources keyed by "type.name".
    pub data: BTreeMap<String, ResourceConfig>,
    pub provider_configs: Vec<ProviderConfigBlock>,
    /// Provider local name → fully-qualified source, from required_providers.
    pub required_providers: BTreeMap<String, ProviderSource>,
    pub module_calls: BTreeMap<String, ModuleCall>,
    pub moved: Vec<MovedBlock>,
    pub removed: Vec<RemovedBlock>,
    pub imports: Vec<ImportBlock>,
    pub checks: BTreeMap<String, CheckConfig>,
}

impl ModuleConfig {
    pub fn resource(&self, resource: &Resource) -> Option<&ResourceConfig> {
        let key = format!("{}.{}", resource.type_name, resource.name);
        match resource.mode {
            ResourceMode::Managed => self.managed.get(&key),
            ResourceMode::Data => self.data.get(&key),
        }
    }

    pub fn add_managed(&mut self, rc: ResourceConfig) -> &mut Self {
        let key = format!("{}.{}", rc.type_name, rc.name);
        self.managed.insert(key, rc);
        self
    }

    pub fn add_data(&mut self, rc: ResourceConfig) -> &mut Self {
        let key = format!("{}.{}", rc.type_name, rc.name);
        self.data.insert(key, rc);
        self
    }

    /// Resolve the provider source for a provider local name, checking this
    /// module first, then treating the local name itself as an implied
    /// default-registry source the way implied providers resolve.
    pub fn provider_source(&self, local_name: &str) -> ProviderSource {
        self.required_providers
            .get(local_name)
            .cloned()
            .unwrap_or_else(|| ProviderSource::default_registry("builtin", local_name))
    }
}

// ── Resources ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub mode: ResourceMode,
    pub type_name: String,
    pub name: String,
    /// Attribute name → expression; the block body.
    pub body: BTreeMap<String, Expr>,
    pub count: Option<Expr>,
    pub for_each: Option<Expr>,
    pub provider: Option<ProviderRef>,
    pub depends_on: Vec<Reference>,
    pub lifecycle: Lifecycle,
    pub source: Option<SourceRange>,
}

impl ResourceConfig {
    pub fn managed(type_name: impl Into<String>, name: impl Into<String>) -> Self {
        ResourceConfig::new(ResourceMode::Managed, type_name, name)
    }

    pub fn data(type_name: impl Into<String>, name: impl Into<String>) -> Self {
        ResourceConfig::new(ResourceMode::Data, type_name, name)
    }

    fn new(mode: ResourceMode, type_name: impl Into<String>, name: impl Into<String>) -> Self {
        ResourceConfig {
            mode,
            type_name: type_name.into(),
            name: name.into(),
            body: BTreeMap::new(),
            count: None,
            for_each: None,
            provider: None,
            depends_on: Vec::new(),
            lifecycle: Lifecycle::default(),
            source: None,
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, expr: Expr) -> Self {
        self.body.insert(name.into(), expr);
        self
    }

    pub fn with_for_each(mut self, expr: Expr) -> Self {
        self.for_each = Some(expr);
        self
    }

    pub fn with_count(mut self, expr: Expr) -> Self {
        self.count = Some(expr);
        self
    }

    pub fn addr(&self) -> Resource {
        Resource {
            mode: self.mode,
            type_name: self.type_name.clone(),
            name: self.name.clone(),
        }
    }

    /// The provider local name this resource uses: an explicit `provider`
    /// argument, or the type-name prefix before the first underscore.
    pub fn provider_local_name(&self) -> &str {
        if let Some(provider) = &self.provider {
            if let Some(name) = &provider.local_name {
                return name;
            }
        }
        self.type_name
            .split('_')
            .next()
            .unwrap_or(&self.type_name)
    }

    /// All references in the body, repetition argument and depends_on.
    pub fn references(&self) -> Vec<Reference> {
        let mut out = Vec::new();
        if let Some(count) = &self.count {
            out.extend(count.references());
        }
        if let Some(for_each) = &self.for_each {
            out.extend(for_each.references());
        }
        for expr in self.body.values() {
            out.extend(expr.references());
        }
        if let Some(provider) = &self.provider {
            if let Some(key_expr) = &provider.key_expr {
                out.extend(key_expr.references());
            }
        }
        out.extend(self.depends_on.iter().cloned());
        for rule in self
            .lifecycle
            .preconditions
            .iter()
            .chain(self.lifecycle.postconditions.iter())
        {
            out.extend(rule.references());
        }
        out
    }
}

/// The `provider =` argument on a resource block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRef {
    /// Provider local name; None means implied from the resource type.
    pub local_name: Option<String>,
    pub alias: Option<String>,
    /// Instance key expression for providers with `for_each`.
    pub key_expr: Option<Expr>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Lifecycle {
    pub create_before_destroy: bool,
    pub preconditions: Vec<CheckRuleConfig>,
    pub postconditions: Vec<CheckRuleConfig>,
}

/// One precondition/postcondition/validation/assert block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRuleConfig {
    pub condition: Expr,
    pub error_message: Expr,
    pub source: Option<SourceRange>,
}

impl CheckRuleConfig {
    pub fn new(condition: Expr, error_message: Expr) -> Self {
        CheckRuleConfig { condition, error_message, source: None }
    }

    pub fn references(&self) -> Vec<Reference> {
        let mut out = self.condition.references();
        out.extend(self.error_message.references());
        out
    }
}

// ── Variables, locals, outputs ────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableConfig {
    pub default: Option<Value>,
    pub sensitive: bool,
    pub validations: Vec<CheckRuleConfig>,
    pub source: Option<SourceRange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub value: Expr,
    pub sensitive: bool,
    pub preconditions: Vec<CheckRuleConfig>,
    pub source: Option<SourceRange>,
}

impl OutputConfig {
    pub fn new(value: Expr) -> Self {
        OutputConfig { value, sensitive: false, preconditions: Vec::new(), source: None }
    }
}

// ── Module calls ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleCall {
    pub name: String,
    pub child: Box<ModuleConfig>,
    pub count: Option<Expr>,
    pub for_each: Option<Expr>,
    /// Input-variable assignments for the child module.
    pub args: BTreeMap<String, Expr>,
    pub source: Option<SourceRange>,
}

impl ModuleCall {
    pub fn references(&self) -> Vec<Reference> {
        let mut out = Vec::new();
        if let Some(count) = &self.count {
            out.extend(count.references());
        }
        if let Some(for_each) = &self.for_each {
            out.extend(for_each.references());
        }
        for expr in self.args.values() {
            out.extend(expr.references());
        }
        out
    }
}

// ── Provider blocks ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfigBlock {
    pub local_name: String,
    pub alias: Option<String>,
    pub for_each: Option<Expr>,
    pub body: BTreeMap<String, Expr>,
    pub source: Option<SourceRange>,
}

impl ProviderConfigBlock {
    pub fn new(local_name: impl Into<String>) -> Self {
        ProviderConfigBlock {
            local_name: local_name.into(),
            alias: None,
            for_each: None,
            body: BTreeMap::new(),
            source: None,
        }
    }

    pub fn references(&self) -> Vec<Reference> {
        let mut out = Vec::new();
        if let Some(for_each) = &self.for_each {
            out.extend(for_each.references());
        }
        for expr in self.body.values() {
            out.extend(expr.references());
        }
        out
    }
}

// ── Refactoring directives ────────────────────────────────────────────────────

/// One endpoint of a `moved` block: a resource, optionally a single instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MoveEndpoint {
    pub resource: Resource,
    pub key: Option<InstanceKey>,
}

impl MoveEndpoint {
    pub fn resource(resource: Resource) -> Self {
        MoveEndpoint { resource, key: None }
    }

    pub fn instance(resource: Resource, key: InstanceKey) -> Self {
        MoveEndpoint { resource, key: Some(key) }
    }
}

impl std::fmt::Display for MoveEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.resource)?;
        if let Some(key) = &self.key {
            write!(f, "{}", key)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovedBlock {
    pub from: MoveEndpoint,
    pub to: MoveEndpoint,
    pub source: Option<SourceRange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoveEndpoint {
    Resource(Resource),
    ModuleCall(String),
}

impl std::fmt::Display for RemoveEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoveEndpoint::Resource(r) => write!(f, "{}", r),
            RemoveEndpoint::ModuleCall(name) => write!(f, "module.{}", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemovedBlock {
    pub from: RemoveEndpoint,
    pub source: Option<SourceRange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportBlock {
    /// Target resource; root module only for config generation.
    pub to: Resource,
    /// Index expression on the target (`test_object.a[each.key]`).
    pub to_key_expr: Option<Expr>,
    pub id: Expr,
    pub for_each: Option<Expr>,
    pub source: Option<SourceRange>,
}

// ── Check blocks ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckConfig {
    pub name: String,
    pub asserts: Vec<CheckRuleConfig>,
    pub source: Option<SourceRange>,
}

impl CheckConfig {
    pub fn references(&self) -> Vec<Reference> {
        self.asserts.iter().flat_map(|a| a.references()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn implied_provider_local_name() {
        let rc = ResourceConfig::managed("test_object", "a");
        assert_eq!(rc.provider_local_name(), "test");

        let explicit = ResourceConfig {
            provider: Some(ProviderRef {
                local_name: Some("other".into()),
                alias: None,
                key_expr: None,
            }),
            ..ResourceConfig::managed("test_object", "a")
        };
        assert_eq!(explicit.provider_local_name(), "other");
    }

    #[test]
    fn module_lookup_by_path() {
        let mut child = ModuleConfig::default();
        child.locals.insert("x".into(), Expr::lit(1i64));
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
        let config = Config::new(root);

        let path = Module::root().child("net");
        assert!(config.module(&path).unwrap().locals.contains_key("x"));
        assert!(config.module(&path.child("missing")).is_none());

        let mut paths: Vec<String> =
            config.modules().iter().map(|(p, _)| p.to_string()).collect();
        paths.sort();
        assert_eq!(paths, vec!["".to_string(), "module.net".to_string()]);
    }

    #[test]
    fn resource_references_include_conditions() {
        let mut rc = ResourceConfig::managed("test_object", "a")
            .with_attr("arg", Expr::var("input"));
        rc.lifecycle.postconditions.push(CheckRuleConfig::new(
            Expr::self_attr("valid"),
            Expr::local("message"),
        ));
        let refs = rc.references();
        assert!(refs.contains(&Reference::Var("input".into())));
        assert!(refs.contains(&Reference::SelfRef));
        assert!(refs.contains(&Reference::Local("message".into())));
    }
}
