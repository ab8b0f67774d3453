use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use strata_domain::{
    AbsResource, AttrPath, DeposedKey, InstanceKey, Mark, MarkedValue, Marks, ModuleInstance,
    ProviderConfigAddr, Resource, ResourceInstance, Value,
};

// ── Objects ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ObjectStatus {
    /// Exists and was fully provisioned.
    #[default]
    Ready,
    /// Exists but a previous apply failed partway; will be replaced.
    Tainted,
    /// Does not exist yet; the value is a plan-time projection.
    Planned,
}

impl std::fmt::Display for ObjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectStatus::Ready => write!(f, "ready"),
            ObjectStatus::Tainted => write!(f, "tainted"),
            ObjectStatus::Planned => write!(f, "planned"),
        }
    }
}

/// One stored remote-object record: serialized attributes plus bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectState {
    /// Attribute JSON, decodable against the schema at `schema_version`.
    pub attrs: serde_json::Value,
    pub status: ObjectStatus,
    /// Paths within `attrs` that carry the sensitive mark.
    pub sensitive_paths: Vec<AttrPath>,
    /// Addresses this object depended on when it was created; advisory during
    /// plan, used for destroy ordering only.
    pub dependencies: Vec<AbsResource>,
    pub schema_version: u64,
    /// Opaque provider-private payload, round-tripped through every RPC.
    #[serde(default)]
    pub private: Vec<u8>,
}

impl ObjectState {
    pub fn new(attrs: serde_json::Value) -> Self {
        ObjectState {
            attrs,
            status: ObjectStatus::Ready,
            sensitive_paths: Vec::new(),
            dependencies: Vec::new(),
            schema_version: 0,
            private: Vec::new(),
        }
    }

    pub fn with_status(mut self, status: ObjectStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_schema_version(mut self, version: u64) -> Self {
        self.schema_version = version;
        self
    }

    pub fn with_sensitive_paths(mut self, paths: Vec<AttrPath>) -> Self {
        self.sensitive_paths = paths;
        self
    }

    /// Decode the attribute JSON into the value model, applying the recorded
    /// sensitive-path marks.
    pub fn marked_value(&self) -> MarkedValue {
        let value = Value::from_json(self.attrs.clone());
        let marks = Marks::from_paths(self.sensitive_paths.iter().cloned(), Mark::Sensitive);
        MarkedValue::new(value, marks)
    }
}

// ── Instances ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceState {
    pub current: Option<ObjectState>,
    pub deposed: BTreeMap<DeposedKey, ObjectState>,
    /// The provider instance key that manages this object, recorded at the
    /// last apply. NoKey unless the provider block used `for_each`.
    #[serde(default = "no_key")]
    pub provider_key: InstanceKey,
}

fn no_key() -> InstanceKey {
    InstanceKey::NoKey
}

impl InstanceState {
    pub fn with_current(object: ObjectState) -> Self {
        InstanceState {
            current: Some(object),
            deposed: BTreeMap::new(),
            provider_key: InstanceKey::NoKey,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_none() && self.deposed.is_empty()
    }
}

// ── Resources ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    /// The provider configuration this resource's objects belong to.
    pub provider_config: ProviderConfigAddr,
    pub instances: BTreeMap<InstanceKey, InstanceState>,
}

impl ResourceState {
    pub fn new(provider_config: ProviderConfigAddr) -> Self {
        ResourceState { provider_config, instances: BTreeMap::new() }
    }
}

// ── Modules ───────────────────────────────────────────────────────────────────

/// A stored root-module output value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputValue {
    pub value: serde_json::Value,
    pub sensitive: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleState {
    pub resources: BTreeMap<Resource, ResourceState>,
    pub outputs: BTreeMap<String, OutputValue>,
}

impl ModuleState {
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.outputs.is_empty()
    }
}

// ── State ─────────────────────────────────────────────────────────────────────

/// The full persisted picture of what was last believed to exist, in memory.
/// Load/save is the caller's concern.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub modules: BTreeMap<ModuleInstance, ModuleState>,
}

impl State {
    pub fn new() -> Self {
        State::default()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.values().all(ModuleState::is_empty)
    }

    pub fn module(&self, addr: &ModuleInstance) -> Option<&ModuleState> {
        self.modules.get(addr)
    }

    pub fn module_mut(&mut self, addr: &ModuleInstance) -> &mut ModuleState {
        self.modules.entry(addr.clone()).or_default()
    }

    pub fn resource(&self, addr: &AbsResource) -> Option<&ResourceState> {
        self.modules.get(&addr.module)?.resources.get(&addr.resource)
    }

    pub fn instance(&self, addr: &ResourceInstance) -> Option<&InstanceState> {
        self.resource(&addr.abs_resource())?.instances.get(&addr.key)
    }

    pub fn root_output(&self, name: &str) -> Option<&OutputValue> {
        self.modules.get(&ModuleInstance::root())?.outputs.get(name)
    }

    /// Every resource instance in the state, in address order.
    pub fn all_resource_instances(&self) -> Vec<ResourceInstance> {
        let mut out = Vec::new();
        for (module, module_state) in &self.modules {
            for (resource, resource_state) in &module_state.resources {
                for key in resource_state.instances.keys() {
                    out.push(ResourceInstance {
                        module: module.clone(),
                        resource: resource.clone(),
                        key: key.clone(),
                    });
                }
            }
        }
        out
    }

    /// Record which provider configuration manages a resource, creating the
    /// resource record if needed.
    pub fn set_resource_provider(&mut self, addr: &AbsResource, provider: ProviderConfigAddr) {
        let module = self.module_mut(&addr.module);
        module
            .resources
            .entry(addr.resource.clone())
            .and_modify(|r| r.provider_config = provider.clone())
            .or_insert_with(|| ResourceState::new(provider));
    }

    /// Set or clear the current object for an instance. Clearing prunes empty
    /// containers all the way up.
    pub fn set_instance_current(&mut self, addr: &ResourceInstance, object: Option<ObjectState>) {
        match object {
            Some(object) => {
                let resource = self
                    .module_mut(&addr.module)
                    .resources
                    .get_mut(&addr.resource);
                let Some(resource) = resource else {
                    // Callers must have declared the provider first.
                    debug_assert!(false, "set_instance_current before set_resource_provider");
                    return;
                };
                resource
                    .instances
                    .entry(addr.key.clone())
                    .or_default()
                    .current = Some(object);
            }
            None => {
                if let Some(module) = self.modules.get_mut(&addr.module) {
                    if let Some(resource) = module.resources.get_mut(&addr.resource) {
                        if let Some(instance) = resource.instances.get_mut(&addr.key) {
                            instance.current = None;
                        }
                    }
                }
                self.prune(addr);
            }
        }
    }

    /// Set or clear one deposed object.
    pub fn set_instance_deposed(
        &mut self,
        addr: &ResourceInstance,
        key: &DeposedKey,
        object: Option<ObjectState>,
    ) {
        match object {
            Some(object) => {
                if let Some(resource) = self
                    .modules
                    .get_mut(&addr.module)
                    .and_then(|m| m.resources.get_mut(&addr.resource))
                {
                    resource
                        .instances
                        .entry(addr.key.clone())
                        .or_default()
                        .deposed
                        .insert(key.clone(), object);
                }
            }
            None => {
                if let Some(instance) = self
                    .modules
                    .get_mut(&addr.module)
                    .and_then(|m| m.resources.get_mut(&addr.resource))
                    .and_then(|r| r.instances.get_mut(&addr.key))
                {
                    instance.deposed.remove(key);
                }
                self.prune(addr);
            }
        }
    }

    /// Record the provider instance key managing an instance.
    pub fn set_instance_provider_key(&mut self, addr: &ResourceInstance, key: InstanceKey) {
        if let Some(instance) = self
            .modules
            .get_mut(&addr.module)
            .and_then(|m| m.resources.get_mut(&addr.resource))
            .and_then(|r| r.instances.get_mut(&addr.key))
        {
            instance.provider_key = key;
        }
    }

    /// Drop an entire instance (current and deposed) without touching the
    /// remote object: the forget operation.
    pub fn forget_instance(&mut self, addr: &ResourceInstance) {
        if let Some(resource) = self
            .modules
            .get_mut(&addr.module)
            .and_then(|m| m.resources.get_mut(&addr.resource))
        {
            resource.instances.remove(&addr.key);
        }
        self.prune(addr);
    }

    /// Rewrite the state key of an instance. Returns false if the source is
    /// absent or the destination is occupied; the caller decides how to
    /// surface that.
    pub fn move_resource_instance(
        &mut self,
        from: &ResourceInstance,
        to: &ResourceInstance,
    ) -> bool {
        if self.instance(to).is_some() {
            return false;
        }
        let Some(from_resource) = self
            .modules
            .get_mut(&from.module)
            .and_then(|m| m.resources.get_mut(&from.resource))
        else {
            return false;
        };
        let provider = from_resource.provider_config.clone();
        let Some(instance) = from_resource.instances.remove(&from.key) else {
            return false;
        };
        self.prune(from);

        self.set_resource_provider(&to.abs_resource(), provider);
        self.module_mut(&to.module)
            .resources
            .get_mut(&to.resource)
            .expect("resource record just created")
            .instances
            .insert(to.key.clone(), instance);
        true
    }

    pub fn set_output_value(&mut self, name: impl Into<String>, value: OutputValue) {
        self.module_mut(&ModuleInstance::root())
            .outputs
            .insert(name.into(), value);
    }

    pub fn remove_output(&mut self, name: &str) {
        if let Some(module) = self.modules.get_mut(&ModuleInstance::root()) {
            module.outputs.remove(name);
        }
    }

    fn prune(&mut self, addr: &ResourceInstance) {
        let Some(module) = self.modules.get_mut(&addr.module) else {
            return;
        };
        if let Some(resource) = module.resources.get_mut(&addr.resource) {
            if resource
                .instances
                .get(&addr.key)
                .is_some_and(InstanceState::is_empty)
            {
                resource.instances.remove(&addr.key);
            }
            if resource.instances.is_empty() {
                module.resources.remove(&addr.resource);
            }
        }
        if module.is_empty() && !addr.module.is_root() {
            self.modules.remove(&addr.module);
        }
    }
}
