use std::collections::BTreeMap;
use std::sync::Mutex;

use tracing::warn;

use strata_domain::{AbsResource, DeposedKey};

use crate::checks::CheckRegistry;
use crate::plan::{
    Changes, DriftedResource, OutputChange, ResourceInstanceChange,
};

/// Collects everything the walk produces. The only writer of plan content;
/// nodes funnel their results through it, never through shared mutable plan
/// structures of their own.
#[derive(Debug, Default)]
pub struct PlanBuilder {
    changes: Mutex<BTreeMap<(String, Option<DeposedKey>), ResourceInstanceChange>>,
    drift: Mutex<Vec<DriftedResource>>,
    outputs: Mutex<BTreeMap<String, OutputChange>>,
    pub checks: CheckRegistry,
}

impl PlanBuilder {
    pub fn new() -> Self {
        PlanBuilder::default()
    }

    /// Record one change. Each (address, deposed-key) pair may be recorded
    /// once; a duplicate indicates a graph bug and keeps the first record.
    pub fn record_change(&self, change: ResourceInstanceChange) {
        let key = (change.addr.to_string(), change.deposed.clone());
        let mut changes = self.changes.lock().unwrap();
        if changes.contains_key(&key) {
            debug_assert!(false, "duplicate change recorded for {}", change);
            warn!(change = %change, "duplicate change dropped");
            return;
        }
        changes.insert(key, change);
    }

    /// Whether any recorded change for an instance of this resource would
    /// touch the remote object. Drives data-source read deferral.
    pub fn resource_has_pending_change(&self, addr: &AbsResource) -> bool {
        let changes = self.changes.lock().unwrap();
        changes
            .values()
            .any(|c| c.action.is_pending() && c.addr.abs_resource() == *addr)
    }

    pub fn record_drift(&self, drift: DriftedResource) {
        self.drift.lock().unwrap().push(drift);
    }

    pub fn record_output_change(&self, change: OutputChange) {
        self.outputs
            .lock()
            .unwrap()
            .insert(change.name.clone(), change);
    }

    /// Finalize into plan parts: changes in address order, drift in address
    /// order, output changes by name.
    pub fn into_parts(
        self,
    ) -> (
        Changes,
        Vec<DriftedResource>,
        BTreeMap<String, OutputChange>,
        crate::plan::CheckResults,
    ) {
        let changes = Changes {
            resources: self.changes.into_inner().unwrap().into_values().collect(),
        };
        let mut drift = self.drift.into_inner().unwrap();
        drift.sort_by_key(|d| d.addr.to_string());
        let outputs = self.outputs.into_inner().unwrap();
        (changes, drift, outputs, self.checks.into_results())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_domain::{
        InstanceKey, Marks, ModuleInstance, ProviderConfigAddr, ProviderSource, Resource, Value,
    };

    use crate::plan::{Action, ActionReason};

    fn change(name: &str, action: Action) -> ResourceInstanceChange {
        let addr = ModuleInstance::root()
            .resource(Resource::managed("test_object", name))
            .instance(InstanceKey::NoKey);
        ResourceInstanceChange {
            addr: addr.clone(),
            prev_run_addr: addr,
            deposed: None,
            action,
            reason: ActionReason::NoReason,
            before: Value::Null,
            after: Value::Null,
            before_marks: Marks::new(),
            after_marks: Marks::new(),
            importing: None,
            generated_config: None,
            provider: ProviderConfigAddr::root(ProviderSource::default_registry("core", "test")),
        }
    }

    #[test]
    fn changes_sorted_by_address() {
        let builder = PlanBuilder::new();
        builder.record_change(change("b", Action::Create));
        builder.record_change(change("a", Action::Create));

        let (changes, _, _, _) = builder.into_parts();
        let names: Vec<_> = changes
            .resources
            .iter()
            .map(|c| c.addr.resource.name.clone())
            .collect();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn pending_change_lookup() {
        let builder = PlanBuilder::new();
        builder.record_change(change("a", Action::NoOp));
        builder.record_change(change("b", Action::Update));

        let abs_a = ModuleInstance::root().resource(Resource::managed("test_object", "a"));
        let abs_b = ModuleInstance::root().resource(Resource::managed("test_object", "b"));
        assert!(!builder.resource_has_pending_change(&abs_a));
        assert!(builder.resource_has_pending_change(&abs_b));
    }
}
