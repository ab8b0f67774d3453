use std::sync::Arc;

use tokio::sync::RwLock;

use strata_domain::{
    AbsResource, DeposedKey, InstanceKey, ProviderConfigAddr, ResourceInstance,
};

use crate::state::{ObjectState, OutputValue, State};

/// The one writable handle to an evolving state during a walk. All mutations
/// funnel through the typed operations here; readers take snapshots. The
/// walker's edge ordering plus this lock give the visibility guarantee that a
/// node observes every write made by its predecessors.
#[derive(Debug, Clone)]
pub struct SyncState {
    inner: Arc<RwLock<State>>,
}

impl SyncState {
    pub fn new(state: State) -> Self {
        SyncState { inner: Arc::new(RwLock::new(state)) }
    }

    /// A deep copy of the current state.
    pub async fn snapshot(&self) -> State {
        self.inner.read().await.clone()
    }

    /// Run a read-only closure against the live state without copying.
    pub async fn read<R>(&self, f: impl FnOnce(&State) -> R) -> R {
        let guard = self.inner.read().await;
        f(&guard)
    }

    /// Consume the handle and return the state. Panics if clones are still
    /// alive; call only after the walk has completed.
    pub fn into_inner(self) -> State {
        Arc::try_unwrap(self.inner)
            .expect("state handle still shared after walk")
            .into_inner()
    }

    pub async fn set_resource_provider(&self, addr: &AbsResource, provider: ProviderConfigAddr) {
        self.inner.write().await.set_resource_provider(addr, provider);
    }

    pub async fn set_instance_current(&self, addr: &ResourceInstance, object: Option<ObjectState>) {
        self.inner.write().await.set_instance_current(addr, object);
    }

    pub async fn set_instance_deposed(
        &self,
        addr: &ResourceInstance,
        key: &DeposedKey,
        object: Option<ObjectState>,
    ) {
        self.inner.write().await.set_instance_deposed(addr, key, object);
    }

    pub async fn set_instance_provider_key(&self, addr: &ResourceInstance, key: InstanceKey) {
        self.inner.write().await.set_instance_provider_key(addr, key);
    }

    pub async fn forget_instance(&self, addr: &ResourceInstance) {
        self.inner.write().await.forget_instance(addr);
    }

    pub async fn move_resource_instance(
        &self,
        from: &ResourceInstance,
        to: &ResourceInstance,
    ) -> bool {
        self.inner.write().await.move_resource_instance(from, to)
    }

    pub async fn set_output_value(&self, name: impl Into<String>, value: OutputValue) {
        self.inner.write().await.set_output_value(name, value);
    }

    pub async fn remove_output(&self, name: &str) {
        self.inner.write().await.remove_output(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_domain::{ModuleInstance, ProviderSource, Resource};

    #[tokio::test]
    async fn writes_visible_to_snapshots() {
        let sync = SyncState::new(State::new());
        let addr = ModuleInstance::root()
            .resource(Resource::managed("test_object", "a"))
            .instance(InstanceKey::NoKey);

        sync.set_resource_provider(
            &addr.abs_resource(),
            ProviderConfigAddr::root(ProviderSource::default_registry("core", "test")),
        )
        .await;
        sync.set_instance_current(&addr, Some(ObjectState::new(serde_json::json!({"id": 1}))))
            .await;

        let snap = sync.snapshot().await;
        assert!(snap.instance(&addr).is_some());

        // The snapshot is independent of later writes.
        sync.set_instance_current(&addr, None).await;
        assert!(snap.instance(&addr).is_some());
        assert!(sync.read(|s| s.instance(&addr).is_none()).await);
    }
}
