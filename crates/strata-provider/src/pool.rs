use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use strata_domain::{Diagnostics, InstanceKey, ProviderConfigAddr, ProviderSource, Value};

use crate::error::ProviderError;
use crate::provider::Provider;
use crate::schema::ProviderSchema;

// ── Registry ──────────────────────────────────────────────────────────────────

type Factory = Arc<dyn Fn() -> Arc<dyn Provider> + Send + Sync>;

/// Maps provider sources to factories producing plugin instances. Injected by
/// the caller; the core never launches processes itself.
#[derive(Default)]
pub struct ProviderRegistry {
    factories: HashMap<ProviderSource, Factory>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        ProviderRegistry::default()
    }

    /// Register a factory for a source. Returns `&mut self` for chaining.
    pub fn register(
        &mut self,
        source: ProviderSource,
        factory: impl Fn() -> Arc<dyn Provider> + Send + Sync + 'static,
    ) -> &mut Self {
        self.factories.insert(source, Arc::new(factory));
        self
    }

    pub fn for_source(&self, source: &ProviderSource) -> Result<Arc<dyn Provider>, ProviderError> {
        self.factories
            .get(source)
            .map(|f| f())
            .ok_or_else(|| ProviderError::NoFactory(source.clone()))
    }
}

// ── Pool ──────────────────────────────────────────────────────────────────────

struct PoolEntry {
    provider: Arc<dyn Provider>,
    /// Guards the at-most-once configure. Later callers block on the lock and
    /// therefore observe the first configure's completion.
    configured: Arc<Mutex<bool>>,
}

/// Owns every provider plugin instance for the duration of one plan, keyed by
/// (provider configuration, instance key). Schemas are fetched once per
/// source and treated as immutable.
pub struct ProviderPool {
    registry: Arc<ProviderRegistry>,
    instances: Mutex<HashMap<(ProviderConfigAddr, InstanceKey), Arc<PoolEntry>>>,
    schemas: Mutex<HashMap<ProviderSource, Arc<ProviderSchema>>>,
}

impl ProviderPool {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        ProviderPool {
            registry,
            instances: Mutex::new(HashMap::new()),
            schemas: Mutex::new(HashMap::new()),
        }
    }

    /// Ensure a plugin instance exists for the given configuration and key.
    /// Idempotent.
    pub async fn init(
        &self,
        config: &ProviderConfigAddr,
        key: &InstanceKey,
    ) -> Result<(), ProviderError> {
        let mut instances = self.instances.lock().await;
        let pool_key = (config.clone(), key.clone());
        if instances.contains_key(&pool_key) {
            return Ok(());
        }
        debug!(provider = %config, key = %key, "initializing provider instance");
        let provider = self.registry.for_source(&config.source)?;
        instances.insert(
            pool_key,
            Arc::new(PoolEntry { provider, configured: Arc::new(Mutex::new(false)) }),
        );
        Ok(())
    }

    /// Fetch an already-inited instance.
    pub async fn get(
        &self,
        config: &ProviderConfigAddr,
        key: &InstanceKey,
    ) -> Result<Arc<dyn Provider>, ProviderError> {
        let instances = self.instances.lock().await;
        instances
            .get(&(config.clone(), key.clone()))
            .map(|e| e.provider.clone())
            .ok_or_else(|| ProviderError::NotInitialized {
                addr: format!("{}{}", config, key),
            })
    }

    /// Memoized schema fetch. The returned schema is shared and must be
    /// treated as immutable for the plan.
    pub async fn schema(
        &self,
        cancel: &CancellationToken,
        source: &ProviderSource,
    ) -> Result<Arc<ProviderSchema>, ProviderError> {
        {
            let schemas = self.schemas.lock().await;
            if let Some(schema) = schemas.get(source) {
                return Ok(schema.clone());
            }
        }
        // Schemas come from an unconfigured throwaway instance; configuration
        // is not required for GetProviderSchema.
        let provider = self.registry.for_source(source)?;
        let schema = Arc::new(provider.get_schema(cancel).await?);
        let mut schemas = self.schemas.lock().await;
        Ok(schemas.entry(source.clone()).or_insert(schema).clone())
    }

    /// Validate a provider configuration value. A returned prepared config
    /// that differs from the input is logged and discarded.
    pub async fn validate_config(
        &self,
        cancel: &CancellationToken,
        config: &ProviderConfigAddr,
        key: &InstanceKey,
        value: Value,
    ) -> Result<Diagnostics, ProviderError> {
        let provider = self.get(config, key).await?;
        let response = provider
            .validate_provider_config(cancel, value.clone())
            .await?;
        if let Some(prepared) = response.prepared_config {
            if prepared != value {
                warn!(
                    provider = %config,
                    "provider returned a modified prepared config; ignoring it"
                );
            }
        }
        Ok(response.diagnostics)
    }

    /// Configure a provider instance at most once. Re-entrant calls return
    /// without re-sending to the plugin, after the first configure completed.
    pub async fn configure(
        &self,
        cancel: &CancellationToken,
        config: &ProviderConfigAddr,
        key: &InstanceKey,
        value: Value,
    ) -> Result<Diagnostics, ProviderError> {
        let entry = {
            let instances = self.instances.lock().await;
            instances
                .get(&(config.clone(), key.clone()))
                .cloned()
                .ok_or_else(|| ProviderError::NotInitialized {
                    addr: format!("{}{}", config, key),
                })?
        };

        let mut configured = entry.configured.lock().await;
        if *configured {
            return Ok(Diagnostics::new());
        }
        debug!(provider = %config, key = %key, "configuring provider instance");
        let response = entry.provider.configure_provider(cancel, value).await?;
        if !response.diagnostics.has_errors() {
            *configured = true;
        }
        Ok(response.diagnostics)
    }

    /// Tear down all instances at plan completion. Plugin processes are owned
    /// by the caller's transport; dropping the handles here releases the
    /// core's references.
    pub async fn close_all(&self) {
        self.instances.lock().await.clear();
        self.schemas.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockProvider;

    fn test_source() -> ProviderSource {
        ProviderSource::default_registry("core", "test")
    }

    fn registry_with_mock() -> (Arc<ProviderRegistry>, Arc<MockProvider>) {
        let mock = Arc::new(MockProvider::new());
        let mock_for_factory = mock.clone();
        let mut registry = ProviderRegistry::new();
        registry.register(test_source(), move || mock_for_factory.clone());
        (Arc::new(registry), mock)
    }

    #[tokio::test]
    async fn get_before_init_fails() {
        let (registry, _) = registry_with_mock();
        let pool = ProviderPool::new(registry);
        let config = ProviderConfigAddr::root(test_source());
        let result = pool.get(&config, &InstanceKey::NoKey).await;
        let err = match result {
            Err(e) => e,
            Ok(_) => panic!("expected get_before_init_fails to return an error"),
        };
        assert!(matches!(err, ProviderError::NotInitialized { .. }));
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let (registry, _) = registry_with_mock();
        let pool = ProviderPool::new(registry);
        let config = ProviderConfigAddr::root(test_source());
        pool.init(&config, &InstanceKey::NoKey).await.unwrap();
        pool.init(&config, &InstanceKey::NoKey).await.unwrap();
        assert!(pool.get(&config, &InstanceKey::NoKey).await.is_ok());
    }

    #[tokio::test]
    async fn configure_sends_once() {
        let (registry, mock) = registry_with_mock();
        let pool = ProviderPool::new(registry);
        let config = ProviderConfigAddr::root(test_source());
        let cancel = CancellationToken::new();

        pool.init(&config, &InstanceKey::NoKey).await.unwrap();
        pool.configure(&cancel, &config, &InstanceKey::NoKey, Value::Null)
            .await
            .unwrap();
        pool.configure(&cancel, &config, &InstanceKey::NoKey, Value::Null)
            .await
            .unwrap();

        assert_eq!(mock.calls_of("configure_provider"), 1);
    }

    #[tokio::test]
    async fn schema_is_memoized() {
        let (registry, mock) = registry_with_mock();
        let pool = ProviderPool::new(registry);
        let cancel = CancellationToken::new();

        let a = pool.schema(&cancel, &test_source()).await.unwrap();
        let b = pool.schema(&cancel, &test_source()).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(mock.calls_of("get_schema"), 1);
    }

    #[tokio::test]
    async fn unknown_source_is_reported() {
        let pool = ProviderPool::new(Arc::new(ProviderRegistry::new()));
        let config = ProviderConfigAddr::root(test_source());
        let err = pool.init(&config, &InstanceKey::NoKey).await.unwrap_err();
        assert!(matches!(err, ProviderError::NoFactory(_)));
    }
}
