//! An in-process provider used by tests: no transport, programmable
//! responses, and a call log for asserting RPC discipline.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use strata_domain::{AttrPath, Value};

use crate::error::ProviderError;
use crate::provider::*;
use crate::schema::{AttributeFlags, AttributeType, Block, ProviderSchema, ResourceSchema};

#[derive(Default)]
struct Behavior {
    /// type → upgraded attrs (default: decode the raw JSON unchanged).
    upgrade_results: HashMap<String, serde_json::Value>,
    /// type → refreshed attrs; a programmed `None` means "gone".
    read_results: HashMap<String, Option<serde_json::Value>>,
    /// type → planned value override (default: echo the proposed value).
    plan_results: HashMap<String, Value>,
    /// type → paths forcing replacement.
    requires_replace: HashMap<String, Vec<AttrPath>>,
    /// data source type → result attrs (default: echo the config).
    data_results: HashMap<String, serde_json::Value>,
    /// import id → imported attrs (default: empty object).
    import_results: HashMap<String, serde_json::Value>,
    /// target type → translated attrs (default: pass the source through).
    move_results: HashMap<String, serde_json::Value>,
    configure_error: Option<String>,
}

/// A provider whose every response is programmable per resource type (or per
/// import id). Unprogrammed calls echo their input, which makes a fully
/// converged no-op plan the default behavior.
pub struct MockProvider {
    schema: Mutex<ProviderSchema>,
    behavior: Mutex<Behavior>,
    calls: Mutex<Vec<(String, String)>>,
}

impl MockProvider {
    pub fn new() -> Self {
        MockProvider {
            schema: Mutex::new(Self::default_schema()),
            behavior: Mutex::new(Behavior::default()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// The fixture schema most tests use: two managed types and one data
    /// source, all with a computed id.
    pub fn default_schema() -> ProviderSchema {
        let test_object = Block::new()
            .attr("id", AttributeType::String, AttributeFlags::optional_computed())
            .attr("test_string", AttributeType::String, AttributeFlags::optional())
            .attr("arg", AttributeType::String, AttributeFlags::optional())
            .attr("valid", AttributeType::Bool, AttributeFlags::optional())
            .attr(
                "secret",
                AttributeType::String,
                AttributeFlags::optional().sensitive(),
            );
        let test_resource = Block::new()
            .attr("id", AttributeType::String, AttributeFlags::optional_computed())
            .attr("valid", AttributeType::Bool, AttributeFlags::optional());
        let test_data_source = Block::new()
            .attr("id", AttributeType::String, AttributeFlags::optional())
            .attr("valid", AttributeType::Bool, AttributeFlags::optional())
            .attr("output", AttributeType::String, AttributeFlags::computed());

        let mut schema = ProviderSchema {
            provider: Block::new().attr(
                "endpoint",
                AttributeType::String,
                AttributeFlags::optional(),
            ),
            ..ProviderSchema::default()
        };
        schema
            .resources
            .insert("test_object".into(), ResourceSchema::new(test_object, 0));
        schema
            .resources
            .insert("test_resource".into(), ResourceSchema::new(test_resource, 0));
        schema
            .data_sources
            .insert("test_data_source".into(), test_data_source);
        schema
    }

    // ── Programming ───────────────────────────────────────────────────────────

    pub fn set_schema(&self, schema: ProviderSchema) {
        *self.schema.lock().unwrap() = schema;
    }

    /// Bump the declared schema version of one resource type, to provoke the
    /// upgrade path.
    pub fn set_resource_version(&self, type_name: &str, version: u64) {
        if let Some(rs) = self.schema.lock().unwrap().resources.get_mut(type_name) {
            rs.version = version;
        }
    }

    pub fn set_upgrade_result(&self, type_name: &str, attrs: serde_json::Value) {
        self.behavior
            .lock()
            .unwrap()
            .upgrade_results
            .insert(type_name.to_string(), attrs);
    }

    pub fn set_read_result(&self, type_name: &str, attrs: Option<serde_json::Value>) {
        self.behavior
            .lock()
            .unwrap()
            .read_results
            .insert(type_name.to_string(), attrs);
    }

    pub fn set_plan_result(&self, type_name: &str, planned: Value) {
        self.behavior
            .lock()
            .unwrap()
            .plan_results
            .insert(type_name.to_string(), planned);
    }

    pub fn set_requires_replace(&self, type_name: &str, paths: Vec<AttrPath>) {
        self.behavior
            .lock()
            .unwrap()
            .requires_replace
            .insert(type_name.to_string(), paths);
    }

    pub fn set_data_result(&self, type_name: &str, attrs: serde_json::Value) {
        self.behavior
            .lock()
            .unwrap()
            .data_results
            .insert(type_name.to_string(), attrs);
    }

    pub fn set_import_result(&self, id: &str, attrs: serde_json::Value) {
        self.behavior
            .lock()
            .unwrap()
            .import_results
            .insert(id.to_string(), attrs);
    }

    pub fn set_move_result(&self, target_type: &str, attrs: serde_json::Value) {
        self.behavior
            .lock()
            .unwrap()
            .move_results
            .insert(target_type.to_string(), attrs);
    }

    pub fn fail_configure(&self, message: impl Into<String>) {
        self.behavior.lock().unwrap().configure_error = Some(message.into());
    }

    // ── Call log ──────────────────────────────────────────────────────────────

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_of(&self, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .count()
    }

    fn record(&self, method: &str, subject: impl Into<String>) {
        self.calls
            .lock()
            .unwrap()
            .push((method.to_string(), subject.into()));
    }

    fn check_cancel(&self, cancel: &CancellationToken) -> Result<(), ProviderError> {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        Ok(())
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        MockProvider::new()
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn get_schema(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ProviderSchema, ProviderError> {
        self.check_cancel(cancel)?;
        self.record("get_schema", "");
        Ok(self.schema.lock().unwrap().clone())
    }

    async fn validate_provider_config(
        &self,
        cancel: &CancellationToken,
        _config: Value,
    ) -> Result<ValidateProviderConfigResponse, ProviderError> {
        self.check_cancel(cancel)?;
        self.record("validate_provider_config", "");
        Ok(ValidateProviderConfigResponse::default())
    }

    async fn configure_provider(
        &self,
        cancel: &CancellationToken,
        _config: Value,
    ) -> Result<ConfigureProviderResponse, ProviderError> {
        self.check_cancel(cancel)?;
        self.record("configure_provider", "");
        let mut response = ConfigureProviderResponse::default();
        if let Some(message) = &self.behavior.lock().unwrap().configure_error {
            response
                .diagnostics
                .error("Provider configuration failed", message.clone());
        }
        Ok(response)
    }

    async fn upgrade_resource_state(
        &self,
        cancel: &CancellationToken,
        type_name: &str,
        _schema_version: u64,
        raw: serde_json::Value,
    ) -> Result<UpgradeResourceStateResponse, ProviderError> {
        self.check_cancel(cancel)?;
        self.record("upgrade_resource_state", type_name);
        let upgraded = match self.behavior.lock().unwrap().upgrade_results.get(type_name) {
            Some(attrs) => Value::from_json(attrs.clone()),
            None => Value::from_json(raw),
        };
        Ok(UpgradeResourceStateResponse { upgraded, diagnostics: Default::default() })
    }

    async fn read_resource(
        &self,
        cancel: &CancellationToken,
        type_name: &str,
        prior: Value,
        private: Vec<u8>,
    ) -> Result<ReadResourceResponse, ProviderError> {
        self.check_cancel(cancel)?;
        self.record("read_resource", type_name);
        let new_state = match self.behavior.lock().unwrap().read_results.get(type_name) {
            Some(Some(attrs)) => Value::from_json(attrs.clone()),
            Some(None) => Value::Null,
            None => prior,
        };
        Ok(ReadResourceResponse { new_state, private, diagnostics: Default::default() })
    }

    async fn plan_resource_change(
        &self,
        cancel: &CancellationToken,
        req: PlanResourceChangeRequest,
    ) -> Result<PlanResourceChangeResponse, ProviderError> {
        self.check_cancel(cancel)?;
        self.record("plan_resource_change", &req.type_name);
        debug!(type_name = %req.type_name, "MockProvider: plan_resource_change");
        let behavior = self.behavior.lock().unwrap();
        let planned = match behavior.plan_results.get(&req.type_name) {
            Some(planned) => planned.clone(),
            None => req.proposed.clone(),
        };
        let requires_replace = behavior
            .requires_replace
            .get(&req.type_name)
            .cloned()
            .unwrap_or_default();
        Ok(PlanResourceChangeResponse {
            planned,
            requires_replace,
            planned_private: req.prior_private,
            legacy_type_system: false,
            diagnostics: Default::default(),
        })
    }

    async fn read_data_source(
        &self,
        cancel: &CancellationToken,
        type_name: &str,
        config: Value,
    ) -> Result<ReadDataSourceResponse, ProviderError> {
        self.check_cancel(cancel)?;
        self.record("read_data_source", type_name);
        let state = match self.behavior.lock().unwrap().data_results.get(type_name) {
            Some(attrs) => Value::from_json(attrs.clone()),
            None => config,
        };
        Ok(ReadDataSourceResponse { state, diagnostics: Default::default() })
    }

    async fn import_resource_state(
        &self,
        cancel: &CancellationToken,
        type_name: &str,
        id: &str,
    ) -> Result<ImportResourceStateResponse, ProviderError> {
        self.check_cancel(cancel)?;
        self.record("import_resource_state", format!("{}:{}", type_name, id));
        let state = match self.behavior.lock().unwrap().import_results.get(id) {
            Some(attrs) => Value::from_json(attrs.clone()),
            None => Value::Map(Default::default()),
        };
        Ok(ImportResourceStateResponse {
            imported: vec![ImportedObject {
                type_name: type_name.to_string(),
                state,
                private: Vec::new(),
            }],
            diagnostics: Default::default(),
        })
    }

    async fn move_resource_state(
        &self,
        cancel: &CancellationToken,
        req: MoveResourceStateRequest,
    ) -> Result<MoveResourceStateResponse, ProviderError> {
        self.check_cancel(cancel)?;
        self.record("move_resource_state", &req.target_type);
        let target_state = match self.behavior.lock().unwrap().move_results.get(&req.target_type) {
            Some(attrs) => Value::from_json(attrs.clone()),
            None => Value::from_json(req.source_raw),
        };
        Ok(MoveResourceStateResponse { target_state, diagnostics: Default::default() })
    }
}
