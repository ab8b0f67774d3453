use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use strata_domain::{AttrPath, Diagnostics, Value};

use crate::error::ProviderError;
use crate::schema::ProviderSchema;

// ── Responses ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct ValidateProviderConfigResponse {
    /// Providers may return a normalized copy of the config. The core logs a
    /// warning and discards it when it differs from the input.
    pub prepared_config: Option<Value>,
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigureProviderResponse {
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Clone, Default)]
pub struct UpgradeResourceStateResponse {
    pub upgraded: Value,
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Clone, Default)]
pub struct ReadResourceResponse {
    /// Null means the remote object is gone.
    pub new_state: Value,
    pub private: Vec<u8>,
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Clone)]
pub struct PlanResourceChangeRequest {
    pub type_name: String,
    pub prior: Value,
    pub proposed: Value,
    pub config: Value,
    pub prior_private: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct PlanResourceChangeResponse {
    /// May be wholly or partially unknown.
    pub planned: Value,
    pub requires_replace: Vec<AttrPath>,
    pub planned_private: Vec<u8>,
    /// Set by providers built against the legacy type system; relaxes some
    /// plan/apply consistency checks downstream.
    pub legacy_type_system: bool,
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Clone, Default)]
pub struct ReadDataSourceResponse {
    pub state: Value,
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Clone)]
pub struct ImportedObject {
    pub type_name: String,
    pub state: Value,
    pub private: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct ImportResourceStateResponse {
    pub imported: Vec<ImportedObject>,
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Clone)]
pub struct MoveResourceStateRequest {
    pub source_type: String,
    pub source_schema_version: u64,
    pub source_raw: serde_json::Value,
    pub target_type: String,
}

#[derive(Debug, Clone, Default)]
pub struct MoveResourceStateResponse {
    pub target_state: Value,
    pub diagnostics: Diagnostics,
}

// ── The RPC surface ───────────────────────────────────────────────────────────

/// The conversation the core holds with one provider plugin instance. The
/// transport is external; implementations translate token cancellation into
/// their transport's abort mechanism.
///
/// Values crossing this boundary are always unmarked: the core strips marks
/// before every call and re-applies them to results.
#[async_trait]
pub trait Provider: Send + Sync + 'static {
    async fn get_schema(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ProviderSchema, ProviderError>;

    async fn validate_provider_config(
        &self,
        cancel: &CancellationToken,
        config: Value,
    ) -> Result<ValidateProviderConfigResponse, ProviderError>;

    /// Called at most once per provider instance; the pool enforces this.
    async fn configure_provider(
        &self,
        cancel: &CancellationToken,
        config: Value,
    ) -> Result<ConfigureProviderResponse, ProviderError>;

    async fn upgrade_resource_state(
        &self,
        cancel: &CancellationToken,
        type_name: &str,
        schema_version: u64,
        raw: serde_json::Value,
    ) -> Result<UpgradeResourceStateResponse, ProviderError>;

    async fn read_resource(
        &self,
        cancel: &CancellationToken,
        type_name: &str,
        prior: Value,
        private: Vec<u8>,
    ) -> Result<ReadResourceResponse, ProviderError>;

    async fn plan_resource_change(
        &self,
        cancel: &CancellationToken,
        req: PlanResourceChangeRequest,
    ) -> Result<PlanResourceChangeResponse, ProviderError>;

    async fn read_data_source(
        &self,
        cancel: &CancellationToken,
        type_name: &str,
        config: Value,
    ) -> Result<ReadDataSourceResponse, ProviderError>;

    async fn import_resource_state(
        &self,
        cancel: &CancellationToken,
        type_name: &str,
        id: &str,
    ) -> Result<ImportResourceStateResponse, ProviderError>;

    async fn move_resource_state(
        &self,
        cancel: &CancellationToken,
        req: MoveResourceStateRequest,
    ) -> Result<MoveResourceStateResponse, ProviderError>;
}
