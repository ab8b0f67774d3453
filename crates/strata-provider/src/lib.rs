pub mod error;
pub mod mock;
pub mod pool;
pub mod provider;
pub mod schema;

pub use error::ProviderError;
pub use mock::MockProvider;
pub use pool::{ProviderPool, ProviderRegistry};
pub use provider::{
    ConfigureProviderResponse, ImportedObject, ImportResourceStateResponse,
    MoveResourceStateRequest, MoveResourceStateResponse, PlanResourceChangeRequest,
    PlanResourceChangeResponse, Provider, ReadDataSourceResponse, ReadResourceResponse,
    UpgradeResourceStateResponse, ValidateProviderConfigResponse,
};
pub use schema::{
    Attribute, AttributeFlags, AttributeType, Block, ProviderSchema, ResourceSchema,
};
