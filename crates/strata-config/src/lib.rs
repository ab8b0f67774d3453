pub mod config;
pub mod expr;

pub use config::{
    CheckConfig, CheckRuleConfig, Config, ImportBlock, Lifecycle, ModuleCall, ModuleConfig,
    MoveEndpoint, MovedBlock, OutputConfig, ProviderConfigBlock, ProviderRef, RemoveEndpoint,
    RemovedBlock, ResourceConfig, VariableConfig,
};
pub use expr::{Expr, Reference};
