pub mod addrs;
pub mod checks;
pub mod diag;
pub mod value;

pub use addrs::{
    AbsResource, ConfigResource, DeposedKey, InstanceKey, Module, ModuleInstance,
    ModuleInstanceStep, ProviderConfigAddr, ProviderInstanceAddr, ProviderSource, Resource,
    ResourceInstance, ResourceMode, TargetAddr,
};
pub use checks::{CheckStatus, CheckableAddr, CheckRuleAddr, CheckRuleKind};
pub use diag::{Diagnostic, Diagnostics, Severity, SourceRange};
pub use value::{AttrPath, Mark, MarkedValue, Marks, PathStep, Value};
