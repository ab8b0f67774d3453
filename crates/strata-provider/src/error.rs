use thiserror::Error;

use strata_domain::ProviderSource;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("no provider factory registered for source: {0}")]
    NoFactory(ProviderSource),

    #[error("provider instance not initialized: {addr}")]
    NotInitialized { addr: String },

    #[error(
        "provider instance key {key} is not declared by {provider}; restore the key in the \
         provider block's for_each, or remove the resources that refer to it"
    )]
    UnknownInstanceKey { provider: String, key: String },

    #[error(
        "resource {resource} tracks provider instance key {key} from a previous run; the \
         resource must be destroyed or forgotten before using for_each on its provider block"
    )]
    StaleInstanceKey { resource: String, key: String },

    #[error("schema for {provider_source} does not define type {type_name}")]
    UnknownType { provider_source: ProviderSource, type_name: String },

    #[error("provider call cancelled")]
    Cancelled,

    #[error("provider transport error: {0}")]
    Transport(String),
}
