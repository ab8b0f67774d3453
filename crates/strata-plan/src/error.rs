use thiserror::Error;

/// Failures that prevent planning from starting at all. Everything that
/// happens after the walk begins is reported through diagnostics on the
/// returned plan instead, so partial results survive.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("invalid plan options: {0}")]
    InvalidOptions(String),

    #[error(transparent)]
    Graph(#[from] strata_graph::GraphError),

    #[error("provider error: {0}")]
    Provider(#[from] strata_provider::ProviderError),
}
