use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("cycle detected in dependency graph: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("self-dependency on node: {0}")]
    SelfLoop(String),
}
