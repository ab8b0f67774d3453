pub mod error;
pub mod graph;
pub mod walker;

pub use error::GraphError;
pub use graph::DepGraph;
pub use petgraph::graph::NodeIndex;
pub use walker::{walk, WalkReport};
