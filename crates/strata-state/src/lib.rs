pub mod hash;
pub mod state;
pub mod sync;

pub use hash::canonical_hash;
pub use state::{
    InstanceState, ModuleState, ObjectState, ObjectStatus, OutputValue, ResourceState, State,
};
pub use sync::SyncState;
