pub mod backoff;
pub mod machine;
pub mod persist;
pub mod worker;

pub use backoff::ReconnectPolicy;
pub use machine::{MachineConfig, SessionShared};
pub use persist::{PersistConfig, PersistenceCoordinator};
pub use worker::{spawn, WorkerConfig, WorkerHandle};
