pub mod errors;
pub mod events;
pub mod ids;
pub mod ipc;
pub mod mock;
pub mod protocol;
pub mod session;

pub use errors::ActionError;
pub use ids::{CorrelationId, SessionId};
pub use session::{SessionSnapshot, SessionStatus};
