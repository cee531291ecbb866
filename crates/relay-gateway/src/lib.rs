pub mod config;
pub mod correlator;
pub mod directory;
pub mod server;
pub mod supervisor;
pub mod webhook;

pub use config::GatewayConfig;
pub use correlator::Correlator;
pub use directory::OwnershipDirectory;
pub use server::GatewayServer;
pub use supervisor::{Supervisor, SupervisorConfig};
pub use webhook::Notifier;
