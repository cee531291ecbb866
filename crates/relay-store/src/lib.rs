pub mod credentials;
pub mod database;
pub mod error;
pub mod schema;

pub use credentials::{CredentialRecord, CredentialRepo, CredentialSink};
pub use database::Database;
pub use error::StoreError;
