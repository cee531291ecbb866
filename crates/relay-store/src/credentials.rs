use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use relay_core::ids::SessionId;

use crate::database::Database;
use crate::error::StoreError;

/// Diagnostic view of one stored credential row. The blob itself is opaque to
/// this layer; `status`/`updated_at` are never used for routing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub session_id: SessionId,
    pub status: String,
    pub updated_at: String,
}

/// Write capability seam used by the persistence coordinator; lets tests
/// inject failing sinks without a real database.
pub trait CredentialSink: Send + Sync + 'static {
    fn store(&self, session_id: &SessionId, blob: &[u8]) -> Result<(), StoreError>;
}

pub struct CredentialRepo {
    db: Database,
}

impl CredentialRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Load the credential blob for a session, or `None` if never paired.
    pub fn load(&self, session_id: &SessionId) -> Result<Option<Vec<u8>>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT blob FROM credentials WHERE session_id = ?1")?;
            let mut rows = stmt.query([session_id.as_str()])?;
            match rows.next()? {
                Some(row) => {
                    let encoded: String = row.get(0)?;
                    Ok(Some(BASE64.decode(encoded.as_bytes())?))
                }
                None => Ok(None),
            }
        })
    }

    /// Insert or replace the credential blob. Binary material is base64-tagged
    /// so the TEXT column stores it losslessly.
    pub fn upsert(&self, session_id: &SessionId, blob: &[u8]) -> Result<(), StoreError> {
        let encoded = BASE64.encode(blob);
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO credentials (session_id, blob, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(session_id) DO UPDATE SET blob = ?2, updated_at = ?3",
                rusqlite::params![session_id.as_str(), encoded, now],
            )?;
            Ok(())
        })
    }

    /// Update the diagnostic status marker without touching the blob.
    pub fn set_status(&self, session_id: &SessionId, status: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE credentials SET status = ?2, updated_at = ?3 WHERE session_id = ?1",
                rusqlite::params![session_id.as_str(), status, now],
            )?;
            Ok(())
        })
    }

    /// All persisted session ids, for restore-on-start listings.
    pub fn list(&self) -> Result<Vec<CredentialRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT session_id, status, updated_at FROM credentials ORDER BY session_id")?;
            let rows = stmt.query_map([], |row| {
                let id: String = row.get(0)?;
                Ok(CredentialRecord {
                    session_id: SessionId::from_raw(id),
                    status: row.get(1)?,
                    updated_at: row.get(2)?,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
        })
    }
}

impl Clone for CredentialRepo {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
        }
    }
}

impl CredentialSink for CredentialRepo {
    fn store(&self, session_id: &SessionId, blob: &[u8]) -> Result<(), StoreError> {
        self.upsert(session_id, blob)
    }
}
