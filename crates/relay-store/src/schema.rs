pub const SCHEMA_VERSION: u32 = 1;

pub const PRAGMAS: &str = "
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
";

/// One row per session id. `blob` is the base64-encoded opaque credential
/// material; `status` and `updated_at` are diagnostics only and never drive
/// routing.
pub const CREATE_TABLES: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS credentials (
    session_id TEXT PRIMARY KEY,
    blob TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'initializing',
    updated_at TEXT NOT NULL
);
";
