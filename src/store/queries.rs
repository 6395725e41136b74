//! SQL statements for the account store.

/// Accounts table, created at startup if missing.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    username        TEXT NOT NULL UNIQUE,
    password        TEXT NOT NULL,
    traffic_limit   INTEGER NOT NULL DEFAULT 0,
    traffic_used    INTEGER NOT NULL DEFAULT 0,
    expires_at      INTEGER NOT NULL DEFAULT 0,
    enabled         INTEGER NOT NULL DEFAULT 1,
    last_connection INTEGER NOT NULL DEFAULT 0,
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL,
    deleted_at      INTEGER
)
"#;

/// Look up a live account by username.
pub const FIND_BY_USERNAME: &str = r#"
SELECT id, username, password, traffic_limit, traffic_used, expires_at, enabled, last_connection
FROM accounts
WHERE username = ? AND deleted_at IS NULL
"#;

/// Look up a live account by id.
pub const FIND_BY_ID: &str = r#"
SELECT id, username, password, traffic_limit, traffic_used, expires_at, enabled, last_connection
FROM accounts
WHERE id = ? AND deleted_at IS NULL
"#;

/// Create an account.
pub const INSERT: &str = r#"
INSERT INTO accounts (username, password, traffic_limit, traffic_used, expires_at, enabled, last_connection, created_at, updated_at)
VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?)
"#;

/// Add transferred bytes; additive so concurrent flushes never clobber
/// each other.
pub const ADD_USAGE: &str = r#"
UPDATE accounts SET traffic_used = traffic_used + ?, updated_at = ? WHERE id = ?
"#;

/// Stamp a successful authentication.
pub const TOUCH_LAST_CONNECTION: &str = r#"
UPDATE accounts SET last_connection = ?, updated_at = ? WHERE id = ?
"#;

/// Change an account password.
pub const UPDATE_PASSWORD: &str = r#"
UPDATE accounts SET password = ?, updated_at = ? WHERE id = ?
"#;

/// Enable or disable an account.
pub const SET_ENABLED: &str = r#"
UPDATE accounts SET enabled = ?, updated_at = ? WHERE id = ?
"#;

/// Change an account traffic limit.
pub const SET_TRAFFIC_LIMIT: &str = r#"
UPDATE accounts SET traffic_limit = ?, updated_at = ? WHERE id = ?
"#;

/// Admin reset of consumed traffic.
pub const RESET_TRAFFIC: &str = r#"
UPDATE accounts SET traffic_used = 0, updated_at = ? WHERE id = ?
"#;

/// Soft delete.
pub const DELETE: &str = r#"
UPDATE accounts SET deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL
"#;
