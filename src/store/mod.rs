//! Account store
//!
//! Authoritative record of credentials, quotas, expiry, and activity state,
//! backed by an embedded sqlite database. Traffic updates go through an
//! additive SQL expression so concurrent sessions merge instead of
//! overwriting each other.

mod account;
mod queries;

pub use account::Account;

pub(crate) use account::now_unix;

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, info};

use crate::error::AuthError;

/// sqlite-backed account store
#[derive(Debug, Clone)]
pub struct AccountStore {
    pool: SqlitePool,
}

impl AccountStore {
    /// Open the database, creating the file and schema if missing.
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);

        // Each pooled connection to ":memory:" would get its own database;
        // clamp to a single connection there.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        sqlx::query(queries::SCHEMA).execute(&pool).await?;

        info!(url, "account database ready");
        Ok(Self { pool })
    }

    fn parse_row(row: SqliteRow) -> Result<Account, sqlx::Error> {
        Ok(Account {
            id: row.try_get("id")?,
            username: row.try_get("username")?,
            password: row.try_get("password")?,
            traffic_limit: row.try_get("traffic_limit")?,
            traffic_used: row.try_get("traffic_used")?,
            expires_at: row.try_get("expires_at")?,
            enabled: row.try_get::<i64, _>("enabled")? != 0,
            last_connection: row.try_get("last_connection")?,
        })
    }

    /// Look up a live account by username.
    pub async fn find_by_username(&self, username: &str) -> Result<Option<Account>, sqlx::Error> {
        let row = sqlx::query(queries::FIND_BY_USERNAME)
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::parse_row).transpose()
    }

    /// Look up a live account by id.
    pub async fn find_by_id(&self, id: i64) -> Result<Option<Account>, sqlx::Error> {
        let row = sqlx::query(queries::FIND_BY_ID)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::parse_row).transpose()
    }

    /// Verify credentials and activity; stamp `last_connection` on success.
    ///
    /// All failure causes surface as the same [`AuthError::Rejected`]; the
    /// specific reason is only logged.
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<Account, AuthError> {
        let found = self
            .find_by_username(username)
            .await
            .map_err(AuthError::Backend)?;

        let Some(mut account) = found else {
            debug!(username, "authentication failed: unknown username");
            return Err(AuthError::Rejected);
        };

        if account.password.as_bytes() != password.as_bytes() {
            debug!(username, "authentication failed: invalid password");
            return Err(AuthError::Rejected);
        }

        if !account.is_active() {
            debug!(username, "authentication failed: account not active");
            return Err(AuthError::Rejected);
        }

        let now = now_unix();
        sqlx::query(queries::TOUCH_LAST_CONNECTION)
            .bind(now)
            .bind(now)
            .bind(account.id)
            .execute(&self.pool)
            .await
            .map_err(AuthError::Backend)?;
        account.last_connection = now;

        Ok(account)
    }

    /// Merge transferred bytes into the stored `traffic_used`.
    pub async fn add_usage(&self, id: i64, delta: i64) -> Result<(), sqlx::Error> {
        if delta <= 0 {
            return Ok(());
        }
        sqlx::query(queries::ADD_USAGE)
            .bind(delta)
            .bind(now_unix())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Recompute the activity predicate against the current clock.
    pub async fn is_active(&self, id: i64) -> Result<bool, sqlx::Error> {
        Ok(self
            .find_by_id(id)
            .await?
            .map(|account| account.is_active())
            .unwrap_or(false))
    }

    /// Create a new account.
    pub async fn insert(
        &self,
        username: &str,
        password: &str,
        traffic_limit: i64,
        expires_at: i64,
        enabled: bool,
    ) -> Result<Account, sqlx::Error> {
        let now = now_unix();
        let result = sqlx::query(queries::INSERT)
            .bind(username)
            .bind(password)
            .bind(traffic_limit)
            .bind(0i64)
            .bind(expires_at)
            .bind(enabled as i64)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;

        let id = result.last_insert_rowid();
        self.find_by_id(id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    /// Change an account password.
    pub async fn update_password(&self, id: i64, password: &str) -> Result<(), sqlx::Error> {
        sqlx::query(queries::UPDATE_PASSWORD)
            .bind(password)
            .bind(now_unix())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Enable or disable an account.
    pub async fn set_enabled(&self, id: i64, enabled: bool) -> Result<(), sqlx::Error> {
        sqlx::query(queries::SET_ENABLED)
            .bind(enabled as i64)
            .bind(now_unix())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Change an account traffic limit; 0 means unlimited.
    pub async fn set_traffic_limit(&self, id: i64, traffic_limit: i64) -> Result<(), sqlx::Error> {
        sqlx::query(queries::SET_TRAFFIC_LIMIT)
            .bind(traffic_limit)
            .bind(now_unix())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Admin reset of consumed traffic, the only sanctioned decrease.
    pub async fn reset_traffic(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query(queries::RESET_TRAFFIC)
            .bind(now_unix())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Soft-delete an account; it no longer resolves for lookups or auth.
    pub async fn delete(&self, id: i64) -> Result<(), sqlx::Error> {
        let now = now_unix();
        sqlx::query(queries::DELETE)
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuthError;

    async fn memory_store() -> AccountStore {
        AccountStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let store = memory_store().await;
        let account = store.insert("alice", "secret", 0, 0, true).await.unwrap();
        assert_eq!(account.username, "alice");
        assert_eq!(account.traffic_used, 0);
        assert_eq!(account.last_connection, 0);

        let found = store.find_by_username("alice").await.unwrap().unwrap();
        assert_eq!(found, account);

        assert!(store.find_by_username("bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_authenticate_success_stamps_last_connection() {
        let store = memory_store().await;
        store.insert("alice", "secret", 0, 0, true).await.unwrap();

        let account = store.authenticate("alice", "secret").await.unwrap();
        assert!(account.last_connection > 0);

        let stored = store.find_by_username("alice").await.unwrap().unwrap();
        assert_eq!(stored.last_connection, account.last_connection);
    }

    #[tokio::test]
    async fn test_authenticate_failures_are_uniform() {
        let store = memory_store().await;
        store.insert("alice", "secret", 0, 0, true).await.unwrap();
        store.insert("carol", "pw", 0, 0, false).await.unwrap();
        let expired = store
            .insert("dave", "pw", 0, now_unix() - 10, true)
            .await
            .unwrap();
        assert!(!expired.is_active());

        // Unknown user, wrong password, disabled, and expired all produce
        // the identical rejection.
        for (user, pass) in [
            ("nobody", "secret"),
            ("alice", "wrong"),
            ("carol", "pw"),
            ("dave", "pw"),
        ] {
            let err = store.authenticate(user, pass).await.unwrap_err();
            assert!(matches!(err, AuthError::Rejected), "{user} should be rejected");
            assert_eq!(format!("{}", err), "invalid username or password");
        }
    }

    #[tokio::test]
    async fn test_authenticate_rejects_exhausted_quota() {
        let store = memory_store().await;
        let account = store.insert("bob", "pw", 1024, 0, true).await.unwrap();
        store.add_usage(account.id, 1024).await.unwrap();

        let err = store.authenticate("bob", "pw").await.unwrap_err();
        assert!(matches!(err, AuthError::Rejected));
    }

    #[tokio::test]
    async fn test_add_usage_is_additive() {
        let store = memory_store().await;
        let account = store.insert("alice", "secret", 0, 0, true).await.unwrap();

        store.add_usage(account.id, 100).await.unwrap();
        store.add_usage(account.id, 50).await.unwrap();
        store.add_usage(account.id, 0).await.unwrap();
        store.add_usage(account.id, -7).await.unwrap();

        let stored = store.find_by_id(account.id).await.unwrap().unwrap();
        assert_eq!(stored.traffic_used, 150);
    }

    #[tokio::test]
    async fn test_is_active_tracks_quota() {
        let store = memory_store().await;
        let account = store.insert("bob", "pw", 1024, 0, true).await.unwrap();
        assert!(store.is_active(account.id).await.unwrap());

        store.add_usage(account.id, 2048).await.unwrap();
        assert!(!store.is_active(account.id).await.unwrap());

        assert!(!store.is_active(9999).await.unwrap());
    }

    #[tokio::test]
    async fn test_admin_updates() {
        let store = memory_store().await;
        let account = store.insert("alice", "secret", 0, 0, true).await.unwrap();

        store.update_password(account.id, "rotated").await.unwrap();
        assert!(store.authenticate("alice", "secret").await.is_err());
        assert!(store.authenticate("alice", "rotated").await.is_ok());

        store.set_enabled(account.id, false).await.unwrap();
        assert!(!store.is_active(account.id).await.unwrap());
        store.set_enabled(account.id, true).await.unwrap();

        store.set_traffic_limit(account.id, 10).await.unwrap();
        store.add_usage(account.id, 20).await.unwrap();
        assert!(!store.is_active(account.id).await.unwrap());

        store.reset_traffic(account.id).await.unwrap();
        assert!(store.is_active(account.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_is_soft() {
        let store = memory_store().await;
        let account = store.insert("alice", "secret", 0, 0, true).await.unwrap();

        store.delete(account.id).await.unwrap();
        assert!(store.find_by_username("alice").await.unwrap().is_none());
        assert!(store.find_by_id(account.id).await.unwrap().is_none());
        assert!(store.authenticate("alice", "secret").await.is_err());

        // The username can be observed as gone, but the row still exists for
        // bookkeeping; re-inserting the same username violates uniqueness.
        assert!(store.insert("alice", "other", 0, 0, true).await.is_err());
    }
}
