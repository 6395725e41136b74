//! Account records
//!
//! An account is the stable identity of a tunnel user. Activity is a derived
//! predicate over the enabled flag, the expiry instant, and the quota.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix timestamp in seconds.
pub(crate) fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// A tunnel user account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    /// Row id
    pub id: i64,
    /// Unique, case-sensitive username
    pub username: String,
    /// Password, compared byte-exact
    pub password: String,
    /// Traffic limit in bytes, 0 means unlimited
    pub traffic_limit: i64,
    /// Traffic consumed in bytes, monotonically increasing
    pub traffic_used: i64,
    /// Expiry as unix seconds, 0 means never
    pub expires_at: i64,
    /// Whether the account may connect at all
    pub enabled: bool,
    /// Last successful authentication as unix seconds, 0 means never
    pub last_connection: i64,
}

impl Account {
    /// Check if the account's access has expired
    pub fn is_expired(&self) -> bool {
        self.expires_at > 0 && now_unix() >= self.expires_at
    }

    /// Check if the account has traffic quota remaining
    pub fn has_traffic_remaining(&self) -> bool {
        self.traffic_limit == 0 || self.traffic_used < self.traffic_limit
    }

    /// Check if the account can connect
    pub fn is_active(&self) -> bool {
        self.enabled && !self.is_expired() && self.has_traffic_remaining()
    }

    /// Remaining traffic in bytes; `None` means unlimited
    pub fn remaining_traffic(&self) -> Option<i64> {
        if self.traffic_limit == 0 {
            return None;
        }
        Some((self.traffic_limit - self.traffic_used).max(0))
    }
}
