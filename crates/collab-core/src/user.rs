//! User identity and permission registry.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Sentinel uid meaning "no such user".
pub const INVALID_UID: u32 = u32::MAX;

/// Identity and permission record for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub username: String,
    pub uid: u32,
    /// Categories of update this user may publish.
    #[serde(default)]
    pub publish: u64,
    /// Categories of update this user wants to receive.
    #[serde(default)]
    pub subscribe: u64,
}

impl UserInfo {
    #[must_use]
    pub fn new(username: impl Into<String>, uid: u32, publish: u64, subscribe: u64) -> Self {
        Self {
            username: username.into(),
            uid,
            publish,
            subscribe,
        }
    }

    /// The record returned for unknown uids.
    #[must_use]
    pub fn invalid() -> Self {
        Self::new("invalid", INVALID_UID, 0, 0)
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.uid != INVALID_UID
    }
}

impl Default for UserInfo {
    fn default() -> Self {
        Self::invalid()
    }
}

/// Maps uids to [`UserInfo`] records.
#[derive(Debug, Default)]
pub struct UserRegistry {
    users: DashMap<u32, UserInfo>,
}

impl UserRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a user.
    ///
    /// Returns `false` if the record carries [`INVALID_UID`] and was refused.
    pub fn register(&self, info: UserInfo) -> bool {
        if !info.is_valid() {
            warn!(username = %info.username, "Refusing to register user with invalid uid");
            return false;
        }
        debug!(uid = info.uid, username = %info.username, "Registered user");
        self.users.insert(info.uid, info);
        true
    }

    /// Look up a user. Unknown uids yield [`UserInfo::invalid`].
    #[must_use]
    pub fn get(&self, uid: u32) -> UserInfo {
        self.users
            .get(&uid)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(UserInfo::invalid)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.users.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}
