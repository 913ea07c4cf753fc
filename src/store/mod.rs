//! Record store
//!
//! The bastion core reads users, hosts, groups and ACLs through [`RecordStore`] and
//! writes back only a handful of single-row updates: invite redemption, host-key
//! pinning and session lifecycle. [`RedbRecordStore`] is the on-disk implementation.

pub mod database;
pub mod models;

use async_trait::async_trait;
use thiserror::Error;

pub use database::RedbRecordStore;
pub use models::{
    Acl, Group, GroupAcls, Host, HostGroup, LoggingMode, NewUserKey, SessionRecord,
    SessionStatus, SshKey, User, UserGroup, UserKey,
};

// ═══════════════════════════════════════════════════════════════════════════
// Error Types
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Error)]
#[allow(clippy::result_large_err)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("{0} not found")]
    NotFound(String),
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Store Interface
// ═══════════════════════════════════════════════════════════════════════════

/// Record lookups and the few mutations the bastion performs
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn user_by_id(&self, id: u64) -> Result<Option<User>, StoreError>;

    /// Find the user-key whose canonical authorized-key encoding matches exactly
    async fn user_key_by_authorized_key(
        &self,
        authorized_key: &str,
    ) -> Result<Option<UserKey>, StoreError>;

    /// Consume an invite token: link `key` to the user carrying the token and clear it.
    ///
    /// Returns `None` when no user carries a valid token. Runs in a single transaction.
    async fn redeem_invite(&self, token: &str, key: NewUserKey)
        -> Result<Option<User>, StoreError>;

    async fn host_by_name(&self, name: &str) -> Result<Option<Host>, StoreError>;

    async fn host_by_id(&self, id: u64) -> Result<Option<Host>, StoreError>;

    async fn ssh_key_by_id(&self, id: u64) -> Result<Option<SshKey>, StoreError>;

    async fn ssh_key_by_name(&self, name: &str) -> Result<Option<SshKey>, StoreError>;

    /// The user's groups, each with its ACLs loaded
    async fn user_group_acls(&self, user: &User) -> Result<Vec<GroupAcls>, StoreError>;

    /// The host's groups, each with its ACLs loaded
    async fn host_group_acls(&self, host: &Host) -> Result<Vec<GroupAcls>, StoreError>;

    /// Persist the first host key seen for a host
    async fn pin_host_key(&self, host_id: u64, key: &[u8]) -> Result<(), StoreError>;

    async fn create_session(&self, user_id: u64, host_id: u64)
        -> Result<SessionRecord, StoreError>;

    /// Mark a session closed; an empty `error` means a clean shutdown
    async fn close_session(&self, id: u64, error: &str) -> Result<(), StoreError>;

    /// Close every session still marked active, returning how many were closed
    async fn close_active_sessions(&self, reason: &str) -> Result<usize, StoreError>;
}
