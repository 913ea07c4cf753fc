//! Access control
//!
//! An ACL applies to a (user, host) pair only when it is attached to one of the
//! user's groups *and* one of the host's groups. Among the shared ACLs the lowest
//! weight wins; equal weights are broken by the lowest ACL id. No shared ACL means deny.
//!
//! `host_pattern`, `inception` and `expiration` are carried on [`Acl`] but are not
//! consulted here.

pub mod hook;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use tracing::debug;

use crate::store::{Acl, GroupAcls, Host, RecordStore, StoreError, User};

pub use hook::consult_hook;

#[derive(Debug, Error)]
pub enum AclError {
    #[error("invalid ACL action: {0:?}")]
    InvalidAction(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclAction {
    Allow,
    Deny,
}

impl AclAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AclAction::Allow => "allow",
            AclAction::Deny => "deny",
        }
    }
}

impl fmt::Display for AclAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AclAction {
    type Err = AclError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(AclAction::Allow),
            "deny" => Ok(AclAction::Deny),
            other => Err(AclError::InvalidAction(other.to_string())),
        }
    }
}

/// Resolve the action for a user and a host from their groups' ACLs.
///
/// Pure and deterministic. Fails only when the winning ACL carries an action
/// other than `allow` or `deny`.
pub fn resolve(user_groups: &[GroupAcls], host_groups: &[GroupAcls]) -> Result<AclAction, AclError> {
    let user_acls: BTreeMap<u64, &Acl> = user_groups
        .iter()
        .flat_map(|group| group.acls.iter())
        .map(|acl| (acl.id, acl))
        .collect();

    let shared: BTreeMap<u64, &Acl> = host_groups
        .iter()
        .flat_map(|group| group.acls.iter())
        .filter(|acl| user_acls.contains_key(&acl.id))
        .map(|acl| (acl.id, acl))
        .collect();

    // min_by_key keeps the first minimum, i.e. the lowest id on equal weight
    match shared.values().min_by_key(|acl| acl.weight) {
        Some(acl) => {
            debug!(
                "ACL {} (weight {}) selected among {} shared",
                acl.id,
                acl.weight,
                shared.len()
            );
            acl.action.parse()
        }
        None => Ok(AclAction::Deny),
    }
}

/// Resolve the action for `user` on `host`, loading groups from the store and
/// consulting the external hook when one is configured.
pub async fn check_acls(
    store: &dyn RecordStore,
    user: &User,
    host: &Host,
    hook_cmd: Option<&str>,
) -> Result<AclAction, AclError> {
    let user_groups = store.user_group_acls(user).await?;
    let host_groups = store.host_group_acls(host).await?;
    let action = resolve(&user_groups, &host_groups)?;

    match hook_cmd {
        Some(cmd) => Ok(consult_hook(cmd, action, user, host).await),
        None => Ok(action),
    }
}
