//! Persisted records consumed by the bastion core
//!
//! Records are owned by the administrative side of the system. The core only reads
//! them, except for invite redemption, host-key pinning and session lifecycle updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A bastion user
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: u64,
    pub name: String,
    pub email: String,
    /// Single-use invite token, empty when none is outstanding
    #[serde(default)]
    pub invite_token: String,
    #[serde(default)]
    pub invite_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub group_ids: Vec<u64>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub comment: String,
}

impl User {
    /// Whether the outstanding invite can still be redeemed at `now`
    pub fn invite_is_valid(&self, now: DateTime<Utc>) -> bool {
        !self.invite_token.is_empty() && self.invite_expires_at.map_or(true, |exp| exp > now)
    }
}

/// A public key linked to a user
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserKey {
    pub id: u64,
    pub user_id: u64,
    /// Canonical authorized-key encoding (`<algorithm> <base64>`), the lookup key
    pub authorized_key: String,
    /// Raw wire encoding of the key
    pub key_blob: Vec<u8>,
    #[serde(default)]
    pub comment: String,
    pub created_at: DateTime<Utc>,
}

/// Key material for a user-key about to be linked through an invite
#[derive(Debug, Clone)]
pub struct NewUserKey {
    pub authorized_key: String,
    pub key_blob: Vec<u8>,
    pub comment: String,
}

/// Membership container carrying ACLs; used for both user groups and host groups
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Group {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub acl_ids: Vec<u64>,
    #[serde(default)]
    pub comment: String,
}

pub type UserGroup = Group;
pub type HostGroup = Group;

/// Access-control policy entry
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Acl {
    pub id: u64,
    /// `allow` or `deny`; anything else is a configuration error
    pub action: String,
    /// Lower weight wins
    pub weight: u32,
    #[serde(default)]
    pub host_pattern: String,
    #[serde(default)]
    pub inception: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expiration: Option<DateTime<Utc>>,
    #[serde(default)]
    pub comment: String,
}

/// A group with its ACLs loaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupAcls {
    pub group: Group,
    pub acls: Vec<Acl>,
}

/// What gets recorded for channels relayed to a host
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LoggingMode {
    Disabled,
    Input,
    #[default]
    Everything,
}

impl LoggingMode {
    pub fn is_enabled(self) -> bool {
        self != LoggingMode::Disabled
    }

    /// Whether bytes flowing from the user to the host are recorded
    pub fn logs_input(self) -> bool {
        matches!(self, LoggingMode::Input | LoggingMode::Everything)
    }

    /// Whether bytes flowing from the host back to the user are recorded
    pub fn logs_output(self) -> bool {
        self == LoggingMode::Everything
    }
}

/// A connection target
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Host {
    pub id: u64,
    pub name: String,
    /// `host[:port]`
    pub addr: String,
    /// Login user on the target
    pub user: String,
    /// Possibly encrypted, empty when unset
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub ssh_key_id: Option<u64>,
    /// Host this one must be reached through
    #[serde(default)]
    pub hop_id: Option<u64>,
    #[serde(default)]
    pub logging: LoggingMode,
    /// Pinned host key (raw wire form), empty until first contact
    #[serde(default)]
    pub host_key: Vec<u8>,
    #[serde(default)]
    pub group_ids: Vec<u64>,
    #[serde(default)]
    pub comment: String,
}

/// A private key stored by the bastion (host identity or client key for targets)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SshKey {
    pub id: u64,
    pub name: String,
    pub key_type: String,
    /// OpenSSH/PEM encoded, possibly encrypted
    pub private_key: String,
    #[serde(default)]
    pub public_key: String,
    #[serde(default)]
    pub comment: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Closed,
}

/// Lifecycle record of one relayed channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: u64,
    pub user_id: u64,
    pub host_id: u64,
    pub status: SessionStatus,
    #[serde(default)]
    pub error: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_logging_direction_policy() {
        assert!(!LoggingMode::Disabled.logs_input());
        assert!(!LoggingMode::Disabled.logs_output());
        assert!(LoggingMode::Input.logs_input());
        assert!(!LoggingMode::Input.logs_output());
        assert!(LoggingMode::Everything.logs_input());
        assert!(LoggingMode::Everything.logs_output());
    }

    #[test]
    fn test_logging_mode_serde_names() {
        let mode: LoggingMode = serde_json::from_str("\"input\"").unwrap();
        assert_eq!(mode, LoggingMode::Input);
        assert_eq!(serde_json::to_string(&LoggingMode::Disabled).unwrap(), "\"disabled\"");
    }

    #[test]
    fn test_invite_validity() {
        let now = Utc::now();
        let mut user = User {
            invite_token: "abc".to_string(),
            ..Default::default()
        };
        assert!(user.invite_is_valid(now));

        user.invite_expires_at = Some(now - Duration::minutes(1));
        assert!(!user.invite_is_valid(now));

        user.invite_expires_at = None;
        user.invite_token.clear();
        assert!(!user.invite_is_valid(now));
    }
}
