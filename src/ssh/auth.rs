//! Authentication gate
//!
//! Resolves the inbound username and credential into a [`ConnectionContext`].
//! Public-key authentication always lets the handshake continue: failures are
//! kept as a deferred error and shown on the first channel, where the client
//! can read them.

use russh::keys::{PublicKey, PublicKeyBase64};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::SshError;
use crate::store::{NewUserKey, RecordStore, User};

pub const HEALTHCHECK_USER: &str = "healthcheck";
const INVITE_PREFIX: &str = "invite:";

/// What the inbound username asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserIntent {
    Healthcheck,
    /// Administrative shell
    Shell,
    /// Redeem an invite token
    Invite(String),
    /// Relay to the named host
    Bastion(String),
}

impl UserIntent {
    /// Classify `username`, given the user its key resolved to (if any)
    pub fn classify(username: &str, user: Option<&User>) -> Self {
        if username == HEALTHCHECK_USER {
            return UserIntent::Healthcheck;
        }
        if username == "admin"
            || user.is_some_and(|u| username == u.name || username == u.email)
        {
            return UserIntent::Shell;
        }
        if let Some(token) = username.strip_prefix(INVITE_PREFIX) {
            return UserIntent::Invite(token.to_string());
        }
        UserIntent::Bastion(username.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    None,
    PublicKey,
    Password,
}

/// Per-connection state, owned by the server handler
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub connection_id: Uuid,
    pub username: String,
    pub user: Option<User>,
    pub intent: UserIntent,
    pub auth_method: AuthMethod,
    /// Shown as `error: ...` on the first channel
    pub deferred_error: Option<String>,
    /// Shown on the shell channel (invite welcome)
    pub message: Option<String>,
}

impl ConnectionContext {
    pub fn new(connection_id: Uuid) -> Self {
        Self {
            connection_id,
            username: String::new(),
            user: None,
            intent: UserIntent::Bastion(String::new()),
            auth_method: AuthMethod::None,
            deferred_error: None,
            message: None,
        }
    }
}

/// A presented public key in the forms the store knows
#[derive(Debug, Clone)]
pub struct KeyCredential {
    /// `<algorithm> <base64>`, no comment
    pub authorized_key: String,
    pub key_blob: Vec<u8>,
}

impl KeyCredential {
    pub fn from_public_key(key: &PublicKey) -> Result<Self, SshError> {
        let openssh = key.to_openssh().map_err(|e| SshError::KeyError(e.to_string()))?;
        let authorized_key = openssh
            .split_whitespace()
            .take(2)
            .collect::<Vec<_>>()
            .join(" ");
        Ok(Self {
            authorized_key,
            key_blob: key.public_key_bytes(),
        })
    }
}

/// Public-key authentication. Returns whether the handshake continues, which is
/// always the case: rejections are deferred into the context.
pub async fn authenticate_publickey(
    store: &dyn RecordStore,
    ctx: &mut ConnectionContext,
    username: &str,
    key: KeyCredential,
) -> Result<bool, SshError> {
    ctx.username = username.to_string();
    ctx.auth_method = AuthMethod::PublicKey;
    ctx.deferred_error = None;
    ctx.message = None;

    if username == HEALTHCHECK_USER {
        ctx.intent = UserIntent::Healthcheck;
        return Ok(true);
    }

    let known = match store.user_key_by_authorized_key(&key.authorized_key).await? {
        Some(user_key) => store.user_by_id(user_key.user_id).await?,
        None => None,
    };
    ctx.intent = UserIntent::classify(username, known.as_ref());

    match (known, &ctx.intent) {
        (Some(user), UserIntent::Invite(_)) => {
            ctx.deferred_error = Some(format!(
                "invites are only supported for new SSH keys; your ssh key is already associated with the user {:?}",
                user.email
            ));
            ctx.user = Some(user);
        }
        (Some(user), _) => {
            debug!("[{}] key belongs to {}", ctx.connection_id, user.name);
            ctx.user = Some(user);
        }
        (None, UserIntent::Invite(token)) => {
            let new_key = NewUserKey {
                authorized_key: key.authorized_key,
                key_blob: key.key_blob,
                comment: "created by sshbastion".to_string(),
            };
            match store.redeem_invite(token, new_key).await? {
                Some(user) => {
                    info!(
                        "[{}] invite redeemed, key linked to {}",
                        ctx.connection_id, user.name
                    );
                    ctx.message = Some(format!(
                        "Welcome {}!\n\nYour key is now associated with the user {:?}.\n",
                        user.name, user.email
                    ));
                    ctx.user = Some(user);
                }
                None => {
                    warn!("[{}] invalid invite token", ctx.connection_id);
                    ctx.user = None;
                    ctx.deferred_error = Some("your token is invalid or expired".to_string());
                }
            }
        }
        (None, _) => {
            warn!("[{}] unknown key for {:?}", ctx.connection_id, username);
            ctx.user = None;
            ctx.deferred_error = Some("unknown ssh key".to_string());
        }
    }

    Ok(true)
}

/// Password authentication exists only for the health check
pub fn authenticate_password(ctx: &mut ConnectionContext, username: &str) -> bool {
    if username != HEALTHCHECK_USER {
        return false;
    }
    ctx.username = username.to_string();
    ctx.auth_method = AuthMethod::Password;
    ctx.intent = UserIntent::Healthcheck;
    ctx.user = None;
    ctx.deferred_error = None;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{RedbRecordStore, UserKey};
    use chrono::Utc;
    use tempfile::tempdir;

    fn alice() -> User {
        User {
            id: 1,
            name: "alice".to_string(),
            email: "alice@example.com".to_string(),
            ..Default::default()
        }
    }

    fn key(n: u8) -> KeyCredential {
        KeyCredential {
            authorized_key: format!("ssh-ed25519 AAAAkey{}", n),
            key_blob: vec![n; 8],
        }
    }

    #[test]
    fn test_classify_order() {
        let user = alice();
        assert_eq!(
            UserIntent::classify("healthcheck", Some(&user)),
            UserIntent::Healthcheck
        );
        assert_eq!(UserIntent::classify("alice", Some(&user)), UserIntent::Shell);
        assert_eq!(
            UserIntent::classify("alice@example.com", Some(&user)),
            UserIntent::Shell
        );
        assert_eq!(UserIntent::classify("admin", None), UserIntent::Shell);
        assert_eq!(
            UserIntent::classify("invite:abc", None),
            UserIntent::Invite("abc".to_string())
        );
        assert_eq!(
            UserIntent::classify("web01", Some(&user)),
            UserIntent::Bastion("web01".to_string())
        );
        // Another user's name is just a host name
        assert_eq!(
            UserIntent::classify("alice", None),
            UserIntent::Bastion("alice".to_string())
        );
    }

    #[test]
    fn test_password_only_for_healthcheck() {
        let mut ctx = ConnectionContext::new(Uuid::new_v4());
        assert!(!authenticate_password(&mut ctx, "alice"));
        assert!(authenticate_password(&mut ctx, "healthcheck"));
        assert_eq!(ctx.intent, UserIntent::Healthcheck);
        assert_eq!(ctx.auth_method, AuthMethod::Password);
    }

    #[tokio::test]
    async fn test_known_key_resolves_user() {
        let temp = tempdir().unwrap();
        let store = RedbRecordStore::open(&temp.path().join("db.redb")).unwrap();
        let user = store.put_user(User { id: 0, ..alice() }).unwrap();
        store
            .put_user_key(UserKey {
                id: 0,
                user_id: user.id,
                authorized_key: key(1).authorized_key,
                key_blob: key(1).key_blob,
                comment: String::new(),
                created_at: Utc::now(),
            })
            .unwrap();

        let mut ctx = ConnectionContext::new(Uuid::new_v4());
        assert!(authenticate_publickey(&store, &mut ctx, "web01", key(1)).await.unwrap());
        assert_eq!(ctx.user.as_ref().map(|u| u.id), Some(user.id));
        assert_eq!(ctx.intent, UserIntent::Bastion("web01".to_string()));
        assert!(ctx.deferred_error.is_none());

        // Same key used with an invite
        let mut ctx = ConnectionContext::new(Uuid::new_v4());
        authenticate_publickey(&store, &mut ctx, "invite:whatever", key(1))
            .await
            .unwrap();
        assert_eq!(
            ctx.deferred_error.as_deref(),
            Some("invites are only supported for new SSH keys; your ssh key is already associated with the user \"alice@example.com\"")
        );
    }

    #[tokio::test]
    async fn test_unknown_key_is_deferred() {
        let temp = tempdir().unwrap();
        let store = RedbRecordStore::open(&temp.path().join("db.redb")).unwrap();

        let mut ctx = ConnectionContext::new(Uuid::new_v4());
        assert!(authenticate_publickey(&store, &mut ctx, "web01", key(9)).await.unwrap());
        assert!(ctx.user.is_none());
        assert_eq!(ctx.deferred_error.as_deref(), Some("unknown ssh key"));
    }

    #[tokio::test]
    async fn test_invite_is_single_use() {
        let temp = tempdir().unwrap();
        let store = RedbRecordStore::open(&temp.path().join("db.redb")).unwrap();
        store
            .put_user(User {
                id: 0,
                invite_token: "tok123".to_string(),
                ..alice()
            })
            .unwrap();

        let mut ctx = ConnectionContext::new(Uuid::new_v4());
        authenticate_publickey(&store, &mut ctx, "invite:tok123", key(2))
            .await
            .unwrap();
        assert!(ctx.deferred_error.is_none());
        assert_eq!(
            ctx.message.as_deref(),
            Some("Welcome alice!\n\nYour key is now associated with the user \"alice@example.com\".\n")
        );
        let linked = store
            .user_key_by_authorized_key(&key(2).authorized_key)
            .await
            .unwrap();
        assert!(linked.is_some());

        // Replaying the token with a fresh key
        let mut ctx = ConnectionContext::new(Uuid::new_v4());
        authenticate_publickey(&store, &mut ctx, "invite:tok123", key(3))
            .await
            .unwrap();
        assert!(ctx.user.is_none());
        assert_eq!(
            ctx.deferred_error.as_deref(),
            Some("your token is invalid or expired")
        );
    }
}
