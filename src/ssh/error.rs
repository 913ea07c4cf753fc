//! SSH Error types

use thiserror::Error;

use crate::acl::AclError;
use crate::relay::RelayError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("host key mismatch for {0:?}")]
    HostKeyMismatch(String),

    #[error("you don't have permission to that host")]
    AccessDenied,

    #[error("unknown host {0:?}")]
    UnknownHost(String),

    #[error("hop chain of {0:?} loops or exceeds {1} hosts")]
    HopCycle(String, usize),

    #[error("no valid authentication method for host {0:?}")]
    NoAuthMethod(String),

    #[error(transparent)]
    Acl(#[from] AclError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::ProtocolError(err.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}
