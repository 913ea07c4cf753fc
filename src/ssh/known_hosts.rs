//! Host-key trust for upstream hosts
//!
//! Trust on first use: the first key a host presents is pinned in the record
//! store, later connections must present exactly the same key. Every hop of a
//! chain is checked against its own pin.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use super::error::SshError;
use crate::store::{Host, RecordStore};

/// Result of host key verification
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    /// Key matches the pinned key
    Verified,
    /// Nothing pinned yet
    Unknown,
    /// Key differs from the pinned key
    Changed,
}

/// Compare a presented key (raw wire form) against a pin
pub fn verify_pinned(pinned: &[u8], presented: &[u8]) -> HostKeyVerification {
    if pinned.is_empty() {
        HostKeyVerification::Unknown
    } else if pinned.len() == presented.len() && bool::from(pinned.ct_eq(presented)) {
        HostKeyVerification::Verified
    } else {
        HostKeyVerification::Changed
    }
}

/// `SHA256:<base64>` as printed by `ssh-keygen -l`
pub fn fingerprint(key: &[u8]) -> String {
    format!("SHA256:{}", STANDARD_NO_PAD.encode(Sha256::digest(key)))
}

/// Trust decision for one host of a hop chain
pub struct HostKeyTrust {
    store: Arc<dyn RecordStore>,
    host_id: u64,
    host_name: String,
    pinned: Vec<u8>,
}

impl HostKeyTrust {
    pub fn new(store: Arc<dyn RecordStore>, host: &Host) -> Self {
        Self {
            store,
            host_id: host.id,
            host_name: host.name.clone(),
            pinned: host.host_key.clone(),
        }
    }

    /// Accept or reject the key presented by the host, pinning it on first use
    pub async fn check(&mut self, presented: &[u8]) -> Result<(), SshError> {
        match verify_pinned(&self.pinned, presented) {
            HostKeyVerification::Verified => Ok(()),
            HostKeyVerification::Unknown => {
                info!(
                    "TOFU: pinning host key for {} ({})",
                    self.host_name,
                    fingerprint(presented)
                );
                self.store.pin_host_key(self.host_id, presented).await?;
                self.pinned = presented.to_vec();
                Ok(())
            }
            HostKeyVerification::Changed => {
                warn!(
                    "HOST KEY CHANGED for {}! Expected {}, got {}",
                    self.host_name,
                    fingerprint(&self.pinned),
                    fingerprint(presented)
                );
                Err(SshError::HostKeyMismatch(self.host_name.clone()))
            }
        }
    }
}
