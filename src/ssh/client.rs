//! SSH client side: handler for upstream connections

use russh::client;
use russh::keys::{PublicKey, PublicKeyBase64};
use tracing::debug;

use super::error::SshError;
use super::known_hosts::HostKeyTrust;

/// Client handler for one hop of a chain
///
/// Only host-key verification happens here; the bastion never accepts channels
/// opened by an upstream server.
pub struct ClientHandler {
    trust: HostKeyTrust,
}

impl ClientHandler {
    pub fn new(trust: HostKeyTrust) -> Self {
        Self { trust }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        self.trust
            .check(&server_public_key.public_key_bytes())
            .await?;
        debug!("Host key accepted");
        Ok(true)
    }
}
