//! SSH server bootstrap

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use russh::keys::PrivateKey;
use russh::server::{self, Server};
use tracing::{info, warn};
use uuid::Uuid;

use super::config::parse_private_key;
use super::error::SshError;
use super::handler::BastionHandler;
use crate::config::BastionConfig;
use crate::crypto::SecretBox;
use crate::store::{RecordStore, RedbRecordStore};

/// Name of the stored key used as the server identity
pub const HOST_KEY_NAME: &str = "host";

pub const HALTED_SESSION_ERROR: &str =
    "sshbastion was halted while the connection was still active";

/// State shared by every connection
pub struct ServerState {
    pub store: Arc<dyn RecordStore>,
    pub config: BastionConfig,
    pub secrets: SecretBox,
}

impl ServerState {
    pub fn new(store: Arc<dyn RecordStore>, config: BastionConfig) -> Self {
        let secrets = SecretBox::new(&config.aes_key);
        Self {
            store,
            config,
            secrets,
        }
    }
}

/// Creates one [`BastionHandler`] per inbound connection
pub struct BastionServer {
    state: Arc<ServerState>,
}

impl BastionServer {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }
}

impl Server for BastionServer {
    type Handler = BastionHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        let connection_id = Uuid::new_v4();
        info!("[{}] New connection from {:?}", connection_id, peer_addr);
        BastionHandler::new(self.state.clone(), connection_id, peer_addr)
    }

    fn handle_session_error(&mut self, error: <Self::Handler as server::Handler>::Error) {
        warn!("SSH session ended with error: {}", error);
    }
}

/// Load the server identity from the store
pub async fn load_host_key(
    store: &dyn RecordStore,
    secrets: &SecretBox,
) -> Result<PrivateKey, SshError> {
    let key = store.ssh_key_by_name(HOST_KEY_NAME).await?.ok_or_else(|| {
        SshError::KeyError(format!(
            "no SSH key named {:?} in the record store",
            HOST_KEY_NAME
        ))
    })?;
    let pem = secrets.decrypt_or_raw(&key.private_key);
    parse_private_key(&pem)
}

/// Open the store, close sessions left over by a previous run, and serve forever
pub async fn run(config: BastionConfig) -> Result<(), SshError> {
    let store = Arc::new(RedbRecordStore::open(&config.db_path)?);
    let state = Arc::new(ServerState::new(store, config));

    let swept = state
        .store
        .close_active_sessions(HALTED_SESSION_ERROR)
        .await?;
    if swept > 0 {
        warn!("Closed {} sessions left active by a previous run", swept);
    }

    let host_key = load_host_key(state.store.as_ref(), &state.secrets).await?;

    let ssh_config = server::Config {
        inactivity_timeout: state.config.idle_timeout(),
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::ZERO),
        keys: vec![host_key],
        ..Default::default()
    };

    let bind_address = state.config.bind_address.clone();
    info!("SSH bastion listening on {}", bind_address);

    let mut server = BastionServer::new(state);
    server
        .run_on_address(Arc::new(ssh_config), bind_address.as_str())
        .await?;
    Ok(())
}
