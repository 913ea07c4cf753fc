//! sshbastion - SSH bastion host
//!
//! Authenticates inbound users by public key, checks group ACLs, and relays
//! `session` and `direct-tcpip` channels to target hosts through chains of
//! jump hosts, recording every session.

// Use mimalloc as the global allocator: every relayed channel churns through
// many short-lived buffers
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod acl;
pub mod config;
pub mod crypto;
pub mod recorder;
pub mod relay;
pub mod ssh;
pub mod store;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use config::BastionConfig;
pub use ssh::SshError;

/// Initialize logging
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Run the bastion until the listener fails
pub async fn run(config: BastionConfig) -> Result<(), SshError> {
    ssh::run(config).await
}
