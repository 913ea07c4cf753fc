//! SSH module - inbound server and upstream hop chains
//!
//! Both sides run on russh:
//! - `server` / `handler`: accept users, authenticate them, dispatch channels
//! - `hop_chain` / `proxy`: resolve and dial the chain of hosts behind a target
//! - `bastion`: drive one relayed channel from admission to session close

mod auth;
mod bastion;
mod client;
mod config;
mod error;
mod handler;
mod hop_chain;
pub mod known_hosts;
mod proxy;
mod server;

pub use auth::{
    authenticate_password, authenticate_publickey, AuthMethod, ConnectionContext, KeyCredential,
    UserIntent, HEALTHCHECK_USER,
};
pub use bastion::{serve_channel, BastionChannel};
pub use client::ClientHandler;
pub use config::{parse_host_addr, parse_private_key, ClientAuth, DialSpec};
pub use error::SshError;
pub use handler::{BastionHandler, ChannelKind};
pub use hop_chain::HopChainResolver;
pub use known_hosts::{fingerprint, verify_pinned, HostKeyTrust, HostKeyVerification};
pub use proxy::{connect_chain, UpstreamChannel, UpstreamConnection};
pub use server::{load_host_key, run, BastionServer, ServerState, HOST_KEY_NAME};
