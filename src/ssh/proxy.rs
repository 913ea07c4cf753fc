//! Hop-chain dialer
//!
//! Connects through every hop of a dial plan with SSH-over-SSH:
//! ```text
//! bastion --SSH--> [hop1] --direct-tcpip--> [hop2] --direct-tcpip--> ... --> [target]
//! ```
//! The first hop is reached over TCP, every following hop over a `direct-tcpip`
//! channel of the previous one wrapped as a stream (`client::connect_stream`).

use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle, Msg};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::{Channel, ChannelStream, Disconnect};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::config::{ClientAuth, DialSpec};
use super::error::SshError;
use super::known_hosts::HostKeyTrust;
use crate::store::RecordStore;

/// What to open on the final host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamChannel {
    Session,
    DirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
    },
}

impl UpstreamChannel {
    /// Channel type as it appears in log file names
    pub fn type_name(&self) -> &'static str {
        match self {
            UpstreamChannel::Session => "session",
            UpstreamChannel::DirectTcpip { .. } => "direct-tcpip",
        }
    }
}

/// Live connections to every hop of a chain
///
/// `handles` is ordered like the dial plan; the last handle is the target.
pub struct UpstreamConnection {
    handles: Vec<Handle<ClientHandler>>,
}

impl UpstreamConnection {
    /// Open the relayed channel on the target host
    pub async fn open_channel(&self, kind: &UpstreamChannel) -> Result<Channel<Msg>, SshError> {
        let target = self
            .handles
            .last()
            .ok_or_else(|| SshError::ConnectionFailed("empty hop chain".into()))?;

        let channel = match kind {
            UpstreamChannel::Session => target.channel_open_session().await,
            UpstreamChannel::DirectTcpip {
                host,
                port,
                originator_host,
                originator_port,
            } => {
                target
                    .channel_open_direct_tcpip(
                        host.as_str(),
                        *port,
                        originator_host.as_str(),
                        *originator_port,
                    )
                    .await
            }
        };
        channel.map_err(|e| SshError::ChannelError(e.to_string()))
    }

    /// Disconnect the target first, then each hop back towards the bastion
    pub async fn disconnect(self) {
        for handle in self.handles.into_iter().rev() {
            if let Err(e) = handle
                .disconnect(Disconnect::ByApplication, "Session closed", "en")
                .await
            {
                debug!("Disconnect failed: {}", e);
            }
        }
    }
}

/// Dial every hop of `plan` in order
pub async fn connect_chain(
    plan: &[DialSpec],
    store: Arc<dyn RecordStore>,
    timeout: Duration,
) -> Result<UpstreamConnection, SshError> {
    if plan.is_empty() {
        return Err(SshError::ConnectionFailed("empty hop chain".into()));
    }

    info!("Establishing {}-hop SSH chain", plan.len());

    let mut handles: Vec<Handle<ClientHandler>> = Vec::with_capacity(plan.len());
    let mut stream: Option<ChannelStream<Msg>> = None;

    for (i, hop) in plan.iter().enumerate() {
        info!(
            "Hop {}: connecting to {}@{}:{}",
            i + 1,
            hop.username,
            hop.address,
            hop.port
        );

        let handler = ClientHandler::new(HostKeyTrust::new(store.clone(), &hop.host));
        let handle = match stream.take() {
            Some(stream) => connect_via_stream(hop, stream, handler, timeout).await,
            None => direct_connect(hop, handler, timeout).await,
        };
        let handle = match handle {
            Ok(handle) => handle,
            Err(e) => {
                UpstreamConnection { handles }.disconnect().await;
                return Err(e);
            }
        };

        if let Some(next) = plan.get(i + 1) {
            debug!("Hop {}: opening tunnel to {}:{}", i + 1, next.address, next.port);
            match handle
                .channel_open_direct_tcpip(next.address.as_str(), next.port as u32, "127.0.0.1", 0)
                .await
            {
                Ok(channel) => stream = Some(channel.into_stream()),
                Err(e) => {
                    handles.push(handle);
                    UpstreamConnection { handles }.disconnect().await;
                    return Err(SshError::ConnectionFailed(format!(
                        "Failed to open tunnel to {}:{}: {}",
                        next.address, next.port, e
                    )));
                }
            }
        }

        handles.push(handle);
    }

    Ok(UpstreamConnection { handles })
}

fn client_config() -> Arc<client::Config> {
    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        ..Default::default()
    })
}

async fn direct_connect(
    hop: &DialSpec,
    handler: ClientHandler,
    timeout: Duration,
) -> Result<Handle<ClientHandler>, SshError> {
    let mut handle = tokio::time::timeout(
        timeout,
        client::connect(client_config(), (hop.address.as_str(), hop.port), handler),
    )
    .await
    .map_err(|_| {
        SshError::Timeout(format!(
            "Connection to {}:{} timed out",
            hop.address, hop.port
        ))
    })??;

    authenticate(&mut handle, hop).await?;
    Ok(handle)
}

async fn connect_via_stream(
    hop: &DialSpec,
    stream: ChannelStream<Msg>,
    handler: ClientHandler,
    timeout: Duration,
) -> Result<Handle<ClientHandler>, SshError> {
    let mut handle = tokio::time::timeout(
        timeout,
        client::connect_stream(client_config(), stream, handler),
    )
    .await
    .map_err(|_| {
        SshError::Timeout(format!(
            "Connection to {}:{} via stream timed out",
            hop.address, hop.port
        ))
    })??;

    authenticate(&mut handle, hop).await?;
    Ok(handle)
}

/// Try the hop's credentials in order until one is accepted
async fn authenticate(handle: &mut Handle<ClientHandler>, hop: &DialSpec) -> Result<(), SshError> {
    for auth in &hop.auth {
        let result = match auth {
            ClientAuth::Key(key) => {
                debug!("Authenticating to {} with key", hop.host.name);
                handle
                    .authenticate_publickey(
                        &hop.username,
                        PrivateKeyWithHashAlg::new(key.clone(), None),
                    )
                    .await
            }
            ClientAuth::Password(password) => {
                debug!("Authenticating to {} with password", hop.host.name);
                handle
                    .authenticate_password(&hop.username, password.as_str())
                    .await
            }
        };

        match result {
            Ok(outcome) if outcome.success() => {
                info!("Authenticated to {}", hop.host.name);
                return Ok(());
            }
            Ok(_) => debug!("Authentication method rejected by {}", hop.host.name),
            Err(e) => warn!("Authentication to {} failed: {}", hop.host.name, e),
        }
    }

    Err(SshError::AuthenticationFailed(format!(
        "Authentication to {:?} rejected",
        hop.host.name
    )))
}
