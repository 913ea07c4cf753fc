//! Server-side connection handler
//!
//! One [`BastionHandler`] per inbound connection. Authentication fills the
//! [`ConnectionContext`]; channels are then either relayed (bastion intent) or
//! answered locally (health check, shell, invite).

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use russh::keys::PublicKey;
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Pty, Sig};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::auth::{self, ConnectionContext, KeyCredential, UserIntent};
use super::bastion::{serve_channel, BastionChannel};
use super::error::SshError;
use super::proxy::UpstreamChannel;
use super::server::ServerState;
use crate::relay::{ChannelRequest, Chunk, InboundFeed, InboundWriter};

const SHELL_NOTICE: &str =
    "The administrative shell is not served on this endpoint.\n";

/// Inbound channel types the bastion knows how to serve
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    Session,
    DirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
    },
}

impl From<ChannelKind> for UpstreamChannel {
    fn from(kind: ChannelKind) -> Self {
        match kind {
            ChannelKind::Session => UpstreamChannel::Session,
            ChannelKind::DirectTcpip {
                host,
                port,
                originator_host,
                originator_port,
            } => UpstreamChannel::DirectTcpip {
                host,
                port,
                originator_host,
                originator_port,
            },
        }
    }
}

/// What a local (non-relayed) channel answers to `shell`/`exec`
fn local_reply(ctx: &ConnectionContext) -> (String, u32) {
    if ctx.intent == UserIntent::Healthcheck {
        return ("OK\n".to_string(), 0);
    }
    if let Some(err) = &ctx.deferred_error {
        return (format!("error: {}\n", err), 1);
    }
    match (&ctx.intent, &ctx.message) {
        (UserIntent::Invite(_), Some(message)) => (message.clone(), 0),
        (_, Some(message)) => (format!("{}{}", message, SHELL_NOTICE), 1),
        _ => (SHELL_NOTICE.to_string(), 1),
    }
}

/// Why a bastion channel cannot be relayed, if it cannot
fn admission_error(ctx: &ConnectionContext) -> Option<String> {
    if let Some(err) = &ctx.deferred_error {
        return Some(err.clone());
    }
    if ctx.user.is_none() {
        return Some("access denied".to_string());
    }
    None
}

pub struct BastionHandler {
    state: Arc<ServerState>,
    ctx: ConnectionContext,
    peer_addr: Option<SocketAddr>,
    /// Relayed channels
    feeds: HashMap<ChannelId, InboundFeed>,
    /// Channels answered by the bastion itself
    local: HashSet<ChannelId>,
}

impl BastionHandler {
    pub fn new(
        state: Arc<ServerState>,
        connection_id: Uuid,
        peer_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            state,
            ctx: ConnectionContext::new(connection_id),
            peer_addr,
            feeds: HashMap::new(),
            local: HashSet::new(),
        }
    }

    fn open_channel(&mut self, id: ChannelId, kind: ChannelKind, session: &mut Session) -> bool {
        let conn = self.ctx.connection_id;

        let host_name = match &self.ctx.intent {
            UserIntent::Bastion(host) => host.clone(),
            _ => {
                if kind != ChannelKind::Session {
                    warn!("[{}] {:?} refused outside bastion mode", conn, kind);
                    return false;
                }
                self.local.insert(id);
                return true;
            }
        };

        let writer = InboundWriter::new(session.handle(), id);

        if let Some(reason) = admission_error(&self.ctx) {
            warn!("[{}] channel refused for {:?}: {}", conn, self.ctx.username, reason);
            tokio::spawn(async move { writer.reject(&reason).await });
            return true;
        }
        let Some(user) = self.ctx.user.clone() else {
            return false;
        };

        info!(
            "[{}] {} opens {:?} to {} from {:?}",
            conn, user.name, kind, host_name, self.peer_addr
        );

        let (feed, data_rx, req_rx) = InboundFeed::channel();
        self.feeds.insert(id, feed);

        let channel = BastionChannel {
            user,
            host_name,
            upstream: kind.into(),
            writer,
            data_rx,
            req_rx,
        };
        tokio::spawn(serve_channel(self.state.clone(), channel));
        true
    }

    /// Hand a request to the relay, or answer it for a local channel.
    ///
    /// A relayed request that takes a reply is answered here, once the upstream
    /// has given its verdict, so the reply always belongs to this request.
    async fn route_request(
        &mut self,
        channel: ChannelId,
        request: ChannelRequest,
        session: &mut Session,
    ) {
        if let Some(feed) = self.feeds.get(&channel) {
            match feed.request(request).await {
                Some(true) => {
                    let _ = session.channel_success(channel);
                }
                Some(false) => {
                    let _ = session.channel_failure(channel);
                }
                None => {}
            }
            return;
        }

        if !self.local.contains(&channel) {
            let _ = session.channel_failure(channel);
            return;
        }

        match request {
            ChannelRequest::Pty { .. }
            | ChannelRequest::Env { .. }
            | ChannelRequest::WindowChange { .. } => {
                let _ = session.channel_success(channel);
            }
            ChannelRequest::Shell | ChannelRequest::Exec { .. } => {
                let _ = session.channel_success(channel);
                self.reply_locally(channel, session);
            }
            other => {
                debug!(
                    "[{}] {} refused on local channel",
                    self.ctx.connection_id,
                    other.kind()
                );
                let _ = session.channel_failure(channel);
            }
        }
    }

    fn reply_locally(&mut self, channel: ChannelId, session: &mut Session) {
        let (text, status) = local_reply(&self.ctx);
        debug!(
            "[{}] local reply for {:?}, exit {}",
            self.ctx.connection_id, self.ctx.intent, status
        );
        let _ = session.data(channel, CryptoVec::from_slice(text.as_bytes()));
        let _ = session.exit_status_request(channel, status);
        let _ = session.eof(channel);
        let _ = session.close(channel);
        self.local.remove(&channel);
    }
}

impl server::Handler for BastionHandler {
    type Error = SshError;

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let credential = KeyCredential::from_public_key(public_key)?;
        let accepted = auth::authenticate_publickey(
            self.state.store.as_ref(),
            &mut self.ctx,
            user,
            credential,
        )
        .await?;

        if accepted {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            })
        }
    }

    async fn auth_password(&mut self, user: &str, _password: &str) -> Result<Auth, Self::Error> {
        if auth::authenticate_password(&mut self.ctx, user) {
            info!("[{}] health check", self.ctx.connection_id);
            Ok(Auth::Accept)
        } else {
            Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.open_channel(channel.id(), ChannelKind::Session, session))
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let kind = ChannelKind::DirectTcpip {
            host: host_to_connect.to_string(),
            port: port_to_connect,
            originator_host: originator_address.to_string(),
            originator_port,
        };
        Ok(self.open_channel(channel.id(), kind, session))
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(feed) = self.feeds.get(&channel) {
            feed.data(Chunk::data(data.to_vec())).await;
        }
        Ok(())
    }

    async fn extended_data(
        &mut self,
        channel: ChannelId,
        code: u32,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(feed) = self.feeds.get(&channel) {
            feed.data(Chunk::extended(code, data.to_vec())).await;
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(feed) = self.feeds.get_mut(&channel) {
            feed.eof();
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(mut feed) = self.feeds.remove(&channel) {
            feed.close();
        }
        self.local.remove(&channel);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = ChannelRequest::Pty {
            term: term.to_string(),
            col_width,
            row_height,
            pix_width,
            pix_height,
            modes: modes.to_vec(),
        };
        self.route_request(channel, request, session).await;
        Ok(())
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        _single_connection: bool,
        _x11_auth_protocol: &str,
        _x11_auth_cookie: &str,
        _x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("[{}] x11 forwarding declined", self.ctx.connection_id);
        let _ = session.channel_failure(channel);
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = ChannelRequest::Env {
            name: variable_name.to_string(),
            value: variable_value.to_string(),
        };
        self.route_request(channel, request, session).await;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.route_request(channel, ChannelRequest::Shell, session).await;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = ChannelRequest::Exec {
            command: data.to_vec(),
        };
        self.route_request(channel, request, session).await;
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = ChannelRequest::Subsystem {
            name: name.to_string(),
        };
        self.route_request(channel, request, session).await;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = ChannelRequest::WindowChange {
            col_width,
            row_height,
            pix_width,
            pix_height,
        };
        self.route_request(channel, request, session).await;
        Ok(())
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        signal: Sig,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.route_request(channel, ChannelRequest::Signal(signal), session).await;
        Ok(())
    }

    async fn agent_request(
        &mut self,
        _channel: ChannelId,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!("[{}] agent forwarding declined", self.ctx.connection_id);
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::User;

    fn ctx(intent: UserIntent) -> ConnectionContext {
        let mut ctx = ConnectionContext::new(Uuid::new_v4());
        ctx.intent = intent;
        ctx
    }

    fn alice() -> User {
        User {
            id: 1,
            name: "alice".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_healthcheck_replies_ok() {
        let ctx = ctx(UserIntent::Healthcheck);
        assert_eq!(local_reply(&ctx), ("OK\n".to_string(), 0));
    }

    #[test]
    fn test_invite_welcome_exits_zero() {
        let mut ctx = ctx(UserIntent::Invite("tok".to_string()));
        ctx.user = Some(alice());
        ctx.message = Some("Welcome alice!\n".to_string());
        assert_eq!(local_reply(&ctx), ("Welcome alice!\n".to_string(), 0));
    }

    #[test]
    fn test_deferred_error_exits_one() {
        let mut ctx = ctx(UserIntent::Invite("tok".to_string()));
        ctx.deferred_error = Some("your token is invalid or expired".to_string());
        assert_eq!(
            local_reply(&ctx),
            ("error: your token is invalid or expired\n".to_string(), 1)
        );
    }

    #[test]
    fn test_shell_prints_notice() {
        let mut ctx = ctx(UserIntent::Shell);
        ctx.user = Some(alice());
        assert_eq!(local_reply(&ctx), (SHELL_NOTICE.to_string(), 1));
    }

    #[test]
    fn test_bastion_admission() {
        let mut ctx = ctx(UserIntent::Bastion("web01".to_string()));
        assert_eq!(admission_error(&ctx).as_deref(), Some("access denied"));

        ctx.deferred_error = Some("unknown ssh key".to_string());
        assert_eq!(admission_error(&ctx).as_deref(), Some("unknown ssh key"));

        ctx.deferred_error = None;
        ctx.user = Some(alice());
        assert!(admission_error(&ctx).is_none());
    }

    #[test]
    fn test_channel_kind_maps_to_upstream() {
        let kind = ChannelKind::DirectTcpip {
            host: "db".to_string(),
            port: 5432,
            originator_host: "10.0.0.1".to_string(),
            originator_port: 51000,
        };
        let upstream: UpstreamChannel = kind.into();
        assert_eq!(upstream.type_name(), "direct-tcpip");

        let upstream: UpstreamChannel = ChannelKind::Session.into();
        assert_eq!(upstream, UpstreamChannel::Session);
    }
}
