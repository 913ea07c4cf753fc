//! Bastion channel lifecycle
//!
//! `Accepted -> Dialing -> Relaying -> Closed`. Everything that fails before the
//! relay starts is an admission failure: the user gets `error: <reason>` on the
//! channel and no session record remains active. Once relaying, failures end
//! up as the session record's error.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::config::DialSpec;
use super::error::SshError;
use super::hop_chain::HopChainResolver;
use super::proxy::{connect_chain, UpstreamChannel};
use super::server::ServerState;
use crate::recorder::{session_log_path, RecordingSink, SessionLog, StreamLog};
use crate::relay::{
    inbound_endpoint, pipe, upstream_endpoint, Chunk, InboundWriter, PendingRequest, RelayError,
};
use crate::store::{Host, LoggingMode, User};

/// An accepted inbound channel waiting to be relayed
pub struct BastionChannel {
    pub user: User,
    pub host_name: String,
    pub upstream: UpstreamChannel,
    pub writer: InboundWriter,
    pub data_rx: mpsc::Receiver<Chunk>,
    pub req_rx: mpsc::Receiver<PendingRequest>,
}

/// Drive one bastion channel to completion
pub async fn serve_channel(state: Arc<ServerState>, channel: BastionChannel) {
    let writer = channel.writer.clone();
    let label = format!("{} -> {}", channel.user.name, channel.host_name);

    // The channel's queues are dropped by the time this returns, so requests
    // still waiting on a verdict are refused before the error is printed
    if let Err(e) = relay_channel(&state, channel).await {
        warn!("Bastion channel {} refused: {}", label, e);
        writer.reject(&e.to_string()).await;
    }
}

async fn relay_channel(state: &ServerState, channel: BastionChannel) -> Result<(), SshError> {
    let BastionChannel {
        user,
        host_name,
        upstream,
        writer,
        data_rx,
        req_rx,
    } = channel;

    let (host, plan) = admit(state, &user, &host_name).await?;

    // Dialing
    let connection = connect_chain(&plan, state.store.clone(), state.config.dial_timeout()).await?;
    let upstream_channel = match connection.open_channel(&upstream).await {
        Ok(channel) => channel,
        Err(e) => {
            connection.disconnect().await;
            return Err(e);
        }
    };

    // Relaying
    let result = record_session(state, &user, &host, &upstream, |streams| async move {
        let mut inbound = inbound_endpoint(writer, data_rx, req_rx);
        let mut outbound = upstream_endpoint(upstream_channel);
        outbound.writer = RecordingSink::wrap(outbound.writer, streams.input);
        inbound.writer = RecordingSink::wrap(inbound.writer, streams.output);
        pipe(inbound, outbound, streams.exec).await
    })
    .await;

    connection.disconnect().await;
    result
}

/// Look up the target and resolve its hop chain, checking every hop's ACL
async fn admit(
    state: &ServerState,
    user: &User,
    host_name: &str,
) -> Result<(Host, Vec<DialSpec>), SshError> {
    let host = state
        .store
        .host_by_name(host_name)
        .await?
        .ok_or_else(|| SshError::UnknownHost(host_name.to_string()))?;

    let resolver = HopChainResolver {
        store: state.store.as_ref(),
        secrets: &state.secrets,
        acl_hook: state.config.acl_hook(),
        max_hops: state.config.max_hops,
    };
    let plan = resolver.resolve(user, host.clone()).await?;
    Ok((host, plan))
}

/// Recorders handed to the relay
struct SessionStreams {
    /// user -> host, `None` when that direction is not recorded
    input: Option<StreamLog>,
    /// host -> user
    output: Option<StreamLog>,
    /// exec commands
    exec: StreamLog,
}

/// Run `relay` inside a session record.
///
/// The record is created first and always closed, with the relay's error or an
/// empty one. The log is flushed before the record is closed. Errors returned
/// here happened before the relay ran.
async fn record_session<F, Fut>(
    state: &ServerState,
    user: &User,
    host: &Host,
    upstream: &UpstreamChannel,
    relay: F,
) -> Result<(), SshError>
where
    F: FnOnce(SessionStreams) -> Fut,
    Fut: Future<Output = Result<(), RelayError>>,
{
    let session = state.store.create_session(user.id, host.id).await?;

    let log = match open_session_log(state, user, host, upstream, session.id) {
        Ok(log) => log,
        Err(e) => {
            if let Err(close_err) = state.store.close_session(session.id, &e.to_string()).await {
                warn!("Failed to close session {}: {}", session.id, close_err);
            }
            return Err(e);
        }
    };

    info!(
        "Session {}: relaying {} channel of {} to {}",
        session.id,
        upstream.type_name(),
        user.name,
        host.name
    );
    let (input_log, output_log) = stream_logs(&log, upstream);
    let streams = SessionStreams {
        exec: if host.logging.is_enabled() {
            input_log.clone()
        } else {
            StreamLog::disabled()
        },
        input: directional(host.logging, true, input_log),
        output: directional(host.logging, false, output_log),
    };

    let result = relay(streams).await;

    // Closed
    let error = match &result {
        Ok(()) => String::new(),
        Err(e) => e.to_string(),
    };
    if let Err(e) = log.flush().await {
        warn!("Session {}: flushing log failed: {}", session.id, e);
    }
    if let Err(e) = state.store.close_session(session.id, &error).await {
        warn!("Failed to close session {}: {}", session.id, e);
    }

    match result {
        Ok(()) => info!("Session {} closed", session.id),
        Err(e) => warn!("Session {} aborted: {}", session.id, e),
    }
    Ok(())
}

fn open_session_log(
    state: &ServerState,
    user: &User,
    host: &Host,
    upstream: &UpstreamChannel,
    session_id: u64,
) -> Result<SessionLog, SshError> {
    if !host.logging.is_enabled() {
        return Ok(SessionLog::disabled());
    }
    let path = session_log_path(
        &state.config.logs_location,
        &user.name,
        upstream.type_name(),
        session_id,
        Utc::now(),
    );
    Ok(SessionLog::create(&path)?)
}

/// Recorders for (user -> host, host -> user). Forwarded bytes are labelled
/// with the host they are heading to.
fn stream_logs(log: &SessionLog, upstream: &UpstreamChannel) -> (StreamLog, StreamLog) {
    match upstream {
        UpstreamChannel::Session => (StreamLog::ttyrec(log.clone()), StreamLog::ttyrec(log.clone())),
        UpstreamChannel::DirectTcpip {
            host,
            originator_host,
            ..
        } => (
            StreamLog::labelled(log.clone(), host.clone()),
            StreamLog::labelled(log.clone(), originator_host.clone()),
        ),
    }
}

fn directional(mode: LoggingMode, input: bool, log: StreamLog) -> Option<StreamLog> {
    let enabled = if input {
        mode.logs_input()
    } else {
        mode.logs_output()
    };
    enabled.then_some(log)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BastionConfig;
    use crate::store::{Acl, Group, RecordStore, RedbRecordStore, SessionStatus};
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        temp: TempDir,
        store: Arc<RedbRecordStore>,
        user: User,
        allowed_group: u64,
    }

    fn fixture() -> Fixture {
        let temp = tempdir().unwrap();
        let store = Arc::new(RedbRecordStore::open(&temp.path().join("db.redb")).unwrap());
        let acl = store
            .put_acl(Acl {
                action: "allow".to_string(),
                weight: 10,
                ..Default::default()
            })
            .unwrap();
        let user_group = store
            .put_user_group(Group {
                name: "ops".to_string(),
                acl_ids: vec![acl.id],
                ..Default::default()
            })
            .unwrap();
        let host_group = store
            .put_host_group(Group {
                name: "prod".to_string(),
                acl_ids: vec![acl.id],
                ..Default::default()
            })
            .unwrap();
        let user = store
            .put_user(User {
                name: "alice".to_string(),
                email: "alice@example.com".to_string(),
                group_ids: vec![user_group.id],
                ..Default::default()
            })
            .unwrap();
        Fixture {
            temp,
            store,
            user,
            allowed_group: host_group.id,
        }
    }

    impl Fixture {
        fn state(&self) -> ServerState {
            let config = BastionConfig {
                logs_location: self.temp.path().join("logs"),
                ..Default::default()
            };
            std::fs::create_dir_all(&config.logs_location).unwrap();
            let store: Arc<dyn RecordStore> = self.store.clone();
            ServerState::new(store, config)
        }

        fn host(&self, name: &str, group_ids: Vec<u64>, logging: LoggingMode) -> Host {
            self.store
                .put_host(Host {
                    name: name.to_string(),
                    addr: format!("{}.internal:22", name),
                    user: "root".to_string(),
                    password: "secret".to_string(),
                    group_ids,
                    logging,
                    ..Default::default()
                })
                .unwrap()
        }

        fn log_files(&self) -> Vec<std::path::PathBuf> {
            std::fs::read_dir(self.temp.path().join("logs"))
                .unwrap()
                .map(|entry| entry.unwrap().path())
                .collect()
        }
    }

    fn forward() -> UpstreamChannel {
        UpstreamChannel::DirectTcpip {
            host: "db.internal".to_string(),
            port: 5432,
            originator_host: "10.1.1.1".to_string(),
            originator_port: 40000,
        }
    }

    #[tokio::test]
    async fn test_unknown_host_leaves_no_session() {
        let f = fixture();
        let state = f.state();

        let err = admit(&state, &f.user, "nowhere").await.unwrap_err();
        assert!(matches!(err, SshError::UnknownHost(ref name) if name == "nowhere"));
        assert_eq!(err.to_string(), "unknown host \"nowhere\"");
        assert!(f.store.session(1).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_acl_deny_leaves_no_session() {
        let f = fixture();
        let state = f.state();
        f.host("vault", vec![], LoggingMode::Everything);

        let err = admit(&state, &f.user, "vault").await.unwrap_err();
        assert!(matches!(err, SshError::AccessDenied));
        assert!(f.store.session(1).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_admitted_host_has_plan() {
        let f = fixture();
        let state = f.state();
        f.host("web", vec![f.allowed_group], LoggingMode::Disabled);

        let (host, plan) = admit(&state, &f.user, "web").await.unwrap();
        assert_eq!(host.name, "web");
        assert_eq!(plan.len(), 1);
    }

    #[tokio::test]
    async fn test_clean_relay_closes_with_empty_error() {
        let f = fixture();
        let state = f.state();
        let host = f.host("web", vec![f.allowed_group], LoggingMode::Disabled);

        record_session(&state, &f.user, &host, &UpstreamChannel::Session, |streams| async move {
            assert!(streams.input.is_none());
            assert!(streams.output.is_none());
            Ok(())
        })
        .await
        .unwrap();

        let record = f.store.session(1).unwrap().unwrap();
        assert_eq!(record.status, SessionStatus::Closed);
        assert_eq!(record.error, "");
        assert!(record.stopped_at.is_some());
        assert!(f.log_files().is_empty());
    }

    #[tokio::test]
    async fn test_failed_relay_records_error() {
        let f = fixture();
        let state = f.state();
        let host = f.host("web", vec![f.allowed_group], LoggingMode::Input);

        record_session(&state, &f.user, &host, &UpstreamChannel::Session, |_| async {
            Err(RelayError::ChannelClosed("outbound"))
        })
        .await
        .unwrap();

        let record = f.store.session(1).unwrap().unwrap();
        assert_eq!(record.status, SessionStatus::Closed);
        assert_eq!(record.error, "outbound channel closed");
    }

    #[tokio::test]
    async fn test_unwritable_log_closes_session() {
        let f = fixture();
        let mut state = f.state();
        state.config.logs_location = f.temp.path().join("missing");
        let host = f.host("web", vec![f.allowed_group], LoggingMode::Everything);

        let ran = record_session(&state, &f.user, &host, &UpstreamChannel::Session, |_| async {
            panic!("relay must not start without its log");
        })
        .await;
        assert!(ran.is_err());

        let record = f.store.session(1).unwrap().unwrap();
        assert_eq!(record.status, SessionStatus::Closed);
        assert!(!record.error.is_empty());
    }

    #[tokio::test]
    async fn test_forwarded_bytes_are_labelled_by_destination() {
        let f = fixture();
        let state = f.state();
        let host = f.host("db", vec![f.allowed_group], LoggingMode::Everything);

        record_session(&state, &f.user, &host, &forward(), |streams| async move {
            let input = streams.input.unwrap();
            let output = streams.output.unwrap();
            input.record(b"SELECT 1;\n").await;
            output.record(b"1\n").await;
            Ok(())
        })
        .await
        .unwrap();

        // The log is complete once the session is closed
        let files = f.log_files();
        assert_eq!(files.len(), 1);
        let name = files[0].file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("alice-direct-tcpip-1-"));
        let content = std::fs::read(&files[0]).unwrap();
        assert_eq!(content, b"db.internal: SELECT 1;\n10.1.1.1: 1\n");
    }

    #[tokio::test]
    async fn test_input_mode_records_exec_but_not_output() {
        let f = fixture();
        let state = f.state();
        let host = f.host("web", vec![f.allowed_group], LoggingMode::Input);

        record_session(&state, &f.user, &host, &UpstreamChannel::Session, |streams| async move {
            assert!(streams.input.is_some());
            assert!(streams.output.is_none());
            streams.exec.record_line(b"id").await;
            Ok(())
        })
        .await
        .unwrap();

        let content = std::fs::read(&f.log_files()[0]).unwrap();
        assert_eq!(&content[crate::recorder::TTYREC_HEADER_LEN..], b"id\n");
    }

    #[test]
    fn test_directional_policy() {
        let log = StreamLog::disabled;
        assert!(directional(LoggingMode::Everything, true, log()).is_some());
        assert!(directional(LoggingMode::Everything, false, log()).is_some());
        assert!(directional(LoggingMode::Input, true, log()).is_some());
        assert!(directional(LoggingMode::Input, false, log()).is_none());
        assert!(directional(LoggingMode::Disabled, true, log()).is_none());
        assert!(directional(LoggingMode::Disabled, false, log()).is_none());
    }

    #[test]
    fn test_channel_type_names() {
        assert_eq!(UpstreamChannel::Session.type_name(), "session");
        assert_eq!(forward().type_name(), "direct-tcpip");
    }
}
