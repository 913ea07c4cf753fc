//! Upstream channel owner
//!
//! A `Channel<client::Msg>` cannot be read from several tasks, so a single owner
//! task holds it. Everything the upstream sends is demultiplexed onto a bounded
//! data queue and a bounded request queue; while one is full the owner stops
//! reading the channel, which leaves the remote window to throttle the peer.
//! Requests and close go through [`UpstreamController`]. Replies to our own
//! want-reply requests arrive in order, so they are matched against a FIFO of
//! pending oneshots. Data and EOF bypass the owner through channel writers.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

use super::endpoint::{
    ByteSink, ByteSource, ChannelCloser, Chunk, Endpoint, RequestSink, RequestSource,
};
use super::error::RelayError;
use super::request::{ChannelRequest, IncomingRequest};

const SIDE: &str = "outbound";
const DATA_QUEUE_DEPTH: usize = 64;
const REQUEST_QUEUE_DEPTH: usize = 16;
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

enum OwnerCommand {
    Request {
        request: ChannelRequest,
        want_reply: bool,
        reply_tx: oneshot::Sender<Result<bool, RelayError>>,
    },
    Close {
        reply_tx: oneshot::Sender<Result<(), RelayError>>,
    },
}

/// Cloneable handle to the owner task
#[derive(Clone)]
pub struct UpstreamController {
    cmd_tx: mpsc::Sender<OwnerCommand>,
}

impl UpstreamController {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, RelayError>>) -> OwnerCommand,
    ) -> Result<T, RelayError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(build(reply_tx))
            .await
            .map_err(|_| RelayError::ChannelClosed(SIDE))?;
        reply_rx.await.map_err(|_| RelayError::ChannelClosed(SIDE))?
    }

    pub async fn request(
        &self,
        request: ChannelRequest,
        want_reply: bool,
    ) -> Result<bool, RelayError> {
        self.call(|reply_tx| OwnerCommand::Request {
            request,
            want_reply,
            reply_tx,
        })
        .await
    }

    pub async fn close(&self) -> Result<(), RelayError> {
        // The owner may already be gone, which means the channel is closed.
        match self.call(|reply_tx| OwnerCommand::Close { reply_tx }).await {
            Err(RelayError::ChannelClosed(_)) => Ok(()),
            other => other,
        }
    }
}

enum Delivery {
    Data(Chunk),
    Request(IncomingRequest),
}

/// Queue `value`, handing it back when the queue is full. A queue nobody reads
/// anymore is dropped along with the value.
fn try_push<T>(tx: &mut Option<mpsc::Sender<T>>, value: T) -> Option<T> {
    let sender = tx.as_ref()?;
    match sender.try_send(value) {
        Ok(()) => None,
        Err(mpsc::error::TrySendError::Full(value)) => Some(value),
        Err(mpsc::error::TrySendError::Closed(_)) => {
            *tx = None;
            None
        }
    }
}

async fn room_in<T>(tx: Option<&mpsc::Sender<T>>) {
    if let Some(tx) = tx {
        // The permit is released right away; the owner is the only producer
        let _ = tx.reserve().await;
    }
}

/// Fan-out of upstream messages onto the data and request queues, holding at
/// most one message that did not fit
struct Demux {
    data_tx: Option<mpsc::Sender<Chunk>>,
    req_tx: Option<mpsc::Sender<IncomingRequest>>,
    held: Option<Delivery>,
}

impl Demux {
    fn new(data_tx: mpsc::Sender<Chunk>, req_tx: mpsc::Sender<IncomingRequest>) -> Self {
        Self {
            data_tx: Some(data_tx),
            req_tx: Some(req_tx),
            held: None,
        }
    }

    fn is_blocked(&self) -> bool {
        self.held.is_some()
    }

    fn push(&mut self, item: Delivery) {
        self.held = match item {
            Delivery::Data(chunk) => try_push(&mut self.data_tx, chunk).map(Delivery::Data),
            Delivery::Request(request) => {
                try_push(&mut self.req_tx, request).map(Delivery::Request)
            }
        };
    }

    /// Resolves once the held message fits. Cancel-safe.
    async fn room(&self) {
        match &self.held {
            Some(Delivery::Data(_)) => room_in(self.data_tx.as_ref()).await,
            Some(Delivery::Request(_)) => room_in(self.req_tx.as_ref()).await,
            None => std::future::pending().await,
        }
    }

    fn release(&mut self) {
        if let Some(item) = self.held.take() {
            self.push(item);
        }
    }

    fn end_data(&mut self) {
        self.data_tx = None;
    }

    fn end_all(&mut self) {
        self.data_tx = None;
        self.req_tx = None;
        self.held = None;
    }
}

/// Spawn the owner task for an opened upstream channel.
///
/// Returns the controller, the writer half, and the queues of upstream data and
/// upstream requests. The data queue ends at EOF, the request queue ends when
/// the channel closes.
pub fn spawn_channel_owner(
    channel: Channel<Msg>,
) -> (
    UpstreamController,
    UpstreamSink,
    mpsc::Receiver<Chunk>,
    mpsc::Receiver<IncomingRequest>,
) {
    let (cmd_tx, cmd_rx) = mpsc::channel::<OwnerCommand>(32);
    let (data_tx, data_rx) = mpsc::channel(DATA_QUEUE_DEPTH);
    let (req_tx, req_rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
    let (closed_tx, closed_rx) = watch::channel(false);

    let sink = UpstreamSink::new(
        Box::pin(channel.make_writer()),
        Box::pin(channel.make_writer_ext(Some(SSH_EXTENDED_DATA_STDERR))),
        closed_rx,
    );
    tokio::spawn(run_owner(
        channel,
        cmd_rx,
        Demux::new(data_tx, req_tx),
        closed_tx,
    ));

    (UpstreamController { cmd_tx }, sink, data_rx, req_rx)
}

async fn run_owner(
    mut channel: Channel<Msg>,
    mut cmd_rx: mpsc::Receiver<OwnerCommand>,
    mut demux: Demux,
    closed_tx: watch::Sender<bool>,
) {
    let channel_id = channel.id();
    let mut pending: VecDeque<oneshot::Sender<Result<bool, RelayError>>> = VecDeque::new();
    let mut remote_closed = false;
    let mut local_closed = false;

    debug!("Upstream owner started for channel {:?}", channel_id);

    loop {
        tokio::select! {
            _ = demux.room(), if demux.is_blocked() => demux.release(),
            msg = channel.wait(), if !remote_closed && !demux.is_blocked() => {
                match msg {
                    Some(ChannelMsg::Data { data }) => {
                        demux.push(Delivery::Data(Chunk::data(Bytes::copy_from_slice(&data))));
                    }
                    Some(ChannelMsg::ExtendedData { data, ext }) => {
                        demux.push(Delivery::Data(Chunk::extended(
                            ext,
                            Bytes::copy_from_slice(&data),
                        )));
                    }
                    Some(ChannelMsg::Eof) => {
                        trace!("Upstream EOF on channel {:?}", channel_id);
                        demux.end_data();
                    }
                    Some(ChannelMsg::Success) => {
                        if let Some(waiter) = pending.pop_front() {
                            let _ = waiter.send(Ok(true));
                        }
                    }
                    Some(ChannelMsg::Failure) => {
                        if let Some(waiter) = pending.pop_front() {
                            let _ = waiter.send(Ok(false));
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        demux.push(Delivery::Request(ChannelRequest::ExitStatus(exit_status).into()));
                    }
                    Some(ChannelMsg::ExitSignal {
                        signal_name,
                        core_dumped,
                        error_message,
                        lang_tag,
                    }) => {
                        demux.push(Delivery::Request(
                            ChannelRequest::ExitSignal {
                                signal: signal_name,
                                core_dumped,
                                error_message,
                                lang_tag,
                            }
                            .into(),
                        ));
                    }
                    Some(ChannelMsg::Close) | None => {
                        debug!("Upstream channel {:?} closed by peer", channel_id);
                        remote_closed = true;
                        closed_tx.send_replace(true);
                        demux.end_all();
                        for waiter in pending.drain(..) {
                            let _ = waiter.send(Ok(false));
                        }
                    }
                    Some(other) => {
                        trace!("Ignoring upstream message {:?}", other);
                    }
                }
            }
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    break;
                };
                match cmd {
                    OwnerCommand::Request {
                        request,
                        want_reply,
                        reply_tx,
                    } => {
                        if remote_closed || local_closed {
                            let _ = reply_tx.send(Ok(false));
                            continue;
                        }
                        match send_request(&channel, &request, want_reply).await {
                            Ok(true) if want_reply => pending.push_back(reply_tx),
                            Ok(_) => {
                                let _ = reply_tx.send(Ok(false));
                            }
                            Err(e) => {
                                let _ = reply_tx.send(Err(e));
                            }
                        }
                    }
                    OwnerCommand::Close { reply_tx } => {
                        let result = if remote_closed || local_closed {
                            Ok(())
                        } else {
                            local_closed = true;
                            closed_tx.send_replace(true);
                            channel
                                .close()
                                .await
                                .map_err(|e| RelayError::Send(SIDE, e.to_string()))
                        };
                        let _ = reply_tx.send(result);
                    }
                }
            }
        }
    }

    closed_tx.send_replace(true);
    if !remote_closed && !local_closed {
        if let Err(e) = channel.close().await {
            warn!("Closing upstream channel {:?}: {}", channel_id, e);
        }
    }
    debug!("Upstream owner terminated for channel {:?}", channel_id);
}

/// Put `request` on the wire. Returns whether it was sent, `false` for requests a
/// client never sends upstream.
async fn send_request(
    channel: &Channel<Msg>,
    request: &ChannelRequest,
    want_reply: bool,
) -> Result<bool, RelayError> {
    let sent = match request {
        ChannelRequest::Pty {
            term,
            col_width,
            row_height,
            pix_width,
            pix_height,
            modes,
        } => {
            channel
                .request_pty(
                    want_reply,
                    term,
                    *col_width,
                    *row_height,
                    *pix_width,
                    *pix_height,
                    modes,
                )
                .await
        }
        ChannelRequest::Shell => channel.request_shell(want_reply).await,
        ChannelRequest::Exec { command } => channel.exec(want_reply, command.clone()).await,
        ChannelRequest::Env { name, value } => {
            channel
                .set_env(want_reply, name.clone(), value.clone())
                .await
        }
        ChannelRequest::WindowChange {
            col_width,
            row_height,
            pix_width,
            pix_height,
        } => {
            channel
                .window_change(*col_width, *row_height, *pix_width, *pix_height)
                .await?;
            return Ok(false);
        }
        ChannelRequest::Signal(sig) => {
            channel.signal(sig.clone()).await?;
            return Ok(false);
        }
        ChannelRequest::Subsystem { name } => channel.request_subsystem(want_reply, name).await,
        ChannelRequest::ExitStatus(_) | ChannelRequest::ExitSignal { .. } => {
            debug!("Dropping {} request towards upstream", request.kind());
            return Ok(false);
        }
    };
    sent.map_err(|e| RelayError::Send(SIDE, e.to_string()))?;
    Ok(true)
}

impl From<russh::Error> for RelayError {
    fn from(e: russh::Error) -> Self {
        RelayError::Send(SIDE, e.to_string())
    }
}

pub struct UpstreamSource {
    data_rx: mpsc::Receiver<Chunk>,
}

#[async_trait]
impl ByteSource for UpstreamSource {
    async fn read(&mut self) -> Result<Option<Chunk>, RelayError> {
        Ok(self.data_rx.recv().await)
    }
}

type ChannelWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Writes user data straight onto the upstream channel.
///
/// A write waits for window space without involving the owner, so the owner
/// keeps reading while the peer is slow. Once the channel is closed, pending and
/// later writes are dropped.
pub struct UpstreamSink {
    stdout: ChannelWriter,
    stderr: ChannelWriter,
    closed: watch::Receiver<bool>,
}

impl UpstreamSink {
    pub fn new(stdout: ChannelWriter, stderr: ChannelWriter, closed: watch::Receiver<bool>) -> Self {
        Self {
            stdout,
            stderr,
            closed,
        }
    }
}

async fn unless_closed<F>(closed: &mut watch::Receiver<bool>, op: F) -> Result<(), RelayError>
where
    F: Future<Output = std::io::Result<()>> + Send,
{
    if *closed.borrow() {
        return Ok(());
    }
    tokio::select! {
        res = op => match res {
            Ok(()) => Ok(()),
            Err(_) if *closed.borrow() => Ok(()),
            Err(e) => Err(RelayError::Send(SIDE, e.to_string())),
        },
        _ = async { closed.wait_for(|closed| *closed).await.map(|_| ()) } => Ok(()),
    }
}

#[async_trait]
impl ByteSink for UpstreamSink {
    async fn write(&mut self, chunk: Chunk) -> Result<(), RelayError> {
        let Self {
            stdout,
            stderr,
            closed,
        } = self;
        let writer = match chunk.ext {
            Some(_) => stderr,
            None => stdout,
        };
        unless_closed(closed, writer.write_all(&chunk.data)).await
    }

    async fn close_write(&mut self) -> Result<(), RelayError> {
        let Self { stdout, closed, .. } = self;
        unless_closed(closed, stdout.shutdown()).await
    }
}

/// Requests the upstream sends us: only exit-status and exit-signal, which never
/// want a reply.
pub struct UpstreamRequests {
    req_rx: mpsc::Receiver<IncomingRequest>,
}

#[async_trait]
impl RequestSource for UpstreamRequests {
    async fn next_request(&mut self) -> Option<IncomingRequest> {
        self.req_rx.recv().await
    }

    async fn reply(&mut self, _accepted: bool) -> Result<(), RelayError> {
        Ok(())
    }
}

pub struct UpstreamRequester {
    controller: UpstreamController,
}

#[async_trait]
impl RequestSink for UpstreamRequester {
    async fn send_request(
        &mut self,
        request: &ChannelRequest,
        want_reply: bool,
    ) -> Result<bool, RelayError> {
        self.controller.request(request.clone(), want_reply).await
    }
}

pub struct UpstreamCloser {
    controller: UpstreamController,
}

#[async_trait]
impl ChannelCloser for UpstreamCloser {
    async fn close(&self) -> Result<(), RelayError> {
        self.controller.close().await
    }
}

/// Wrap an opened upstream channel as the outbound side of a relay
pub fn upstream_endpoint(channel: Channel<Msg>) -> Endpoint {
    let (controller, sink, data_rx, req_rx) = spawn_channel_owner(channel);
    Endpoint {
        name: SIDE,
        reader: Box::new(UpstreamSource { data_rx }),
        writer: Box::new(sink),
        requests: Box::new(UpstreamRequests { req_rx }),
        requester: Box::new(UpstreamRequester {
            controller: controller.clone(),
        }),
        closer: Arc::new(UpstreamCloser { controller }),
    }
}
