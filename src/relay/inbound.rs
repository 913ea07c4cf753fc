//! Inbound (user-facing) side of a relay
//!
//! The server handler receives data, EOF and requests through its callbacks and
//! pushes them into an [`InboundFeed`]. Both queues are bounded: a full queue
//! holds the callback, which holds russh's session loop, which stops the window
//! from being replenished. Writes back to the user go through the server `Handle`.

use std::sync::Arc;

use async_trait::async_trait;
use russh::server::Handle;
use russh::{ChannelId, CryptoVec};
use tokio::sync::{mpsc, oneshot};

use super::endpoint::{
    ByteSink, ByteSource, ChannelCloser, Chunk, Endpoint, RequestSink, RequestSource,
};
use super::error::RelayError;
use super::request::{ChannelRequest, IncomingRequest};

const SIDE: &str = "inbound";
const DATA_QUEUE_DEPTH: usize = 64;
const REQUEST_QUEUE_DEPTH: usize = 16;

/// A request from the user plus where its verdict goes
#[derive(Debug)]
pub struct PendingRequest {
    pub request: IncomingRequest,
    verdict_tx: Option<oneshot::Sender<bool>>,
}

/// Producer half kept by the server handler for one channel
#[derive(Debug)]
pub struct InboundFeed {
    data_tx: Option<mpsc::Sender<Chunk>>,
    req_tx: Option<mpsc::Sender<PendingRequest>>,
}

impl InboundFeed {
    pub fn channel() -> (
        Self,
        mpsc::Receiver<Chunk>,
        mpsc::Receiver<PendingRequest>,
    ) {
        let (data_tx, data_rx) = mpsc::channel(DATA_QUEUE_DEPTH);
        let (req_tx, req_rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        (
            Self {
                data_tx: Some(data_tx),
                req_tx: Some(req_tx),
            },
            data_rx,
            req_rx,
        )
    }

    /// Queue user data, waiting while the relay is behind
    pub async fn data(&self, chunk: Chunk) {
        if let Some(tx) = &self.data_tx {
            let _ = tx.send(chunk).await;
        }
    }

    /// The user sent EOF
    pub fn eof(&mut self) {
        self.data_tx = None;
    }

    /// Queue a request for the relay.
    ///
    /// Requests that take a reply wait for the upstream's verdict, so the reply
    /// can be sent from the callback that received the request. Returns `None`
    /// for requests that never take a reply, `Some(false)` once nobody is
    /// listening anymore.
    pub async fn request(&self, request: ChannelRequest) -> Option<bool> {
        let request = IncomingRequest::from(request);
        let want_reply = request.want_reply;
        let Some(tx) = &self.req_tx else {
            return want_reply.then_some(false);
        };

        if !want_reply {
            let _ = tx
                .send(PendingRequest {
                    request,
                    verdict_tx: None,
                })
                .await;
            return None;
        }

        let (verdict_tx, verdict_rx) = oneshot::channel();
        let pending = PendingRequest {
            request,
            verdict_tx: Some(verdict_tx),
        };
        if tx.send(pending).await.is_err() {
            return Some(false);
        }
        Some(verdict_rx.await.unwrap_or(false))
    }

    /// The user closed the channel
    pub fn close(&mut self) {
        self.data_tx = None;
        self.req_tx = None;
    }
}

pub struct InboundSource {
    data_rx: mpsc::Receiver<Chunk>,
}

#[async_trait]
impl ByteSource for InboundSource {
    async fn read(&mut self) -> Result<Option<Chunk>, RelayError> {
        Ok(self.data_rx.recv().await)
    }
}

/// Writes to the user through the server handle
#[derive(Clone)]
pub struct InboundWriter {
    handle: Handle,
    channel_id: ChannelId,
}

impl InboundWriter {
    pub fn new(handle: Handle, channel_id: ChannelId) -> Self {
        Self { handle, channel_id }
    }

    pub async fn data(&self, chunk: &Chunk) -> Result<(), RelayError> {
        let data = CryptoVec::from_slice(&chunk.data);
        let sent = match chunk.ext {
            Some(ext) => self.handle.extended_data(self.channel_id, ext, data).await,
            None => self.handle.data(self.channel_id, data).await,
        };
        sent.map_err(|_| RelayError::Send(SIDE, "session is gone".to_string()))
    }

    pub async fn eof(&self) -> Result<(), RelayError> {
        self.handle
            .eof(self.channel_id)
            .await
            .map_err(|_| RelayError::Send(SIDE, "session is gone".to_string()))
    }

    pub async fn exit_status(&self, status: u32) -> Result<(), RelayError> {
        self.handle
            .exit_status_request(self.channel_id, status)
            .await
            .map_err(|_| RelayError::Send(SIDE, "session is gone".to_string()))
    }

    pub async fn close(&self) -> Result<(), RelayError> {
        self.handle
            .close(self.channel_id)
            .await
            .map_err(|_| RelayError::Send(SIDE, "session is gone".to_string()))
    }

    /// Print an admission error on the channel and end it with exit status 1
    pub async fn reject(&self, message: &str) {
        let _ = self.data(&rejection(message)).await;
        let _ = self.exit_status(1).await;
        let _ = self.eof().await;
        let _ = self.close().await;
    }
}

/// The line shown to a user whose channel was refused
fn rejection(message: &str) -> Chunk {
    Chunk::data(format!("error: {}\n", message))
}

#[async_trait]
impl ByteSink for InboundWriter {
    async fn write(&mut self, chunk: Chunk) -> Result<(), RelayError> {
        self.data(&chunk).await
    }

    async fn close_write(&mut self) -> Result<(), RelayError> {
        self.eof().await
    }
}

/// Requests from the user. The verdict goes back to the waiting callback, which
/// answers the client.
pub struct InboundRequests {
    req_rx: mpsc::Receiver<PendingRequest>,
    verdict_tx: Option<oneshot::Sender<bool>>,
}

#[async_trait]
impl RequestSource for InboundRequests {
    async fn next_request(&mut self) -> Option<IncomingRequest> {
        let pending = self.req_rx.recv().await?;
        self.verdict_tx = pending.verdict_tx;
        Some(pending.request)
    }

    async fn reply(&mut self, accepted: bool) -> Result<(), RelayError> {
        if let Some(tx) = self.verdict_tx.take() {
            // The callback is gone when the user closed the channel meanwhile
            let _ = tx.send(accepted);
        }
        Ok(())
    }
}

/// Requests the upstream sends towards the user. Only exit-status and exit-signal
/// can be expressed on the server side.
pub struct InboundRequester {
    writer: InboundWriter,
}

#[async_trait]
impl RequestSink for InboundRequester {
    async fn send_request(
        &mut self,
        request: &ChannelRequest,
        _want_reply: bool,
    ) -> Result<bool, RelayError> {
        let writer = &self.writer;
        let sent = match request {
            ChannelRequest::ExitStatus(status) => {
                writer
                    .handle
                    .exit_status_request(writer.channel_id, *status)
                    .await
            }
            ChannelRequest::ExitSignal {
                signal,
                core_dumped,
                error_message,
                lang_tag,
            } => {
                writer
                    .handle
                    .exit_signal_request(
                        writer.channel_id,
                        signal.clone(),
                        *core_dumped,
                        error_message.clone(),
                        lang_tag.clone(),
                    )
                    .await
            }
            other => {
                tracing::debug!("Dropping {} request towards user", other.kind());
                return Ok(false);
            }
        };
        sent.map_err(|_| RelayError::Send(SIDE, "session is gone".to_string()))?;
        Ok(true)
    }
}

pub struct InboundCloser {
    writer: InboundWriter,
}

#[async_trait]
impl ChannelCloser for InboundCloser {
    async fn close(&self) -> Result<(), RelayError> {
        self.writer.close().await
    }
}

/// Build the inbound side of a relay from the receivers of an [`InboundFeed`]
pub fn inbound_endpoint(
    writer: InboundWriter,
    data_rx: mpsc::Receiver<Chunk>,
    req_rx: mpsc::Receiver<PendingRequest>,
) -> Endpoint {
    Endpoint {
        name: SIDE,
        reader: Box::new(InboundSource { data_rx }),
        writer: Box::new(writer.clone()),
        requests: Box::new(InboundRequests {
            req_rx,
            verdict_tx: None,
        }),
        requester: Box::new(InboundRequester {
            writer: writer.clone(),
        }),
        closer: Arc::new(InboundCloser { writer }),
    }
}
