//! Endpoint abstraction for the relay
//!
//! A relayed channel is split into five capabilities so that each of the four relay
//! tasks owns exactly what it needs: a byte source, a byte sink, a request source,
//! a request sink, and a shared closer.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::error::RelayError;
use super::request::{ChannelRequest, IncomingRequest};

/// A block of channel data; `ext` is set for extended data (stderr is 1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub data: Bytes,
    pub ext: Option<u32>,
}

impl Chunk {
    pub fn data(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            ext: None,
        }
    }

    pub fn extended(ext: u32, data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            ext: Some(ext),
        }
    }
}

#[async_trait]
pub trait ByteSource: Send {
    /// Next chunk, or `None` once the peer sent EOF
    async fn read(&mut self) -> Result<Option<Chunk>, RelayError>;
}

#[async_trait]
pub trait ByteSink: Send {
    async fn write(&mut self, chunk: Chunk) -> Result<(), RelayError>;

    /// Half-close: no more data will be written
    async fn close_write(&mut self) -> Result<(), RelayError>;
}

#[async_trait]
pub trait RequestSource: Send {
    /// Next request, or `None` once the channel is closed
    async fn next_request(&mut self) -> Option<IncomingRequest>;

    /// Answer the most recent request that asked for a reply
    async fn reply(&mut self, accepted: bool) -> Result<(), RelayError>;
}

#[async_trait]
pub trait RequestSink: Send {
    /// Send a request and, if `want_reply`, wait for the peer's answer
    async fn send_request(
        &mut self,
        request: &ChannelRequest,
        want_reply: bool,
    ) -> Result<bool, RelayError>;
}

#[async_trait]
pub trait ChannelCloser: Send + Sync {
    async fn close(&self) -> Result<(), RelayError>;
}

/// One side of a relay
pub struct Endpoint {
    pub name: &'static str,
    pub reader: Box<dyn ByteSource>,
    pub writer: Box<dyn ByteSink>,
    pub requests: Box<dyn RequestSource>,
    pub requester: Box<dyn RequestSink>,
    pub closer: Arc<dyn ChannelCloser>,
}
