//! Channel relay
//!
//! Pipes one inbound channel to one upstream channel. Both sides are expressed
//! as an [`Endpoint`] so the four-task pipe does not care which SSH role owns
//! the channel.

pub mod endpoint;
pub mod error;
pub mod inbound;
pub mod pipe;
pub mod request;
pub mod upstream;

pub use endpoint::{
    ByteSink, ByteSource, ChannelCloser, Chunk, Endpoint, RequestSink, RequestSource,
};
pub use error::RelayError;
pub use inbound::{inbound_endpoint, InboundFeed, InboundWriter, PendingRequest};
pub use pipe::pipe;
pub use request::{ChannelRequest, IncomingRequest};
pub use upstream::upstream_endpoint;
