//! Relay Error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("{0} channel closed")]
    ChannelClosed(&'static str),

    #[error("Send failed on {0} channel: {1}")]
    Send(&'static str, String),

    #[error("Relay task failed: {0}")]
    Task(String),
}
