//! Byte sink that records what passes through it

use async_trait::async_trait;

use super::StreamLog;
use crate::relay::{ByteSink, Chunk, RelayError};

/// Records every chunk into a [`StreamLog`] before handing it to the inner sink
pub struct RecordingSink {
    inner: Box<dyn ByteSink>,
    log: StreamLog,
}

impl RecordingSink {
    pub fn new(inner: Box<dyn ByteSink>, log: StreamLog) -> Self {
        Self { inner, log }
    }

    /// Wrap `inner` only when this direction is recorded
    pub fn wrap(inner: Box<dyn ByteSink>, log: Option<StreamLog>) -> Box<dyn ByteSink> {
        match log {
            Some(log) => Box::new(Self::new(inner, log)),
            None => inner,
        }
    }
}

#[async_trait]
impl ByteSink for RecordingSink {
    async fn write(&mut self, chunk: Chunk) -> Result<(), RelayError> {
        self.log.record(&chunk.data).await;
        self.inner.write(chunk).await
    }

    async fn close_write(&mut self) -> Result<(), RelayError> {
        self.inner.close_write().await
    }
}
