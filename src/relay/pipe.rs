//! Four-task bidirectional pipe
//!
//! Two byte-copy tasks and two request-forwarding tasks run concurrently and report
//! to a control loop through an error queue and a completion queue. The control loop
//! is the only place channels get fully closed:
//!
//! - a copy task that reaches EOF half-closes the *other* channel and exits;
//! - once a side has finished both its byte stream and its request stream (the peer
//!   closed that channel) the other channel is closed as well, after its half-close;
//! - when all four tasks are done both channels are closed and the pipe returns;
//! - the first error aborts every task, closes both channels and is returned.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::endpoint::{ByteSink, ByteSource, ChannelCloser, Endpoint, RequestSink, RequestSource};
use super::error::RelayError;
use super::request::ChannelRequest;
use crate::recorder::StreamLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    InboundBytes,
    OutboundBytes,
    InboundRequests,
    OutboundRequests,
}

#[derive(Default)]
struct Progress {
    inbound_bytes: bool,
    outbound_bytes: bool,
    inbound_requests: bool,
    outbound_requests: bool,
}

impl Progress {
    fn mark(&mut self, task: Task) {
        match task {
            Task::InboundBytes => self.inbound_bytes = true,
            Task::OutboundBytes => self.outbound_bytes = true,
            Task::InboundRequests => self.inbound_requests = true,
            Task::OutboundRequests => self.outbound_requests = true,
        }
    }

    /// The inbound peer sent EOF and closed its channel
    fn inbound_finished(&self) -> bool {
        self.inbound_bytes && self.inbound_requests
    }

    fn outbound_finished(&self) -> bool {
        self.outbound_bytes && self.outbound_requests
    }

    fn all_done(&self) -> bool {
        self.inbound_finished() && self.outbound_finished()
    }
}

/// Closes a channel at most once
struct Closer {
    name: &'static str,
    closer: Arc<dyn ChannelCloser>,
    closed: bool,
}

impl Closer {
    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.closer.close().await {
            debug!("Closing {} channel: {}", self.name, e);
        }
    }
}

/// Pipe `inbound` and `outbound` until both sides are done.
///
/// `exec_log` receives the command line of every `exec` request sent from the
/// inbound side.
pub async fn pipe(
    inbound: Endpoint,
    outbound: Endpoint,
    exec_log: StreamLog,
) -> Result<(), RelayError> {
    let (err_tx, mut err_rx) = mpsc::channel::<RelayError>(4);
    let (done_tx, mut done_rx) = mpsc::channel::<Task>(4);

    let mut inbound_closer = Closer {
        name: inbound.name,
        closer: inbound.closer,
        closed: false,
    };
    let mut outbound_closer = Closer {
        name: outbound.name,
        closer: outbound.closer,
        closed: false,
    };

    let tasks: Vec<JoinHandle<()>> = vec![
        spawn_task(
            Task::InboundBytes,
            copy_bytes(inbound.reader, outbound.writer),
            &err_tx,
            &done_tx,
        ),
        spawn_task(
            Task::OutboundBytes,
            copy_bytes(outbound.reader, inbound.writer),
            &err_tx,
            &done_tx,
        ),
        spawn_task(
            Task::InboundRequests,
            forward_requests(inbound.requests, outbound.requester, exec_log),
            &err_tx,
            &done_tx,
        ),
        spawn_task(
            Task::OutboundRequests,
            forward_requests(outbound.requests, inbound.requester, StreamLog::disabled()),
            &err_tx,
            &done_tx,
        ),
    ];
    drop(err_tx);
    drop(done_tx);

    let mut progress = Progress::default();
    let result = loop {
        tokio::select! {
            Some(err) = err_rx.recv() => {
                warn!("Relay aborted: {}", err);
                for task in &tasks {
                    task.abort();
                }
                break Err(err);
            }
            Some(task) = done_rx.recv() => {
                debug!("Relay task {:?} finished", task);
                progress.mark(task);

                if progress.all_done() {
                    break Ok(());
                }
                if progress.inbound_finished() {
                    outbound_closer.close().await;
                }
                if progress.outbound_finished() {
                    inbound_closer.close().await;
                }
            }
            else => {
                // Every task is gone without reporting; treat as a failure
                break Err(RelayError::Task("relay tasks exited unexpectedly".to_string()));
            }
        }
    };

    outbound_closer.close().await;
    inbound_closer.close().await;
    result
}

fn spawn_task<F>(
    task: Task,
    work: F,
    err_tx: &mpsc::Sender<RelayError>,
    done_tx: &mpsc::Sender<Task>,
) -> JoinHandle<()>
where
    F: std::future::Future<Output = Result<(), RelayError>> + Send + 'static,
{
    let err_tx = err_tx.clone();
    let done_tx = done_tx.clone();
    tokio::spawn(async move {
        match work.await {
            Ok(()) => {
                let _ = done_tx.send(task).await;
            }
            Err(e) => {
                let _ = err_tx.send(e).await;
            }
        }
    })
}

async fn copy_bytes(
    mut from: Box<dyn ByteSource>,
    mut to: Box<dyn ByteSink>,
) -> Result<(), RelayError> {
    while let Some(chunk) = from.read().await? {
        to.write(chunk).await?;
    }
    to.close_write().await
}

async fn forward_requests(
    mut from: Box<dyn RequestSource>,
    mut to: Box<dyn RequestSink>,
    exec_log: StreamLog,
) -> Result<(), RelayError> {
    while let Some(incoming) = from.next_request().await {
        if let ChannelRequest::Exec { command } = &incoming.request {
            exec_log.record_line(command).await;
        }

        let accepted = to.send_request(&incoming.request, incoming.want_reply).await?;
        debug!(
            "Forwarded {} request (want_reply={}, accepted={})",
            incoming.request.kind(),
            incoming.want_reply,
            accepted
        );
        if incoming.want_reply {
            from.reply(accepted).await?;
        }
    }
    Ok(())
}
