//! Out-of-band channel requests carried across the relay

use russh::{Pty, Sig};

/// A channel request as seen by the relay, independent of which side sent it
#[derive(Debug, Clone)]
pub enum ChannelRequest {
    Pty {
        term: String,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: Vec<(Pty, u32)>,
    },
    Shell,
    Exec {
        command: Vec<u8>,
    },
    Env {
        name: String,
        value: String,
    },
    WindowChange {
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    },
    Signal(Sig),
    Subsystem {
        name: String,
    },
    ExitStatus(u32),
    ExitSignal {
        signal: Sig,
        core_dumped: bool,
        error_message: String,
        lang_tag: String,
    },
}

impl ChannelRequest {
    /// Wire name of the request
    pub fn kind(&self) -> &'static str {
        match self {
            ChannelRequest::Pty { .. } => "pty-req",
            ChannelRequest::Shell => "shell",
            ChannelRequest::Exec { .. } => "exec",
            ChannelRequest::Env { .. } => "env",
            ChannelRequest::WindowChange { .. } => "window-change",
            ChannelRequest::Signal(_) => "signal",
            ChannelRequest::Subsystem { .. } => "subsystem",
            ChannelRequest::ExitStatus(_) => "exit-status",
            ChannelRequest::ExitSignal { .. } => "exit-signal",
        }
    }

    /// Whether clients conventionally send this request with want-reply set
    pub fn wants_reply(&self) -> bool {
        !matches!(
            self,
            ChannelRequest::WindowChange { .. }
                | ChannelRequest::Signal(_)
                | ChannelRequest::ExitStatus(_)
                | ChannelRequest::ExitSignal { .. }
        )
    }
}

/// A request waiting to be forwarded, with whether the sender expects a reply
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub request: ChannelRequest,
    pub want_reply: bool,
}

impl From<ChannelRequest> for IncomingRequest {
    fn from(request: ChannelRequest) -> Self {
        let want_reply = request.wants_reply();
        Self {
            request,
            want_reply,
        }
    }
}
