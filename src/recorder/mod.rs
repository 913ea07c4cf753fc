//! Session recording
//!
//! Session channels are recorded as ttyrec: every write becomes a 12-byte
//! little-endian header `[seconds:i32][microseconds:i32][length:i32]` followed by
//! the payload, so captures replay with their original timing. Forwarded TCP
//! traffic is recorded as plain text, each write prefixed with `"<host>: "`.

pub mod sink;

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

pub use sink::RecordingSink;

pub const TTYREC_HEADER_LEN: usize = 12;

/// Header preceding every recorded payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtyrecHeader {
    pub sec: i32,
    pub usec: i32,
    pub len: i32,
}

impl TtyrecHeader {
    pub fn new(at: SystemTime, len: usize) -> Self {
        let since_epoch = at.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self {
            sec: since_epoch.as_secs() as i32,
            usec: since_epoch.subsec_micros() as i32,
            len: len as i32,
        }
    }

    pub fn encode(&self) -> [u8; TTYREC_HEADER_LEN] {
        let mut buf = [0u8; TTYREC_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.sec.to_le_bytes());
        buf[4..8].copy_from_slice(&self.usec.to_le_bytes());
        buf[8..12].copy_from_slice(&self.len.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        let header: &[u8; TTYREC_HEADER_LEN] = buf.get(..TTYREC_HEADER_LEN)?.try_into().ok()?;
        let field = |i: usize| i32::from_le_bytes([header[i], header[i + 1], header[i + 2], header[i + 3]]);
        Some(Self {
            sec: field(0),
            usec: field(4),
            len: field(8),
        })
    }
}

/// Write one ttyrec frame
pub fn write_frame<W: Write + ?Sized>(out: &mut W, at: SystemTime, payload: &[u8]) -> io::Result<()> {
    out.write_all(&TtyrecHeader::new(at, payload.len()).encode())?;
    out.write_all(payload)
}

/// Write one labelled text record
pub fn write_labelled<W: Write + ?Sized>(out: &mut W, label: &str, payload: &[u8]) -> io::Result<()> {
    out.write_all(label.as_bytes())?;
    out.write_all(b": ")?;
    out.write_all(payload)
}

const LOG_QUEUE_DEPTH: usize = 64;

enum LogOp {
    Write(Vec<u8>),
    Flush(oneshot::Sender<io::Result<()>>),
}

/// Shared append-only log for one relayed channel
///
/// Cloned into each task that records. Frames are built by the caller and
/// written by a blocking writer task, so file I/O never runs on the async
/// workers. A failing write is logged and the session keeps relaying. A
/// disabled log accepts and discards writes.
#[derive(Clone)]
pub struct SessionLog {
    tx: Option<mpsc::Sender<LogOp>>,
}

impl SessionLog {
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Start the writer task for `writer`. Must be called inside a tokio runtime.
    pub fn from_writer(writer: Box<dyn Write + Send>) -> Self {
        let (tx, rx) = mpsc::channel(LOG_QUEUE_DEPTH);
        tokio::task::spawn_blocking(move || run_writer(writer, rx));
        Self { tx: Some(tx) }
    }

    /// Create the log file, readable by the owner's group
    pub fn create(path: &Path) -> io::Result<Self> {
        let mut options = OpenOptions::new();
        options.write(true).create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o640);
        }
        let file: File = options.open(path)?;
        info!("Recording session to {:?}", path);
        Ok(Self::from_writer(Box::new(file)))
    }

    async fn append(&self, bytes: Vec<u8>) {
        if let Some(tx) = &self.tx {
            if tx.send(LogOp::Write(bytes)).await.is_err() {
                debug!("Session log writer is gone, dropping record");
            }
        }
    }

    /// Wait until everything queued so far has been written and flushed
    pub async fn flush(&self) -> io::Result<()> {
        let Some(tx) = &self.tx else {
            return Ok(());
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        let gone = || io::Error::new(io::ErrorKind::BrokenPipe, "session log writer is gone");
        tx.send(LogOp::Flush(ack_tx)).await.map_err(|_| gone())?;
        ack_rx.await.map_err(|_| gone())?
    }
}

fn run_writer(mut out: Box<dyn Write + Send>, mut rx: mpsc::Receiver<LogOp>) {
    let mut failed = false;
    while let Some(op) = rx.blocking_recv() {
        match op {
            LogOp::Write(bytes) => {
                if let Err(e) = out.write_all(&bytes) {
                    if !failed {
                        warn!("Session log write failed, recording is incomplete: {}", e);
                    }
                    failed = true;
                }
            }
            LogOp::Flush(ack) => {
                let _ = ack.send(out.flush());
            }
        }
    }
    if let Err(e) = out.flush() {
        warn!("Session log flush failed: {}", e);
    }
}

/// How writes of one direction are recorded into a [`SessionLog`]
#[derive(Clone)]
pub struct StreamLog {
    log: SessionLog,
    label: Option<String>,
}

impl StreamLog {
    /// ttyrec frames
    pub fn ttyrec(log: SessionLog) -> Self {
        Self { log, label: None }
    }

    /// `"<label>: "` prefixed text
    pub fn labelled(log: SessionLog, label: impl Into<String>) -> Self {
        Self {
            log,
            label: Some(label.into()),
        }
    }

    pub fn disabled() -> Self {
        Self::ttyrec(SessionLog::disabled())
    }

    /// Encode one record the way this stream writes it
    fn encode(&self, at: SystemTime, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(TTYREC_HEADER_LEN + payload.len());
        // Writing into a Vec cannot fail
        let _ = match &self.label {
            Some(label) => write_labelled(&mut out, label, payload),
            None => write_frame(&mut out, at, payload),
        };
        out
    }

    pub async fn record(&self, payload: &[u8]) {
        if payload.is_empty() || self.log.tx.is_none() {
            return;
        }
        self.log.append(self.encode(SystemTime::now(), payload)).await;
    }

    /// Record `payload` followed by a newline as a single write
    pub async fn record_line(&self, payload: &[u8]) {
        let mut line = Vec::with_capacity(payload.len() + 1);
        line.extend_from_slice(payload);
        line.push(b'\n');
        self.record(&line).await;
    }
}

/// `<root>/<user>-<channel type>-<session id>-<RFC3339 timestamp>`
pub fn session_log_path(
    root: &Path,
    user: &str,
    channel_type: &str,
    session_id: u64,
    at: DateTime<Utc>,
) -> PathBuf {
    let user: String = user
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    root.join(format!(
        "{}-{}-{}-{}",
        user,
        channel_type,
        session_id,
        at.to_rfc3339_opts(SecondsFormat::Secs, true)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    /// Writer that keeps what was written for inspection
    #[derive(Clone, Default)]
    pub(crate) struct SharedBuf(pub Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Writer on a full disk
    pub(crate) struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::other("no space left on device"))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_frame_layout() {
        let at = UNIX_EPOCH + Duration::new(1_700_000_000, 123_456_000);
        let mut out = Vec::new();
        write_frame(&mut out, at, b"hello world").unwrap();

        assert_eq!(out.len(), TTYREC_HEADER_LEN + 11);
        let header = TtyrecHeader::decode(&out).unwrap();
        assert_eq!(header.sec, 1_700_000_000);
        assert_eq!(header.usec, 123_456);
        assert_eq!(header.len, 11);
        assert_eq!(&out[TTYREC_HEADER_LEN..], b"hello world");
    }

    #[test]
    fn test_header_is_little_endian() {
        let header = TtyrecHeader { sec: 1, usec: 2, len: 0x0102 };
        assert_eq!(header.encode(), [1, 0, 0, 0, 2, 0, 0, 0, 0x02, 0x01, 0, 0]);
        assert_eq!(TtyrecHeader::decode(&[0u8; 5]), None);
    }

    #[tokio::test]
    async fn test_labelled_stream() {
        let buf = SharedBuf::default();
        let log = SessionLog::from_writer(Box::new(buf.clone()));
        let stream = StreamLog::labelled(log.clone(), "10.0.0.5");

        stream.record(b"GET / HTTP/1.1\r\n").await;
        log.flush().await.unwrap();
        assert_eq!(&*buf.0.lock(), b"10.0.0.5: GET / HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn test_record_line_is_one_frame() {
        let buf = SharedBuf::default();
        let log = SessionLog::from_writer(Box::new(buf.clone()));
        let stream = StreamLog::ttyrec(log.clone());

        stream.record_line(b"uname -a").await;
        log.flush().await.unwrap();
        let out = buf.0.lock();
        let header = TtyrecHeader::decode(&out).unwrap();
        assert_eq!(header.len, 9);
        assert_eq!(&out[TTYREC_HEADER_LEN..], b"uname -a\n");
    }

    #[tokio::test]
    async fn test_records_keep_their_order() {
        let buf = SharedBuf::default();
        let log = SessionLog::from_writer(Box::new(buf.clone()));
        let input = StreamLog::labelled(log.clone(), "db.internal");
        let output = StreamLog::labelled(log.clone(), "10.1.1.1");

        input.record(b"ping\n").await;
        output.record(b"pong\n").await;
        input.record(b"quit\n").await;
        log.flush().await.unwrap();

        assert_eq!(
            &*buf.0.lock(),
            b"db.internal: ping\n10.1.1.1: pong\ndb.internal: quit\n"
        );
    }

    #[tokio::test]
    async fn test_write_failure_is_not_fatal() {
        let log = SessionLog::from_writer(Box::new(FailingWriter));
        let stream = StreamLog::ttyrec(log.clone());

        stream.record(b"first").await;
        stream.record(b"second").await;
        // The writer survives and still answers flushes
        assert!(log.flush().await.is_ok());
    }

    #[tokio::test]
    async fn test_disabled_log_discards() {
        let stream = StreamLog::disabled();
        stream.record(b"secret").await;
        assert!(SessionLog::disabled().flush().await.is_ok());
    }

    #[tokio::test]
    async fn test_log_file_path_and_creation() {
        let dir = tempdir().unwrap();
        let at = DateTime::parse_from_rfc3339("2024-05-01T10:20:30Z")
            .unwrap()
            .with_timezone(&Utc);
        let path = session_log_path(dir.path(), "db/1", "session", 7, at);
        assert_eq!(
            path.file_name().unwrap().to_string_lossy(),
            "db_1-session-7-2024-05-01T10:20:30Z"
        );

        let log = SessionLog::create(&path).unwrap();
        StreamLog::ttyrec(log.clone()).record(b"x").await;
        log.flush().await.unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 13);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o002, 0);
        }
    }
}
