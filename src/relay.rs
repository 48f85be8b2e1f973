//! Line-oriented conduit to a sandbox's standard streams.
//!
//! A background pump owns the stdout reader and forwards complete lines over
//! a channel, so a read that times out never loses buffered output. stderr is
//! drained concurrently into a bounded tail buffer. The relay never kills the
//! process; it only reports what it observes.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::types::RelayConfig;
use crate::sandbox::SandboxStdio;

/// Lines buffered between the stdout pump and the reader.
const LINE_CHANNEL_CAPACITY: usize = 64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("no response before the deadline")]
    Timeout,

    #[error("output stream closed")]
    Closed,

    #[error("input stream closed by the program")]
    BrokenPipe,

    #[error("read cancelled by a termination request")]
    Cancelled,

    #[error("response line exceeds {limit} bytes")]
    Oversized { limit: usize },

    #[error("response is not valid UTF-8")]
    InvalidUtf8,

    #[error("relay IO error: {0}")]
    Io(String),
}

/// What the stdout pump forwards to the reader.
#[derive(Debug)]
enum LineEvent {
    Line(String),
    Oversized,
    InvalidUtf8,
    Failed(String),
}

/// Ring buffer keeping the last `capacity` bytes written to it.
#[derive(Debug)]
pub struct StderrTail {
    buf: VecDeque<u8>,
    capacity: usize,
    total: u64,
}

impl StderrTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity.min(64 * 1024)),
            capacity,
            total: 0,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.total += bytes.len() as u64;
        if self.capacity == 0 {
            return;
        }

        let bytes = if bytes.len() > self.capacity {
            &bytes[bytes.len() - self.capacity..]
        } else {
            bytes
        };
        let overflow = (self.buf.len() + bytes.len()).saturating_sub(self.capacity);
        self.buf.drain(..overflow);
        self.buf.extend(bytes);
    }

    /// Retained bytes as text; a multi-byte character cut at the front is
    /// replaced rather than rejected.
    pub fn contents(&self) -> String {
        let (front, back) = self.buf.as_slices();
        let mut bytes = Vec::with_capacity(self.buf.len());
        bytes.extend_from_slice(front);
        bytes.extend_from_slice(back);
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Bytes were dropped from the front.
    pub fn truncated(&self) -> bool {
        self.total > self.buf.len() as u64
    }

    pub fn total_bytes(&self) -> u64 {
        self.total
    }
}

/// What the relay captured once the streams are closed.
#[derive(Debug, Clone, Default)]
pub struct RelayOutput {
    pub stderr_tail: String,
    pub stderr_truncated: bool,
    pub stderr_bytes: u64,
}

pub struct IoRelay {
    stdin: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    lines: mpsc::Receiver<LineEvent>,
    stop: CancellationToken,
    max_line_bytes: usize,
    stdout_pump: JoinHandle<()>,
    stderr_pump: JoinHandle<()>,
    stderr: Arc<Mutex<StderrTail>>,
}

impl IoRelay {
    /// Attach to the streams of a launched sandbox. `stop` is the handle's
    /// stop token: once it fires, pending reads and writes return `Cancelled`.
    pub fn attach(stdio: SandboxStdio, stop: CancellationToken, config: &RelayConfig) -> Self {
        let (tx, lines) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let stderr = Arc::new(Mutex::new(StderrTail::new(config.stderr_tail_bytes)));

        let stdout_pump = tokio::spawn(pump_stdout(stdio.stdout, config.max_line_bytes, tx));
        let stderr_pump = tokio::spawn(pump_stderr(stdio.stderr, stderr.clone()));

        Self {
            stdin: Some(stdio.stdin),
            lines,
            stop,
            max_line_bytes: config.max_line_bytes,
            stdout_pump,
            stderr_pump,
            stderr,
        }
    }

    /// Write `text` followed by a newline and flush it.
    pub async fn write_line(&mut self, text: &str) -> Result<(), RelayError> {
        let stdin = self.stdin.as_mut().ok_or(RelayError::BrokenPipe)?;
        let mut line = String::with_capacity(text.len() + 1);
        line.push_str(text);
        line.push('\n');

        let write = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        };

        tokio::select! {
            biased;
            _ = self.stop.cancelled() => Err(RelayError::Cancelled),
            result = write => result.map_err(map_write_error),
        }
    }

    /// Wait for the next stdout line until `deadline`.
    pub async fn read_line(&mut self, deadline: Instant) -> Result<String, RelayError> {
        tokio::select! {
            biased;
            event = self.lines.recv() => match event {
                Some(LineEvent::Line(line)) => {
                    trace!(len = line.len(), "Line received");
                    Ok(line)
                }
                Some(LineEvent::Oversized) => Err(RelayError::Oversized {
                    limit: self.max_line_bytes,
                }),
                Some(LineEvent::InvalidUtf8) => Err(RelayError::InvalidUtf8),
                Some(LineEvent::Failed(message)) => Err(RelayError::Io(message)),
                None => Err(RelayError::Closed),
            },
            _ = self.stop.cancelled() => Err(RelayError::Cancelled),
            _ = sleep_until(deadline) => Err(RelayError::Timeout),
        }
    }

    /// Signal end of input to the program.
    pub async fn close_stdin(&mut self) {
        if let Some(mut stdin) = self.stdin.take() {
            if let Err(e) = stdin.shutdown().await {
                debug!(error = %e, "stdin shutdown failed");
            }
        }
    }

    /// Stop relaying and collect the stderr tail.
    ///
    /// Waits up to `drain` for stderr to reach end of file; both pumps are
    /// gone when this returns.
    pub async fn finish(mut self, drain: Duration) -> RelayOutput {
        self.stdin = None;
        self.lines.close();
        self.stdout_pump.abort();

        if timeout(drain, &mut self.stderr_pump).await.is_err() {
            warn!("stderr still open after teardown, discarding the rest");
            self.stderr_pump.abort();
        }
        let _ = (&mut self.stdout_pump).await;

        let tail = self.stderr.lock().await;
        RelayOutput {
            stderr_tail: tail.contents(),
            stderr_truncated: tail.truncated(),
            stderr_bytes: tail.total_bytes(),
        }
    }
}

fn map_write_error(e: io::Error) -> RelayError {
    match e.kind() {
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => RelayError::BrokenPipe,
        _ => RelayError::Io(e.to_string()),
    }
}

async fn pump_stdout(
    stdout: Box<dyn AsyncRead + Send + Unpin>,
    max_line_bytes: usize,
    tx: mpsc::Sender<LineEvent>,
) {
    let mut frames = FramedRead::new(stdout, LinesCodec::new_with_max_length(max_line_bytes));

    while let Some(frame) = frames.next().await {
        let (event, last) = match frame {
            Ok(line) => (LineEvent::Line(line), false),
            Err(LinesCodecError::MaxLineLengthExceeded) => (LineEvent::Oversized, true),
            Err(LinesCodecError::Io(e)) if e.kind() == io::ErrorKind::InvalidData => {
                (LineEvent::InvalidUtf8, true)
            }
            Err(LinesCodecError::Io(e)) => (LineEvent::Failed(e.to_string()), true),
        };
        if tx.send(event).await.is_err() || last {
            break;
        }
    }
    debug!("stdout closed");
}

async fn pump_stderr(mut stderr: Box<dyn AsyncRead + Send + Unpin>, tail: Arc<Mutex<StderrTail>>) {
    let mut buf = vec![0u8; 4096];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => tail.lock().await.push(&buf[..n]),
            Err(e) => {
                debug!(error = %e, "stderr read failed");
                break;
            }
        }
    }
}
