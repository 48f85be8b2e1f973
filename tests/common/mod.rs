//! In-memory sandbox backend for driving the harness without processes.
//!
//! The "program" is a task answering each request line through a responder
//! closure. Faults can be injected at launch, write, read, wait and release.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{
    duplex, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream,
    ReadBuf,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use judgelet::config::JudgeletConfig;
use judgelet::error::{JudgeletError, Result};
use judgelet::sandbox::{
    BackendCapabilities, Launched, RawExit, SandboxBackend, SandboxInfo, SandboxInstance,
    SandboxSpec, SandboxStdio, StopSignal,
};

const SIGTERM: i32 = 15;
const SIGKILL: i32 = 9;

/// How the scripted program reacts to one request line.
#[derive(Debug, Clone)]
pub enum Reply {
    Line(String),
    /// Write raw bytes to stdout (no newline added)
    Raw(Vec<u8>),
    Silent,
    Stderr(String),
    Exit(i32),
    /// Killed by the kernel for exceeding its memory ceiling
    OomKill,
}

pub type Responder = Arc<dyn Fn(&str) -> Reply + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    None,
    Launch,
    Write,
    Read,
    Wait,
    Release,
}

pub struct ScriptedBackend {
    responder: Responder,
    fault: Fault,
    memory: u64,
    memory_after: Option<(Duration, u64)>,
    ignore_graceful: bool,
    pub stats: Arc<Stats>,
}

#[derive(Debug, Default)]
pub struct Stats {
    pub launches: AtomicUsize,
    pub releases: AtomicUsize,
    pub graceful_signals: AtomicUsize,
    pub forced_signals: AtomicUsize,
}

impl Stats {
    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

impl ScriptedBackend {
    pub fn new(responder: impl Fn(&str) -> Reply + Send + Sync + 'static) -> Self {
        Self {
            responder: Arc::new(responder),
            fault: Fault::None,
            memory: 4096,
            memory_after: None,
            ignore_graceful: false,
            stats: Arc::new(Stats::default()),
        }
    }

    /// Answers `echo <n>` with `<n>`.
    pub fn echo() -> Self {
        Self::new(|request| {
            let arg = request.split_once(' ').map(|(_, a)| a).unwrap_or("");
            Reply::Line(arg.to_string())
        })
    }

    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.fault = fault;
        self
    }

    /// Memory reported to the monitor on every sample.
    pub fn with_memory(mut self, bytes: u64) -> Self {
        self.memory = bytes;
        self
    }

    /// Memory reported once `after` has passed since launch.
    pub fn with_memory_after(mut self, after: Duration, bytes: u64) -> Self {
        self.memory_after = Some((after, bytes));
        self
    }

    pub fn ignoring_sigterm(mut self) -> Self {
        self.ignore_graceful = true;
        self
    }
}

#[async_trait]
impl SandboxBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            oom_detection: true,
            networking: false,
        }
    }

    async fn launch(&self, _spec: &SandboxSpec) -> Result<Launched> {
        if self.fault == Fault::Launch {
            return Err(JudgeletError::Launch("injected launch fault".to_string()));
        }
        self.stats.launches.fetch_add(1, Ordering::SeqCst);

        let (stdin_ours, stdin_theirs) = duplex(4096);
        let (stdout_theirs, stdout_ours) = duplex(4096);
        let (stderr_theirs, stderr_ours) = duplex(4096);

        let kill = CancellationToken::new();
        let last_signal = Arc::new(AtomicI32::new(0));
        let (exit_tx, exit_rx) = watch::channel(None);

        tokio::spawn(program(
            stdin_theirs,
            stdout_theirs,
            stderr_theirs,
            self.responder.clone(),
            kill.clone(),
            last_signal.clone(),
            exit_tx,
        ));

        let stdin: Box<dyn AsyncWrite + Send + Unpin> = match self.fault {
            Fault::Write => Box::new(FailingIo),
            _ => Box::new(stdin_ours),
        };
        let stdout: Box<dyn AsyncRead + Send + Unpin> = match self.fault {
            Fault::Read => Box::new(FailingIo),
            _ => Box::new(stdout_ours),
        };

        let instance = ScriptedInstance {
            fault: self.fault,
            memory: self.memory,
            memory_after: self.memory_after,
            launched_at: Instant::now(),
            ignore_graceful: self.ignore_graceful,
            kill,
            last_signal,
            exit_rx,
            exited: AtomicBool::new(false),
            stats: self.stats.clone(),
        };

        Ok(Launched {
            instance: Arc::new(instance),
            stdio: SandboxStdio {
                stdin,
                stdout,
                stderr: Box::new(stderr_ours),
            },
        })
    }
}

async fn program(
    stdin: DuplexStream,
    mut stdout: DuplexStream,
    mut stderr: DuplexStream,
    responder: Responder,
    kill: CancellationToken,
    last_signal: Arc<AtomicI32>,
    exit_tx: watch::Sender<Option<RawExit>>,
) {
    let mut lines = BufReader::new(stdin).lines();

    let exit = loop {
        tokio::select! {
            _ = kill.cancelled() => {
                break RawExit {
                    code: None,
                    signal: Some(last_signal.load(Ordering::SeqCst)),
                    oom_killed: false,
                };
            }
            line = lines.next_line() => {
                let request = match line {
                    Ok(Some(request)) => request,
                    // End of input: exit cleanly
                    _ => break RawExit { code: Some(0), ..RawExit::default() },
                };
                match responder(&request) {
                    Reply::Line(text) => {
                        let _ = stdout.write_all(format!("{}\n", text).as_bytes()).await;
                    }
                    Reply::Raw(bytes) => {
                        let _ = stdout.write_all(&bytes).await;
                    }
                    Reply::Silent => {}
                    Reply::Stderr(text) => {
                        let _ = stderr.write_all(text.as_bytes()).await;
                    }
                    Reply::Exit(code) => break RawExit { code: Some(code), ..RawExit::default() },
                    Reply::OomKill => {
                        break RawExit {
                            code: None,
                            signal: Some(SIGKILL),
                            oom_killed: true,
                        };
                    }
                }
            }
        }
    };

    drop(stdout);
    drop(stderr);
    exit_tx.send_replace(Some(exit));
}

struct ScriptedInstance {
    fault: Fault,
    memory: u64,
    memory_after: Option<(Duration, u64)>,
    launched_at: Instant,
    ignore_graceful: bool,
    kill: CancellationToken,
    last_signal: Arc<AtomicI32>,
    exit_rx: watch::Receiver<Option<RawExit>>,
    exited: AtomicBool,
    stats: Arc<Stats>,
}

#[async_trait]
impl SandboxInstance for ScriptedInstance {
    fn id(&self) -> &str {
        "scripted-1"
    }

    fn info(&self) -> SandboxInfo {
        SandboxInfo {
            backend_type: "scripted".to_string(),
            instance_id: "scripted-1".to_string(),
            metadata: HashMap::new(),
        }
    }

    async fn memory_usage(&self) -> Option<u64> {
        if self.exited.load(Ordering::SeqCst) {
            return None;
        }
        match self.memory_after {
            Some((after, bytes)) if self.launched_at.elapsed() >= after => Some(bytes),
            _ => Some(self.memory),
        }
    }

    async fn signal(&self, signal: StopSignal) -> Result<()> {
        match signal {
            StopSignal::Graceful => {
                self.stats.graceful_signals.fetch_add(1, Ordering::SeqCst);
                if !self.ignore_graceful {
                    self.last_signal.store(SIGTERM, Ordering::SeqCst);
                    self.kill.cancel();
                }
            }
            StopSignal::Forced => {
                self.stats.forced_signals.fetch_add(1, Ordering::SeqCst);
                self.last_signal.store(SIGKILL, Ordering::SeqCst);
                self.kill.cancel();
            }
        }
        Ok(())
    }

    async fn wait(&self) -> Result<RawExit> {
        let mut rx = self.exit_rx.clone();
        let exit = rx
            .wait_for(|exit| exit.is_some())
            .await
            .map_err(|_| JudgeletError::Teardown("program task vanished".to_string()))?
            .clone()
            .unwrap_or_default();
        self.exited.store(true, Ordering::SeqCst);

        if self.fault == Fault::Wait {
            return Err(JudgeletError::Teardown("injected wait fault".to_string()));
        }
        Ok(exit)
    }

    async fn release(&self) -> Result<()> {
        self.stats.releases.fetch_add(1, Ordering::SeqCst);
        self.kill.cancel();
        if self.fault == Fault::Release {
            return Err(JudgeletError::Teardown("injected release fault".to_string()));
        }
        Ok(())
    }

    fn kill_now(&self) {
        self.last_signal.store(SIGKILL, Ordering::SeqCst);
        self.kill.cancel();
    }
}

/// Stream whose every read and write fails.
struct FailingIo;

impl AsyncRead for FailingIo {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "injected read fault")))
    }
}

impl AsyncWrite for FailingIo {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "injected write fault")))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Configuration with short timings for tests.
pub fn fast_config() -> JudgeletConfig {
    let mut config = JudgeletConfig::default();
    config.sandbox.grace_period_ms = 50;
    config.sandbox.exit_grace_ms = 200;
    config.monitor.sample_interval_ms = 5;
    config.limits.time_limit_ms = 300;
    config.limits.total_time_limit_ms = 3_000;
    config
}
