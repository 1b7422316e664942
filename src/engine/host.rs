//! Engine process hosting.
//!
//! [`ProcessHost`] spawns an engine binary, performs the handshake over its
//! stdout, and returns a [`Session`]: a typed [`EngineClient`] for issuing
//! calls plus a [`ProcessHandle`] that owns the child.
//!
//! One reader thread per engine routes response messages to the in-flight
//! call with the matching id, so several calls can share a session.
use super::context::CancelToken;
use super::error::{EngineError, EngineResult};
use super::protocol::{
    EngineMessage, Frame, Handshake, HostMessage, InitRequest, RunRequest, ShutdownRequest,
    LOG_LEVEL_ENV, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE,
};
use super::stream::ResponseStream;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// How long an engine gets to complete the handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
/// Interval at which blocked streams re-check their cancel token.
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Typed calls against a dispensed engine.
pub trait EngineClient: Send + Sync {
    fn init(&self, cancel: &CancelToken, request: InitRequest)
        -> EngineResult<Box<dyn ResponseStream>>;

    fn run(
        &self,
        cancel: &CancelToken,
        request: RunRequest,
    ) -> EngineResult<Box<dyn ResponseStream>>;

    fn shutdown(
        &self,
        cancel: &CancelToken,
        request: ShutdownRequest,
    ) -> EngineResult<Box<dyn ResponseStream>>;
}

/// Owned handle to a running engine process.
pub trait ProcessHandle: Send + Sync {
    /// Kill the process and reap it. Calling it again is a no-op.
    fn terminate(&self) -> EngineResult<()>;

    fn pid(&self) -> Option<u32> {
        None
    }
}

/// A live engine: client plus process.
pub struct Session {
    pub client: Arc<dyn EngineClient>,
    pub process: Box<dyn ProcessHandle>,
}

/// Starts engine processes.
pub trait SessionHost: Send + Sync {
    fn spawn(&self, engine: &Path, log_level: &str) -> EngineResult<Session>;
}

/// [`SessionHost`] that runs engines as child processes speaking JSON lines.
#[derive(Debug, Clone)]
pub struct ProcessHost {
    handshake_timeout: Duration,
}

impl Default for ProcessHost {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl ProcessHost {
    pub fn with_handshake_timeout(handshake_timeout: Duration) -> Self {
        Self { handshake_timeout }
    }
}

impl SessionHost for ProcessHost {
    fn spawn(&self, engine: &Path, log_level: &str) -> EngineResult<Session> {
        tracing::debug!(engine = %engine.display(), log_level, "spawning engine");
        let mut child = Command::new(engine)
            .env(MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE)
            .env(LOG_LEVEL_ENV, log_level)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| EngineError::Spawn {
                engine: engine.to_path_buf(),
                source,
            })?;
        let process = EngineProcess {
            engine: engine.to_path_buf(),
            pid: child.id(),
            child: Mutex::new(None),
        };

        let handshake_err = |reason: &str| EngineError::Handshake {
            engine: engine.to_path_buf(),
            reason: reason.to_string(),
        };
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            kill_quietly(&mut child);
            return Err(handshake_err("engine stdio was not captured"));
        };
        *process.child.lock() = Some(child);

        forward_stderr(engine, stderr);
        let pending: Arc<DashMap<u64, Sender<Reply>>> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));
        let (startup_tx, startup_rx) = mpsc::channel();
        {
            let pending = Arc::clone(&pending);
            let closed = Arc::clone(&closed);
            let engine = engine.to_path_buf();
            thread::Builder::new()
                .name("engine-reader".to_string())
                .spawn(move || read_loop(&engine, stdout, startup_tx, &pending, &closed))
                .map_err(|err| EngineError::io("start engine reader thread", err))?;
        }

        let client = StdioEngineClient {
            engine: engine.to_path_buf(),
            writer: Mutex::new(stdin),
            pending,
            closed,
            next_id: AtomicU64::new(1),
        };
        let deadline = Instant::now() + self.handshake_timeout;
        if let Err(err) = client.handshake(&startup_rx, deadline) {
            // Dropping the process kills the child.
            drop(process);
            return Err(err);
        }
        tracing::debug!(engine = %engine.display(), pid = process.pid, "engine dispensed");
        Ok(Session {
            client: Arc::new(client),
            process: Box::new(process),
        })
    }
}

/// Routed response for one call.
#[derive(Debug)]
enum Reply {
    Frame(Frame),
    End,
    Error(String),
}

/// Client half of a JSON-lines engine session.
pub struct StdioEngineClient {
    engine: PathBuf,
    writer: Mutex<ChildStdin>,
    pending: Arc<DashMap<u64, Sender<Reply>>>,
    closed: Arc<AtomicBool>,
    next_id: AtomicU64,
}

impl StdioEngineClient {
    fn handshake(
        &self,
        startup: &Receiver<Result<String, String>>,
        deadline: Instant,
    ) -> EngineResult<()> {
        let mut handshake = Handshake::new();
        let hello = self.startup_line(startup, deadline)?;
        let dispense = handshake
            .on_hello(&hello)
            .map_err(|reason| self.handshake_error(reason))?;
        self.send(&dispense)
            .map_err(|err| self.handshake_error(format!("send dispense: {err}")))?;
        let reply = self.startup_line(startup, deadline)?;
        let message: EngineMessage = serde_json::from_str(&reply)
            .map_err(|err| self.handshake_error(format!("parse dispense reply: {err}")))?;
        handshake
            .on_dispense_reply(&message)
            .map_err(|reason| self.handshake_error(reason))
    }

    fn startup_line(
        &self,
        startup: &Receiver<Result<String, String>>,
        deadline: Instant,
    ) -> EngineResult<String> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match startup.recv_timeout(remaining) {
            Ok(Ok(line)) => Ok(line),
            Ok(Err(reason)) => Err(self.handshake_error(reason)),
            Err(RecvTimeoutError::Timeout) => {
                Err(self.handshake_error("timed out waiting for engine"))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(self.handshake_error("engine exited during handshake"))
            }
        }
    }

    fn handshake_error(&self, reason: impl Into<String>) -> EngineError {
        EngineError::Handshake {
            engine: self.engine.clone(),
            reason: reason.into(),
        }
    }

    fn send(&self, message: &HostMessage) -> io::Result<()> {
        let mut line = serde_json::to_string(message)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        line.push('\n');
        let mut writer = self.writer.lock();
        writer.write_all(line.as_bytes())?;
        writer.flush()
    }

    fn call(
        &self,
        cancel: &CancelToken,
        working_dir: &str,
        build: impl FnOnce(u64) -> HostMessage,
    ) -> EngineResult<Box<dyn ResponseStream>> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let stream_err = |reason: String| EngineError::StreamRead {
            working_dir: working_dir.to_string(),
            reason,
        };
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel();
        self.pending.insert(id, tx);
        if self.closed.load(Ordering::SeqCst) {
            self.pending.remove(&id);
            return Err(stream_err(format!(
                "engine {} is no longer running",
                self.engine.display()
            )));
        }
        if let Err(err) = self.send(&build(id)) {
            self.pending.remove(&id);
            return Err(stream_err(format!("send request: {err}")));
        }
        Ok(Box::new(ChannelStream {
            id,
            working_dir: working_dir.to_string(),
            rx,
            cancel: cancel.clone(),
            pending: Arc::clone(&self.pending),
            finished: false,
        }))
    }
}

impl EngineClient for StdioEngineClient {
    fn init(
        &self,
        cancel: &CancelToken,
        request: InitRequest,
    ) -> EngineResult<Box<dyn ResponseStream>> {
        let working_dir = request.working_dir.clone();
        self.call(cancel, &working_dir, |id| HostMessage::Init { id, request })
    }

    fn run(
        &self,
        cancel: &CancelToken,
        request: RunRequest,
    ) -> EngineResult<Box<dyn ResponseStream>> {
        let working_dir = request.working_dir.clone();
        self.call(cancel, &working_dir, |id| HostMessage::Run { id, request })
    }

    fn shutdown(
        &self,
        cancel: &CancelToken,
        request: ShutdownRequest,
    ) -> EngineResult<Box<dyn ResponseStream>> {
        let working_dir = request.working_dir.clone();
        self.call(cancel, &working_dir, |id| HostMessage::Shutdown { id, request })
    }
}

/// Frames for one call id, fed by the reader thread.
struct ChannelStream {
    id: u64,
    working_dir: String,
    rx: Receiver<Reply>,
    cancel: CancelToken,
    pending: Arc<DashMap<u64, Sender<Reply>>>,
    finished: bool,
}

impl ResponseStream for ChannelStream {
    fn next_frame(&mut self) -> EngineResult<Option<Frame>> {
        if self.finished {
            return Ok(None);
        }
        loop {
            if self.cancel.is_cancelled() {
                self.finished = true;
                self.pending.remove(&self.id);
                return Err(EngineError::Cancelled);
            }
            match self.rx.recv_timeout(CANCEL_POLL) {
                Ok(Reply::Frame(frame)) => return Ok(Some(frame)),
                Ok(Reply::End) => {
                    self.finished = true;
                    return Ok(None);
                }
                Ok(Reply::Error(reason)) => {
                    self.finished = true;
                    return Err(EngineError::StreamRead {
                        working_dir: self.working_dir.clone(),
                        reason,
                    });
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    self.finished = true;
                    return Err(EngineError::StreamRead {
                        working_dir: self.working_dir.clone(),
                        reason: "engine closed the stream".to_string(),
                    });
                }
            }
        }
    }
}

impl Drop for ChannelStream {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// Hands the first two stdout lines to the handshake, then routes messages.
fn read_loop(
    engine: &Path,
    stdout: ChildStdout,
    startup: Sender<Result<String, String>>,
    pending: &DashMap<u64, Sender<Reply>>,
    closed: &AtomicBool,
) {
    let mut lines = BufReader::new(stdout).lines();
    for _ in 0..2 {
        let line = match lines.next() {
            Some(Ok(line)) => Ok(line),
            Some(Err(err)) => Err(format!("read engine stdout: {err}")),
            None => Err("engine closed stdout during handshake".to_string()),
        };
        let failed = line.is_err();
        if startup.send(line).is_err() || failed {
            return;
        }
    }
    drop(startup);

    let mut exit_reason = "engine exited".to_string();
    for line in lines {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                exit_reason = format!("read engine stdout: {err}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<EngineMessage>(&line) {
            Ok(message) => route(pending, message),
            Err(err) => {
                tracing::debug!(
                    target: "engine",
                    engine = %engine.display(),
                    error = %err,
                    "ignoring non-protocol line: {line}"
                );
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    let ids: Vec<u64> = pending.iter().map(|entry| *entry.key()).collect();
    for id in ids {
        if let Some((_, tx)) = pending.remove(&id) {
            let _ = tx.send(Reply::Error(exit_reason.clone()));
        }
    }
    tracing::debug!(engine = %engine.display(), "engine stdout closed");
}

fn route(pending: &DashMap<u64, Sender<Reply>>, message: EngineMessage) {
    match message {
        EngineMessage::Frame { id, frame } => {
            if let Some(tx) = pending.get(&id) {
                let _ = tx.send(Reply::Frame(frame));
            }
        }
        EngineMessage::End { id } => {
            if let Some((_, tx)) = pending.remove(&id) {
                let _ = tx.send(Reply::End);
            }
        }
        EngineMessage::Error {
            id: Some(id),
            message,
        } => {
            if let Some((_, tx)) = pending.remove(&id) {
                let _ = tx.send(Reply::Error(message));
            }
        }
        EngineMessage::Error { id: None, message } => {
            tracing::warn!(target: "engine", "engine reported an error: {message}");
        }
        EngineMessage::Dispensed { .. } => {}
    }
}

fn forward_stderr(engine: &Path, stderr: ChildStderr) {
    let engine = engine.display().to_string();
    let spawned = thread::Builder::new()
        .name("engine-stderr".to_string())
        .spawn(move || {
            for line in BufReader::new(stderr).lines() {
                match line {
                    Ok(line) => tracing::debug!(target: "engine", engine = %engine, "{line}"),
                    Err(_) => break,
                }
            }
        });
    if let Err(err) = spawned {
        tracing::warn!(error = %err, "could not forward engine stderr");
    }
}

/// Child process owned by a session.
struct EngineProcess {
    engine: PathBuf,
    pid: u32,
    child: Mutex<Option<Child>>,
}

impl ProcessHandle for EngineProcess {
    fn terminate(&self) -> EngineResult<()> {
        let Some(mut child) = self.child.lock().take() else {
            return Ok(());
        };
        match child.kill() {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::InvalidInput => {}
            Err(err) => {
                return Err(EngineError::io(
                    format!("kill engine {}", self.engine.display()),
                    err,
                ))
            }
        }
        let status = child
            .wait()
            .map_err(|err| {
                EngineError::io(format!("wait for engine {}", self.engine.display()), err)
            })?;
        tracing::debug!(
            engine = %self.engine.display(),
            pid = self.pid,
            %status,
            "engine terminated"
        );
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.get_mut().take() {
            kill_quietly(&mut child);
        }
    }
}

fn kill_quietly(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}
