//! In-memory engine doubles shared by unit tests.
use super::context::CancelToken;
use super::error::{EngineError, EngineResult};
use super::host::{EngineClient, ProcessHandle, Session, SessionHost};
use super::protocol::{Frame, InitRequest, RunRequest, ShutdownRequest};
use super::stream::tests::ScriptedStream;
use super::stream::ResponseStream;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Canned responses for each call kind.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockScript {
    pub(crate) init: Vec<Frame>,
    pub(crate) run: Vec<Frame>,
    pub(crate) shutdown: Vec<Frame>,
    pub(crate) fail_init: bool,
    pub(crate) fail_shutdown: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Init(String),
    Run(String, String, Vec<String>),
    Shutdown(String),
}

#[derive(Default)]
pub(crate) struct MockClient {
    pub(crate) script: Mutex<MockScript>,
    pub(crate) calls: Mutex<Vec<Call>>,
}

impl MockClient {
    pub(crate) fn with_script(script: MockScript) -> Self {
        Self {
            script: Mutex::new(script),
            calls: Mutex::default(),
        }
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    fn broken(working_dir: &str) -> EngineError {
        EngineError::StreamRead {
            working_dir: working_dir.to_string(),
            reason: "engine exited".to_string(),
        }
    }
}

impl EngineClient for MockClient {
    fn init(
        &self,
        cancel: &CancelToken,
        request: InitRequest,
    ) -> EngineResult<Box<dyn ResponseStream>> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        self.calls.lock().push(Call::Init(request.working_dir.clone()));
        let script = self.script.lock();
        if script.fail_init {
            return Ok(Box::new(ScriptedStream::failing_after(
                script.init.clone(),
                Self::broken(&request.working_dir),
            )));
        }
        Ok(Box::new(ScriptedStream::new(script.init.clone())))
    }

    fn run(
        &self,
        cancel: &CancelToken,
        request: RunRequest,
    ) -> EngineResult<Box<dyn ResponseStream>> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        self.calls.lock().push(Call::Run(
            request.working_dir.clone(),
            request.command.clone(),
            request.args.clone(),
        ));
        Ok(Box::new(ScriptedStream::new(self.script.lock().run.clone())))
    }

    fn shutdown(
        &self,
        cancel: &CancelToken,
        request: ShutdownRequest,
    ) -> EngineResult<Box<dyn ResponseStream>> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        self.calls
            .lock()
            .push(Call::Shutdown(request.working_dir.clone()));
        let script = self.script.lock();
        if script.fail_shutdown {
            return Err(Self::broken(&request.working_dir));
        }
        Ok(Box::new(ScriptedStream::new(script.shutdown.clone())))
    }
}

#[derive(Default)]
pub(crate) struct MockProcess {
    terminations: AtomicUsize,
}

impl MockProcess {
    pub(crate) fn is_terminated(&self) -> bool {
        self.terminations.load(Ordering::SeqCst) > 0
    }
}

impl ProcessHandle for Arc<MockProcess> {
    fn terminate(&self) -> EngineResult<()> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub(crate) fn mock_session() -> (Session, Arc<MockClient>, Arc<MockProcess>) {
    session_with(MockScript::default())
}

pub(crate) fn session_with(script: MockScript) -> (Session, Arc<MockClient>, Arc<MockProcess>) {
    let client = Arc::new(MockClient::with_script(script));
    let process = Arc::new(MockProcess::default());
    let session = Session {
        client: client.clone(),
        process: Box::new(Arc::clone(&process)),
    };
    (session, client, process)
}

/// Host handing out mock sessions, one script per spawn in order.
#[derive(Default)]
pub(crate) struct MockHost {
    scripts: Mutex<Vec<MockScript>>,
    pub(crate) spawned: Mutex<Vec<(PathBuf, Arc<MockClient>, Arc<MockProcess>)>>,
    spawn_count: AtomicUsize,
    spawn_delay: Duration,
}

impl MockHost {
    pub(crate) fn with_scripts(scripts: Vec<MockScript>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
            ..Self::default()
        }
    }

    /// Sleep this long in every spawn, like a slow engine start.
    pub(crate) fn with_spawn_delay(mut self, delay: Duration) -> Self {
        self.spawn_delay = delay;
        self
    }

    pub(crate) fn spawn_count(&self) -> usize {
        self.spawn_count.load(Ordering::SeqCst)
    }

    pub(crate) fn session(&self, index: usize) -> (Arc<MockClient>, Arc<MockProcess>) {
        let spawned = self.spawned.lock();
        (spawned[index].1.clone(), spawned[index].2.clone())
    }
}

impl SessionHost for MockHost {
    fn spawn(&self, engine: &Path, _log_level: &str) -> EngineResult<Session> {
        self.spawn_count.fetch_add(1, Ordering::SeqCst);
        if !self.spawn_delay.is_zero() {
            thread::sleep(self.spawn_delay);
        }
        let script = {
            let mut scripts = self.scripts.lock();
            if scripts.is_empty() {
                MockScript::default()
            } else {
                scripts.remove(0)
            }
        };
        let (session, client, process) = session_with(script);
        self.spawned
            .lock()
            .push((engine.to_path_buf(), client, process));
        Ok(session)
    }
}
