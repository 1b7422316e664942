//! Shared test infrastructure for integration tests.
#![allow(dead_code)]

use iacrun::engine::{EngineContext, EngineDescriptor, EngineSettings, ExecutionOptions, OutputSink};
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Path of the bundled reference engine built alongside the tests.
pub fn shell_engine() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_iacrun-shell-engine"))
}

pub fn iacrun_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_iacrun"))
}

/// Scratch area with a cache directory and a trace file the shell engine
/// appends `init <pid>` / `shutdown <pid>` lines to.
pub struct EngineFixture {
    pub root: TempDir,
    pub trace_file: PathBuf,
}

impl EngineFixture {
    pub fn new() -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        let trace_file = root.path().join("trace.log");
        Self { root, trace_file }
    }

    /// Create (if needed) and return a working directory under the root.
    pub fn working_dir(&self, name: &str) -> PathBuf {
        let dir = self.root.path().join("work").join(name);
        fs::create_dir_all(&dir).expect("create working dir");
        dir
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.path().join("cache")
    }

    pub fn descriptor(&self) -> EngineDescriptor {
        EngineDescriptor::new(shell_engine().display().to_string()).with_meta(
            "trace_file",
            serde_json::Value::String(self.trace_file.display().to_string()),
        )
    }

    pub fn settings(&self) -> EngineSettings {
        EngineSettings {
            cache_path: self.cache_dir(),
            log_level: "debug".to_string(),
            ..EngineSettings::default()
        }
    }

    pub fn context(&self) -> EngineContext {
        EngineContext::new(self.descriptor(), self.settings()).expect("engine context")
    }

    /// Trace lines whose event matches `event`.
    pub fn trace_events(&self, event: &str) -> Vec<String> {
        let text = fs::read_to_string(&self.trace_file).unwrap_or_default();
        text.lines()
            .filter(|line| line.split_whitespace().next() == Some(event))
            .map(str::to_string)
            .collect()
    }

    /// Write an `iacrun.json` pointing at the shell engine.
    pub fn write_config(&self) -> PathBuf {
        let path = self.root.path().join("iacrun.json");
        let config = serde_json::json!({
            "engine": self.descriptor(),
            "engine_settings": {"cache_path": self.cache_dir()},
        });
        fs::write(&path, serde_json::to_vec_pretty(&config).expect("json")).expect("write config");
        path
    }
}

/// Captured output of one run.
pub struct Captured {
    pub stdout: Arc<Mutex<Vec<u8>>>,
    pub stderr: Arc<Mutex<Vec<u8>>>,
}

impl Captured {
    pub fn stdout(&self) -> String {
        String::from_utf8_lossy(&self.stdout.lock()).into_owned()
    }

    pub fn stderr(&self) -> String {
        String::from_utf8_lossy(&self.stderr.lock()).into_owned()
    }
}

/// `sh -c script` in `dir`, with output going to in-memory buffers.
pub fn sh(dir: &Path, script: &str) -> (ExecutionOptions, Captured) {
    let (stdout, stdout_buf) = OutputSink::buffer();
    let (stderr, stderr_buf) = OutputSink::buffer();
    let options = ExecutionOptions::new(dir, "sh")
        .with_args(["-c", script])
        .with_sinks(stdout, stderr);
    (
        options,
        Captured {
            stdout: stdout_buf,
            stderr: stderr_buf,
        },
    )
}
