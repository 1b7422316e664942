//! Reference engine: runs commands as local processes.
//!
//! Started by the host with the magic cookie set. Each Run executes the
//! requested command in the working directory and streams its output back
//! line by line.
use iacrun::engine::protocol::{InitRequest, Meta, RunRequest, ShutdownRequest, LOG_LEVEL_ENV};
use iacrun::engine::server::{check_magic_cookie, serve, EngineHandler, FrameSink};
use iacrun::logging::init_engine_logging;
use std::fs::OpenOptions;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Command, ExitCode, Stdio};
use std::thread;

/// Meta key naming a file that receives one line per Init and Shutdown.
const TRACE_FILE_META: &str = "trace_file";

struct ShellEngine;

impl EngineHandler for ShellEngine {
    fn init(&self, request: &InitRequest, out: &FrameSink<'_>) -> Result<(), String> {
        if !Path::new(&request.working_dir).is_dir() {
            out.stderr(format!("working directory {} does not exist\n", request.working_dir))
                .and_then(|()| out.result_code(1))
                .map_err(|err| err.to_string())?;
            return Ok(());
        }
        tracing::debug!(working_dir = %request.working_dir, "init");
        trace(&request.meta, "init")?;
        out.result_code(0).map_err(|err| err.to_string())
    }

    fn run(&self, request: &RunRequest, out: &FrameSink<'_>) -> Result<(), String> {
        tracing::debug!(working_dir = %request.working_dir, command = %request.command, "run");
        let spawned = Command::new(&request.command)
            .args(&request.args)
            .envs(&request.env)
            .current_dir(&request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                return out
                    .stderr(format!("run {}: {err}\n", request.command))
                    .and_then(|()| out.result_code(127))
                    .map_err(|err| err.to_string());
            }
        };
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        thread::scope(|scope| {
            if let Some(stdout) = stdout {
                scope.spawn(move || pump(stdout, |text| out.stdout(text)));
            }
            if let Some(stderr) = stderr {
                scope.spawn(move || pump(stderr, |text| out.stderr(text)));
            }
        });
        let status = child
            .wait()
            .map_err(|err| format!("wait for {}: {err}", request.command))?;
        out.result_code(status.code().unwrap_or(1))
            .map_err(|err| err.to_string())
    }

    fn shutdown(&self, request: &ShutdownRequest, out: &FrameSink<'_>) -> Result<(), String> {
        tracing::debug!(working_dir = %request.working_dir, "shutdown");
        trace(&request.meta, "shutdown")?;
        out.result_code(0).map_err(|err| err.to_string())
    }
}

/// Forward `reader` to `send` one line at a time until end of file.
fn pump<R: Read>(reader: R, send: impl Fn(String) -> io::Result<()>) {
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) => {
                if let Err(err) = send(String::from_utf8_lossy(&line).into_owned()) {
                    tracing::warn!(error = %err, "dropping command output");
                    break;
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "read command output");
                break;
            }
        }
    }
}

fn trace(meta: &Meta, event: &str) -> Result<(), String> {
    let Some(path) = meta.get(TRACE_FILE_META).and_then(|value| value.as_str()) else {
        return Ok(());
    };
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| format!("open trace file {path}: {err}"))?;
    writeln!(file, "{event} {}", std::process::id())
        .map_err(|err| format!("write trace file {path}: {err}"))
}

fn main() -> ExitCode {
    if let Err(hint) = check_magic_cookie() {
        eprintln!("{hint}");
        return ExitCode::FAILURE;
    }
    let level = std::env::var(LOG_LEVEL_ENV).unwrap_or_else(|_| "info".to_string());
    if let Err(err) = init_engine_logging(&level) {
        eprintln!("{err:#}");
    }
    let stdin = io::stdin();
    match serve(&ShellEngine, stdin.lock(), io::stdout()) {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "engine stopped");
            ExitCode::FAILURE
        }
    }
}
