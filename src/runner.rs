//! Runs one command across several working directories.
//!
//! Each directory gets its own thread. With an engine configured the command
//! goes through [`EngineContext::run`] and every session is shut down at the
//! end; otherwise the command is executed directly.
use crate::config::Config;
use crate::engine::{CancelToken, EngineContext, ExecutionOptions, ShutdownSummary};
use crate::util::{display_path, truncate_string};
use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;

/// Longest error text kept per working directory in the report.
const MAX_ERROR_BYTES: usize = 4096;

/// The command to run and where.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub working_dirs: Vec<PathBuf>,
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// How one working directory fared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirOutcome {
    pub working_dir: PathBuf,
    /// Exit code of the command, when it ran to completion.
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

impl DirOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub outcomes: Vec<DirOutcome>,
    /// Present when an engine was used.
    pub shutdown: Option<ShutdownSummary>,
}

impl RunReport {
    pub fn failed(&self) -> Vec<&DirOutcome> {
        self.outcomes
            .iter()
            .filter(|outcome| !outcome.succeeded())
            .collect()
    }

    /// 0 when every directory succeeded, else the first failing exit code
    /// (or 1 when the failure had none).
    pub fn exit_code(&self) -> i32 {
        match self.failed().first() {
            None => 0,
            Some(outcome) => outcome.exit_code.filter(|code| *code != 0).unwrap_or(1),
        }
    }
}

/// Run `invocation` in every working directory concurrently.
pub fn run_all(
    config: &Config,
    invocation: &Invocation,
    cancel: &CancelToken,
) -> Result<RunReport> {
    if invocation.working_dirs.is_empty() {
        return Err(anyhow!("no working directories given"));
    }
    let cwd = std::env::current_dir().context("resolve current directory")?;
    match (&config.engine, config.settings.enabled) {
        (Some(descriptor), true) => {
            let context = EngineContext::new(descriptor.clone(), config.settings.clone())
                .context("set up engine")?;
            tracing::info!(
                source = %descriptor.source,
                dirs = invocation.working_dirs.len(),
                "running through engine"
            );
            let outcomes = for_each_dir(invocation, &cwd, |dir| {
                run_with_engine(&context, cancel, invocation, dir)
            });
            let summary = context.shutdown(cancel);
            for (working_dir, reason) in &summary.failures {
                tracing::warn!(
                    working_dir = %working_dir,
                    "engine did not shut down cleanly: {reason}"
                );
            }
            Ok(RunReport {
                outcomes,
                shutdown: Some(summary),
            })
        }
        _ => {
            let program = which::which(&invocation.command)
                .with_context(|| format!("find {} on PATH", invocation.command))?;
            let outcomes =
                for_each_dir(invocation, &cwd, |dir| run_direct(&program, invocation, dir));
            Ok(RunReport {
                outcomes,
                shutdown: None,
            })
        }
    }
}

fn for_each_dir<F>(invocation: &Invocation, cwd: &Path, run: F) -> Vec<DirOutcome>
where
    F: Fn(&Path) -> DirOutcome + Sync,
{
    thread::scope(|scope| {
        let handles: Vec<_> = invocation
            .working_dirs
            .iter()
            .map(|dir| {
                let run = &run;
                let handle = scope.spawn(move || run(dir));
                (dir, handle)
            })
            .collect();
        handles
            .into_iter()
            .map(|(dir, handle)| {
                let outcome = handle.join().unwrap_or_else(|_| DirOutcome {
                    working_dir: dir.clone(),
                    exit_code: None,
                    error: Some("worker thread panicked".to_string()),
                });
                let shown = display_path(dir, Some(cwd));
                match &outcome.error {
                    Some(error) => tracing::error!(working_dir = %shown, "{error}"),
                    None => {
                        tracing::debug!(working_dir = %shown, code = ?outcome.exit_code, "done")
                    }
                }
                outcome
            })
            .collect()
    })
}

fn run_with_engine(
    context: &EngineContext,
    cancel: &CancelToken,
    invocation: &Invocation,
    dir: &Path,
) -> DirOutcome {
    let mut options = ExecutionOptions::new(dir, invocation.command.clone())
        .with_args(invocation.args.iter().cloned());
    options.env = invocation.env.clone();
    match context.run(cancel, options) {
        Ok(_) => DirOutcome {
            working_dir: dir.to_path_buf(),
            exit_code: Some(0),
            error: None,
        },
        Err(err) => DirOutcome {
            working_dir: dir.to_path_buf(),
            exit_code: err.execution_failure().map(|failure| failure.exit_code),
            error: Some(truncate_string(&err.to_string(), MAX_ERROR_BYTES)),
        },
    }
}

fn run_direct(program: &Path, invocation: &Invocation, dir: &Path) -> DirOutcome {
    let status = Command::new(program)
        .args(&invocation.args)
        .envs(&invocation.env)
        .current_dir(dir)
        .status();
    match status {
        Ok(status) if status.success() => DirOutcome {
            working_dir: dir.to_path_buf(),
            exit_code: Some(0),
            error: None,
        },
        Ok(status) => DirOutcome {
            working_dir: dir.to_path_buf(),
            exit_code: status.code(),
            error: Some(format!(
                "`{}` in {} exited with {status}",
                invocation.command,
                dir.display()
            )),
        },
        Err(err) => DirOutcome {
            working_dir: dir.to_path_buf(),
            exit_code: None,
            error: Some(format!("run {} in {}: {err}", program.display(), dir.display())),
        },
    }
}
