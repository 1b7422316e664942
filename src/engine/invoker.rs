//! Init, Run and Shutdown calls against engine sessions.
use super::context::{CancelToken, EngineContext, ExecutionOptions};
use super::error::{CommandOutput, EngineError, EngineResult, ExecutionFailure};
use super::protocol::{InitRequest, RunRequest, ShutdownRequest};
use super::registry::EngineInstance;
use super::stream::drain;

/// Result of shutting down every live session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownSummary {
    pub total: usize,
    pub clean: usize,
    /// Working directory and error for each session that did not stop cleanly.
    pub failures: Vec<(String, String)>,
}

impl ShutdownSummary {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

impl EngineContext {
    /// Run `options.command` through the engine session for its working
    /// directory, creating and initializing the session on first use.
    ///
    /// Output is streamed line by line into the option sinks while it
    /// arrives. A non-zero result code becomes [`EngineError::ExecutionFailure`]
    /// with the full captured output.
    pub fn run(
        &self,
        cancel: &CancelToken,
        options: ExecutionOptions,
    ) -> EngineResult<CommandOutput> {
        let working_dir = options.working_dir_key();
        let instance = self
            .registry
            .get_or_create(&working_dir, || self.start_instance(cancel, &options))?;

        let request = RunRequest {
            working_dir: working_dir.clone(),
            command: options.command.clone(),
            args: options.args.clone(),
            allocate_pseudo_tty: options.allocate_pseudo_tty,
            env: options.env.clone(),
            meta: self.descriptor.meta.clone(),
        };
        tracing::debug!(working_dir = %working_dir, command = %options.command, "engine run");
        let mut stream = instance.client().run(cancel, request)?;
        let outcome = drain(stream.as_mut(), &options.stdout, &options.stderr)?;
        if outcome.result_code != 0 {
            return Err(EngineError::ExecutionFailure(Box::new(ExecutionFailure {
                working_dir,
                command: options.command,
                args: options.args,
                exit_code: outcome.result_code,
                output: outcome.output,
            })));
        }
        Ok(outcome.output)
    }

    /// Stop every live session and close the registry.
    ///
    /// Each session gets a Shutdown call and is then terminated, whatever the
    /// call returned. Failures are logged and collected, never propagated.
    pub fn shutdown(&self, cancel: &CancelToken) -> ShutdownSummary {
        self.registry.close();
        let instances = self.registry.drain();
        let mut summary = ShutdownSummary {
            total: instances.len(),
            ..ShutdownSummary::default()
        };
        for (working_dir, instance) in instances {
            let mut failure = None;
            if let Err(err) = self.shutdown_instance(cancel, &working_dir, &instance) {
                tracing::warn!(working_dir = %working_dir, error = %err, "engine shutdown failed");
                failure = Some(err.to_string());
            }
            if let Err(err) = instance.terminate() {
                tracing::warn!(
                    working_dir = %working_dir,
                    error = %err,
                    "failed to terminate engine"
                );
                failure.get_or_insert_with(|| err.to_string());
            }
            match failure {
                Some(reason) => summary.failures.push((working_dir, reason)),
                None => summary.clean += 1,
            }
        }
        tracing::debug!(total = summary.total, clean = summary.clean, "engine sessions shut down");
        summary
    }

    /// Download, spawn and Init a session for `options.working_dir`.
    fn start_instance(
        &self,
        cancel: &CancelToken,
        options: &ExecutionOptions,
    ) -> EngineResult<EngineInstance> {
        let engine = self.downloader.ensure_available(&self.descriptor)?;
        let session = self.host.spawn(&engine, &self.settings.log_level)?;
        let instance = EngineInstance::new(session, options.clone(), engine);
        if let Err(err) = self.init_instance(cancel, &instance) {
            if let Err(term_err) = instance.terminate() {
                tracing::warn!(
                    engine = %instance.engine().display(),
                    error = %term_err,
                    "failed to terminate engine"
                );
            }
            return Err(err);
        }
        tracing::info!(
            working_dir = %options.working_dir.display(),
            engine = %instance.engine().display(),
            pid = instance.pid(),
            "engine session ready"
        );
        Ok(instance)
    }

    fn init_instance(&self, cancel: &CancelToken, instance: &EngineInstance) -> EngineResult<()> {
        let options = instance.options();
        let working_dir = options.working_dir_key();
        let init_failed = |reason: String| EngineError::InitFailed {
            working_dir: working_dir.clone(),
            reason,
        };
        let request = InitRequest {
            working_dir: working_dir.clone(),
            env: options.env.clone(),
            meta: self.descriptor.meta.clone(),
        };
        let outcome = instance
            .client()
            .init(cancel, request)
            .and_then(|mut stream| drain(stream.as_mut(), &options.stdout, &options.stderr))
            .map_err(|err| match err {
                EngineError::Cancelled => EngineError::Cancelled,
                other => init_failed(other.to_string()),
            })?;
        if outcome.result_code != 0 {
            let detail = outcome.output.stderr.trim();
            return Err(init_failed(if detail.is_empty() {
                format!("engine returned code {}", outcome.result_code)
            } else {
                format!("engine returned code {}: {detail}", outcome.result_code)
            }));
        }
        Ok(())
    }

    fn shutdown_instance(
        &self,
        cancel: &CancelToken,
        working_dir: &str,
        instance: &EngineInstance,
    ) -> EngineResult<()> {
        let options = instance.options();
        let request = ShutdownRequest {
            working_dir: working_dir.to_string(),
            env: options.env.clone(),
            meta: self.descriptor.meta.clone(),
        };
        let mut stream = instance.client().shutdown(cancel, request)?;
        let outcome = drain(stream.as_mut(), &options.stdout, &options.stderr)?;
        if outcome.result_code != 0 {
            return Err(EngineError::ExecutionFailure(Box::new(ExecutionFailure {
                working_dir: working_dir.to_string(),
                command: "shutdown".to_string(),
                args: Vec::new(),
                exit_code: outcome.result_code,
                output: outcome.output,
            })));
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "invoker_tests.rs"]
mod tests;
