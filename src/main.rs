use anyhow::{anyhow, Context, Result};
use clap::Parser;
use iacrun::config::{load_config, Config};
use iacrun::engine::verify::file_sha256;
use iacrun::engine::{CancelToken, EngineContext, EngineDescriptor, Verifier};
use iacrun::logging::init_logging;
use iacrun::runner::{run_all, Invocation};
use iacrun::util::display_path;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

mod cli;
use cli::{Command, EngineCommand, EngineConfigArgs, RootArgs, RunArgs, VerifyArgs};

fn main() -> Result<ExitCode> {
    let args = RootArgs::parse();
    init_logging(args.verbose)?;
    match args.command {
        Command::Run(args) => cmd_run(args),
        Command::Engine(EngineCommand::Fetch(args)) => cmd_engine_fetch(args),
        Command::Engine(EngineCommand::Verify(args)) => cmd_engine_verify(args),
        Command::Engine(EngineCommand::Info(args)) => cmd_engine_info(args),
    }
}

fn cmd_run(args: RunArgs) -> Result<ExitCode> {
    let cwd = std::env::current_dir().context("resolve current directory")?;
    let mut config = load_config(args.config.as_deref(), &cwd)?;
    if args.no_engine {
        config.settings.enabled = false;
    }
    if args.engine_skip_check {
        config.settings.skip_check = true;
    }
    if let Some(level) = args.engine_log_level {
        config.settings.log_level = level;
    }

    let (command, rest) = args
        .command
        .split_first()
        .ok_or_else(|| anyhow!("missing command"))?;
    let working_dirs = if args.working_dirs.is_empty() {
        vec![cwd.clone()]
    } else {
        args.working_dirs.iter().map(|dir| absolutize(&cwd, dir)).collect()
    };
    let invocation = Invocation {
        working_dirs,
        command: command.clone(),
        args: rest.to_vec(),
        env: parse_env_pairs(&args.env)?,
    };

    let report = run_all(&config, &invocation, &CancelToken::new())?;
    let failed = report.failed();
    if !failed.is_empty() {
        eprintln!("{} of {} directories failed:", failed.len(), report.outcomes.len());
        for outcome in &failed {
            eprintln!("  {}", display_path(&outcome.working_dir, Some(&cwd)));
        }
    }
    if let Some(summary) = &report.shutdown {
        if !summary.is_clean() {
            eprintln!(
                "{} of {} engine sessions did not shut down cleanly",
                summary.failures.len(),
                summary.total
            );
        }
    }
    Ok(exit_code(report.exit_code()))
}

fn cmd_engine_fetch(args: EngineConfigArgs) -> Result<ExitCode> {
    let (context, _) = engine_context(&args)?;
    let path = context
        .downloader()
        .ensure_available(context.descriptor())
        .context("fetch engine")?;
    println!("{}", path.display());
    Ok(ExitCode::SUCCESS)
}

fn cmd_engine_verify(args: VerifyArgs) -> Result<ExitCode> {
    let verifier = Verifier::embedded().context("load trusted key")?;
    verifier
        .verify(&args.artifact, &args.checksums, &args.signature)
        .with_context(|| format!("verify {}", args.artifact.display()))?;
    let digest = file_sha256(&args.artifact)?;
    println!("verified {} sha256:{}", args.artifact.display(), hex::encode(digest));
    Ok(ExitCode::SUCCESS)
}

fn cmd_engine_info(args: EngineConfigArgs) -> Result<ExitCode> {
    let (context, config) = engine_context(&args)?;
    let resolved = context
        .downloader()
        .resolve(context.descriptor())
        .context("resolve engine")?;
    let cache_root = context.cache_root();
    let info = serde_json::json!({
        "config": config.path,
        "descriptor": context.descriptor(),
        "resolved_version": resolved.layout.as_ref().map(|layout| layout.version.clone()),
        "enabled": config.settings.enabled,
        "cache_root": cache_root,
        "cache_dir": resolved.layout.as_ref().map(|layout| layout.cache_dir(cache_root)),
        "artifact_path": resolved.path,
        "installed": resolved.path.is_file(),
    });
    let text = serde_json::to_string_pretty(&info).context("serialize engine info")?;
    println!("{text}");
    Ok(ExitCode::SUCCESS)
}

fn engine_context(args: &EngineConfigArgs) -> Result<(EngineContext, Config)> {
    let cwd = std::env::current_dir().context("resolve current directory")?;
    let mut config = load_config(args.config.as_deref(), &cwd)?;
    if args.skip_check {
        config.settings.skip_check = true;
    }
    let descriptor: EngineDescriptor = config
        .engine
        .clone()
        .ok_or_else(|| anyhow!("no engine configured (add an `engine` block to the config file)"))?;
    let context = EngineContext::new(descriptor, config.settings.clone()).context("set up engine")?;
    Ok((context, config))
}

fn parse_env_pairs(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("--env expects KEY=VALUE, got {pair:?}"))?;
            if key.is_empty() {
                return Err(anyhow!("--env key must not be empty in {pair:?}"));
            }
            Ok((key.to_string(), value.to_string()))
        })
        .collect()
}

fn absolutize(cwd: &Path, dir: &Path) -> PathBuf {
    if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        cwd.join(dir)
    }
}

fn exit_code(code: i32) -> ExitCode {
    match u8::try_from(code) {
        Ok(code) => ExitCode::from(code),
        Err(_) => ExitCode::FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_pairs_split_on_first_equals() {
        let env = parse_env_pairs(&["A=1".to_string(), "B=x=y".to_string()]).expect("pairs");
        assert_eq!(env["A"], "1");
        assert_eq!(env["B"], "x=y");
    }

    #[test]
    fn env_pairs_reject_missing_equals() {
        assert!(parse_env_pairs(&["NOPE".to_string()]).is_err());
        assert!(parse_env_pairs(&["=1".to_string()]).is_err());
    }

    #[test]
    fn relative_dirs_resolve_against_cwd() {
        let cwd = Path::new("/work");
        assert_eq!(absolutize(cwd, Path::new("vpc")), PathBuf::from("/work/vpc"));
        assert_eq!(absolutize(cwd, Path::new("/abs")), PathBuf::from("/abs"));
    }
}
