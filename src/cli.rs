//! CLI argument parsing.
//!
//! The CLI stays thin: every command resolves configuration, then hands off
//! to the library.
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Root CLI entrypoint.
#[derive(Parser, Debug)]
#[command(
    name = "iacrun",
    version,
    about = "Run IaC commands across working directories, optionally through an execution engine",
    after_help = "Examples:\n  iacrun run --working-dir vpc --working-dir db -- plan -input=false\n  iacrun engine fetch --config iacrun.json\n  iacrun engine info\n  iacrun engine verify --artifact engine --checksums SHA256SUMS --signature SHA256SUMS.sig",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    /// Log at debug level (overrides RUST_LOG)
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Top-level commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    Run(RunArgs),
    #[command(subcommand, about = "Manage the configured execution engine")]
    Engine(EngineCommand),
}

/// Run command inputs.
#[derive(Parser, Debug)]
#[command(about = "Run a command in every working directory")]
pub struct RunArgs {
    /// Directory to run in; repeat for several (defaults to the current directory)
    #[arg(long = "working-dir", value_name = "DIR")]
    pub working_dirs: Vec<PathBuf>,

    /// Config file (defaults to ./iacrun.json when present)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Execute the command directly even when an engine is configured
    #[arg(long)]
    pub no_engine: bool,

    /// Skip checksum and signature verification of downloaded engines
    #[arg(long)]
    pub engine_skip_check: bool,

    /// Log level passed to the engine process
    #[arg(long, value_name = "LEVEL")]
    pub engine_log_level: Option<String>,

    /// Extra environment for the command (KEY=VALUE, repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Command and arguments to run
    #[arg(last = true, required = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

/// Engine maintenance commands.
#[derive(Subcommand, Debug)]
pub enum EngineCommand {
    /// Download and verify the configured engine, then print its path
    Fetch(EngineConfigArgs),
    /// Verify a local artifact against a signed checksum manifest
    Verify(VerifyArgs),
    /// Print the resolved engine descriptor and cache paths as JSON
    Info(EngineConfigArgs),
}

#[derive(Parser, Debug)]
pub struct EngineConfigArgs {
    /// Config file (defaults to ./iacrun.json when present)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Skip checksum and signature verification
    #[arg(long)]
    pub skip_check: bool,
}

#[derive(Parser, Debug)]
pub struct VerifyArgs {
    /// Engine artifact to check
    #[arg(long, value_name = "PATH")]
    pub artifact: PathBuf,

    /// SHA256SUMS manifest
    #[arg(long, value_name = "PATH")]
    pub checksums: PathBuf,

    /// Detached signature over the manifest
    #[arg(long, value_name = "PATH")]
    pub signature: PathBuf,
}
