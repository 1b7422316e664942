//! Run configuration.
//!
//! Settings are layered, lowest priority first: built-in defaults, the JSON
//! config file, environment variables, then command-line flags (applied by
//! the binary).
use crate::engine::protocol::LOG_LEVEL_ENV;
use crate::engine::{EngineDescriptor, EngineSettings};
use crate::util::parse_flag;
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Config file looked up in the current directory when `--config` is absent.
pub const CONFIG_FILE_NAME: &str = "iacrun.json";

pub const ENGINE_ENABLE_ENV: &str = "IACRUN_ENGINE_ENABLE";
pub const ENGINE_SKIP_CHECK_ENV: &str = "IACRUN_ENGINE_SKIP_CHECK";
pub const ENGINE_CACHE_PATH_ENV: &str = "IACRUN_ENGINE_CACHE_PATH";

/// On-disk shape of `iacrun.json`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub engine: Option<EngineDescriptor>,
    #[serde(default)]
    pub engine_settings: SettingsFile,
}

/// Optional overrides for [`EngineSettings`].
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsFile {
    pub enabled: Option<bool>,
    pub cache_path: Option<PathBuf>,
    pub skip_check: Option<bool>,
    pub log_level: Option<String>,
}

/// Fully resolved configuration for one invocation.
#[derive(Debug, Clone)]
pub struct Config {
    /// Engine to delegate to; `None` runs commands directly.
    pub engine: Option<EngineDescriptor>,
    pub settings: EngineSettings,
    /// File the configuration was read from, if any.
    pub path: Option<PathBuf>,
}

impl Config {
    /// True when commands should go through an engine.
    pub fn uses_engine(&self) -> bool {
        self.settings.enabled && self.engine.is_some()
    }
}

/// Load configuration using the process environment.
pub fn load_config(explicit: Option<&Path>, cwd: &Path) -> Result<Config> {
    load_config_with_env(explicit, cwd, |key| std::env::var(key).ok())
}

/// Load configuration with an injectable environment lookup.
pub fn load_config_with_env(
    explicit: Option<&Path>,
    cwd: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> Result<Config> {
    let (file, path) = match explicit {
        Some(path) => (read_config_file(path)?, Some(path.to_path_buf())),
        None => {
            let default_path = cwd.join(CONFIG_FILE_NAME);
            if default_path.is_file() {
                (read_config_file(&default_path)?, Some(default_path))
            } else {
                (ConfigFile::default(), None)
            }
        }
    };

    let mut settings = EngineSettings::default();
    apply_file_settings(&mut settings, file.engine_settings);
    apply_env_settings(&mut settings, env)?;

    let config = Config {
        engine: file.engine,
        settings,
        path,
    };
    validate_config(&config)?;
    Ok(config)
}

fn read_config_file(path: &Path) -> Result<ConfigFile> {
    let bytes = fs::read(path).with_context(|| format!("read config {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parse config {}", path.display()))
}

fn apply_file_settings(settings: &mut EngineSettings, file: SettingsFile) {
    if let Some(enabled) = file.enabled {
        settings.enabled = enabled;
    }
    if let Some(cache_path) = file.cache_path {
        settings.cache_path = cache_path;
    }
    if let Some(skip_check) = file.skip_check {
        settings.skip_check = skip_check;
    }
    if let Some(log_level) = file.log_level {
        settings.log_level = log_level;
    }
}

fn apply_env_settings(
    settings: &mut EngineSettings,
    env: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    if let Some(value) = env(ENGINE_ENABLE_ENV) {
        settings.enabled = env_flag(ENGINE_ENABLE_ENV, &value)?;
    }
    if let Some(value) = env(ENGINE_SKIP_CHECK_ENV) {
        settings.skip_check = env_flag(ENGINE_SKIP_CHECK_ENV, &value)?;
    }
    if let Some(value) = env(ENGINE_CACHE_PATH_ENV).filter(|value| !value.trim().is_empty()) {
        settings.cache_path = PathBuf::from(value);
    }
    if let Some(value) = env(LOG_LEVEL_ENV).filter(|value| !value.trim().is_empty()) {
        settings.log_level = value;
    }
    Ok(())
}

fn env_flag(name: &str, value: &str) -> Result<bool> {
    parse_flag(value).ok_or_else(|| anyhow!("{name} must be true or false, got {value:?}"))
}

/// Reject descriptors the engine layer cannot act on.
pub fn validate_config(config: &Config) -> Result<()> {
    let Some(engine) = &config.engine else {
        return Ok(());
    };
    if engine.source.trim().is_empty() {
        return Err(anyhow!("engine.source must not be empty"));
    }
    if engine.engine_type.trim().is_empty() {
        return Err(anyhow!("engine.type must not be empty"));
    }
    if engine.meta.keys().any(|key| key.trim().is_empty()) {
        return Err(anyhow!("engine.meta keys must not be empty"));
    }
    if config.settings.log_level.trim().is_empty() {
        return Err(anyhow!("engine log level must not be empty"));
    }
    Ok(())
}
