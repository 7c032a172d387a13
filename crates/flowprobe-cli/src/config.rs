//! Configuration file management for flowprobe.
//!
//! Provides a TOML-based config file at `~/.config/flowprobe/config.toml` and
//! a resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use flowprobe_core::harness::{EngineCommand, EngineLocator, ProcessRunner, RunnerConfig, ShortReadPolicy};

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSection {
    /// Explicit path to the engine executable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<PathBuf>,
    /// Cargo workspace the engine is built in, used when `binary` is unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_root: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbosity: Option<u8>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutsSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_secs: Option<u64>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the flowprobe config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/flowprobe` or
/// `~/.config/flowprobe`, on every platform.
pub fn config_dir() -> PathBuf {
    if let Some(xdg) = env_var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("flowprobe");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("flowprobe")
}

/// Return the path to the flowprobe config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))
}

/// Serialize and write the config file, creating parent dirs as needed.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Settings given on the command line; `None` means "not given".
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub engine: Option<PathBuf>,
    pub build_root: Option<PathBuf>,
    pub home: Option<PathBuf>,
    pub read_timeout_secs: Option<u64>,
    pub deadline_secs: Option<u64>,
}

/// Where the engine path came from, for `flowprobe config`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineSource {
    Flag,
    Env,
    File,
    BuildTree,
}

impl std::fmt::Display for EngineSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EngineSource::Flag => "--engine",
            EngineSource::Env => "FLOWPROBE_ENGINE",
            EngineSource::File => "config file",
            EngineSource::BuildTree => "build tree",
        };
        f.write_str(s)
    }
}

/// Fully resolved configuration, ready for use.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub engine: PathBuf,
    pub engine_source: EngineSource,
    pub home: Option<PathBuf>,
    pub verbosity: u8,
    pub runner: RunnerConfig,
}

impl ProbeConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    ///
    /// A config file that exists but does not parse is an error; a missing
    /// one is not.
    pub fn resolve(cli: &CliOverrides) -> Result<Self> {
        let file = if config_path().exists() {
            Some(load_config()?)
        } else {
            None
        };
        Self::resolve_with(cli, file.unwrap_or_default())
    }

    fn resolve_with(cli: &CliOverrides, file: ConfigFile) -> Result<Self> {
        let ConfigFile { engine, timeouts } = file;

        let (engine_path, engine_source) = if let Some(path) = &cli.engine {
            (path.clone(), EngineSource::Flag)
        } else if let Some(path) = env_var("FLOWPROBE_ENGINE") {
            (PathBuf::from(path), EngineSource::Env)
        } else if let Some(path) = engine.binary {
            (path, EngineSource::File)
        } else {
            let build_root = cli
                .build_root
                .clone()
                .or_else(|| env_var("FLOWPROBE_BUILD_ROOT").map(PathBuf::from))
                .or(engine.build_root)
                .unwrap_or_else(|| PathBuf::from("."));
            let locator = EngineLocator {
                build_root,
                target: env_var("EDGELINK_BUILD_TARGET").or(engine.target),
                profile: env_var("EDGELINK_BUILD_PROFILE")
                    .or(engine.profile)
                    .unwrap_or_else(|| EngineLocator::DEFAULT_PROFILE.to_string()),
            };
            (locator.binary_path(), EngineSource::BuildTree)
        };

        let home = cli
            .home
            .clone()
            .or_else(|| env_var("EDGELINK_HOME").map(PathBuf::from))
            .or(engine.home);

        let runner = RunnerConfig {
            read_timeout: seconds(
                "read timeout",
                cli.read_timeout_secs.or(timeouts.read_secs),
                RunnerConfig::DEFAULT_READ_TIMEOUT,
            )?,
            deadline: seconds(
                "deadline",
                cli.deadline_secs.or(timeouts.deadline_secs),
                RunnerConfig::DEFAULT_DEADLINE,
            )?,
            grace: seconds("grace", timeouts.grace_secs, RunnerConfig::DEFAULT_GRACE)?,
            short_read: ShortReadPolicy::ReturnPartial,
        };

        Ok(Self {
            engine: engine_path,
            engine_source,
            home,
            verbosity: engine.verbosity.unwrap_or(0),
            runner,
        })
    }

    pub fn command(&self) -> EngineCommand {
        let mut command = EngineCommand::new(&self.engine).with_verbosity(self.verbosity);
        command.home = self.home.clone();
        command
    }

    pub fn process_runner(&self) -> ProcessRunner {
        ProcessRunner::new(self.command()).with_config(self.runner.clone())
    }
}

fn seconds(what: &str, value: Option<u64>, default: Duration) -> Result<Duration> {
    match value {
        Some(0) => bail!("{what} must be at least one second"),
        Some(secs) => Ok(Duration::from_secs(secs)),
        None => Ok(default),
    }
}

/// Read an environment variable, treating an empty value as unset.
fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
