//! Configuration for the huntarr service.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (HUNTARR_HOME, HUNTARR_DB, HUNTARR_ADDR,
//!    PLAYWRIGHT_VNC_URL, HUNTARR_AUTOMATION_URL)
//! 2. Config file (.huntarr/config.yaml)
//! 3. Defaults (~/.huntarr)
//!
//! Config file discovery:
//! - Searches current directory and parents for .huntarr/config.yaml
//! - Relative paths in the config file are resolved against its `.huntarr/` directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::orchestrator::OrchestratorSettings;
use crate::core::safety::ExecutionLimits;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

pub const DEFAULT_ADDR: &str = "127.0.0.1:8000";
pub const DEFAULT_SESSION_URL: &str = "http://localhost:7900";
const DEFAULT_AUTOMATION_TIMEOUT_SECONDS: u64 = 120;

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub home: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub manual: ManualConfig,
    #[serde(default)]
    pub automation: AutomationConfig,
    #[serde(default)]
    pub orchestrator: Option<ExecutionLimits>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    pub addr: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManualConfig {
    /// Remote browser session handed to operators
    pub session_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AutomationConfig {
    pub base_url: Option<String>,
    pub timeout_seconds: Option<u64>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// State directory (lock file, default database location)
    pub home: PathBuf,
    /// SQLite database path
    pub database: PathBuf,
    /// HTTP listen address
    pub addr: String,
    /// Default manual session URL
    pub session_url: String,
    /// External automation service, if configured
    pub automation_url: Option<String>,
    pub automation_timeout: Duration,
    pub limits: ExecutionLimits,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

impl ResolvedConfig {
    /// Advisory lock held by `serve`
    pub fn lock_path(&self) -> PathBuf {
        self.home.join("huntarr.lock")
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            limits: self.limits.clone(),
            session_url: Some(self.session_url.clone()),
            ..OrchestratorSettings::default()
        }
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".huntarr").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Merge file values and environment over defaults.
///
/// `env` is injected so resolution can be tested without touching the
/// process environment.
fn resolve<E>(file: ConfigFile, config_file: Option<PathBuf>, env: E) -> Result<ResolvedConfig>
where
    E: Fn(&str) -> Option<String>,
{
    let base_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let home = match (env("HUNTARR_HOME"), &file.home) {
        (Some(home), _) => PathBuf::from(home),
        (None, Some(home)) => resolve_path(&base_dir, home),
        (None, None) => dirs::home_dir()
            .context("Failed to determine home directory")?
            .join(".huntarr"),
    };

    let database = match (env("HUNTARR_DB"), &file.database) {
        (Some(db), _) => PathBuf::from(db),
        (None, Some(db)) => resolve_path(&base_dir, db),
        (None, None) => home.join("huntarr.db"),
    };

    let addr = env("HUNTARR_ADDR")
        .or(file.server.addr)
        .unwrap_or_else(|| DEFAULT_ADDR.to_string());

    let session_url = env("PLAYWRIGHT_VNC_URL")
        .or(file.manual.session_url)
        .unwrap_or_else(|| DEFAULT_SESSION_URL.to_string());

    let automation_url = env("HUNTARR_AUTOMATION_URL")
        .or(file.automation.base_url)
        .filter(|url| !url.trim().is_empty());

    let automation_timeout = Duration::from_secs(
        file.automation
            .timeout_seconds
            .unwrap_or(DEFAULT_AUTOMATION_TIMEOUT_SECONDS),
    );

    Ok(ResolvedConfig {
        home,
        database,
        addr,
        session_url,
        automation_url,
        automation_timeout,
        limits: file.orchestrator.unwrap_or_default(),
        config_file,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let config_file = find_config_file();
    let file = match &config_file {
        Some(path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    resolve(file, config_file, |key| std::env::var(key).ok())
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Get the huntarr home directory
pub fn huntarr_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}
