//! Configuration for genflow.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (GENFLOW_HOME, GENFLOW_WORKFLOWS, GENFLOW_MODELS)
//! 2. Config file (.genflow/config.yaml)
//! 3. Defaults (~/.genflow)
//!
//! Config file discovery:
//! - Searches current directory and parents for .genflow/config.yaml
//! - `paths.home` is relative to the .genflow directory, other paths to the
//!   project root (the parent of .genflow)

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::{ExecutorConfig, HealthPolicy};
use crate::providers::HttpProviderConfig;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    /// Provider health thresholds and cooldown curve
    #[serde(default)]
    pub router: Option<HealthPolicy>,
    #[serde(default)]
    pub executor: Option<ExecutorConfig>,
    /// HTTP provider backends
    #[serde(default)]
    pub providers: Vec<HttpProviderConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .genflow/)
    pub home: Option<String>,
    /// Workflow definitions directory
    pub workflows: Option<String>,
    /// Model catalog file
    pub models: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Engine state (store, defaults for the rest)
    pub home: PathBuf,
    pub workflows: PathBuf,
    pub models: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub router: HealthPolicy,
    pub executor: ExecutorConfig,
    pub providers: Vec<HttpProviderConfig>,
}

/// Paths taken from the environment
#[derive(Debug, Clone, Default)]
struct EnvOverrides {
    home: Option<PathBuf>,
    workflows: Option<PathBuf>,
    models: Option<PathBuf>,
}

impl EnvOverrides {
    fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty()).map(PathBuf::from);
        Self {
            home: var("GENFLOW_HOME"),
            workflows: var("GENFLOW_WORKFLOWS"),
            models: var("GENFLOW_MODELS"),
        }
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".genflow").join("config.yaml");
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

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Merge the three sources
fn resolve(
    file: Option<(&Path, ConfigFile)>,
    env: EnvOverrides,
    default_home: PathBuf,
) -> ResolvedConfig {
    let Some((config_path, config)) = file else {
        let home = env.home.unwrap_or(default_home);
        return ResolvedConfig {
            workflows: env.workflows.unwrap_or_else(|| home.join("workflows")),
            models: env.models.unwrap_or_else(|| home.join("models.yaml")),
            home,
            config_file: None,
            router: HealthPolicy::default(),
            executor: ExecutorConfig::default(),
            providers: Vec::new(),
        };
    };

    // .genflow/ and the project root above it
    let genflow_dir = config_path.parent().unwrap_or(Path::new("."));
    let base_dir = genflow_dir.parent().unwrap_or(Path::new("."));

    let home = env
        .home
        .or_else(|| config.paths.home.as_deref().map(|p| resolve_path(genflow_dir, p)))
        .unwrap_or(default_home);

    let workflows = env
        .workflows
        .or_else(|| config.paths.workflows.as_deref().map(|p| resolve_path(base_dir, p)))
        .unwrap_or_else(|| home.join("workflows"));

    let models = env
        .models
        .or_else(|| config.paths.models.as_deref().map(|p| resolve_path(base_dir, p)))
        .unwrap_or_else(|| home.join("models.yaml"));

    ResolvedConfig {
        home,
        workflows,
        models,
        config_file: Some(config_path.to_path_buf()),
        router: config.router.unwrap_or_default(),
        executor: config.executor.unwrap_or_default(),
        providers: config.providers,
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".genflow");

    let env = EnvOverrides::from_env();

    match find_config_file() {
        Some(config_path) => {
            let config = load_config_file(&config_path)?;
            Ok(resolve(Some((&config_path, config)), env, default_home))
        }
        None => Ok(resolve(None, env, default_home)),
    }
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration, bypassing the cache
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the store directory ($GENFLOW_HOME/store)
pub fn store_dir() -> Result<PathBuf> {
    Ok(config()?.home.join("store"))
}
