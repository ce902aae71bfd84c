//! Configuration for palisade.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (PALISADE_HOME, PALISADE_WEBHOOK_SECRET)
//! 2. Config file (.palisade/config.yaml)
//! 3. Defaults (~/.palisade)
//!
//! Config file discovery searches the current directory and its parents
//! for .palisade/config.yaml. Tuning sections omitted from the file take
//! their defaults, so a minimal file only names the dependencies.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::cache::CacheTtls;
use crate::core::circuit::CircuitConfig;
use crate::core::ledger::LimitSettings;
use crate::core::retry::RetryPolicies;
use crate::domain::CostTable;
use crate::health::HealthConfig;
use crate::webhook::WebhookConfig;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,

    /// State directory, relative to the config file's parent.
    #[serde(default)]
    pub home: Option<String>,

    #[serde(default)]
    pub circuit: Option<CircuitConfig>,
    #[serde(default)]
    pub retry: Option<RetryPolicies>,
    #[serde(default)]
    pub cache: Option<CacheTtls>,
    #[serde(default)]
    pub limits: Option<LimitSettings>,
    #[serde(default)]
    pub webhook: Option<WebhookConfig>,
    #[serde(default)]
    pub health: Option<HealthConfig>,
    #[serde(default)]
    pub costs: Option<CostTable>,

    /// External dependencies with health endpoints to probe.
    #[serde(default)]
    pub dependencies: Vec<DependencyDecl>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DependencyDecl {
    pub name: String,
    pub health_url: Option<String>,
}

/// Resolved configuration with absolute paths and all sections filled in.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to the palisade state directory.
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,

    pub circuit: CircuitConfig,
    pub retry: RetryPolicies,
    pub cache: CacheTtls,
    pub limits: LimitSettings,
    pub webhook: WebhookConfig,
    pub health: HealthConfig,
    pub costs: CostTable,
    pub dependencies: Vec<DependencyDecl>,
}

impl ResolvedConfig {
    /// Usage journal ($PALISADE_HOME/usage.jsonl)
    pub fn usage_journal_path(&self) -> PathBuf {
        self.home.join("usage.jsonl")
    }

    /// Webhook delivery log ($PALISADE_HOME/deliveries.jsonl)
    pub fn deliveries_path(&self) -> PathBuf {
        self.home.join("deliveries.jsonl")
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".palisade").join("config.yaml");
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

/// Resolve a path that may be relative to the config file's parent
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

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".palisade");

    let config_file = find_config_file();

    let file = match config_file {
        Some(ref path) => Some(load_config_file(path)?),
        None => None,
    };

    let home = if let Ok(env_home) = std::env::var("PALISADE_HOME") {
        PathBuf::from(env_home)
    } else if let Some(home_path) = file.as_ref().and_then(|f| f.home.as_deref()) {
        // home is relative to the .palisade/ directory
        let palisade_dir = config_file
            .as_deref()
            .and_then(Path::parent)
            .unwrap_or(Path::new("."));
        resolve_path(palisade_dir, home_path)
    } else {
        default_home
    };

    let mut webhook = file
        .as_ref()
        .and_then(|f| f.webhook.clone())
        .unwrap_or_default();
    if let Ok(secret) = std::env::var("PALISADE_WEBHOOK_SECRET") {
        webhook.secret = Some(secret);
    }

    Ok(ResolvedConfig {
        home,
        config_file,
        circuit: file
            .as_ref()
            .and_then(|f| f.circuit)
            .unwrap_or_default(),
        retry: file.as_ref().and_then(|f| f.retry).unwrap_or_default(),
        cache: file.as_ref().and_then(|f| f.cache).unwrap_or_default(),
        limits: file.as_ref().and_then(|f| f.limits).unwrap_or_default(),
        webhook,
        health: file
            .as_ref()
            .and_then(|f| f.health.clone())
            .unwrap_or_default(),
        costs: file
            .as_ref()
            .and_then(|f| f.costs.clone())
            .unwrap_or_default(),
        dependencies: file.map(|f| f.dependencies).unwrap_or_default(),
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}
