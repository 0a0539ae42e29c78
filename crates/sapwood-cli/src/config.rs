//! Configuration file and environment settings.

use sapwood::ExternalMode;
use sapwood_adapters::ExternalSettings;
use serde::Deserialize;
use std::path::PathBuf;

/// Path of an alternative config file.
pub const CONFIG_ENV: &str = "SAPWOOD_CONFIG";
pub const DATABASE_ENV: &str = "SAPWOOD_DATABASE";
pub const LOCATION_ENV: &str = "SAPWOOD_LOCATION";
pub const PIPELINES_PATH_ENV: &str = "SAPWOOD_PIPELINES_PATH";
pub const SANDBOX_ENV: &str = "SAPWOOD_SANDBOX_ENVIRONMENT";

/// Main configuration structure.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default CLI options.
    pub defaults: Defaults,
    pub warehouse: Warehouse,
    pub external: External,
    pub pipelines: Pipelines,
}

/// Default CLI options.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Defaults {
    /// Enable verbose output by default.
    pub verbose: bool,
    /// Enable quiet output by default.
    pub quiet: bool,
    /// Log level when `RUST_LOG` is unset.
    pub log_level: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Warehouse {
    /// Database for pipelines that do not name one.
    pub database: Option<String>,
    pub location: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct External {
    /// `local-process` or `remote-pod`.
    pub mode: Option<String>,
    pub tool: Option<String>,
    pub projects_path: Option<PathBuf>,
    pub image: Option<String>,
    pub launcher: Option<String>,
    pub namespace: Option<String>,
    /// Set from the sandbox environment variable; not read from the file.
    #[serde(skip)]
    pub sandbox: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Pipelines {
    pub path: Option<PathBuf>,
    pub id_prefix: Option<String>,
}

impl Config {
    /// Load config from the default location (~/.config/sapwood/config.toml),
    /// or from `SAPWOOD_CONFIG`, then apply environment overrides.
    pub fn load() -> Self {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .or_else(Self::default_path);
        let mut config = Self::load_from_path(path);
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Load config from a specific path.
    pub fn load_from_path(path: Option<PathBuf>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        if !path.exists() {
            return Self::default();
        }

        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Warning: Failed to parse config file: {}", e);
                    Self::default()
                }
            },
            Err(e) => {
                eprintln!("Warning: Failed to read config file: {}", e);
                Self::default()
            }
        }
    }

    /// Get the default config file path.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("sapwood").join("config.toml"))
    }

    /// Override settings from environment variables.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(database) = var(DATABASE_ENV).filter(|v| !v.is_empty()) {
            self.warehouse.database = Some(database);
        }
        if let Some(location) = var(LOCATION_ENV).filter(|v| !v.is_empty()) {
            self.warehouse.location = Some(location);
        }
        if let Some(path) = var(PIPELINES_PATH_ENV).filter(|v| !v.is_empty()) {
            self.pipelines.path = Some(PathBuf::from(path));
        }
        if let Some(sandbox) = var(SANDBOX_ENV) {
            self.external.sandbox = Some(sandbox);
        }
    }

    /// Where external transforms run. The sandbox variable, when set,
    /// decides; otherwise the configured mode, defaulting to remote pods.
    pub fn external_mode(&self) -> ExternalMode {
        if self.external.sandbox.is_some() {
            return ExternalMode::from_sandbox_flag(self.external.sandbox.as_deref());
        }
        match self.external.mode.as_deref() {
            Some("local-process") | Some("local") => ExternalMode::LocalProcess,
            _ => ExternalMode::RemotePod,
        }
    }

    pub fn external_settings(&self) -> ExternalSettings {
        let defaults = ExternalSettings::default();
        let mut settings = ExternalSettings {
            mode: self.external_mode(),
            tool: self.external.tool.clone().unwrap_or(defaults.tool),
            projects_path: self
                .external
                .projects_path
                .clone()
                .unwrap_or(defaults.projects_path),
            image: self.external.image.clone().unwrap_or(defaults.image),
            namespace: self.external.namespace.clone().unwrap_or(defaults.namespace),
            launcher: self.external.launcher.clone().unwrap_or(defaults.launcher),
            env: defaults.env,
        };
        if let Some(database) = &self.warehouse.database {
            settings.env.insert(DATABASE_ENV.into(), database.clone());
        }
        if let Some(location) = &self.warehouse.location {
            settings.env.insert(LOCATION_ENV.into(), location.clone());
        }
        settings
    }

    pub fn pipelines_path(&self) -> PathBuf {
        self.pipelines
            .path
            .clone()
            .unwrap_or_else(|| PathBuf::from("pipelines"))
    }

    pub fn log_level(&self) -> &str {
        self.defaults.log_level.as_deref().unwrap_or("warn")
    }
}
