//! Loading pipeline documents and their assets from disk.
//!
//! A pipelines directory holds one sub-directory per pipeline:
//!
//! ```text
//! pipelines/
//!   orders/
//!     config.yaml
//!     sql/
//!       stg_orders.sql
//!       orders_daily.sql
//! ```
//!
//! Sub-directories without a `config.*` file are ignored.

use crate::spec::Task;
use crate::value::Value;
use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Config file names looked up in a pipeline directory, in order.
const CONFIG_FILES: &[&str] = &["config.yaml", "config.yml", "config.json", "config.toml"];

/// Default pipeline id prefix.
pub const DEFAULT_ID_PREFIX: &str = "sapwood";

/// Supported document formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Yaml,
    Json,
    Toml,
}

impl DocumentFormat {
    /// Detect format from a format name or file extension.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "yaml" | "yml" => Some(DocumentFormat::Yaml),
            "json" => Some(DocumentFormat::Json),
            "toml" => Some(DocumentFormat::Toml),
            _ => None,
        }
    }

    /// Detect format from a file path's extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_name)
    }
}

/// Errors raised while reading pipeline documents and assets.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse pipeline document: {0}")]
    Parse(String),

    #[error("unsupported pipeline document format: {0}")]
    UnsupportedFormat(String),

    #[error("no config file found in {0}")]
    MissingConfig(PathBuf),

    #[error("task `{task}` has no SQL body, expected {path}")]
    MissingSql { task: String, path: PathBuf },
}

/// Parse a pipeline document into its raw structure.
pub fn load_document(data: &[u8], format: DocumentFormat) -> Result<Value, LoadError> {
    match format {
        DocumentFormat::Json => {
            serde_json::from_slice(data).map_err(|e| LoadError::Parse(e.to_string()))
        }
        DocumentFormat::Yaml => {
            serde_yaml::from_slice(data).map_err(|e| LoadError::Parse(e.to_string()))
        }
        DocumentFormat::Toml => {
            let s = std::str::from_utf8(data)
                .map_err(|e| LoadError::Parse(format!("Invalid UTF-8: {}", e)))?;
            toml::from_str(s).map_err(|e| LoadError::Parse(e.to_string()))
        }
    }
}

/// A pipeline document read from disk, not yet validated.
#[derive(Debug, Clone)]
pub struct PipelineSource {
    /// Pipeline id, `<prefix>__<directory name>`.
    pub id: String,
    /// The pipeline directory.
    pub dir: PathBuf,
    /// The config file the document was read from.
    pub config_path: PathBuf,
    /// Raw document.
    pub document: Value,
}

/// Finds and reads pipelines below a root directory.
#[derive(Debug, Clone)]
pub struct PipelineLoader {
    root: PathBuf,
    id_prefix: String,
}

impl PipelineLoader {
    /// Create a loader for the given pipelines directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            id_prefix: DEFAULT_ID_PREFIX.to_string(),
        }
    }

    /// Set the pipeline id prefix.
    pub fn id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.id_prefix = prefix.into();
        self
    }

    /// Pipeline directories below the root, sorted by name.
    pub fn discover(&self) -> Result<Vec<PathBuf>, LoadError> {
        debug!(root = %self.root.display(), "scanning pipelines directory");

        let mut dirs = Vec::new();
        for entry in WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| LoadError::Io {
                path: self.root.clone(),
                source: e.into(),
            })?;
            if !entry.file_type().is_dir() {
                continue;
            }
            if find_config(entry.path()).is_none() {
                debug!(dir = %entry.path().display(), "ignoring directory without config file");
                continue;
            }
            dirs.push(entry.into_path());
        }

        Ok(dirs)
    }

    /// Read the config document of one pipeline directory.
    pub fn load_dir(&self, dir: &Path) -> Result<PipelineSource, LoadError> {
        let config_path = find_config(dir).ok_or_else(|| LoadError::MissingConfig(dir.to_path_buf()))?;
        let format = DocumentFormat::from_path(&config_path)
            .ok_or_else(|| LoadError::UnsupportedFormat(config_path.display().to_string()))?;

        let data = std::fs::read(&config_path).map_err(|source| LoadError::Io {
            path: config_path.clone(),
            source,
        })?;
        let document = load_document(&data, format)?;

        Ok(PipelineSource {
            id: self.pipeline_id(dir),
            dir: dir.to_path_buf(),
            config_path,
            document,
        })
    }

    /// Pipeline id for a directory.
    pub fn pipeline_id(&self, dir: &Path) -> String {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!("{}__{}", self.id_prefix, name)
    }
}

/// Locate the config file of a pipeline directory.
pub fn find_config(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

/// Conventional location of a task's SQL body.
pub fn sql_path(dir: &Path, identifier: &str) -> PathBuf {
    dir.join("sql").join(format!("{}.sql", identifier))
}

/// Read the SQL bodies of every task that needs one.
pub fn read_sql(dir: &Path, tasks: &[Task]) -> Result<IndexMap<String, String>, LoadError> {
    let mut bodies = IndexMap::new();

    for task in tasks.iter().filter(|t| t.needs_sql()) {
        let path = sql_path(dir, &task.identifier);
        let body = match std::fs::read_to_string(&path) {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LoadError::MissingSql {
                    task: task.identifier.clone(),
                    path,
                });
            }
            Err(source) => return Err(LoadError::Io { path, source }),
        };
        bodies.insert(task.identifier.clone(), body);
    }

    Ok(bodies)
}
