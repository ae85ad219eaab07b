use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub artifacts: ArtifactsConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub activation: ActivationConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ArtifactsConfig {
    /// Directory holding per-(service, tag) subset/dictionary files.
    pub dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexingConfig {
    /// Bounded parallelism for per-document work inside a build.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Maximum stored neighbors per (service, tag, document) key.
    #[serde(default = "default_max_neighbors")]
    pub max_neighbors: usize,
    /// Report progress at most once per this many documents.
    #[serde(default = "default_progress_every")]
    pub progress_every: usize,
    /// Word-occurrence fetch batch size.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Delay between retries when the document store is overloaded.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            max_neighbors: default_max_neighbors(),
            progress_every: default_progress_every(),
            batch_size: default_batch_size(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
fn default_max_neighbors() -> usize {
    50
}
fn default_progress_every() -> usize {
    25
}
fn default_batch_size() -> usize {
    64
}
fn default_retry_backoff_ms() -> u64 {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct ActivationConfig {
    /// Safety multiplier applied to on-disk artifact sizes when estimating
    /// the in-memory footprint of an activation.
    #[serde(default = "default_memory_multiplier")]
    pub memory_multiplier: f64,
    /// Overrides the detected available memory (bytes). Mainly for tests.
    #[serde(default)]
    pub available_memory_override: Option<u64>,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            memory_multiplier: default_memory_multiplier(),
            available_memory_override: None,
        }
    }
}

fn default_memory_multiplier() -> f64 {
    3.0
}

impl Config {
    /// Minimal config rooted at a directory. Used by tests and `tagsim init`.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            db: DbConfig {
                path: root.join("tagsim.sqlite"),
            },
            artifacts: ArtifactsConfig {
                dir: root.join("artifacts"),
            },
            indexing: IndexingConfig::default(),
            activation: ActivationConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.indexing.parallelism == 0 {
        anyhow::bail!("indexing.parallelism must be > 0");
    }
    if config.indexing.max_neighbors == 0 {
        anyhow::bail!("indexing.max_neighbors must be > 0");
    }
    if config.indexing.batch_size == 0 {
        anyhow::bail!("indexing.batch_size must be > 0");
    }
    if config.activation.memory_multiplier < 1.0 {
        anyhow::bail!("activation.memory_multiplier must be >= 1.0");
    }

    Ok(config)
}
