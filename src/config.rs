use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub converter: ConverterConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Root of the content-addressable parse cache: one subdirectory per
    /// content hash, holding the structured parse output and page renders.
    pub cache_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub default_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub default_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            default_size: default_chunk_size(),
            default_overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    1200
}
fn default_chunk_overlap() -> usize {
    150
}

/// Options forwarded to the structured document converter.
#[derive(Debug, Deserialize, Clone)]
pub struct ConverterConfig {
    #[serde(default)]
    pub do_ocr: bool,
    #[serde(default = "default_true")]
    pub extract_tables: bool,
    #[serde(default = "default_true")]
    pub generate_page_images: bool,
    #[serde(default = "default_image_scale")]
    pub image_scale: f64,
    #[serde(default = "default_accelerator")]
    pub accelerator: String,
    /// 0 lets the converter pick its own thread count.
    #[serde(default)]
    pub num_threads: usize,
    #[serde(default = "default_parse_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            do_ocr: false,
            extract_tables: true,
            generate_page_images: true,
            image_scale: default_image_scale(),
            accelerator: default_accelerator(),
            num_threads: 0,
            timeout_secs: default_parse_timeout_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_image_scale() -> f64 {
    2.0
}
fn default_accelerator() -> String {
    "auto".to_string()
}
fn default_parse_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Upper bound on files processed concurrently within one job.
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_poll_secs")]
    pub poll_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            poll_secs: default_poll_secs(),
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_poll_secs() -> u64 {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourcesConfig {
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec![
        "**/*.pdf".to_string(),
        "**/*.md".to_string(),
        "**/*.txt".to_string(),
        "**/*.json".to_string(),
    ]
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate chunking
    if config.chunking.default_size == 0 {
        anyhow::bail!("chunking.default_size must be > 0");
    }
    if config.chunking.default_overlap >= config.chunking.default_size {
        anyhow::bail!("chunking.default_overlap must be smaller than chunking.default_size");
    }

    // Validate pipeline
    if config.pipeline.workers == 0 {
        anyhow::bail!("pipeline.workers must be >= 1");
    }

    // Validate converter
    match config.converter.accelerator.as_str() {
        "auto" | "cpu" | "cuda" => {}
        other => anyhow::bail!(
            "Unknown converter accelerator: '{}'. Must be auto, cpu, or cuda.",
            other
        ),
    }

    // Validate embedding
    if config.embedding.is_enabled() {
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.batch_size == 0 {
            anyhow::bail!("embedding.batch_size must be >= 1");
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }

    Ok(config)
}
