//! Configuration loading from files and environment variables.
//!
//! Sources, later ones overriding earlier:
//! 1. Built-in defaults
//! 2. Optional `config.{toml,yaml,json,...}` in the working directory
//! 3. `MINUTES__<SECTION>__<KEY>` environment variables

use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;

use crate::error::{IndexError, IndexResult};
use crate::store::DATABASE_FILE;

/// Top-level indexer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IndexerConfig {
    #[serde(default = "default_storage")]
    pub storage: StorageConfig,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default = "default_render")]
    pub render: RenderConfig,

    #[serde(default = "default_ocr")]
    pub ocr: OcrConfig,
}

/// Where documents are read from and the database is written to
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root of the downloaded minutes tree
    #[serde(default = "default_minutes_dir")]
    pub minutes_dir: PathBuf,

    /// Directory holding the page database
    #[serde(default = "default_database_dir")]
    pub database_dir: PathBuf,
}

impl StorageConfig {
    pub fn database_path(&self) -> PathBuf {
        self.database_dir.join(DATABASE_FILE)
    }
}

/// Ingestion pass settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IngestConfig {
    /// Documents processed at once. Defaults to the host's available
    /// parallelism.
    #[serde(default)]
    pub workers: Option<usize>,
}

/// Page rasterisation settings
#[derive(Debug, Clone, Deserialize)]
pub struct RenderConfig {
    /// Page magnification. Tesseract accuracy drops sharply below 2x.
    #[serde(default = "default_zoom")]
    pub zoom: f32,

    /// JPEG quality (1-100) for rendered pages
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

/// OCR engine settings
#[derive(Debug, Clone, Deserialize)]
pub struct OcrConfig {
    /// Tesseract executable, looked up on PATH unless absolute
    #[serde(default = "default_tesseract_cmd")]
    pub tesseract_cmd: PathBuf,

    /// Tesseract language(s), e.g. "eng" or "eng+spa"
    #[serde(default)]
    pub language: Option<String>,
}

/// Load configuration from file and env vars
pub fn load_config() -> IndexResult<IndexerConfig> {
    let builder = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(
            Environment::with_prefix("MINUTES")
                .separator("__")
                .try_parsing(true),
        );

    from_builder(builder)
}

fn from_builder(
    builder: config::ConfigBuilder<config::builder::DefaultState>,
) -> IndexResult<IndexerConfig> {
    let config: IndexerConfig = builder
        .build()
        .map_err(|e| IndexError::Config {
            message: format!("Failed to build config: {}", e),
        })?
        .try_deserialize()
        .map_err(|e| IndexError::Config {
            message: format!("Failed to deserialize config: {}", e),
        })?;

    config.validate()?;
    Ok(config)
}

impl IndexerConfig {
    fn validate(&self) -> IndexResult<()> {
        if !(self.render.zoom.is_finite() && self.render.zoom > 0.0) {
            return Err(IndexError::Config {
                message: format!("render.zoom must be positive, got {}", self.render.zoom),
            });
        }
        if !(1..=100).contains(&self.render.jpeg_quality) {
            return Err(IndexError::Config {
                message: format!(
                    "render.jpeg_quality must be between 1 and 100, got {}",
                    self.render.jpeg_quality
                ),
            });
        }
        if self.ingest.workers == Some(0) {
            return Err(IndexError::Config {
                message: "ingest.workers must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

// ==================== Default Value Functions ====================

fn default_storage() -> StorageConfig {
    StorageConfig {
        minutes_dir: default_minutes_dir(),
        database_dir: default_database_dir(),
    }
}

fn default_minutes_dir() -> PathBuf {
    PathBuf::from("./minutes")
}

fn default_database_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_render() -> RenderConfig {
    RenderConfig {
        zoom: default_zoom(),
        jpeg_quality: default_jpeg_quality(),
    }
}

fn default_zoom() -> f32 {
    2.0
}

fn default_jpeg_quality() -> u8 {
    98
}

fn default_ocr() -> OcrConfig {
    OcrConfig {
        tesseract_cmd: default_tesseract_cmd(),
        language: None,
    }
}

fn default_tesseract_cmd() -> PathBuf {
    PathBuf::from("tesseract")
}
