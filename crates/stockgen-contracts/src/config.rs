use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub const DEFAULT_TARGET_SIZE: u32 = 4000;
pub const DEFAULT_JPEG_QUALITY: u8 = 95;
pub const DEFAULT_DPI: u16 = 300;

/// Provider selection policy. One snapshot governs a whole run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub active_model: String,
    #[serde(default = "default_fallback_order")]
    pub fallback_order: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            active_model: "openai".to_string(),
            fallback_order: default_fallback_order(),
        }
    }
}

impl OrchestratorConfig {
    pub fn new(active_model: impl Into<String>, fallback_order: Vec<String>) -> Self {
        Self {
            active_model: active_model.into(),
            fallback_order,
        }
    }
}

fn default_fallback_order() -> Vec<String> {
    ["openai", "stability", "huggingface", "together"]
        .iter()
        .map(|id| (*id).to_string())
        .collect()
}

/// Knobs for normalization, placeholder rendering and post-processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub output_dir: PathBuf,
    pub target_size: u32,
    pub jpeg_quality: u8,
    pub dpi: u16,
    pub max_source_bytes: u64,
    pub max_decoded_bytes: u64,
    pub max_download_bytes: u64,
    pub download_timeout_secs: u64,
    pub placeholder_size: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            output_dir: std::env::temp_dir().join("stockgen"),
            target_size: DEFAULT_TARGET_SIZE,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            dpi: DEFAULT_DPI,
            max_source_bytes: 50 * 1024 * 1024,
            max_decoded_bytes: 512 * 1024 * 1024,
            max_download_bytes: 50 * 1024 * 1024,
            download_timeout_secs: 60,
            placeholder_size: 1024,
        }
    }
}

impl PipelineSettings {
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StockgenConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub pipeline: PipelineSettings,
}

impl StockgenConfig {
    /// Reads an optional JSON file, then applies `STOCKGEN_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed reading config {}", path.display()))?;
                serde_json::from_str::<StockgenConfig>(&raw)
                    .with_context(|| format!("invalid config JSON in {}", path.display()))?
            }
            None => StockgenConfig::default(),
        };
        config.apply_env_overrides(non_empty_env);
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(active) = lookup("STOCKGEN_ACTIVE_MODEL") {
            self.orchestrator.active_model = active;
        }
        if let Some(order) = lookup("STOCKGEN_FALLBACK_ORDER") {
            self.orchestrator.fallback_order = parse_provider_list(&order);
        }
        if let Some(dir) = lookup("STOCKGEN_OUTPUT_DIR") {
            self.pipeline.output_dir = PathBuf::from(dir);
        }
        if let Some(size) = lookup("STOCKGEN_TARGET_SIZE").and_then(|raw| raw.parse::<u32>().ok())
        {
            if size > 0 {
                self.pipeline.target_size = size;
            }
        }
    }
}

pub fn parse_provider_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .collect()
}

/// Hot-swappable holder for the selection policy.
///
/// Runs call [`ConfigHandle::snapshot`] once and keep the returned `Arc` for
/// their whole lifetime, so a concurrent [`ConfigHandle::replace`] never
/// changes policy mid-run.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    current: Arc<ArcSwap<OrchestratorConfig>>,
}

impl ConfigHandle {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(config)),
        }
    }

    pub fn snapshot(&self) -> Arc<OrchestratorConfig> {
        self.current.load_full()
    }

    pub fn replace(&self, config: OrchestratorConfig) {
        self.current.store(Arc::new(config));
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
