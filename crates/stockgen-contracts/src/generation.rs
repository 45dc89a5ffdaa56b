use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const MAX_PROMPT_CHARS: usize = 4000;
pub const PLACEHOLDER_PROVIDER_ID: &str = "placeholder";
pub const PLACEHOLDER_MODEL: &str = "placeholder-gradient-v1";
pub const DEMO_MODE_REASON: &str = "Demo Mode Activated";

const BASE_EDGE: u32 = 1024;

/// A caller's request for one generated image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub requested_model: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub force_fallback: bool,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            requested_model: None,
            size: None,
            quality: None,
            style: None,
            seed: None,
            force_fallback: false,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.requested_model = Some(model.into());
        self
    }

    pub fn with_size(mut self, size: impl Into<String>) -> Self {
        self.size = Some(size.into());
        self
    }

    pub fn with_style(mut self, style: impl Into<String>) -> Self {
        self.style = Some(style.into());
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_force_fallback(mut self, force: bool) -> Self {
        self.force_fallback = force;
        self
    }

    /// Checks the prompt bounds. Returns a human readable reason on failure.
    pub fn validate(&self) -> Result<(), String> {
        if self.prompt.trim().is_empty() {
            return Err("prompt must not be empty".to_string());
        }
        let chars = self.prompt.chars().count();
        if chars > MAX_PROMPT_CHARS {
            return Err(format!(
                "prompt is {chars} characters; the limit is {MAX_PROMPT_CHARS}"
            ));
        }
        Ok(())
    }
}

/// Provider-agnostic hints handed to every adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub seed: Option<u64>,
    pub width: u32,
    pub height: u32,
    pub quality: Option<String>,
    pub style: Option<String>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            seed: None,
            width: BASE_EDGE,
            height: BASE_EDGE,
            quality: None,
            style: None,
        }
    }
}

impl GenerationOptions {
    pub fn from_request(request: &GenerationRequest) -> Self {
        let (width, height) = request
            .size
            .as_deref()
            .map(parse_size_hint)
            .unwrap_or((BASE_EDGE, BASE_EDGE));
        Self {
            seed: request.seed,
            width,
            height,
            quality: request.quality.clone(),
            style: request.style.clone(),
        }
    }

    pub fn aspect_ratio(&self) -> f64 {
        if self.height == 0 {
            return 1.0;
        }
        self.width as f64 / self.height as f64
    }
}

/// Accepts `WxH`, `W:H` ratios, and the names `square`, `landscape`, `portrait`.
/// Ratios are scaled so the pixel count stays close to 1024x1024.
pub fn parse_size_hint(raw: &str) -> (u32, u32) {
    let normalized = raw.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "square" => return (BASE_EDGE, BASE_EDGE),
        "landscape" => return dims_for_ratio(16.0, 9.0),
        "portrait" => return dims_for_ratio(9.0, 16.0),
        _ => {}
    }
    if let Some((w, h)) = normalized.split_once('x') {
        if let (Ok(width), Ok(height)) = (w.trim().parse::<u32>(), h.trim().parse::<u32>()) {
            if width > 0 && height > 0 {
                return (width, height);
            }
        }
    }
    if let Some((w, h)) = normalized.split_once(':') {
        if let (Ok(width), Ok(height)) = (w.trim().parse::<f64>(), h.trim().parse::<f64>()) {
            if width > 0.0 && height > 0.0 {
                return dims_for_ratio(width, height);
            }
        }
    }
    (BASE_EDGE, BASE_EDGE)
}

fn dims_for_ratio(width: f64, height: f64) -> (u32, u32) {
    let area = (BASE_EDGE * BASE_EDGE) as f64;
    let ratio = width / height;
    let h = (area / ratio).sqrt();
    let w = h * ratio;
    (snap_to_64(w), snap_to_64(h))
}

fn snap_to_64(value: f64) -> u32 {
    let snapped = ((value / 64.0).round() as u32) * 64;
    snapped.max(64)
}

/// Opaque caller identity. Quota results are carried through, never enforced here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UserContext {
    pub user_id: String,
    #[serde(default)]
    pub quota_remaining: Option<u64>,
}

impl UserContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            quota_remaining: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawPayload {
    Buffer(Vec<u8>),
    Base64(String),
    Url(String),
}

impl RawPayload {
    pub fn format(&self) -> &'static str {
        match self {
            Self::Buffer(_) => "buffer",
            Self::Base64(_) => "base64",
            Self::Url(_) => "url",
        }
    }
}

/// One adapter invocation's reply, before normalization.
#[derive(Debug, Clone)]
pub struct ProviderResult {
    pub success: bool,
    pub provider_id: String,
    pub model: String,
    pub raw_payload: RawPayload,
    pub dimensions: Option<(u32, u32)>,
    pub generation_params: Map<String, Value>,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub content_hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Auth,
    Quota,
    Server,
    Timeout,
    Unknown,
    InvalidEncoding,
    Download,
    CircuitOpen,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Quota => "quota",
            Self::Server => "server",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
            Self::InvalidEncoding => "invalid_encoding",
            Self::Download => "download",
            Self::CircuitOpen => "circuit_open",
        }
    }

    /// The caller-facing reason recorded when the placeholder replaces a failed chain.
    pub fn fallback_reason(&self) -> &'static str {
        match self {
            Self::Auth => "Authentication Failed",
            Self::Quota => "Quota Exceeded",
            Self::Server => "Server Error",
            Self::Timeout => "Request Timeout",
            Self::Unknown | Self::InvalidEncoding | Self::Download | Self::CircuitOpen => {
                "API Error"
            }
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub provider_id: String,
    pub succeeded: bool,
    pub error_class: Option<ErrorClass>,
    pub http_status: Option<u16>,
    pub message: Option<String>,
    pub duration_ms: u64,
}

impl AttemptRecord {
    pub fn success(provider_id: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            provider_id: provider_id.into(),
            succeeded: true,
            error_class: None,
            http_status: None,
            message: None,
            duration_ms,
        }
    }

    pub fn failure(
        provider_id: impl Into<String>,
        error_class: ErrorClass,
        http_status: Option<u16>,
        message: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            succeeded: false,
            error_class: Some(error_class),
            http_status,
            message: Some(message.into()),
            duration_ms,
        }
    }
}

/// Derives the placeholder reason from the last failed attempt.
pub fn fallback_reason_from_attempts(attempts: &[AttemptRecord]) -> &'static str {
    attempts
        .iter()
        .rev()
        .find(|attempt| !attempt.succeeded)
        .and_then(|attempt| attempt.error_class)
        .unwrap_or(ErrorClass::Unknown)
        .fallback_reason()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalImageAsset {
    pub file_path: PathBuf,
    pub byte_size: u64,
    pub width: u32,
    pub height: u32,
    pub mime_type: String,
    pub content_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationOutcome {
    pub used_provider: String,
    pub used_model: String,
    pub fallback_reason: Option<String>,
    pub source_hash: String,
    pub asset: FinalImageAsset,
    pub attempts: Vec<AttemptRecord>,
    #[serde(default)]
    pub generation_params: Map<String, Value>,
}

impl GenerationOutcome {
    pub fn used_placeholder(&self) -> bool {
        self.used_provider == PLACEHOLDER_PROVIDER_ID
    }
}
