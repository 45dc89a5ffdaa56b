use std::collections::BTreeMap;

use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::{json, Map, Value};
use stockgen_contracts::events::now_utc_iso;
use stockgen_contracts::generation::{GenerationOptions, ProviderResult, RawPayload};
use stockgen_contracts::providers::{PayloadStyle, ProviderCatalog, ProviderSpec, ResponseShape};

use crate::error::ProviderError;

const ERROR_BODY_CHARS: usize = 512;

/// SDXL 1.0 only accepts these resolutions.
const SDXL_DIMENSIONS: [(u32, u32); 9] = [
    (1024, 1024),
    (1152, 896),
    (896, 1152),
    (1216, 832),
    (832, 1216),
    (1344, 768),
    (768, 1344),
    (1536, 640),
    (640, 1536),
];

/// One external image API behind a uniform call.
pub trait ProviderAdapter: Send + Sync {
    fn id(&self) -> &str;
    fn generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<ProviderResult, ProviderError>;
    fn status(&self) -> ProviderStatus;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderStatus {
    pub id: String,
    pub display_name: String,
    pub model: String,
    pub endpoint: String,
    pub api_key_env: String,
    pub configured: bool,
    pub response_format: String,
}

impl ProviderStatus {
    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "display_name": self.display_name,
            "model": self.model,
            "endpoint": self.endpoint,
            "api_key_env": self.api_key_env,
            "configured": self.configured,
            "response_format": self.response_format,
        })
    }
}

/// Adapter driven entirely by a [`ProviderSpec`] row.
pub struct HttpProviderAdapter {
    spec: ProviderSpec,
    endpoint: String,
    api_key: Option<String>,
    http: HttpClient,
}

impl HttpProviderAdapter {
    /// Resolves endpoint and key from the `*_API_BASE` and key variables of the row.
    pub fn from_env(spec: ProviderSpec) -> anyhow::Result<Self> {
        let endpoint = spec.endpoint();
        let api_key = std::env::var(&spec.api_key_env)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        Self::with_endpoint(spec, endpoint, api_key)
    }

    pub fn with_endpoint(
        spec: ProviderSpec,
        endpoint: impl Into<String>,
        api_key: Option<String>,
    ) -> anyhow::Result<Self> {
        let http = HttpClient::builder().timeout(spec.timeout).build()?;
        Ok(Self {
            spec,
            endpoint: endpoint.into(),
            api_key,
            http,
        })
    }

    pub fn spec(&self) -> &ProviderSpec {
        &self.spec
    }

    fn accept_header(&self) -> &'static str {
        match self.spec.response {
            ResponseShape::Binary => "image/png",
            _ => "application/json",
        }
    }

    fn extract_payload(&self, response: HttpResponse) -> Result<RawPayload, ProviderError> {
        match &self.spec.response {
            ResponseShape::Binary => {
                let content_type = response
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("")
                    .to_ascii_lowercase();
                if content_type.starts_with("application/json") || content_type.starts_with("text/")
                {
                    let body = response.text().map_err(|err| self.transport_error(err))?;
                    return Err(self.unknown(
                        None,
                        format!(
                            "expected image bytes, got {content_type}: {}",
                            truncate_text(body.trim(), ERROR_BODY_CHARS)
                        ),
                    ));
                }
                let bytes = response.bytes().map_err(|err| self.transport_error(err))?;
                if bytes.is_empty() {
                    return Err(self.unknown(None, "empty image body".to_string()));
                }
                Ok(RawPayload::Buffer(bytes.to_vec()))
            }
            ResponseShape::Base64Field(pointer) => {
                let text = self.json_string_at(response, pointer)?;
                Ok(RawPayload::Base64(text))
            }
            ResponseShape::UrlField(pointer) => {
                let text = self.json_string_at(response, pointer)?;
                Ok(RawPayload::Url(text))
            }
        }
    }

    fn json_string_at(&self, response: HttpResponse, pointer: &str) -> Result<String, ProviderError> {
        let body = response.text().map_err(|err| self.transport_error(err))?;
        let parsed: Value = serde_json::from_str(&body).map_err(|err| {
            self.unknown(None, format!("returned invalid JSON payload: {err}"))
        })?;
        parsed
            .pointer(pointer)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .ok_or_else(|| self.unknown(None, format!("response missing {pointer}")))
    }

    fn transport_error(&self, err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            return ProviderError::Timeout {
                provider: self.spec.id.clone(),
                after: self.spec.timeout,
            };
        }
        self.unknown(
            err.status().map(|status| status.as_u16()),
            format!("request failed: {}", error_chain_text(&err)),
        )
    }

    fn unknown(&self, status: Option<u16>, message: String) -> ProviderError {
        ProviderError::Unknown {
            provider: self.spec.id.clone(),
            status,
            message,
        }
    }
}

impl ProviderAdapter for HttpProviderAdapter {
    fn id(&self) -> &str {
        &self.spec.id
    }

    fn generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<ProviderResult, ProviderError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(self.unknown(None, "prompt is empty".to_string()));
        }
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(ProviderError::Auth {
                provider: self.spec.id.clone(),
                status: None,
                message: format!("{} not set", self.spec.api_key_env),
            });
        };

        let built = build_payload(&self.spec, prompt, options);
        tracing::debug!(
            provider = %self.spec.id,
            endpoint = %self.endpoint,
            width = built.width,
            height = built.height,
            "sending generation request"
        );

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .header(ACCEPT, self.accept_header())
            .json(&built.body)
            .send()
            .map_err(|err| self.transport_error(err))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(classify_failure(&self.spec, status.as_u16(), &body));
        }

        let raw_payload = self.extract_payload(response)?;
        Ok(ProviderResult {
            success: true,
            provider_id: self.spec.id.clone(),
            model: self.spec.model.clone(),
            raw_payload,
            dimensions: Some((built.width, built.height)),
            generation_params: built.params,
            timestamp: now_utc_iso(),
        })
    }

    fn status(&self) -> ProviderStatus {
        ProviderStatus {
            id: self.spec.id.clone(),
            display_name: self.spec.display_name.clone(),
            model: self.spec.model.clone(),
            endpoint: self.endpoint.clone(),
            api_key_env: self.spec.api_key_env.clone(),
            configured: self.api_key.is_some(),
            response_format: self.spec.response.tag().to_string(),
        }
    }
}

/// Maps a non-2xx reply onto the error taxonomy.
///
/// 401/403 are auth failures even when the body mentions billing.
pub fn classify_failure(spec: &ProviderSpec, status: u16, body: &str) -> ProviderError {
    let provider = spec.id.clone();
    let message = truncate_text(body.trim(), ERROR_BODY_CHARS);
    if status == 401 || status == 403 {
        return ProviderError::Auth {
            provider,
            status: Some(status),
            message,
        };
    }
    if spec.is_quota_status(status) || spec.mentions_quota(body) {
        return ProviderError::Quota {
            provider,
            status: Some(status),
            message,
        };
    }
    if (500..600).contains(&status) {
        return ProviderError::Server {
            provider,
            status,
            message,
        };
    }
    ProviderError::Unknown {
        provider,
        status: Some(status),
        message,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuiltPayload {
    pub body: Value,
    pub params: Map<String, Value>,
    pub width: u32,
    pub height: u32,
}

/// Shapes the request body for the provider's vendor and records the parameters
/// actually sent (minus the prompt) for the outcome.
pub fn build_payload(spec: &ProviderSpec, prompt: &str, options: &GenerationOptions) -> BuiltPayload {
    let (body, width, height) = match spec.payload {
        PayloadStyle::OpenAiImages => {
            let size_key = match options.aspect_ratio() {
                ratio if ratio > 1.2 => "landscape_size",
                ratio if ratio < 0.83 => "portrait_size",
                _ => "square_size",
            };
            let size = spec.default_str(size_key).unwrap_or("1024x1024").to_string();
            let (width, height) = parse_dims(&size);
            let quality = match options.quality.as_deref() {
                Some("standard") => "standard",
                _ => spec.default_str("quality").unwrap_or("hd"),
            };
            let mut body = json!({
                "model": spec.model,
                "prompt": prompt,
                "n": 1,
                "size": size,
                "quality": quality,
                "response_format": spec.default_str("response_format").unwrap_or("url"),
            });
            if let Some(style) = options
                .style
                .as_deref()
                .filter(|style| matches!(*style, "vivid" | "natural"))
            {
                body["style"] = Value::String(style.to_string());
            }
            (body, width, height)
        }
        PayloadStyle::StabilityTextToImage => {
            let (width, height) = nearest_dimensions(options.aspect_ratio(), &SDXL_DIMENSIONS);
            let mut body = json!({
                "text_prompts": [{ "text": prompt, "weight": 1 }],
                "width": width,
                "height": height,
                "steps": spec.default_u64("steps").unwrap_or(40),
                "cfg_scale": spec.default_f64("cfg_scale").unwrap_or(7.0),
                "samples": 1,
            });
            if let Some(seed) = options.seed {
                body["seed"] = json!(seed);
            }
            (body, width, height)
        }
        PayloadStyle::HuggingFaceInference => {
            let max_edge = spec.default_u64("max_edge").unwrap_or(1024) as u32;
            let (width, height) = fit_within(options.width, options.height, max_edge);
            let mut parameters = json!({
                "width": width,
                "height": height,
                "num_inference_steps": spec.default_u64("num_inference_steps").unwrap_or(4),
                "guidance_scale": spec.default_f64("guidance_scale").unwrap_or(0.0),
            });
            if let Some(seed) = options.seed {
                parameters["seed"] = json!(seed);
            }
            (json!({ "inputs": prompt, "parameters": parameters }), width, height)
        }
        PayloadStyle::TogetherImages => {
            let max_edge = spec.default_u64("max_edge").unwrap_or(1440) as u32;
            let (width, height) = fit_within(options.width, options.height, max_edge);
            let mut body = json!({
                "model": spec.model,
                "prompt": prompt,
                "width": width,
                "height": height,
                "steps": spec.default_u64("steps").unwrap_or(4),
                "n": 1,
                "response_format": "b64_json",
            });
            if let Some(seed) = options.seed {
                body["seed"] = json!(seed);
            }
            (body, width, height)
        }
    };

    let mut params = Map::new();
    params.insert("provider".to_string(), Value::String(spec.id.clone()));
    params.insert("model".to_string(), Value::String(spec.model.clone()));
    params.insert("request".to_string(), strip_prompt(&body));
    BuiltPayload {
        body,
        params,
        width,
        height,
    }
}

fn strip_prompt(body: &Value) -> Value {
    let mut copy = body.clone();
    if let Some(object) = copy.as_object_mut() {
        object.remove("prompt");
        object.remove("inputs");
        object.remove("text_prompts");
    }
    copy
}

fn nearest_dimensions(ratio: f64, candidates: &[(u32, u32)]) -> (u32, u32) {
    let mut best = (1024, 1024);
    let mut best_delta = f64::MAX;
    for &(width, height) in candidates {
        let delta = (ratio - width as f64 / height as f64).abs();
        if delta < best_delta {
            best_delta = delta;
            best = (width, height);
        }
    }
    best
}

/// Scales down to `max_edge` on the long side, then snaps both sides to 64.
pub fn fit_within(width: u32, height: u32, max_edge: u32) -> (u32, u32) {
    let width = width.max(1) as f64;
    let height = height.max(1) as f64;
    let long = width.max(height);
    let scale = if long > max_edge as f64 {
        max_edge as f64 / long
    } else {
        1.0
    };
    (
        snap_multiple(width * scale, 64, max_edge),
        snap_multiple(height * scale, 64, max_edge),
    )
}

fn snap_multiple(value: f64, multiple: u32, max: u32) -> u32 {
    let snapped = (value / multiple as f64).round() as u32 * multiple;
    snapped.clamp(multiple, max.max(multiple))
}

fn parse_dims(size: &str) -> (u32, u32) {
    size.split_once('x')
        .and_then(|(w, h)| Some((w.trim().parse().ok()?, h.trim().parse().ok()?)))
        .unwrap_or((1024, 1024))
}

fn error_chain_text(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !parts.contains(&text) {
            parts.push(text);
        }
        source = cause.source();
    }
    truncate_text(&parts.join(": "), ERROR_BODY_CHARS)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

/// Adapters keyed by provider id.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Box<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: ProviderAdapter + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.id().to_string(), Box::new(provider));
    }

    pub fn get(&self, id: &str) -> Option<&dyn ProviderAdapter> {
        self.providers.get(id).map(|provider| provider.as_ref())
    }

    pub fn ids(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    pub fn statuses(&self) -> Vec<ProviderStatus> {
        self.providers.values().map(|provider| provider.status()).collect()
    }
}

/// Builds one HTTP adapter per catalog row, reading keys from the environment.
pub fn default_registry(catalog: &ProviderCatalog) -> anyhow::Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();
    for spec in catalog.list() {
        registry.register(HttpProviderAdapter::from_env(spec.clone())?);
    }
    Ok(registry)
}
