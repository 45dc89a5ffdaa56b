use std::time::Duration;

use indexmap::IndexMap;
use serde_json::{Map, Value};

/// How a provider expects its JSON request body to be shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadStyle {
    /// `{model, prompt, n, size, quality, response_format}`
    OpenAiImages,
    /// `{text_prompts: [{text}], width, height, steps, cfg_scale, samples, seed}`
    StabilityTextToImage,
    /// `{inputs, parameters: {width, height, num_inference_steps, guidance_scale, seed}}`
    HuggingFaceInference,
    /// `{model, prompt, width, height, steps, n, response_format, seed}`
    TogetherImages,
}

/// Where the image lives in a successful response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseShape {
    Binary,
    /// JSON pointer to a base64 string.
    Base64Field(String),
    /// JSON pointer to a downloadable URL.
    UrlField(String),
}

impl ResponseShape {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Binary => "buffer",
            Self::Base64Field(_) => "base64",
            Self::UrlField(_) => "url",
        }
    }
}

/// Static description of one external image API.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderSpec {
    pub id: String,
    pub display_name: String,
    pub model: String,
    pub api_base_env: String,
    pub default_api_base: String,
    pub path: String,
    pub api_key_env: String,
    pub timeout: Duration,
    pub payload: PayloadStyle,
    pub response: ResponseShape,
    /// Fixed per-provider parameters (steps, guidance scale, allowed sizes...).
    pub defaults: Map<String, Value>,
    /// Status codes this vendor uses for exhausted credit in addition to 429.
    pub quota_statuses: Vec<u16>,
    /// Lower-case body fragments this vendor uses to signal quota exhaustion.
    pub quota_markers: Vec<String>,
}

impl ProviderSpec {
    pub fn resolved_api_base(&self) -> String {
        std::env::var(&self.api_base_env)
            .ok()
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| self.default_api_base.clone())
    }

    pub fn endpoint(&self) -> String {
        self.endpoint_with_base(&self.resolved_api_base())
    }

    pub fn endpoint_with_base(&self, api_base: &str) -> String {
        format!(
            "{}/{}",
            api_base.trim_end_matches('/'),
            self.path.trim_start_matches('/')
        )
    }

    pub fn default_u64(&self, key: &str) -> Option<u64> {
        self.defaults.get(key).and_then(Value::as_u64)
    }

    pub fn default_f64(&self, key: &str) -> Option<f64> {
        self.defaults.get(key).and_then(Value::as_f64)
    }

    pub fn default_str(&self, key: &str) -> Option<&str> {
        self.defaults.get(key).and_then(Value::as_str)
    }

    pub fn is_quota_status(&self, status: u16) -> bool {
        status == 429 || self.quota_statuses.contains(&status)
    }

    pub fn mentions_quota(&self, body: &str) -> bool {
        let lowered = body.to_ascii_lowercase();
        GENERIC_QUOTA_MARKERS
            .iter()
            .any(|marker| lowered.contains(marker))
            || self
                .quota_markers
                .iter()
                .any(|marker| lowered.contains(marker.as_str()))
    }
}

const GENERIC_QUOTA_MARKERS: [&str; 4] = ["quota", "rate limit", "insufficient credit", "billing"];

/// Ordered table of every provider this build knows how to call.
#[derive(Debug, Clone)]
pub struct ProviderCatalog {
    specs: IndexMap<String, ProviderSpec>,
}

impl Default for ProviderCatalog {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ProviderCatalog {
    pub fn new(specs: Option<IndexMap<String, ProviderSpec>>) -> Self {
        Self {
            specs: specs.unwrap_or_else(default_specs),
        }
    }

    pub fn get(&self, id: &str) -> Option<&ProviderSpec> {
        self.specs.get(id)
    }

    pub fn list(&self) -> impl Iterator<Item = &ProviderSpec> {
        self.specs.values()
    }

    pub fn ids(&self) -> Vec<String> {
        self.specs.keys().cloned().collect()
    }
}

fn default_specs() -> IndexMap<String, ProviderSpec> {
    let mut map = IndexMap::new();

    let mut insert = |id: &str,
                      display_name: &str,
                      model: &str,
                      env_prefix: &str,
                      api_key_env: &str,
                      default_api_base: &str,
                      path: &str,
                      timeout_secs: u64,
                      payload: PayloadStyle,
                      response: ResponseShape,
                      defaults: Value,
                      quota_statuses: &[u16],
                      quota_markers: &[&str]| {
        map.insert(
            id.to_string(),
            ProviderSpec {
                id: id.to_string(),
                display_name: display_name.to_string(),
                model: model.to_string(),
                api_base_env: format!("{env_prefix}_API_BASE"),
                default_api_base: default_api_base.to_string(),
                path: path.to_string(),
                api_key_env: api_key_env.to_string(),
                timeout: Duration::from_secs(timeout_secs),
                payload,
                response,
                defaults: defaults.as_object().cloned().unwrap_or_default(),
                quota_statuses: quota_statuses.to_vec(),
                quota_markers: quota_markers.iter().map(|m| (*m).to_string()).collect(),
            },
        );
    };

    insert(
        "openai",
        "OpenAI DALL-E",
        "dall-e-3",
        "OPENAI",
        "OPENAI_API_KEY",
        "https://api.openai.com/v1",
        "images/generations",
        120,
        PayloadStyle::OpenAiImages,
        ResponseShape::UrlField("/data/0/url".to_string()),
        serde_json::json!({
            "quality": "hd",
            "response_format": "url",
            "landscape_size": "1792x1024",
            "portrait_size": "1024x1792",
            "square_size": "1024x1024",
        }),
        &[],
        &["billing_hard_limit_reached", "insufficient_quota"],
    );
    insert(
        "stability",
        "Stability AI SDXL",
        "stable-diffusion-xl-1024-v1-0",
        "STABILITY",
        "STABILITY_API_KEY",
        "https://api.stability.ai",
        "v1/generation/stable-diffusion-xl-1024-v1-0/text-to-image",
        90,
        PayloadStyle::StabilityTextToImage,
        ResponseShape::Binary,
        serde_json::json!({
            "steps": 40,
            "cfg_scale": 7.0,
            "edge": 1024,
        }),
        &[402],
        &["insufficient_balance"],
    );
    insert(
        "huggingface",
        "Hugging Face FLUX.1-schnell",
        "black-forest-labs/FLUX.1-schnell",
        "HF",
        "HF_API_TOKEN",
        "https://api-inference.huggingface.co",
        "models/black-forest-labs/FLUX.1-schnell",
        60,
        PayloadStyle::HuggingFaceInference,
        ResponseShape::Binary,
        serde_json::json!({
            "num_inference_steps": 4,
            "guidance_scale": 0.0,
            "max_edge": 1024,
        }),
        &[402],
        &["exceeded your monthly included credits", "pro subscription"],
    );
    insert(
        "together",
        "Together FLUX.1-schnell",
        "black-forest-labs/FLUX.1-schnell-Free",
        "TOGETHER",
        "TOGETHER_API_KEY",
        "https://api.together.xyz/v1",
        "images/generations",
        90,
        PayloadStyle::TogetherImages,
        ResponseShape::Base64Field("/data/0/b64_json".to_string()),
        serde_json::json!({
            "steps": 4,
            "max_edge": 1440,
        }),
        &[402],
        &["credit limit"],
    );

    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_catalog_keeps_priority_order() {
        let catalog = ProviderCatalog::default();
        assert_eq!(
            catalog.ids(),
            vec!["openai", "stability", "huggingface", "together"]
        );
    }

    #[test]
    fn every_provider_has_a_bounded_timeout() {
        for spec in ProviderCatalog::default().list() {
            let secs = spec.timeout.as_secs();
            assert!((60..=120).contains(&secs), "{} timeout {secs}s", spec.id);
        }
    }

    #[test]
    fn catalog_covers_all_response_shapes() {
        let catalog = ProviderCatalog::default();
        let mut tags: Vec<&str> = catalog.list().map(|spec| spec.response.tag()).collect();
        tags.sort();
        tags.dedup();
        assert_eq!(tags, vec!["base64", "buffer", "url"]);
    }

    #[test]
    fn endpoint_joins_base_and_path() {
        let catalog = ProviderCatalog::default();
        let spec = catalog.get("together").cloned().expect("together");
        assert_eq!(
            spec.endpoint_with_base("http://127.0.0.1:9000/"),
            "http://127.0.0.1:9000/images/generations"
        );
    }

    #[test]
    fn quota_detection_combines_generic_and_vendor_markers() {
        let catalog = ProviderCatalog::default();
        let openai = catalog.get("openai").cloned().expect("openai");
        assert!(openai.mentions_quota("Error: insufficient_quota for org"));
        assert!(openai.mentions_quota("You exceeded your current QUOTA"));
        assert!(!openai.mentions_quota("invalid prompt"));
        assert!(openai.is_quota_status(429));
        assert!(!openai.is_quota_status(402));

        let stability = catalog.get("stability").cloned().expect("stability");
        assert!(stability.is_quota_status(402));
    }
}
