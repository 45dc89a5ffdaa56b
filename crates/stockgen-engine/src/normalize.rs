use std::io::{Cursor, Read};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::blocking::Client as HttpClient;
use sha2::{Digest, Sha256};
use stockgen_contracts::config::PipelineSettings;
use stockgen_contracts::generation::{NormalizedImage, ProviderResult, RawPayload};

use crate::adapter::truncate_text;
use crate::error::NormalizationError;

/// Turns any of the three raw payload shapes into decoded-format-checked bytes.
pub struct Normalizer {
    http: HttpClient,
    max_download_bytes: u64,
}

impl Normalizer {
    pub fn new(timeout: Duration, max_download_bytes: u64) -> anyhow::Result<Self> {
        Ok(Self {
            http: HttpClient::builder().timeout(timeout).build()?,
            max_download_bytes,
        })
    }

    pub fn from_settings(settings: &PipelineSettings) -> anyhow::Result<Self> {
        Self::new(settings.download_timeout(), settings.max_download_bytes)
    }

    pub fn normalize(&self, result: &ProviderResult) -> Result<NormalizedImage, NormalizationError> {
        let bytes = match &result.raw_payload {
            RawPayload::Buffer(bytes) => bytes.clone(),
            RawPayload::Base64(text) => decode_base64_image(text)?,
            RawPayload::Url(url) => self.download(url)?,
        };
        let image = image_from_bytes(bytes)?;
        tracing::debug!(
            provider = %result.provider_id,
            format = result.raw_payload.format(),
            width = image.width,
            height = image.height,
            "normalized provider payload"
        );
        Ok(image)
    }

    fn download(&self, url: &str) -> Result<Vec<u8>, NormalizationError> {
        let failure = |status: Option<u16>, message: String| NormalizationError::Download {
            url: url.to_string(),
            status,
            message,
        };

        let response = self
            .http
            .get(url)
            .send()
            .map_err(|err| failure(None, err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(failure(
                Some(status.as_u16()),
                format!("HTTP {}: {}", status.as_u16(), truncate_text(body.trim(), 256)),
            ));
        }
        if let Some(declared) = response.content_length() {
            if declared > self.max_download_bytes {
                return Err(failure(
                    Some(status.as_u16()),
                    format!(
                        "declared size {declared} exceeds limit of {} bytes",
                        self.max_download_bytes
                    ),
                ));
            }
        }

        let mut bytes = Vec::new();
        response
            .take(self.max_download_bytes.saturating_add(1))
            .read_to_end(&mut bytes)
            .map_err(|err| failure(Some(status.as_u16()), format!("body read failed: {err}")))?;
        if bytes.len() as u64 > self.max_download_bytes {
            return Err(failure(
                Some(status.as_u16()),
                format!("body exceeds limit of {} bytes", self.max_download_bytes),
            ));
        }
        Ok(bytes)
    }
}

/// Accepts bare base64 or a `data:image/...;base64,` URL. Embedded whitespace is ignored.
pub fn decode_base64_image(text: &str) -> Result<Vec<u8>, NormalizationError> {
    let trimmed = text.trim();
    let encoded = match trimmed.strip_prefix("data:") {
        Some(rest) => {
            let (header, data) = rest.split_once(',').ok_or_else(|| {
                NormalizationError::InvalidEncoding("data URL without payload".to_string())
            })?;
            if !header.ends_with(";base64") {
                return Err(NormalizationError::InvalidEncoding(format!(
                    "data URL is not base64 ({header})"
                )));
            }
            data
        }
        None => trimmed,
    };
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Err(NormalizationError::InvalidEncoding(
            "empty base64 payload".to_string(),
        ));
    }
    BASE64
        .decode(compact.as_bytes())
        .map_err(|err| NormalizationError::InvalidEncoding(format!("base64 decode failed: {err}")))
}

/// Checks the bytes are a recognisable image and reads its header dimensions.
pub fn image_from_bytes(bytes: Vec<u8>) -> Result<NormalizedImage, NormalizationError> {
    if bytes.is_empty() {
        return Err(NormalizationError::InvalidEncoding(
            "empty image bytes".to_string(),
        ));
    }
    let (width, height) = probe_dimensions(&bytes)
        .map_err(|err| NormalizationError::InvalidEncoding(format!("unrecognised image: {err}")))?;
    let content_hash = content_hash(&bytes);
    Ok(NormalizedImage {
        bytes,
        width,
        height,
        content_hash,
    })
}

pub(crate) fn probe_dimensions(bytes: &[u8]) -> image::ImageResult<(u32, u32)> {
    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .into_dimensions()
}

/// Lower-case hex SHA-256.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
