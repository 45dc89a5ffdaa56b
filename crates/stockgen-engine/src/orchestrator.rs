use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Map, Value};
use stockgen_contracts::config::{OrchestratorConfig, PipelineSettings};
use stockgen_contracts::events::{EventPayload, EventWriter, RunEvent};
use stockgen_contracts::generation::{
    fallback_reason_from_attempts, AttemptRecord, ErrorClass, GenerationOptions,
    GenerationOutcome, GenerationRequest, NormalizedImage, UserContext, DEMO_MODE_REASON,
    PLACEHOLDER_MODEL, PLACEHOLDER_PROVIDER_ID,
};

use crate::adapter::ProviderRegistry;
use crate::breaker::CircuitBreaker;
use crate::error::{PipelineError, ProviderError};
use crate::normalize::Normalizer;
use crate::placeholder::{derive_label, PlaceholderSynthesizer};
use crate::postprocess::PostProcessor;

/// Shared flag a caller flips to stop a run before its next provider attempt.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// `[active] ++ fallback`, first occurrence of each id wins.
pub fn attempt_order(active_model: &str, fallback_order: &[String]) -> Vec<String> {
    let mut order: Vec<String> = Vec::with_capacity(fallback_order.len() + 1);
    for id in std::iter::once(active_model).chain(fallback_order.iter().map(String::as_str)) {
        let id = id.trim();
        if id.is_empty() || order.iter().any(|existing| existing == id) {
            continue;
        }
        order.push(id.to_string());
    }
    order
}

struct ChainResult {
    provider: String,
    model: String,
    fallback_reason: Option<String>,
    image: NormalizedImage,
    params: Map<String, Value>,
}

/// Runs the provider chain, the placeholder fallback and post-processing for
/// one request at a time. Safe to share across threads; runs only share the
/// config snapshot handed to each call.
pub struct Orchestrator {
    providers: ProviderRegistry,
    normalizer: Normalizer,
    placeholder: PlaceholderSynthesizer,
    post_processor: PostProcessor,
    events: Option<EventWriter>,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl Orchestrator {
    pub fn new(providers: ProviderRegistry, settings: &PipelineSettings) -> anyhow::Result<Self> {
        Ok(Self {
            providers,
            normalizer: Normalizer::from_settings(settings)?,
            placeholder: PlaceholderSynthesizer::new(settings.placeholder_size),
            post_processor: PostProcessor::new(settings.clone()),
            events: None,
            breaker: None,
        })
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn orchestrate_generation(
        &self,
        request: &GenerationRequest,
        user: &UserContext,
        config: &OrchestratorConfig,
        cancel: Option<&CancelFlag>,
    ) -> Result<GenerationOutcome, PipelineError> {
        request.validate().map_err(PipelineError::InvalidRequest)?;

        let events = self
            .events
            .as_ref()
            .map(|writer| writer.for_run(uuid::Uuid::new_v4().to_string()));
        let active = request
            .requested_model
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(config.active_model.as_str());
        let order = attempt_order(active, &config.fallback_order);

        tracing::info!(
            user = %user.user_id,
            order = ?order,
            force_fallback = request.force_fallback,
            "generation started"
        );
        emit(
            events.as_ref(),
            RunEvent::GenerationStarted,
            json!({
                "user_id": user.user_id,
                "attempt_order": order,
                "force_fallback": request.force_fallback,
            }),
        );

        let mut attempts = Vec::new();
        let chain = if request.force_fallback {
            self.use_placeholder(&request.prompt, DEMO_MODE_REASON, events.as_ref())
        } else {
            match self.run_chain(request, &order, &mut attempts, cancel, events.as_ref()) {
                Ok(Some(chain)) => Ok(chain),
                Ok(None) => {
                    let reason = fallback_reason_from_attempts(&attempts);
                    self.use_placeholder(&request.prompt, reason, events.as_ref())
                }
                Err(err) => Err(err),
            }
        };
        let chain = match chain {
            Ok(chain) => chain,
            Err(err) => {
                fail(events.as_ref(), &err, &attempts);
                return Err(err);
            }
        };

        let asset = match self.post_processor.process(&chain.image) {
            Ok(asset) => asset,
            Err(err) => {
                let err = PipelineError::from(err);
                fail(events.as_ref(), &err, &attempts);
                return Err(err);
            }
        };
        emit(
            events.as_ref(),
            RunEvent::AssetWritten,
            json!({
                "file_path": asset.file_path.to_string_lossy(),
                "byte_size": asset.byte_size,
                "content_hash": asset.content_hash,
            }),
        );

        let outcome = GenerationOutcome {
            used_provider: chain.provider,
            used_model: chain.model,
            fallback_reason: chain.fallback_reason,
            source_hash: chain.image.content_hash,
            asset,
            attempts,
            generation_params: chain.params,
        };
        tracing::info!(
            provider = %outcome.used_provider,
            fallback_reason = ?outcome.fallback_reason,
            path = %outcome.asset.file_path.display(),
            "generation finished"
        );
        emit(
            events.as_ref(),
            RunEvent::GenerationFinished,
            json!({
                "used_provider": outcome.used_provider,
                "used_model": outcome.used_model,
                "fallback_reason": outcome.fallback_reason,
                "attempts": outcome.attempts.len(),
            }),
        );
        Ok(outcome)
    }

    /// `Ok(None)` once every provider in `order` has failed.
    fn run_chain(
        &self,
        request: &GenerationRequest,
        order: &[String],
        attempts: &mut Vec<AttemptRecord>,
        cancel: Option<&CancelFlag>,
        events: Option<&EventWriter>,
    ) -> Result<Option<ChainResult>, PipelineError> {
        let options = GenerationOptions::from_request(request);

        for (index, provider_id) in order.iter().enumerate() {
            if cancel.is_some_and(CancelFlag::is_cancelled) {
                tracing::info!(attempts = attempts.len(), "generation cancelled");
                return Err(PipelineError::Cancelled {
                    attempts: attempts.len(),
                });
            }

            let started = Instant::now();
            let elapsed_ms = || started.elapsed().as_millis() as u64;

            let Some(adapter) = self.providers.get(provider_id) else {
                record_failure(
                    attempts,
                    events,
                    index,
                    AttemptRecord::failure(
                        provider_id,
                        ErrorClass::Unknown,
                        None,
                        "provider not registered",
                        0,
                    ),
                );
                continue;
            };
            if let Some(breaker) = &self.breaker {
                if !breaker.allows(provider_id) {
                    record_failure(
                        attempts,
                        events,
                        index,
                        AttemptRecord::failure(
                            provider_id,
                            ErrorClass::CircuitOpen,
                            None,
                            "circuit open",
                            0,
                        ),
                    );
                    continue;
                }
            }

            let generated = adapter
                .generate(&request.prompt, &options)
                .map_err(|err| attempt_from_provider_error(provider_id, &err, elapsed_ms()))
                .and_then(|result| {
                    self.normalizer
                        .normalize(&result)
                        .map(|image| (result, image))
                        .map_err(|err| {
                            AttemptRecord::failure(
                                provider_id,
                                err.class(),
                                err.http_status(),
                                err.to_string(),
                                elapsed_ms(),
                            )
                        })
                });

            match generated {
                Ok((result, image)) => {
                    if let Some(breaker) = &self.breaker {
                        breaker.record_success(provider_id);
                    }
                    let attempt = AttemptRecord::success(provider_id, elapsed_ms());
                    tracing::info!(provider = %provider_id, attempt = index, "provider succeeded");
                    emit(events, RunEvent::ProviderAttempt, attempt_event(index, &attempt));
                    attempts.push(attempt);
                    return Ok(Some(ChainResult {
                        provider: result.provider_id,
                        model: result.model,
                        fallback_reason: None,
                        image,
                        params: result.generation_params,
                    }));
                }
                Err(attempt) => {
                    if let Some(breaker) = &self.breaker {
                        breaker.record_failure(provider_id);
                    }
                    record_failure(attempts, events, index, attempt);
                }
            }
        }
        Ok(None)
    }

    fn use_placeholder(
        &self,
        prompt: &str,
        reason: &str,
        events: Option<&EventWriter>,
    ) -> Result<ChainResult, PipelineError> {
        let image = self.placeholder.synthesize(prompt)?;
        tracing::warn!(reason, "using placeholder image");
        emit(events, RunEvent::PlaceholderUsed, json!({ "fallback_reason": reason }));

        let mut params = Map::new();
        params.insert("label".to_string(), Value::String(derive_label(prompt)));
        params.insert("size".to_string(), json!(self.placeholder.size()));
        Ok(ChainResult {
            provider: PLACEHOLDER_PROVIDER_ID.to_string(),
            model: PLACEHOLDER_MODEL.to_string(),
            fallback_reason: Some(reason.to_string()),
            image,
            params,
        })
    }
}

fn attempt_from_provider_error(
    provider_id: &str,
    err: &ProviderError,
    duration_ms: u64,
) -> AttemptRecord {
    AttemptRecord::failure(
        provider_id,
        err.class(),
        err.http_status(),
        err.to_string(),
        duration_ms,
    )
}

fn record_failure(
    attempts: &mut Vec<AttemptRecord>,
    events: Option<&EventWriter>,
    index: usize,
    attempt: AttemptRecord,
) {
    tracing::warn!(
        provider = %attempt.provider_id,
        attempt = index,
        error_class = ?attempt.error_class,
        status = ?attempt.http_status,
        detail = attempt.message.as_deref().unwrap_or(""),
        "provider attempt failed"
    );
    emit(events, RunEvent::ProviderAttempt, attempt_event(index, &attempt));
    attempts.push(attempt);
}

fn attempt_event(index: usize, attempt: &AttemptRecord) -> Value {
    json!({
        "index": index,
        "provider": attempt.provider_id,
        "succeeded": attempt.succeeded,
        "error_class": attempt.error_class,
        "http_status": attempt.http_status,
        "message": attempt.message,
        "duration_ms": attempt.duration_ms,
    })
}

fn fail(events: Option<&EventWriter>, err: &PipelineError, attempts: &[AttemptRecord]) {
    tracing::error!(error = %err, attempts = attempts.len(), "generation failed");
    emit(
        events,
        RunEvent::GenerationFailed,
        json!({ "error": err.to_string(), "attempts": attempts.len() }),
    );
}

fn emit(events: Option<&EventWriter>, event: RunEvent, payload: Value) {
    let Some(events) = events else {
        return;
    };
    let payload = match payload {
        Value::Object(map) => map,
        _ => EventPayload::new(),
    };
    if let Err(err) = events.emit(event, payload) {
        tracing::warn!(event = event.as_str(), error = %err, "failed to write run event");
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use image::{ImageFormat, Rgb, RgbImage};
    use stockgen_contracts::config::ConfigHandle;
    use stockgen_contracts::generation::{ProviderResult, RawPayload};

    use super::*;
    use crate::adapter::{ProviderAdapter, ProviderStatus};
    use crate::normalize::content_hash;

    enum Reply {
        Fail(ErrorClass),
        Payload(RawPayload),
    }

    struct ScriptedAdapter {
        id: String,
        reply: Reply,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedAdapter {
        fn new(id: &str, reply: Reply) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    id: id.to_string(),
                    reply,
                    calls: Arc::clone(&calls),
                },
                calls,
            )
        }
    }

    impl ProviderAdapter for ScriptedAdapter {
        fn id(&self) -> &str {
            &self.id
        }

        fn generate(
            &self,
            _prompt: &str,
            _options: &GenerationOptions,
        ) -> Result<ProviderResult, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let provider = self.id.clone();
            match &self.reply {
                Reply::Fail(ErrorClass::Auth) => Err(ProviderError::Auth {
                    provider,
                    status: Some(401),
                    message: "invalid key".to_string(),
                }),
                Reply::Fail(ErrorClass::Quota) => Err(ProviderError::Quota {
                    provider,
                    status: Some(429),
                    message: "quota".to_string(),
                }),
                Reply::Fail(ErrorClass::Server) => Err(ProviderError::Server {
                    provider,
                    status: 503,
                    message: "overloaded".to_string(),
                }),
                Reply::Fail(ErrorClass::Timeout) => Err(ProviderError::Timeout {
                    provider,
                    after: Duration::from_secs(90),
                }),
                Reply::Fail(_) => Err(ProviderError::Unknown {
                    provider,
                    status: None,
                    message: "unexpected".to_string(),
                }),
                Reply::Payload(payload) => Ok(ProviderResult {
                    success: true,
                    provider_id: self.id.clone(),
                    model: format!("{}-model", self.id),
                    raw_payload: payload.clone(),
                    dimensions: None,
                    generation_params: Map::new(),
                    timestamp: "2026-01-01T00:00:00Z".to_string(),
                }),
            }
        }

        fn status(&self) -> ProviderStatus {
            ProviderStatus {
                id: self.id.clone(),
                display_name: self.id.clone(),
                model: format!("{}-model", self.id),
                endpoint: "memory://".to_string(),
                api_key_env: String::new(),
                configured: true,
                response_format: "buffer".to_string(),
            }
        }
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let image = RgbImage::from_pixel(width, height, Rgb([200, 120, 40]));
        let mut out = Cursor::new(Vec::new());
        image
            .write_to(&mut out, ImageFormat::Png)
            .expect("png");
        out.into_inner()
    }

    fn settings(dir: &Path) -> PipelineSettings {
        PipelineSettings {
            output_dir: dir.to_path_buf(),
            target_size: 64,
            placeholder_size: 128,
            ..PipelineSettings::default()
        }
    }

    fn default_config() -> OrchestratorConfig {
        OrchestratorConfig::default()
    }

    struct Harness {
        orchestrator: Orchestrator,
        calls: Vec<(String, Arc<AtomicUsize>)>,
    }

    impl Harness {
        fn new(dir: &Path, replies: Vec<(&str, Reply)>) -> Self {
            Self::configured(dir, replies, |orchestrator| orchestrator)
        }

        fn configured(
            dir: &Path,
            replies: Vec<(&str, Reply)>,
            configure: impl FnOnce(Orchestrator) -> Orchestrator,
        ) -> Self {
            let mut registry = ProviderRegistry::new();
            let mut calls = Vec::new();
            for (id, reply) in replies {
                let (adapter, counter) = ScriptedAdapter::new(id, reply);
                registry.register(adapter);
                calls.push((id.to_string(), counter));
            }
            let orchestrator = configure(
                Orchestrator::new(registry, &settings(dir))
                    .expect("orchestrator"),
            );
            Self {
                orchestrator,
                calls,
            }
        }

        fn calls(&self, id: &str) -> usize {
            self.calls
                .iter()
                .find(|(name, _)| name == id)
                .map(|(_, counter)| counter.load(Ordering::SeqCst))
                .unwrap_or(0)
        }

        fn run(&self, request: &GenerationRequest) -> Result<GenerationOutcome, PipelineError> {
            self.orchestrator.orchestrate_generation(
                request,
                &UserContext::new("user-1"),
                &default_config(),
                None,
            )
        }
    }

    fn all_four(
        openai: Reply,
        stability: Reply,
        huggingface: Reply,
        together: Reply,
    ) -> Vec<(&'static str, Reply)> {
        vec![
            ("openai", openai),
            ("stability", stability),
            ("huggingface", huggingface),
            ("together", together),
        ]
    }

    #[test]
    fn attempt_order_puts_active_first_and_dedups() {
        let fallback = vec![
            "openai".to_string(),
            "stability".to_string(),
            "openai".to_string(),
            "together".to_string(),
        ];
        assert_eq!(
            attempt_order("stability", &fallback),
            vec!["stability", "openai", "together"]
        );
        assert_eq!(attempt_order("custom", &[]), vec!["custom"]);
    }

    #[test]
    fn force_fallback_skips_every_provider() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let harness = Harness::new(
            temp.path(),
            all_four(
                Reply::Payload(RawPayload::Buffer(png(8, 8))),
                Reply::Fail(ErrorClass::Auth),
                Reply::Fail(ErrorClass::Auth),
                Reply::Fail(ErrorClass::Auth),
            ),
        );
        let outcome = harness.run(&GenerationRequest::new("a red fox").with_force_fallback(true))?;

        assert_eq!(outcome.used_provider, PLACEHOLDER_PROVIDER_ID);
        assert_eq!(outcome.fallback_reason.as_deref(), Some("Demo Mode Activated"));
        assert!(outcome.attempts.is_empty());
        for id in ["openai", "stability", "huggingface", "together"] {
            assert_eq!(harness.calls(id), 0, "{id} was called");
        }
        assert!(outcome.asset.file_path.exists());
        Ok(())
    }

    #[test]
    fn auth_failure_falls_through_to_next_provider() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let source = png(32, 32);
        let harness = Harness::new(
            temp.path(),
            all_four(
                Reply::Fail(ErrorClass::Auth),
                Reply::Payload(RawPayload::Buffer(source.clone())),
                Reply::Fail(ErrorClass::Server),
                Reply::Fail(ErrorClass::Server),
            ),
        );
        let outcome = harness.run(&GenerationRequest::new("a red fox"))?;

        assert_eq!(outcome.used_provider, "stability");
        assert_eq!(outcome.used_model, "stability-model");
        assert_eq!(outcome.fallback_reason, None);
        assert_eq!(outcome.source_hash, content_hash(&source));
        assert_eq!(outcome.attempts.len(), 2);
        assert_eq!(outcome.attempts[0].error_class, Some(ErrorClass::Auth));
        assert_eq!(outcome.attempts[0].http_status, Some(401));
        assert!(outcome.attempts[1].succeeded);
        assert_eq!(harness.calls("huggingface"), 0);
        assert_eq!(harness.calls("together"), 0);
        Ok(())
    }

    #[test]
    fn all_failed_uses_deterministic_placeholder_with_last_reason() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let harness = Harness::new(
            temp.path(),
            all_four(
                Reply::Fail(ErrorClass::Timeout),
                Reply::Fail(ErrorClass::Quota),
                Reply::Fail(ErrorClass::Server),
                Reply::Fail(ErrorClass::Auth),
            ),
        );
        let request = GenerationRequest::new("misty pine forest");
        let first = harness.run(&request)?;
        let second = harness.run(&request)?;

        assert_eq!(first.used_provider, PLACEHOLDER_PROVIDER_ID);
        assert_eq!(first.used_model, PLACEHOLDER_MODEL);
        assert_eq!(first.fallback_reason.as_deref(), Some("Authentication Failed"));
        assert_eq!(first.attempts.len(), 4);
        assert!(first.attempts.iter().all(|attempt| !attempt.succeeded));

        let expected = PlaceholderSynthesizer::new(128).synthesize("misty pine forest")?;
        assert_eq!(first.source_hash, expected.content_hash);
        assert_eq!(first.source_hash, second.source_hash);
        assert_eq!(first.asset.content_hash, second.asset.content_hash);
        Ok(())
    }

    #[test]
    fn timeout_then_base64_reply_is_accepted() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let source = png(512, 512);
        let harness = Harness::new(
            temp.path(),
            all_four(
                Reply::Fail(ErrorClass::Timeout),
                Reply::Payload(RawPayload::Base64(BASE64.encode(&source))),
                Reply::Fail(ErrorClass::Server),
                Reply::Fail(ErrorClass::Server),
            ),
        );
        let outcome = harness.run(&GenerationRequest::new("sunset over mountains"))?;

        assert_eq!(outcome.used_provider, "stability");
        assert_eq!(outcome.fallback_reason, None);
        assert_eq!(outcome.attempts[0].error_class, Some(ErrorClass::Timeout));
        assert_eq!(outcome.source_hash, content_hash(&source));
        assert_eq!((outcome.asset.width, outcome.asset.height), (64, 64));
        assert_eq!(outcome.asset.mime_type, "image/jpeg");
        Ok(())
    }

    #[test]
    fn duplicate_ids_are_attempted_once() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let harness = Harness::new(
            temp.path(),
            vec![
                ("openai", Reply::Fail(ErrorClass::Server)),
                ("together", Reply::Fail(ErrorClass::Quota)),
            ],
        );
        let config = OrchestratorConfig::new(
            "openai",
            vec!["openai".into(), "together".into(), "openai".into()],
        );
        let outcome = harness.orchestrator.orchestrate_generation(
            &GenerationRequest::new("harbour"),
            &UserContext::new("u"),
            &config,
            None,
        )?;

        assert_eq!(harness.calls("openai"), 1);
        assert_eq!(harness.calls("together"), 1);
        assert_eq!(outcome.attempts.len(), 2);
        assert_eq!(outcome.fallback_reason.as_deref(), Some("Quota Exceeded"));
        Ok(())
    }

    #[test]
    fn unregistered_provider_is_recorded_and_skipped() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let harness = Harness::new(
            temp.path(),
            vec![("openai", Reply::Payload(RawPayload::Buffer(png(16, 16))))],
        );
        let config = OrchestratorConfig::new("midjourney", vec!["openai".into()]);
        let outcome = harness.orchestrator.orchestrate_generation(
            &GenerationRequest::new("harbour"),
            &UserContext::new("u"),
            &config,
            None,
        )?;

        assert_eq!(outcome.used_provider, "openai");
        assert_eq!(outcome.attempts[0].provider_id, "midjourney");
        assert_eq!(outcome.attempts[0].error_class, Some(ErrorClass::Unknown));
        Ok(())
    }

    #[test]
    fn requested_model_overrides_active_model() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let harness = Harness::new(
            temp.path(),
            all_four(
                Reply::Payload(RawPayload::Buffer(png(16, 16))),
                Reply::Payload(RawPayload::Buffer(png(16, 16))),
                Reply::Payload(RawPayload::Buffer(png(16, 16))),
                Reply::Payload(RawPayload::Buffer(png(16, 16))),
            ),
        );
        let outcome = harness.run(&GenerationRequest::new("harbour").with_model("together"))?;
        assert_eq!(outcome.used_provider, "together");
        assert_eq!(harness.calls("openai"), 0);
        Ok(())
    }

    #[test]
    fn undecodable_payload_counts_as_failed_attempt() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let harness = Harness::new(
            temp.path(),
            vec![("openai", Reply::Payload(RawPayload::Buffer(b"<html>".to_vec())))],
        );
        let config = OrchestratorConfig::new("openai", Vec::new());
        let outcome = harness.orchestrator.orchestrate_generation(
            &GenerationRequest::new("harbour"),
            &UserContext::new("u"),
            &config,
            None,
        )?;

        assert_eq!(outcome.used_provider, PLACEHOLDER_PROVIDER_ID);
        assert_eq!(outcome.attempts[0].error_class, Some(ErrorClass::InvalidEncoding));
        assert_eq!(outcome.fallback_reason.as_deref(), Some("API Error"));
        Ok(())
    }

    #[test]
    fn empty_prompt_is_invalid_request() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let harness = Harness::new(temp.path(), Vec::new());
        let err = harness
            .run(&GenerationRequest::new("   "))
            .expect_err("expected error");
        assert!(matches!(err, PipelineError::InvalidRequest(_)));
        Ok(())
    }

    #[test]
    fn cancelled_run_stops_before_first_attempt() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let harness = Harness::new(
            temp.path(),
            all_four(
                Reply::Fail(ErrorClass::Server),
                Reply::Fail(ErrorClass::Server),
                Reply::Fail(ErrorClass::Server),
                Reply::Fail(ErrorClass::Server),
            ),
        );
        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = harness
            .orchestrator
            .orchestrate_generation(
                &GenerationRequest::new("harbour"),
                &UserContext::new("u"),
                &default_config(),
                Some(&cancel),
            )
            .expect_err("expected cancel");

        assert!(matches!(err, PipelineError::Cancelled { attempts: 0 }));
        assert_eq!(harness.calls("openai"), 0);
        Ok(())
    }

    #[test]
    fn open_circuit_skips_provider_on_next_run() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let breaker = Arc::new(CircuitBreaker::new(1, Duration::from_secs(3600)));
        let harness = Harness::configured(
            temp.path(),
            vec![
                ("openai", Reply::Fail(ErrorClass::Server)),
                ("stability", Reply::Payload(RawPayload::Buffer(png(16, 16)))),
            ],
            |orchestrator| orchestrator.with_circuit_breaker(Arc::clone(&breaker)),
        );

        let config = OrchestratorConfig::new("openai", vec!["stability".into()]);
        let request = GenerationRequest::new("harbour");
        let user = UserContext::new("u");
        harness
            .orchestrator
            .orchestrate_generation(&request, &user, &config, None)?;
        let second = harness
            .orchestrator
            .orchestrate_generation(&request, &user, &config, None)?;

        assert_eq!(harness.calls("openai"), 1);
        assert_eq!(harness.calls("stability"), 2);
        assert_eq!(second.attempts[0].error_class, Some(ErrorClass::CircuitOpen));
        assert_eq!(second.used_provider, "stability");
        assert_eq!(
            breaker.state("openai"),
            crate::breaker::CircuitState::Open
        );
        Ok(())
    }

    #[test]
    fn run_events_are_written_in_order() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let harness = Harness::configured(
            temp.path(),
            vec![
                ("openai", Reply::Fail(ErrorClass::Quota)),
                ("stability", Reply::Payload(RawPayload::Buffer(png(16, 16)))),
            ],
            |orchestrator| orchestrator.with_events(EventWriter::new(&events_path, "session")),
        );

        let config = OrchestratorConfig::new("openai", vec!["stability".into()]);
        harness.orchestrator.orchestrate_generation(
            &GenerationRequest::new("harbour"),
            &UserContext::new("u"),
            &config,
            None,
        )?;

        let types: Vec<String> = std::fs::read_to_string(&events_path)?
            .lines()
            .map(|line| serde_json::from_str::<Value>(line))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter_map(|event| event["type"].as_str().map(str::to_string))
            .collect();
        assert_eq!(
            types,
            vec![
                "generation_started",
                "provider_attempt",
                "provider_attempt",
                "asset_written",
                "generation_finished",
            ]
        );
        Ok(())
    }

    #[test]
    fn post_process_failure_is_fatal() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut registry = ProviderRegistry::new();
        let (adapter, _) =
            ScriptedAdapter::new("openai", Reply::Payload(RawPayload::Buffer(png(16, 16))));
        registry.register(adapter);
        let mut tight = settings(temp.path());
        tight.max_source_bytes = 8;
        let orchestrator = Orchestrator::new(registry, &tight)?;

        let err = orchestrator
            .orchestrate_generation(
                &GenerationRequest::new("harbour"),
                &UserContext::new("u"),
                &OrchestratorConfig::new("openai", Vec::new()),
                None,
            )
            .expect_err("expected failure");
        assert!(matches!(err, PipelineError::PostProcess(_)));
        Ok(())
    }

    #[test]
    fn concurrent_runs_share_one_snapshot() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let harness = Harness::new(
            temp.path(),
            vec![("together", Reply::Payload(RawPayload::Buffer(png(16, 16))))],
        );
        let handle = ConfigHandle::new(OrchestratorConfig::new("together", Vec::new()));
        let snapshot = handle.snapshot();
        handle.replace(OrchestratorConfig::new("openai", Vec::new()));

        let outcomes: Vec<Result<GenerationOutcome, PipelineError>> = std::thread::scope(|scope| {
            let runs: Vec<_> = ["harbour", "meadow"]
                .into_iter()
                .map(|prompt| {
                    let orchestrator = &harness.orchestrator;
                    let snapshot = &snapshot;
                    scope.spawn(move || {
                        orchestrator.orchestrate_generation(
                            &GenerationRequest::new(prompt),
                            &UserContext::new("u"),
                            snapshot,
                            None,
                        )
                    })
                })
                .collect();
            runs.into_iter()
                .map(|run| run.join().expect("run panicked"))
                .collect()
        });

        for outcome in outcomes {
            assert_eq!(outcome?.used_provider, "together");
        }
        assert_eq!(harness.calls("together"), 2);
        Ok(())
    }
}
