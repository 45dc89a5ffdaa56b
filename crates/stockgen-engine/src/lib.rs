//! Provider fallback chain, payload normalization, placeholder rendering and
//! stock-image post-processing.

pub mod adapter;
pub mod breaker;
pub mod error;
pub mod hooks;
pub mod normalize;
pub mod orchestrator;
pub mod placeholder;
pub mod postprocess;

pub use adapter::{
    default_registry, HttpProviderAdapter, ProviderAdapter, ProviderRegistry, ProviderStatus,
};
pub use breaker::CircuitBreaker;
pub use error::{
    NormalizationError, PipelineError, PlaceholderError, PostProcessError, ProviderError,
};
pub use hooks::{persist_record, run_success_hooks, PersistStatus, SuccessHook, UsageEventHook};
pub use orchestrator::{attempt_order, CancelFlag, Orchestrator};
pub use placeholder::PlaceholderSynthesizer;
pub use postprocess::PostProcessor;
