//! Side effects the caller runs after a successful outcome.
//!
//! The orchestrator never calls these itself. Usage accounting, billing and
//! persistence belong to whoever owns the run.

use std::path::PathBuf;

use serde_json::Value;
use stockgen_contracts::events::{EventPayload, EventWriter, RunEvent};
use stockgen_contracts::generation::{GenerationOutcome, UserContext};
use stockgen_contracts::records::{GenerationRecord, RecordStore};

pub trait SuccessHook {
    fn name(&self) -> &str;
    fn on_success(&self, user: &UserContext, outcome: &GenerationOutcome) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookFailure {
    pub hook: String,
    pub error: String,
}

/// Runs every hook in order. A failing hook is logged and reported but does
/// not stop the rest.
pub fn run_success_hooks(
    hooks: &[&dyn SuccessHook],
    user: &UserContext,
    outcome: &GenerationOutcome,
) -> Vec<HookFailure> {
    let mut failures = Vec::new();
    for hook in hooks {
        if let Err(err) = hook.on_success(user, outcome) {
            tracing::warn!(hook = hook.name(), error = %format!("{err:#}"), "success hook failed");
            failures.push(HookFailure {
                hook: hook.name().to_string(),
                error: format!("{err:#}"),
            });
        }
    }
    failures
}

/// Appends a `usage_recorded` event per successful run.
pub struct UsageEventHook {
    events: EventWriter,
}

impl UsageEventHook {
    pub fn new(events: EventWriter) -> Self {
        Self { events }
    }
}

impl SuccessHook for UsageEventHook {
    fn name(&self) -> &str {
        "usage_event"
    }

    fn on_success(&self, user: &UserContext, outcome: &GenerationOutcome) -> anyhow::Result<()> {
        let mut payload = EventPayload::new();
        payload.insert("user_id".to_string(), Value::String(user.user_id.clone()));
        payload.insert(
            "quota_remaining".to_string(),
            user.quota_remaining.map(Value::from).unwrap_or(Value::Null),
        );
        payload.insert(
            "provider".to_string(),
            Value::String(outcome.used_provider.clone()),
        );
        payload.insert(
            "placeholder".to_string(),
            Value::Bool(outcome.used_placeholder()),
        );
        payload.insert(
            "content_hash".to_string(),
            Value::String(outcome.asset.content_hash.clone()),
        );
        self.events.emit(RunEvent::UsageRecorded, payload)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistStatus {
    Stored { record_id: String },
    /// The asset is on disk but no record points at it.
    Orphaned { file_path: PathBuf, error: String },
}

pub fn persist_record(store: &mut dyn RecordStore, record: &GenerationRecord) -> PersistStatus {
    match store.insert(record) {
        Ok(record_id) => PersistStatus::Stored { record_id },
        Err(err) => {
            let file_path = PathBuf::from(&record.file_path);
            tracing::error!(
                path = %file_path.display(),
                error = %format!("{err:#}"),
                "record insert failed; asset orphaned"
            );
            PersistStatus::Orphaned {
                file_path,
                error: format!("{err:#}"),
            }
        }
    }
}
