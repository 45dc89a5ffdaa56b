use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tempfile::NamedTempFile;
use uuid::Uuid;

use crate::events::now_utc_iso;
use crate::generation::{AttemptRecord, GenerationOutcome};

pub const RECORD_SCHEMA_VERSION: u64 = 1;
pub const MAX_TITLE_CHARS: usize = 100;
pub const MAX_KEYWORDS: usize = 10;

/// Caller-side identifiers that accompany an outcome into persistence.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RecordInput {
    pub user_id: String,
    pub prompt: String,
    pub style: Option<String>,
    pub size: Option<String>,
    pub title: Option<String>,
}

/// Shape handed to the document store; one per successful run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub schema_version: u64,
    pub id: String,
    pub user_id: String,
    pub prompt: String,
    pub title: String,
    pub keywords: Vec<String>,
    pub style: Option<String>,
    pub size: Option<String>,
    pub used_provider: String,
    pub used_model: String,
    pub fallback_reason: Option<String>,
    pub is_placeholder: bool,
    pub file_path: String,
    pub byte_size: u64,
    pub width: u32,
    pub height: u32,
    pub mime_type: String,
    pub source_hash: String,
    pub content_hash: String,
    pub attempts: Vec<AttemptRecord>,
    pub generation_params: Value,
    pub created_at: String,
}

pub fn build_record(outcome: &GenerationOutcome, input: &RecordInput) -> GenerationRecord {
    let title = input
        .title
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| truncate_chars(value, MAX_TITLE_CHARS))
        .unwrap_or_else(|| default_title(&input.prompt));

    GenerationRecord {
        schema_version: RECORD_SCHEMA_VERSION,
        id: Uuid::new_v4().to_string(),
        user_id: input.user_id.clone(),
        prompt: input.prompt.clone(),
        title,
        keywords: extract_keywords(&input.prompt, MAX_KEYWORDS),
        style: input.style.clone(),
        size: input.size.clone(),
        used_provider: outcome.used_provider.clone(),
        used_model: outcome.used_model.clone(),
        fallback_reason: outcome.fallback_reason.clone(),
        is_placeholder: outcome.used_placeholder(),
        file_path: outcome.asset.file_path.to_string_lossy().to_string(),
        byte_size: outcome.asset.byte_size,
        width: outcome.asset.width,
        height: outcome.asset.height,
        mime_type: outcome.asset.mime_type.clone(),
        source_hash: outcome.source_hash.clone(),
        content_hash: outcome.asset.content_hash.clone(),
        attempts: outcome.attempts.clone(),
        generation_params: sanitize_payload(&Value::Object(outcome.generation_params.clone())),
        created_at: now_utc_iso(),
    }
}

pub fn default_title(prompt: &str) -> String {
    let collapsed = prompt.split_whitespace().collect::<Vec<&str>>().join(" ");
    let mut chars = collapsed.chars();
    let titled = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
        None => "Untitled".to_string(),
    };
    truncate_chars(&titled, MAX_TITLE_CHARS)
}

/// First `limit` distinct lower-cased words longer than three characters.
pub fn extract_keywords(prompt: &str, limit: usize) -> Vec<String> {
    let mut keywords: Vec<String> = Vec::new();
    for raw in prompt.split_whitespace() {
        if keywords.len() >= limit {
            break;
        }
        let word = raw
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase();
        if word.chars().count() <= 3 || keywords.contains(&word) {
            continue;
        }
        keywords.push(word);
    }
    keywords
}

fn truncate_chars(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

/// Strips inline image payloads before provider params reach a record.
pub fn sanitize_payload(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::Bool(_) | Value::Number(_) | Value::String(_) => value.clone(),
        Value::Array(rows) => Value::Array(rows.iter().map(sanitize_payload).collect()),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, row) in map {
                let lowered = key.to_ascii_lowercase();
                if matches!(
                    lowered.as_str(),
                    "b64_json" | "image" | "image_bytes" | "data" | "api_key" | "authorization"
                ) {
                    out.insert(key.clone(), Value::String("<omitted>".to_string()));
                    continue;
                }
                out.insert(key.clone(), sanitize_payload(row));
            }
            Value::Object(out)
        }
    }
}

/// External persistence seam: insert semantics, one record per run.
pub trait RecordStore {
    fn insert(&mut self, record: &GenerationRecord) -> Result<String>;
}

/// Records kept in one JSON object keyed by record id.
///
/// Inserts run read-merge-write under a lock shared by every store in the
/// process that points at the same path, and the merged object replaces the
/// file through a temp file renamed into place. Only a missing file reads as
/// empty; an unreadable or corrupt file fails the insert and stays untouched.
#[derive(Debug, Clone)]
pub struct JsonFileRecordStore {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl JsonFileRecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock = store_lock(&path);
        Self { path, lock }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, id: &str) -> Result<Option<GenerationRecord>> {
        let mut on_disk = read_records(&self.path)?;
        on_disk
            .remove(id)
            .map(|row| {
                serde_json::from_value(row)
                    .with_context(|| format!("record {id} in {} is malformed", self.path.display()))
            })
            .transpose()
    }

    pub fn len(&self) -> Result<usize> {
        Ok(read_records(&self.path)?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn find_by_content_hash(&self, content_hash: &str) -> Result<Vec<GenerationRecord>> {
        let mut matches = Vec::new();
        for (id, row) in read_records(&self.path)? {
            let record: GenerationRecord = serde_json::from_value(row)
                .with_context(|| format!("record {id} in {} is malformed", self.path.display()))?;
            if record.content_hash == content_hash {
                matches.push(record);
            }
        }
        Ok(matches)
    }
}

impl RecordStore for JsonFileRecordStore {
    fn insert(&mut self, record: &GenerationRecord) -> Result<String> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut on_disk = read_records(&self.path)?;
        if on_disk.contains_key(&record.id) {
            anyhow::bail!("record {} already exists", record.id);
        }
        on_disk.insert(record.id.clone(), serde_json::to_value(record)?);
        write_records(&self.path, &on_disk)?;
        Ok(record.id.clone())
    }
}

fn store_lock(path: &Path) -> Arc<Mutex<()>> {
    static LOCKS: OnceLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();
    let key = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut locks = LOCKS
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    Arc::clone(locks.entry(key).or_default())
}

fn read_records(path: &Path) -> Result<Map<String, Value>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Map::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed reading {}", path.display()));
        }
    };
    let parsed: Value = serde_json::from_str(&raw)
        .with_context(|| format!("record store {} is not valid JSON", path.display()))?;
    match parsed {
        Value::Object(map) => Ok(map),
        _ => anyhow::bail!("record store {} is not a JSON object", path.display()),
    }
}

fn write_records(path: &Path, records: &Map<String, Value>) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).with_context(|| format!("failed creating {}", dir.display()))?;

    let mut staged = NamedTempFile::new_in(dir)
        .with_context(|| format!("failed staging records in {}", dir.display()))?;
    serde_json::to_writer_pretty(&mut staged, records)?;
    staged.as_file().sync_all()?;
    staged
        .persist(path)
        .with_context(|| format!("failed replacing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::generation::{ErrorClass, FinalImageAsset, PLACEHOLDER_MODEL, PLACEHOLDER_PROVIDER_ID};

    fn outcome(provider: &str, model: &str, reason: Option<&str>) -> GenerationOutcome {
        let mut params = Map::new();
        params.insert("steps".to_string(), json!(40));
        params.insert("b64_json".to_string(), json!("aGVsbG8="));
        GenerationOutcome {
            used_provider: provider.to_string(),
            used_model: model.to_string(),
            fallback_reason: reason.map(str::to_string),
            source_hash: "src".to_string(),
            asset: FinalImageAsset {
                file_path: PathBuf::from("/tmp/out/1700000000000-abcdef012345.jpg"),
                byte_size: 1234,
                width: 4000,
                height: 4000,
                mime_type: "image/jpeg".to_string(),
                content_hash: "final".to_string(),
            },
            attempts: vec![AttemptRecord::failure(
                "openai",
                ErrorClass::Quota,
                Some(429),
                "slow down",
                12,
            )],
            generation_params: params,
        }
    }

    fn input(prompt: &str) -> RecordInput {
        RecordInput {
            user_id: "user-1".to_string(),
            prompt: prompt.to_string(),
            style: Some("photo".to_string()),
            size: Some("1:1".to_string()),
            title: None,
        }
    }

    #[test]
    fn record_maps_outcome_fields() {
        let record = build_record(
            &outcome("stability", "sdxl", None),
            &input("sunset over mountains"),
        );
        assert_eq!(record.user_id, "user-1");
        assert_eq!(record.used_provider, "stability");
        assert_eq!(record.width, 4000);
        assert_eq!(record.content_hash, "final");
        assert_eq!(record.source_hash, "src");
        assert!(!record.is_placeholder);
        assert_eq!(record.attempts.len(), 1);
        assert_eq!(record.title, "Sunset over mountains");
        assert!(Uuid::parse_str(&record.id).is_ok());
    }

    #[test]
    fn record_redacts_inline_image_params() {
        let record = build_record(&outcome("together", "flux", None), &input("a cat"));
        assert_eq!(record.generation_params["steps"], json!(40));
        assert_eq!(record.generation_params["b64_json"], json!("<omitted>"));
    }

    #[test]
    fn placeholder_outcome_is_flagged() {
        let record = build_record(
            &outcome(PLACEHOLDER_PROVIDER_ID, PLACEHOLDER_MODEL, Some("Quota Exceeded")),
            &input("a cat"),
        );
        assert!(record.is_placeholder);
        assert_eq!(record.fallback_reason.as_deref(), Some("Quota Exceeded"));
    }

    #[test]
    fn explicit_title_wins_and_is_truncated() {
        let mut custom = input("sunset");
        custom.title = Some(format!("  {}  ", "T".repeat(150)));
        let record = build_record(&outcome("openai", "dall-e-3", None), &custom);
        assert_eq!(record.title.chars().count(), MAX_TITLE_CHARS);
    }

    #[test]
    fn default_title_collapses_whitespace() {
        assert_eq!(default_title("  misty   forest\nat dawn "), "Misty forest at dawn");
        assert_eq!(default_title("   "), "Untitled");
    }

    #[test]
    fn keywords_are_distinct_long_words_in_order() {
        let keywords = extract_keywords(
            "A red fox, a RED fox jumping over the snowy, snowy field at dusk!",
            10,
        );
        assert_eq!(keywords, vec!["jumping", "over", "snowy", "field", "dusk"]);
        let limited = extract_keywords("alpha bravo charlie delta echo", 2);
        assert_eq!(limited, vec!["alpha", "bravo"]);
    }

    #[test]
    fn file_store_inserts_and_merges() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("records.json");
        let mut store_a = JsonFileRecordStore::new(&path);
        let mut store_b = JsonFileRecordStore::new(&path);

        let first = build_record(&outcome("openai", "dall-e-3", None), &input("one"));
        let second = build_record(&outcome("together", "flux", None), &input("two"));
        let id_a = store_a.insert(&first)?;
        let id_b = store_b.insert(&second)?;

        assert_eq!(store_a.len()?, 2);
        assert_eq!(store_a.get(&id_b)?.map(|r| r.prompt), Some("two".to_string()));
        assert_eq!(store_b.get(&id_a)?.map(|r| r.prompt), Some("one".to_string()));
        assert_eq!(store_a.find_by_content_hash("final")?.len(), 2);
        Ok(())
    }

    #[test]
    fn file_store_rejects_duplicate_ids() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut store = JsonFileRecordStore::new(temp.path().join("records.json"));
        let record = build_record(&outcome("openai", "dall-e-3", None), &input("one"));
        store.insert(&record)?;
        assert!(store.insert(&record).is_err());
        assert_eq!(store.len()?, 1);
        Ok(())
    }

    #[test]
    fn missing_store_file_reads_as_empty() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = JsonFileRecordStore::new(temp.path().join("nested").join("records.json"));
        assert!(store.is_empty()?);
        assert_eq!(store.get("absent")?, None);
        Ok(())
    }

    #[test]
    fn corrupt_store_file_fails_insert_and_is_kept() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("records.json");
        let torn = r#"{"existing-id": {"id": "existing-id"}, "#;
        fs::write(&path, torn)?;

        let mut store = JsonFileRecordStore::new(&path);
        let record = build_record(&outcome("openai", "dall-e-3", None), &input("one"));
        let err = store.insert(&record).expect_err("torn file must not be overwritten");

        assert!(format!("{err:#}").contains("records.json"));
        assert_eq!(fs::read_to_string(&path)?, torn);
        assert!(store.len().is_err());
        Ok(())
    }

    #[test]
    fn concurrent_inserts_keep_every_record() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("records.json");

        let ids: Vec<String> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..16)
                .map(|n| {
                    let path = path.clone();
                    scope.spawn(move || {
                        let mut store = JsonFileRecordStore::new(path);
                        let record = build_record(
                            &outcome("together", "flux", None),
                            &input(&format!("harbour {n}")),
                        );
                        store.insert(&record)
                    })
                })
                .collect();
            workers
                .into_iter()
                .map(|worker| worker.join().expect("insert thread panicked"))
                .collect::<Result<_>>()
        })?;

        let store = JsonFileRecordStore::new(&path);
        assert_eq!(ids.len(), 16);
        assert_eq!(store.len()?, 16);
        for id in &ids {
            assert!(store.get(id)?.is_some(), "record {id} lost");
        }
        Ok(())
    }
}
