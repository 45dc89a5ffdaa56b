use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use stockgen_contracts::config::{parse_provider_list, ConfigHandle, StockgenConfig};
use stockgen_contracts::events::EventWriter;
use stockgen_contracts::generation::{GenerationRequest, UserContext};
use stockgen_contracts::providers::ProviderCatalog;
use stockgen_contracts::records::{build_record, JsonFileRecordStore, RecordInput};
use stockgen_engine::{
    default_registry, persist_record, run_success_hooks, Orchestrator, PersistStatus,
    PlaceholderSynthesizer, SuccessHook, UsageEventHook,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "stockgen", version, about = "Stock image generation with provider fallback")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate one stock-ready JPEG and persist its record.
    Generate(GenerateArgs),
    /// List configured providers and whether their credentials are present.
    Providers(ProvidersArgs),
    /// Render the placeholder image for a prompt without calling any provider.
    Placeholder(PlaceholderArgs),
}

#[derive(Debug, Args)]
struct GenerateArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    model: Option<String>,
    /// Comma separated provider ids.
    #[arg(long)]
    fallback_order: Option<String>,
    #[arg(long)]
    force_fallback: bool,
    #[arg(long)]
    size: Option<String>,
    #[arg(long)]
    style: Option<String>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    title: Option<String>,
    #[arg(long, default_value = "local")]
    user: String,
    #[arg(long)]
    target_size: Option<u32>,
    #[arg(long)]
    records: Option<PathBuf>,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ProvidersArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct PlaceholderArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    out: PathBuf,
    #[arg(long, default_value_t = 1024)]
    size: u32,
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("stockgen error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Generate(args) => run_generate(args),
        Command::Providers(args) => run_providers(args),
        Command::Placeholder(args) => run_placeholder(args),
    }
}

fn resolve_config(args: &GenerateArgs) -> Result<StockgenConfig> {
    let mut config = StockgenConfig::load(args.config.as_deref())?;
    if let Some(out) = &args.out {
        config.pipeline.output_dir = out.clone();
    }
    if let Some(order) = &args.fallback_order {
        config.orchestrator.fallback_order = parse_provider_list(order);
    }
    if let Some(size) = args.target_size.filter(|size| *size > 0) {
        config.pipeline.target_size = size;
    }
    Ok(config)
}

fn build_request(args: &GenerateArgs) -> GenerationRequest {
    GenerationRequest {
        prompt: args.prompt.clone(),
        requested_model: args.model.clone(),
        size: args.size.clone(),
        quality: None,
        style: args.style.clone(),
        seed: args.seed,
        force_fallback: args.force_fallback,
    }
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let config = resolve_config(&args)?;
    let out_dir = config.pipeline.output_dir.clone();
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| out_dir.join("events.jsonl"));
    let records_path = args
        .records
        .clone()
        .unwrap_or_else(|| out_dir.join("records.json"));

    let events = EventWriter::new(&events_path, "session");
    let registry = default_registry(&ProviderCatalog::default())?;
    let orchestrator = Orchestrator::new(registry, &config.pipeline)?.with_events(events.clone());
    let handle = ConfigHandle::new(config.orchestrator.clone());

    let request = build_request(&args);
    let user = UserContext::new(args.user.clone());
    let outcome = orchestrator
        .orchestrate_generation(&request, &user, &handle.snapshot(), None)
        .context("generation failed")?;

    let usage = UsageEventHook::new(events.for_run("usage"));
    let hooks: [&dyn SuccessHook; 1] = [&usage];
    let hook_failures = run_success_hooks(&hooks, &user, &outcome);

    let record = build_record(
        &outcome,
        &RecordInput {
            user_id: user.user_id.clone(),
            prompt: request.prompt.clone(),
            style: request.style.clone(),
            size: request.size.clone(),
            title: args.title.clone(),
        },
    );
    let mut store = JsonFileRecordStore::new(&records_path);
    let persisted = persist_record(&mut store, &record);
    if let PersistStatus::Stored { record_id } = &persisted {
        tracing::info!(record_id = %record_id, path = %records_path.display(), "record stored");
    }

    let summary = json!({
        "record_id": match &persisted {
            PersistStatus::Stored { record_id } => Value::String(record_id.clone()),
            PersistStatus::Orphaned { .. } => Value::Null,
        },
        "orphaned": matches!(persisted, PersistStatus::Orphaned { .. }),
        "used_provider": outcome.used_provider,
        "used_model": outcome.used_model,
        "fallback_reason": outcome.fallback_reason,
        "file_path": outcome.asset.file_path.to_string_lossy(),
        "byte_size": outcome.asset.byte_size,
        "content_hash": outcome.asset.content_hash,
        "attempts": outcome.attempts,
        "hook_failures": hook_failures
            .iter()
            .map(|failure| json!({ "hook": failure.hook, "error": failure.error }))
            .collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(0)
}

fn run_providers(args: ProvidersArgs) -> Result<i32> {
    let catalog = ProviderCatalog::default();
    let registry = default_registry(&catalog)?;
    let statuses: Vec<_> = catalog
        .ids()
        .iter()
        .filter_map(|id| registry.get(id))
        .map(|adapter| adapter.status())
        .collect();

    if args.json {
        let rows: Vec<Value> = statuses.iter().map(|status| status.to_json()).collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(0);
    }
    for status in statuses {
        let key = if status.configured { "ready" } else { "missing key" };
        println!(
            "{:<12} {:<40} {:<7} {} ({})",
            status.id, status.model, status.response_format, key, status.api_key_env
        );
    }
    Ok(0)
}

fn run_placeholder(args: PlaceholderArgs) -> Result<i32> {
    let image = PlaceholderSynthesizer::new(args.size).synthesize(&args.prompt)?;
    if let Some(parent) = args.out.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed creating {}", parent.display()))?;
    }
    fs::write(&args.out, &image.bytes)
        .with_context(|| format!("failed writing {}", args.out.display()))?;
    println!("{} {}", args.out.display(), image.content_hash);
    Ok(0)
}
