use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{SecondsFormat, Utc};
use clap::{Parser, Subcommand};
use contextshot_contracts::campaigns::{campaign_variations, find_variation, MAX_VARIATIONS};
use contextshot_contracts::edits::EditRequest;
use contextshot_contracts::events::EventWriter;
use contextshot_contracts::runs::{
    write_batch_summary, BatchAggregates, BatchItem, BatchItemResult, BatchSummary, ItemOutcome,
    VariationMetrics,
};
use contextshot_engine::{
    BatchOptions, BatchOrchestrator, CancelToken, PollPolicy, ProviderClient, ProviderConfig,
    SystemClock, DEFAULT_POLL_ATTEMPTS,
};
use image::ImageFormat;
use serde_json::{json, Map, Value};
use tracing_subscriber::EnvFilter;

const RATE_LIMIT_MESSAGE: &str = "Image generation failed. This may be due to API rate limits. \
Please check your Bria AI plan or try again later.";

#[derive(Debug, Parser)]
#[command(
    name = "contextshot",
    version,
    about = "Generate campaign variations of a product photo"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Generate(GenerateArgs),
    RemoveBackground(RemoveBackgroundArgs),
    ApplyReference(ApplyReferenceArgs),
}

#[derive(Debug, clap::Args)]
struct PacingArgs {
    #[arg(long, env = "CONTEXTSHOT_POLL_ATTEMPTS", default_value_t = DEFAULT_POLL_ATTEMPTS)]
    poll_attempts: u32,
    #[arg(long, env = "CONTEXTSHOT_POLL_INTERVAL_MS", default_value_t = 3000)]
    poll_interval_ms: u64,
    #[arg(long, env = "CONTEXTSHOT_PACE_MS", default_value_t = 3000)]
    pace_ms: u64,
    /// Stop the batch after this many seconds.
    #[arg(long)]
    deadline_secs: Option<u64>,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    prompt: String,
    #[arg(long, default_value_t = 6, value_parser = clap::value_parser!(u8).range(1..=6))]
    variations: u8,
    /// Base seed; variation N is submitted with `seed + N`.
    #[arg(long)]
    seed: Option<i64>,
    /// Append each variation's photography style to the prompt.
    #[arg(long)]
    styled: bool,
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long)]
    events: Option<PathBuf>,
    /// Return placeholder images when every variation failed.
    #[arg(long, env = "USE_MOCK_MODE")]
    mock_fallback: bool,
    #[command(flatten)]
    pacing: PacingArgs,
}

#[derive(Debug, Parser)]
struct RemoveBackgroundArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[command(flatten)]
    pacing: PacingArgs,
}

#[derive(Debug, Parser)]
struct ApplyReferenceArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    prompt: String,
    /// Seed returned by an earlier generation.
    #[arg(long)]
    seed: i64,
    #[arg(long)]
    events: Option<PathBuf>,
    #[command(flatten)]
    pacing: PacingArgs,
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("contextshot error: {err:#}");
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
        Command::RemoveBackground(args) => {
            let image = read_product_image(&args.image)?;
            let item = BatchItem {
                variation_id: "remove_background".to_string(),
                request: EditRequest::remove_background(image),
                metrics: VariationMetrics::default(),
            };
            run_single(item, args.events, &args.pacing)
        }
        Command::ApplyReference(args) => {
            let image = read_product_image(&args.image)?;
            let item = BatchItem {
                variation_id: "reference".to_string(),
                request: EditRequest::replace_background(image, args.prompt)
                    .with_seed(Some(args.seed)),
                metrics: VariationMetrics::default(),
            };
            run_single(item, args.events, &args.pacing)
        }
    }
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let image = read_product_image(&args.image)?;
    let batch_id = new_batch_id();
    let events_path = args
        .events
        .clone()
        .or_else(|| args.out.as_ref().map(|dir| dir.join("events.jsonl")));
    let items = build_items(
        &image,
        &args.prompt,
        usize::from(args.variations),
        args.seed,
        args.styled,
    );

    let orchestrator = build_orchestrator(&args.pacing, events_path.as_deref(), &batch_id)?;
    let summary = orchestrator.run(items, &CancelToken::new())?;

    let mock = summary.succeeded == 0 && args.mock_fallback;
    let report = if mock {
        tracing::info!("no variations generated, substituting placeholders");
        let placeholders = mock_results(&args.prompt, usize::from(args.variations));
        build_report(&args.prompt, &placeholders, &summary, true)
    } else {
        build_report(&args.prompt, &summary.items, &summary, false)
    };

    if let Some(out_dir) = &args.out {
        let mut extra = Map::new();
        extra.insert("prompt".to_string(), Value::String(args.prompt.clone()));
        extra.insert("mock".to_string(), Value::Bool(mock));
        let summary_path = out_dir.join("summary.json");
        write_batch_summary(&summary_path, &batch_id, &summary, Some(&extra))?;
        tracing::info!(path = %summary_path.display(), "wrote batch summary");
    }

    if summary.succeeded == 0 && !mock {
        eprintln!("{RATE_LIMIT_MESSAGE}");
        for failure in summary.failures() {
            if let Some(error) = failure.outcome.error() {
                eprintln!("  {}: {error}", failure.variation_id);
            }
        }
        return Ok(2);
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(0)
}

fn run_single(item: BatchItem, events: Option<PathBuf>, pacing: &PacingArgs) -> Result<i32> {
    let batch_id = new_batch_id();
    let orchestrator = build_orchestrator(pacing, events.as_deref(), &batch_id)?;
    let summary = orchestrator.run(vec![item], &CancelToken::new())?;
    let Some(result) = summary.items.first() else {
        bail!("edit was interrupted before it was submitted");
    };
    match &result.outcome {
        ItemOutcome::Succeeded {
            result_url,
            refined_prompt,
            seed,
        } => {
            let payload = json!({
                "image_url": result_url,
                "seed": seed,
                "refined_prompt": refined_prompt,
                "polls": result.polls,
            });
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(0)
        }
        ItemOutcome::Failed { error } => {
            eprintln!("contextshot error: {error}");
            Ok(1)
        }
    }
}

fn build_orchestrator(
    pacing: &PacingArgs,
    events_path: Option<&Path>,
    batch_id: &str,
) -> Result<BatchOrchestrator> {
    let config = ProviderConfig::from_env()?;
    let client = Arc::new(ProviderClient::new(config)?);
    let policy = PollPolicy::new(
        pacing.poll_attempts,
        Duration::from_millis(pacing.poll_interval_ms),
    );
    let options = BatchOptions {
        pace_interval: Duration::from_millis(pacing.pace_ms),
        deadline: pacing.deadline_secs.map(Duration::from_secs),
        ..BatchOptions::default()
    };
    let orchestrator = BatchOrchestrator::new(client, Arc::new(SystemClock), policy, options);
    Ok(match events_path {
        Some(path) => orchestrator.with_events(EventWriter::new(path, batch_id)),
        None => orchestrator,
    })
}

fn read_product_image(path: &Path) -> Result<Vec<u8>> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let format = image::guess_format(&bytes)
        .with_context(|| format!("{} is not a recognized image", path.display()))?;
    if !matches!(
        format,
        ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::WebP
    ) {
        bail!(
            "{} is {format:?}; expected a JPEG, PNG or WebP image",
            path.display()
        );
    }
    Ok(bytes)
}

fn new_batch_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// One item per catalog variation, all sharing the product image bytes.
fn build_items(
    image: &[u8],
    prompt: &str,
    count: usize,
    seed: Option<i64>,
    styled: bool,
) -> Vec<BatchItem> {
    let image: Arc<[u8]> = Arc::from(image);
    campaign_variations(count.min(MAX_VARIATIONS))
        .iter()
        .enumerate()
        .map(|(idx, variation)| {
            let prompt = if styled {
                format!("{prompt}, {}", variation.prompt_suffix)
            } else {
                prompt.to_string()
            };
            BatchItem {
                variation_id: variation.id(),
                request: EditRequest::replace_background(Arc::clone(&image), prompt)
                    .with_seed(seed.map(|base| base.saturating_add(idx as i64))),
                metrics: variation.metrics(),
            }
        })
        .collect()
}

/// Placeholder results shaped like real ones, used only when every
/// variation failed and the caller opted into mock output.
fn mock_results(prompt: &str, count: usize) -> Vec<BatchItemResult> {
    campaign_variations(count)
        .iter()
        .enumerate()
        .map(|(idx, variation)| {
            let step = idx as f64;
            BatchItemResult {
                position: idx,
                variation_id: variation.id(),
                outcome: ItemOutcome::Succeeded {
                    result_url: format!(
                        "https://via.placeholder.com/400x400/6b2cff/ffffff?text=Mock+{}",
                        variation.name
                    ),
                    refined_prompt: Some(format!("{prompt} - {} variation", variation.name)),
                    seed: None,
                },
                metrics: VariationMetrics {
                    predicted_ctr: 0.035 + step * 0.005,
                    engagement_score: 7.5 + step * 0.5,
                    ..variation.metrics()
                },
                polls: 0,
                elapsed_ms: 0,
            }
        })
        .collect()
}

fn build_report(
    prompt: &str,
    results: &[BatchItemResult],
    summary: &BatchSummary,
    mock: bool,
) -> Value {
    let succeeded: Vec<&BatchItemResult> = results
        .iter()
        .filter(|item| item.outcome.is_success())
        .collect();
    let aggregates = BatchAggregates::over_successes(results.iter());

    let images: Vec<Value> = succeeded
        .iter()
        .filter_map(|item| item.outcome.result_url())
        .map(|url| Value::String(url.to_string()))
        .collect();
    let detailed: Vec<Value> = succeeded.iter().map(|item| detailed_entry(item)).collect();
    let failures: Vec<Value> = summary
        .failures()
        .map(|item| {
            json!({
                "variation": item.position + 1,
                "context_name": context_name(&item.variation_id),
                "error": item.outcome.error(),
            })
        })
        .collect();

    json!({
        "images": images,
        "detailed_results": detailed,
        "failures": failures,
        "prompt": prompt,
        "num_generated": succeeded.len(),
        "generation_time": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        "total_cost_saved": aggregates.total_cost_saved,
        "time_saved_hours": aggregates.total_time_saved_hours,
        "roi_percentage": aggregates.roi_percentage,
        "avg_ctr": aggregates.avg_ctr,
        "avg_engagement": aggregates.avg_engagement,
        "ai_generation_cost": aggregates.ai_generation_cost,
        "mock": mock,
        "interruption": summary.interruption.map(|stop| stop.as_str()),
    })
}

fn detailed_entry(item: &BatchItemResult) -> Value {
    let (result_url, refined_prompt, seed) = match &item.outcome {
        ItemOutcome::Succeeded {
            result_url,
            refined_prompt,
            seed,
        } => (result_url.as_str(), refined_prompt.as_deref(), *seed),
        ItemOutcome::Failed { .. } => ("", None, None),
    };
    let use_case = find_variation(&item.variation_id).map(|variation| variation.use_case);
    json!({
        "final_image": result_url,
        "variation": item.position + 1,
        "context_name": context_name(&item.variation_id),
        "use_case": use_case,
        "predicted_ctr": item.metrics.predicted_ctr,
        "engagement_score": item.metrics.engagement_score,
        "cost_saved": item.metrics.cost_saved,
        "time_saved_hours": item.metrics.time_saved_hours,
        "seed": seed,
        "refined_prompt": refined_prompt,
    })
}

fn context_name(variation_id: &str) -> String {
    find_variation(variation_id)
        .map(|variation| variation.name.to_string())
        .unwrap_or_else(|| variation_id.to_string())
}
