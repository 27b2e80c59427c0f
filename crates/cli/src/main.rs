// Bulkmut CLI
//
// Design Decision: Use clap derive; every engine knob is a flag with an env var.
// Design Decision: A TOML file supplies the base EngineConfig, flags override it.
// Design Decision: Candidates and the failure report are JSON Lines files.

mod candidates;
mod output;
mod report;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bulkmut_engine::reliability::CircuitBreakerConfig;
use bulkmut_engine::telemetry::{init_telemetry, TelemetryConfig};
use bulkmut_engine::{
    load_engine_config, AccountCredentials, CheckpointLedger, CredentialConfig, CredentialManager,
    Dispatcher, EngineConfig, EngineError, MergeFields, PayloadBuilder, RemoteApi, ReplaceWith,
};
use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PayloadMode {
    /// Read the entity and overlay the desired top-level fields
    Merge,
    /// Send the desired state as-is without reading first
    Replace,
}

#[derive(Parser)]
#[command(name = "bulkmut")]
#[command(about = "Apply bulk mutations to a rate-limited OAuth API")]
#[command(version)]
struct Cli {
    /// Candidate file, JSON Lines of {"entity_id", "desired_state"}
    #[arg(long, short, env = "BULKMUT_INPUT")]
    input: PathBuf,

    /// Remote API base URL (entities live under {url}/entities/{id})
    #[arg(long, env = "BULKMUT_API_URL")]
    api_url: String,

    /// OAuth token endpoint
    #[arg(long, env = "BULKMUT_TOKEN_URL")]
    token_url: String,

    /// Authenticated GET used to check the access token
    #[arg(long, env = "BULKMUT_VALIDATION_URL")]
    validation_url: String,

    /// Account name; credentials are read from <ACCOUNT>_ACCESS_TOKEN,
    /// <ACCOUNT>_REFRESH_TOKEN, <ACCOUNT>_CLIENT_ID and <ACCOUNT>_CLIENT_SECRET
    #[arg(long, env = "BULKMUT_ACCOUNT", default_value = "BULKMUT")]
    account: String,

    /// Checkpoint ledger of completed ids
    #[arg(long, env = "BULKMUT_LEDGER", default_value = "completed.txt")]
    ledger: PathBuf,

    /// Failure report output
    #[arg(long, env = "BULKMUT_FAILURES", default_value = "failures.jsonl")]
    failures: PathBuf,

    /// Base engine configuration (TOML)
    #[arg(long, env = "BULKMUT_CONFIG")]
    config: Option<PathBuf>,

    /// Prefix added to ids that do not already start with it
    #[arg(long, env = "BULKMUT_ID_PREFIX")]
    id_prefix: Option<String>,

    /// How the write body is built
    #[arg(long, value_enum, env = "BULKMUT_PAYLOAD", default_value = "merge")]
    payload: PayloadMode,

    /// Summary format
    #[arg(long, short, default_value = "text", value_parser = ["text", "json"])]
    output: String,

    #[command(flatten)]
    engine: EngineArgs,
}

/// Overrides applied on top of the configuration file
#[derive(clap::Args, Debug, Default)]
struct EngineArgs {
    #[arg(long, env = "BULKMUT_MAX_CONCURRENCY")]
    max_concurrency: Option<usize>,

    #[arg(long, env = "BULKMUT_INIT_RATE")]
    init_rate: Option<f64>,

    #[arg(long, env = "BULKMUT_MAX_RATE")]
    max_rate: Option<f64>,

    #[arg(long, env = "BULKMUT_MIN_RATE")]
    min_rate: Option<f64>,

    #[arg(long, env = "BULKMUT_RAMP_STEP")]
    ramp_step: Option<f64>,

    #[arg(long, env = "BULKMUT_CIRCUIT_THRESHOLD")]
    circuit_threshold: Option<u32>,

    #[arg(long, env = "BULKMUT_CIRCUIT_COOLDOWN_MS")]
    circuit_cooldown_ms: Option<u64>,

    /// Shortest pause applied after a throttling response
    #[arg(long, env = "BULKMUT_MIN_PAUSE_MS")]
    min_pause_ms: Option<u64>,

    /// Cap on server-requested pauses
    #[arg(long, env = "BULKMUT_MAX_PAUSE_MS")]
    max_pause_ms: Option<u64>,

    #[arg(long, env = "BULKMUT_QUEUE_REDUCTION_FACTOR")]
    queue_reduction_factor: Option<f64>,

    #[arg(long, env = "BULKMUT_MAX_DRAIN_ITERATIONS")]
    max_drain_iterations: Option<u32>,

    #[arg(long, env = "BULKMUT_DRAIN_PAUSE_MS")]
    drain_pause_ms: Option<u64>,

    #[arg(long, env = "BULKMUT_CHECKPOINT_BATCH_SIZE")]
    checkpoint_batch_size: Option<usize>,

    #[arg(long, env = "BULKMUT_REQUEST_TIMEOUT_SECS")]
    request_timeout_secs: Option<u64>,

    #[arg(long, env = "BULKMUT_PROGRESS_INTERVAL_SECS")]
    progress_interval_secs: Option<u64>,

    #[arg(long, env = "BULKMUT_SHUTDOWN_TIMEOUT_SECS")]
    shutdown_timeout_secs: Option<u64>,

    /// Keep candidate order instead of shuffling
    #[arg(long, env = "BULKMUT_NO_SHUFFLE")]
    no_shuffle: bool,

    /// Keep 5xx/network failures in the retry queue during drain phases
    #[arg(long, env = "BULKMUT_REQUEUE_TRANSIENT")]
    requeue_transient_in_drain: bool,
}

impl EngineArgs {
    fn apply(&self, mut config: EngineConfig) -> EngineConfig {
        if let Some(max) = self.max_concurrency {
            config = config.with_max_concurrency(max);
        }

        let mut limiter = config.limiter.clone();
        if self.min_rate.is_some() || self.max_rate.is_some() {
            let min_rate = self.min_rate.unwrap_or(limiter.min_rate);
            let max_rate = self.max_rate.unwrap_or(limiter.max_rate);
            limiter = limiter.with_bounds(min_rate, max_rate);
        }
        if let Some(rate) = self.init_rate {
            limiter = limiter.with_init_rate(rate);
        }
        if let Some(step) = self.ramp_step {
            limiter = limiter.with_ramp_step(step);
        }
        if self.circuit_threshold.is_some() || self.circuit_cooldown_ms.is_some() {
            let mut breaker: CircuitBreakerConfig = limiter.circuit_breaker.clone();
            if let Some(threshold) = self.circuit_threshold {
                breaker = breaker.with_threshold(threshold);
            }
            if let Some(ms) = self.circuit_cooldown_ms {
                breaker = breaker.with_cooldown(Duration::from_millis(ms));
            }
            limiter = limiter.with_circuit_breaker(breaker);
        }
        if self.min_pause_ms.is_some() || self.max_pause_ms.is_some() {
            let min = self.min_pause_ms.map_or(limiter.min_pause, Duration::from_millis);
            let max = self.max_pause_ms.map_or(limiter.max_pause, Duration::from_millis);
            limiter = limiter.with_pause_bounds(min, max);
        }
        config = config.with_limiter(limiter);

        if let Some(factor) = self.queue_reduction_factor {
            config = config.with_queue_reduction_factor(factor);
        }
        if let Some(n) = self.max_drain_iterations {
            config = config.with_max_drain_iterations(n);
        }
        if let Some(ms) = self.drain_pause_ms {
            config = config.with_drain_pause(Duration::from_millis(ms));
        }
        if let Some(size) = self.checkpoint_batch_size {
            config = config.with_checkpoint_batch_size(size);
        }
        if let Some(secs) = self.request_timeout_secs {
            config = config.with_request_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.progress_interval_secs {
            config = config.with_progress_interval(Duration::from_secs(secs));
        }
        if let Some(secs) = self.shutdown_timeout_secs {
            config = config.with_shutdown_timeout(Duration::from_secs(secs));
        }
        if self.no_shuffle {
            config = config.with_shuffle(false);
        }
        if self.requeue_transient_in_drain {
            config = config.with_requeue_transient_in_drain(true);
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let account = cli.account.to_uppercase();
    let telemetry_config = TelemetryConfig::from_env()
        .with_service_version(env!("CARGO_PKG_VERSION"))
        .with_account(&account);
    let _telemetry_guard = init_telemetry(telemetry_config);

    let base = load_engine_config(cli.config.as_deref()).context("Failed to load engine config")?;
    let config = cli.engine.apply(base);
    config.validate().context("Invalid engine configuration")?;

    let candidates = candidates::load_candidates(&cli.input, cli.id_prefix.as_deref())?;
    tracing::info!(
        candidates = candidates.len(),
        input = %cli.input.display(),
        "Loaded candidates"
    );

    let credentials = CredentialManager::new(
        AccountCredentials::from_env(&account),
        CredentialConfig::new(&cli.token_url, &cli.validation_url)
            .with_timeout(config.request_timeout),
    )
    .context("Failed to create credential manager")?;
    let remote = RemoteApi::new(&cli.api_url, config.request_timeout)?;
    let payload: Arc<dyn PayloadBuilder> = match cli.payload {
        PayloadMode::Merge => Arc::new(MergeFields),
        PayloadMode::Replace => Arc::new(ReplaceWith),
    };

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received shutdown signal, finishing in-flight work");
                shutdown.cancel();
            }
        }
    });

    let dispatcher = Dispatcher::new(
        config,
        remote,
        Arc::new(credentials),
        CheckpointLedger::new(&cli.ledger),
    )?
    .with_payload_builder(payload)
    .with_cancellation(shutdown);

    let report = match dispatcher.run(candidates).await {
        Ok(report) => report,
        Err(EngineError::Checkpoint { source, report }) => {
            // Keep what was decided before the ledger broke
            report::write_failures(&cli.failures, &report.failures)?;
            output::print_summary(&report, output::OutputFormat::from_str(&cli.output))?;
            return Err(anyhow::Error::new(source).context("Checkpoint ledger write failed"));
        }
        Err(e) => return Err(anyhow::Error::new(e).context("Bulk mutation run failed")),
    };

    report::write_failures(&cli.failures, &report.failures)?;
    output::print_summary(&report, output::OutputFormat::from_str(&cli.output))?;

    if report.cancelled {
        tracing::info!(
            unscheduled = report.unscheduled.len(),
            "Run cancelled; rerun to process the remaining items"
        );
        return Ok(ExitCode::from(130));
    }
    if !report.failures.is_empty() {
        tracing::warn!(
            failed = report.failures.len(),
            report = %cli.failures.display(),
            "Some mutations failed permanently"
        );
        return Ok(ExitCode::from(2));
    }
    Ok(ExitCode::SUCCESS)
}
