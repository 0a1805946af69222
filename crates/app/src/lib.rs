use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use tumorscan_core::config::{
    config_path, data_dir, initialize_data_dir, resolve_predictor_url, AppConfig,
    ENV_PREDICTOR_URL,
};
use tumorscan_core::logging::{self, FileSink, LoggingOptions, DEFAULT_LOG_FILTER};
use tumorscan_core::predictor::PredictorClient;
use tumorscan_core::server::{app_router, AppState};
use tumorscan_core::types::{ConnectivityState, DetectionStatus};
use tumorscan_core::workflow::{StartOutcome, WorkflowSnapshot};

#[derive(Parser)]
#[command(
    name = "tumorscan",
    about = "Screen MRI scans for tumors with a remote predictor",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[arg(
        long = "predictor-url",
        value_name = "URL",
        global = true,
        help = "Predictor base URL (overrides TUMORSCAN_PREDICTOR_URL and config)"
    )]
    predictor_url: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload one image and print the prediction.
    Scan(ScanArgs),
    /// Probe the predictor once and print its connectivity.
    Status,
}

#[derive(Args)]
struct ScanArgs {
    #[arg(help = "Path to the MRI image")]
    image: PathBuf,
    #[arg(
        long = "wait-connected-secs",
        value_name = "SECS",
        default_value_t = 0,
        help = "Keep probing up to this long before giving up on the predictor"
    )]
    wait_connected_secs: u64,
    #[arg(long, help = "Print the final snapshot as JSON")]
    json: bool,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(&cli, &resolved_data_dir);

    let mut config = load_config(&resolved_data_dir);
    config.predictor.base_url = resolve_predictor_url(
        cli.predictor_url.as_deref(),
        std::env::var(ENV_PREDICTOR_URL).ok().as_deref(),
        &config.predictor,
    );

    match cli.command {
        Some(Commands::Scan(scan)) => run_scan(&config, scan).await,
        Some(Commands::Status) => run_status(&config).await,
        None => run_server(cli.port, cli.host, config).await,
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let options = LoggingOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let filters = logging::compose_filters(&options);

    match logging::open_file_sink(&options) {
        FileSink::Ready { appender, .. } => {
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(parse_env_filter_with_fallback(&filters.console, "console")),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(logging::MaskingMakeWriter::new(appender))
                        .with_filter(parse_env_filter_with_fallback(&filters.file, "file")),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}");
            }
        }
        FileSink::Unavailable { log_dir, reason } => {
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(parse_env_filter_with_fallback(&filters.console, "console")),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}");
                return;
            }

            warn!(
                log_dir = ?log_dir,
                reason = %reason,
                "File logging unavailable; logging to console only"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn mode_name(command: Option<&Commands>) -> &'static str {
    match command {
        None => "server",
        Some(Commands::Scan(_)) => "scan",
        Some(Commands::Status) => "status",
    }
}

fn log_startup_metadata(cli: &Cli, data_dir: &Path) {
    info!(
        mode = mode_name(cli.command.as_ref()),
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(error) = initialize_data_dir(data_dir) {
        warn!(error = %error, "Failed to initialize data directory");
    }
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(error) => {
            warn!(error = %format!("{error:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

fn build_state(config: &AppConfig) -> Result<AppState<PredictorClient>> {
    let client = PredictorClient::new(
        &config.predictor.base_url,
        config.predictor.predict_timeout(),
    )
    .with_context(|| format!("predictor URL {:?} is not usable", config.predictor.base_url))?;
    info!(predictor = %client.base_url(), "Using predictor service");
    Ok(AppState::new(Arc::new(client), config))
}

async fn run_server(
    port_override: Option<u16>,
    host_override: Option<String>,
    config: AppConfig,
) -> Result<()> {
    let port = port_override.unwrap_or(config.server.port);
    let host = host_override.unwrap_or_else(|| config.server.host.clone());

    let state = build_state(&config)?;
    state.monitor().start();
    let app = app_router(state.clone());

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "Serving tumorscan bridge");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("bridge server failed")?;

    state.monitor().stop().await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(error = %error, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

async fn run_status(config: &AppConfig) -> Result<()> {
    let state = build_state(config)?;
    let connectivity = state.monitor().probe().await;
    println!("predictor {}: {connectivity}", config.predictor.base_url);

    if connectivity != ConnectivityState::Connected {
        bail!("predictor is not reachable");
    }
    Ok(())
}

async fn run_scan(config: &AppConfig, args: ScanArgs) -> Result<()> {
    let state = build_state(config)?;

    let summary = state
        .acquisition()
        .submit_path(&args.image)
        .await
        .with_context(|| format!("cannot scan {}", args.image.display()))?;
    info!(
        file = %summary.file_name,
        mime_type = %summary.mime_type,
        bytes = summary.byte_len,
        "Image accepted"
    );

    let connectivity = wait_for_connection(&state, args.wait_connected_secs).await;
    info!(%connectivity, "Predictor connectivity before analysis");

    let snapshot = match state.workflow().start_analysis() {
        StartOutcome::Started(_) => state.workflow().wait_until_settled().await,
        StartOutcome::Blocked => state.workflow().snapshot(),
        StartOutcome::Rejected(reason) => bail!("analysis did not start: {reason}"),
    };
    state.monitor().stop().await;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&snapshot).context("failed to encode snapshot")?
        );
    } else {
        print!("{}", render_report(&snapshot));
    }

    if snapshot.status == DetectionStatus::AnalysisFailed {
        bail!(
            "analysis failed: {}",
            snapshot.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

/// One probe, then background probing until connected or `wait_secs` pass.
async fn wait_for_connection(
    state: &AppState<PredictorClient>,
    wait_secs: u64,
) -> ConnectivityState {
    let monitor = state.monitor();
    if monitor.probe().await == ConnectivityState::Connected || wait_secs == 0 {
        return monitor.current();
    }

    info!(wait_secs, "Predictor not reachable yet, waiting");
    let mut rx = monitor.subscribe();
    monitor.start();
    // the watch guard from `wait_for` must not outlive this block
    let connected = tokio::time::timeout(Duration::from_secs(wait_secs), async {
        rx.wait_for(|current| *current == ConnectivityState::Connected)
            .await
            .is_ok()
    })
    .await
    .unwrap_or(false);
    if !connected {
        warn!(wait_secs, "Gave up waiting for the predictor");
    }
    monitor.current()
}

fn render_report(snapshot: &WorkflowSnapshot) -> String {
    let mut lines = vec![format!("Status:     {}", snapshot.status.title())];

    if let Some(image) = &snapshot.image {
        lines.push(format!(
            "Image:      {} ({}, {} bytes)",
            image.file_name, image.mime_type, image.byte_len
        ));
    }
    if let Some(result) = &snapshot.result {
        lines.push(format!("Prediction: {}", result.label.as_str()));
        lines.push(format!("Confidence: {}", result.confidence_percent()));
        if let Some(threshold) = result.threshold {
            lines.push(format!("Threshold:  {threshold}"));
        }
    }
    if let Some(error) = &snapshot.error {
        lines.push(format!("Error:      {error}"));
    }

    let mut report = lines.join("\n");
    report.push('\n');
    report
}
