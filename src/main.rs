use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use weave::config::WeaveConfig;
use weave::AppContext;

#[derive(Parser)]
#[command(name = "weaved", about = "weave — agent orchestration core", version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Client-facing WebSocket port.
    #[arg(long, env = "WEAVE_WS_PORT")]
    port: Option<u16>,

    /// Data directory for the audit log, generated auth token, and config.toml.
    #[arg(long, env = "WEAVE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "WEAVE_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "WEAVE_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the orchestration core (default when no subcommand given).
    Serve,
    /// Print the resolved configuration and exit.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the configuration that would be used to serve, as JSON.
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = WeaveConfig::new(args.port, args.data_dir.clone(), args.log.clone());

    let _log_guard = setup_logging(&config.log, args.log_file.as_deref());

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => run_serve(config).await,
        Command::Config { action: ConfigAction::Show } => run_config_show(&config),
    }
}

async fn run_serve(config: WeaveConfig) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "starting weave orchestration core");
    let ctx = AppContext::bootstrap(config).await?;
    ctx.spawn_background_tasks();
    weave::ws_server::serve(ctx).await
}

fn run_config_show(config: &WeaveConfig) -> Result<()> {
    let view = serde_json::json!({
        "ws_port": config.ws_port,
        "data_dir": config.data_dir,
        "log": config.log,
        "registry_redis_url": config.registry_redis_url,
        "registry_heartbeat_interval_s": config.registry_heartbeat_interval.as_secs(),
        "registry_ttl_s": config.registry_ttl.as_secs(),
        "router_concurrency_cap_per_agent": config.router_concurrency_cap_per_agent,
        "router_queue_depth": config.router_queue_depth,
        "breaker_failure_threshold_default": config.breaker_failure_threshold_default,
        "breaker_failure_threshold_safety": config.breaker_failure_threshold_safety,
        "breaker_cooldown_default_s": config.breaker_cooldown_default.as_secs(),
        "breaker_cooldown_safety_s": config.breaker_cooldown_safety.as_secs(),
        "breaker_half_open_probes": config.breaker_half_open_probes,
        "safety_rewrite_cap_per_payload": config.safety_rewrite_cap_per_payload,
        "safety_score_threshold_warn": config.safety_score_threshold_warn,
        "hub_topic_buffer": config.hub_topic_buffer,
        "hub_slow_consumer_watermark": config.hub_slow_consumer_watermark,
        "hub_public_topic_prefix": config.hub_public_topic_prefix,
        "orchestrator_retry_max": config.orchestrator_retry_max,
        "orchestrator_dedup_ttl_s": config.orchestrator_dedup_ttl.as_secs(),
    });
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}

fn setup_logging(log_level: &str, log_file: Option<&std::path::Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let json = std::env::var("WEAVE_LOG_FORMAT").map(|v| v == "json").unwrap_or(false);

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("weaved.log"));

        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("warn: could not create log directory '{}': {e} — falling back to stdout", dir.display());
            tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        if json {
            tracing_subscriber::registry()
                .with(tracing_subscriber::EnvFilter::new(log_level))
                .with(tracing_subscriber::fmt::layer().json())
                .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
                .init();
        } else {
            tracing_subscriber::registry()
                .with(tracing_subscriber::EnvFilter::new(log_level))
                .with(tracing_subscriber::fmt::layer().compact())
                .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
                .init();
        }

        Some(guard)
    } else if json {
        tracing_subscriber::fmt().with_env_filter(log_level).json().init();
        None
    } else {
        tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
        None
    }
}
