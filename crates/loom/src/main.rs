//! Loom - Entry point

use std::path::PathBuf;

use tracing::{error, info};

use loom::{LoomConfig, LoomServer};
use loom_telemetry::{init_telemetry, TelemetryConfig};

/// Command-line arguments.
struct Args {
    /// Path to configuration file.
    config: Option<PathBuf>,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" | "-c" => {
                    config = args.next().map(PathBuf::from);
                }
                "--help" | "-h" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-V" => {
                    println!("loom {}", loom::VERSION);
                    std::process::exit(0);
                }
                other => {
                    eprintln!("Unknown argument: {other}");
                    eprintln!("Use --help for usage information");
                    std::process::exit(1);
                }
            }
        }

        Self { config }
    }
}

fn print_help() {
    println!(
        r"Loom - transparent LLM reverse proxy

USAGE:
    loom [OPTIONS]

OPTIONS:
    -c, --config <PATH>    Path to configuration file (TOML)
    -h, --help             Print help information
    -V, --version          Print version information

ENVIRONMENT VARIABLES:
    LOOM_LISTEN_ADDR          Listen address (default: 0.0.0.0)
    LOOM_LISTEN_PORT          Listen port (default: 8080)
    LOOM_UPSTREAM_URL         Upstream API base URL
    LOOM_UPSTREAM_TIMEOUT     Upstream timeout, e.g. 600s
    LOOM_DEFAULT_PATTERN      Pattern used when the client names none
    LOOM_SOUL_PATH            Identity prompt file
    LOOM_MACHINE_NAME         Machine name woven into the identity prompt
    LOOM_CANARY_MARKER        Metadata marker string
    LOOM_TURN_IDLE_TIMEOUT    Idle time before an open turn is closed
    LOOM_TURN_GRACE_PERIOD    How long closed turns are remembered
    LOOM_OTLP_ENDPOINT        OpenTelemetry collector endpoint
    LOOM_LOG_LEVEL            Log filter (default: loom=info,warn)
    LOOM_REDIS_URL            Redis for turn events and identity context
    LOOM_MEMORY_URL           Memory lookup service

EXAMPLES:
    loom --config /etc/loom/loom.toml
    LOOM_UPSTREAM_URL=http://localhost:9000 loom
"
    );
}

fn load_config(path: Option<PathBuf>) -> Result<LoomConfig, String> {
    let config = match &path {
        Some(path) => LoomConfig::from_file(path).map_err(|e| format!("Failed to load configuration: {e}"))?,
        None => LoomConfig::default(),
    };
    let config = config.with_env_overrides();
    config
        .validate()
        .map_err(|e| format!("Invalid configuration: {e}"))?;
    Ok(config)
}

fn telemetry_config(config: &LoomConfig) -> TelemetryConfig {
    let settings = &config.telemetry;
    let mut builder = TelemetryConfig::builder()
        .service_name(&settings.service_name)
        .service_version(loom::VERSION)
        .log_level(&settings.log_level)
        .json_logs(settings.json_logs)
        .sample_ratio(settings.sample_ratio)
        .metrics_enabled(settings.metrics_enabled);
    if let Some(endpoint) = &settings.otlp_endpoint {
        builder = builder.otlp_endpoint(endpoint);
    }
    builder.build()
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let from_file = args.config.is_some();

    let config = match load_config(args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let _telemetry = match init_telemetry(telemetry_config(&config)) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize telemetry: {e}");
            std::process::exit(1);
        }
    };

    info!(version = loom::VERSION, from_file, "Starting Loom");
    info!(
        addr = %config.server.listen_addr,
        port = config.server.listen_port,
        upstream = %config.upstream.url,
        "Configuration loaded"
    );

    let server = match LoomServer::new(config).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "Failed to create server");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run().await {
        error!(error = %e, "Server error");
        std::process::exit(1);
    }
}
