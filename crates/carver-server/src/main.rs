mod error;
mod handlers;
mod state;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use carver_core::config::{load_config, resolve_config_path, CarverConfig};

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "carver-server", version, about = "endpoint file carving server")]
struct Cli {
    /// Address to listen on
    #[arg(short, long, default_value = "localhost:8686")]
    listen: String,

    /// Path to the YAML config file (falls back to CARVER_CONFIG, then the system file)
    #[arg(short, long)]
    config: Option<String>,

    /// Log output format: "json" or "pretty"
    #[arg(long, default_value = "pretty")]
    log_format: String,

    /// Maximum number of blocking threads for store and file I/O (minimum 1)
    #[arg(long, default_value_t = 6, value_parser = parse_min_one)]
    max_blocking_threads: usize,

    /// Number of tokio worker threads (minimum 1)
    #[arg(long, default_value_t = 4, value_parser = parse_min_one)]
    worker_threads: usize,
}

fn parse_min_one(s: &str) -> Result<usize, String> {
    let n: usize = s.parse().map_err(|e| format!("{e}"))?;
    if n == 0 {
        return Err("value must be at least 1".into());
    }
    Ok(n)
}

fn main() {
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cli.worker_threads)
        .max_blocking_threads(cli.max_blocking_threads)
        .enable_all()
        .build()
        .unwrap_or_else(|e| {
            eprintln!("Error: failed to build tokio runtime: {e}");
            std::process::exit(1);
        });

    runtime.block_on(async_main(cli));
}

async fn async_main(cli: Cli) {
    init_tracing(&cli.log_format);

    let config = match resolve_config_path(cli.config.as_deref()) {
        Some(source) => {
            info!("loading config from {source}");
            load_config(source.path()).unwrap_or_else(|e| {
                eprintln!("Error: {e}");
                std::process::exit(1);
            })
        }
        None => {
            warn!("no config file found, using defaults");
            CarverConfig::default()
        }
    };

    std::fs::create_dir_all(&config.carves_dir).unwrap_or_else(|e| {
        eprintln!(
            "Error: cannot create carves directory '{}': {e}",
            config.carves_dir.display()
        );
        std::process::exit(1);
    });

    let state = AppState::from_config(&config).unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });
    info!(
        carver = %config.carver,
        carves_dir = %config.carves_dir.display(),
        "carve service ready"
    );

    let app = handlers::router(state);

    let listen_addr = cli.listen;
    info!("carver-server listening on {listen_addr}");
    let listener = TcpListener::bind(&listen_addr).await.unwrap_or_else(|e| {
        eprintln!("Error: cannot bind to {listen_addr}: {e}");
        std::process::exit(1);
    });
    if let Err(e) = axum::serve(listener, app).await {
        eprintln!("Error: server stopped: {e}");
        std::process::exit(1);
    }
}

fn init_tracing(log_format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_format {
        "json" => {
            tracing_subscriber::fmt().json().with_env_filter(filter).init();
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}
