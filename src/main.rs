//! Entry point for the collaborative text editing server.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use tokio::time::Instant;

use collab_text_server::api::{create_api_router, ApiState};
use collab_text_server::config::Configuration;
use collab_text_server::engine::EngineConfig;
use collab_text_server::hub::Hub;
use collab_text_server::store::DocumentStore;
use collab_text_server::transport::ws_handler;

#[derive(Parser, Clone)]
#[command(name = "collab-text-server")]
#[command(about = "Real-time collaborative plain-text editing server")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for document snapshots (overrides config/STORE_DIR)
    #[arg(short, long)]
    store_dir: Option<PathBuf>,

    /// Port to listen on (overrides config/PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Clone)]
enum Commands {
    /// Generate shell completions
    Completions {
        /// Shell type (bash, zsh, fish, powershell)
        shell: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.debug)?;

    if let Some(Commands::Completions { shell }) = args.command.clone() {
        return generate_completions(&shell);
    }

    let mut config = load_configuration(&args)?;
    if let Some(store_dir) = &args.store_dir {
        config.store_dir = store_dir.to_string_lossy().into_owned();
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    log::info!("starting collab-text-server v{}", env!("CARGO_PKG_VERSION"));
    log::info!("document store: {}", config.store_dir);
    log::info!("listening on {}", config.bind_addr());

    let store = DocumentStore::new(config.store_path());
    let engine_config = EngineConfig { debounce_delay: config.debounce_delay(), tail_size: config.tail_size };
    let hub = Hub::new(store.clone(), engine_config, config.idle_eviction());
    hub.spawn_idle_sweep();

    let api_state = ApiState { store, hub: hub.clone(), started_at: Instant::now() };
    let cors = build_cors_layer(&config.allowed_origin);

    let app = create_api_router(api_state)
        .route("/ws/:document_id", axum::routing::get(ws_handler))
        .with_state(hub.clone())
        .layer(cors);

    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    let server = axum::serve(listener, app.into_make_service());

    tokio::select! {
        result = server => {
            if let Err(err) = result {
                log::error!("server error: {err}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("shutdown signal received, draining engines (deadline {:?})", config.shutdown_drain());
        }
    }

    let drained = hub.shutdown_drain(config.shutdown_drain()).await;
    if drained {
        log::info!("shutdown complete");
        Ok(())
    } else {
        log::error!("shutdown drain exceeded deadline, exiting non-zero");
        std::process::exit(1);
    }
}

fn setup_logging(debug: bool) -> Result<()> {
    use env_logger::{Builder, Env};

    let env = Env::default().filter_or("COLLAB_LOG", if debug { "debug" } else { "info" });
    Builder::from_env(env).format_timestamp_millis().init();
    Ok(())
}

fn load_configuration(args: &Args) -> Result<Configuration> {
    let path = args.config.as_ref().map(|p| p.to_string_lossy().into_owned());
    Configuration::load(path.as_deref()).map_err(|e| anyhow::anyhow!(e))
}

fn build_cors_layer(allowed_origin: &str) -> tower_http::cors::CorsLayer {
    use tower_http::cors::{AllowOrigin, CorsLayer};

    let layer = CorsLayer::new().allow_methods(tower_http::cors::Any).allow_headers(tower_http::cors::Any);
    if allowed_origin == "*" {
        layer.allow_origin(AllowOrigin::any())
    } else {
        match allowed_origin.parse() {
            Ok(origin) => layer.allow_origin(AllowOrigin::exact(origin)),
            Err(_) => {
                log::warn!("ALLOWED_ORIGIN '{allowed_origin}' is not a valid header value, falling back to '*'");
                layer.allow_origin(AllowOrigin::any())
            }
        }
    }
}

fn generate_completions(shell: &str) -> Result<()> {
    use clap_complete::{generate, shells::*};

    let mut cmd = Args::command();
    match shell.to_lowercase().as_str() {
        "bash" => generate(Bash, &mut cmd, "collab-text-server", &mut std::io::stdout()),
        "zsh" => generate(Zsh, &mut cmd, "collab-text-server", &mut std::io::stdout()),
        "fish" => generate(Fish, &mut cmd, "collab-text-server", &mut std::io::stdout()),
        "powershell" => generate(PowerShell, &mut cmd, "collab-text-server", &mut std::io::stdout()),
        _ => anyhow::bail!("Unsupported shell: {}. Use bash, zsh, fish, or powershell", shell),
    };
    Ok(())
}
