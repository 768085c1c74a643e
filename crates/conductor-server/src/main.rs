//! Conductor: durable AI-task orchestration and usage-metering server.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use conductor_billing::DisabledGateway;
use conductor_llm::{AnthropicClient, ModelClient};
use conductor_runtime::FsAttachmentStore;

mod routes;
mod state;
mod worker;

use state::AppState;

fn resolve_data_dir() -> PathBuf {
    std::env::var("CONDUCTOR_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let exe_dir = std::env::current_exe()
                .ok()
                .and_then(|p| p.parent().map(|p| p.to_path_buf()));
            if let Some(dir) = exe_dir {
                let parent_data = dir.join("../data");
                if parent_data.exists() {
                    return parent_data;
                }
            }
            PathBuf::from("data")
        })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() > 1 {
        match args[1].as_str() {
            "serve" => {}
            "--help" | "-h" | "help" => {
                println!("Conductor: durable AI-task orchestration server");
                println!();
                println!("Usage: conductor [command]");
                println!();
                println!("Commands:");
                println!("  (none) | serve           Start the server");
                println!("  help                     Show this help message");
                println!();
                println!("Environment:");
                println!("  PORT, CONDUCTOR_DATA_DIR, ANTHROPIC_API_KEY, CONDUCTOR_MODEL,");
                println!("  CONDUCTOR_MAX_TOKENS, CONDUCTOR_SINGLE_CONCURRENCY,");
                println!("  CONDUCTOR_SEQUENTIAL_CONCURRENCY, CONDUCTOR_MAX_ATTEMPTS");
                return Ok(());
            }
            _ => {
                eprintln!("Unknown command: {}. Use 'conductor help' for usage.", args[1]);
                std::process::exit(1);
            }
        }
    }

    let data_dir = resolve_data_dir();
    info!("Data directory: {}", data_dir.display());

    let config = conductor_core::ConductorConfig::from_env(&data_dir)?;
    let port = config.port;

    let store = conductor_store::SqliteStore::open(&config.data_paths.db)
        .map_err(|e| anyhow::anyhow!("Failed to open store: {}", e))?;

    // Without a key every model call fails and runs settle as failed.
    let api_key = config.model.api_key.clone().unwrap_or_default();
    let client: Arc<dyn ModelClient> = Arc::new(AnthropicClient::new(api_key)?);
    let attachments = Arc::new(FsAttachmentStore::new(&config.data_paths.attachments));
    warn!("No payment provider configured; auto-reload requests will be declined");

    let state = Arc::new(AppState::new(
        config,
        Arc::new(store),
        client,
        attachments,
        Arc::new(DisabledGateway),
    ));

    worker::start_event_worker(state.clone());

    let app = routes::build_router(state.clone());

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Conductor server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
