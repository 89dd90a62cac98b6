use anyhow::{Context, Result};
use clap::Parser;
use lumen_core::{DeviceMap, Generator, SdLoader};
use lumen_server::routes::{self, AppState};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::{fmt, EnvFilter};

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Stable Diffusion image generation server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Model to load from the hub
    #[arg(long, default_value = lumen_core::stable_diffusion::MODEL_ID)]
    model: String,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let args = Args::parse();

    // Without the hub credential no request can be served; refuse to start.
    let token = std::env::var("HUGGINGFACE_TOKEN")
        .context("HUGGINGFACE_TOKEN environment variable is not set")?;

    let device_map = if args.cpu {
        DeviceMap::ForceCpu
    } else {
        DeviceMap::default()
    };
    let loader = SdLoader::new(args.model, token, device_map);

    // The pipeline itself loads lazily on the first request.
    let state = AppState {
        generator: Arc::new(Generator::new(loader)),
    };
    let app = routes::router(state);

    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    tracing::info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
