use anyhow::Result;
use axum::{
    extract::{DefaultBodyLimit, Json, State},
    routing::{get, post},
    Router,
};
use candle_core::Device;
use captionrs_core::{initialize_logging, LoadOptions, LoadState};
use clap::Parser;
use std::{num::NonZeroUsize, path::PathBuf, sync::Arc};

mod predict;
mod schema;

use crate::{
    predict::{__path_predict, predict},
    schema::{HealthResponse, PredictResponse, PredictUpload, StatusResponse},
};

use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::{info, warn};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

const MB_TO_B: usize = 1024 * 1024; // 1024 kb in a mb

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// IP to serve on. Defaults to "0.0.0.0"
    #[arg(long)]
    serve_ip: Option<String>,

    /// Port to serve on.
    #[arg(short, long, default_value_t = 8000)]
    port: u16,

    /// Captioning model weights (safetensors).
    #[arg(short, long, default_value = "caption_model.safetensors")]
    model: PathBuf,

    /// JSON architecture config for the model. Built-in defaults are used if omitted.
    #[arg(long)]
    model_config: Option<PathBuf>,

    /// Vocabulary file: a JSON word index, or a tokenizer exported to JSON.
    #[arg(short, long, default_value = "vocab.json")]
    vocab: PathBuf,

    /// Maximum caption length in tokens. Derived from the vocabulary if omitted.
    #[arg(long)]
    max_length: Option<usize>,

    /// Largest accepted upload, in MB.
    #[arg(long, default_value_t = 50)]
    max_upload_mb: usize,

    /// Use CPU only
    #[arg(long)]
    cpu: bool,
}

#[utoipa::path(
    get,
    tag = "captionrs",
    path = "/",
    responses((status = 200, description = "Service is up", body = StatusResponse))
)]
async fn root() -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "active",
        message: "Action Recognition API is running",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[utoipa::path(
    get,
    tag = "captionrs",
    path = "/health",
    responses((status = 200, description = "Which startup resources loaded", body = HealthResponse))
)]
async fn health(State(state): State<Arc<LoadState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        model_loaded: state.model_loaded(),
        tokenizer_loaded: state.vocabulary_loaded(),
    })
}

fn get_router(state: Arc<LoadState>, max_upload_mb: usize) -> Router {
    #[derive(OpenApi)]
    #[openapi(
        paths(root, health, predict),
        components(
            schemas(StatusResponse, HealthResponse, PredictResponse, PredictUpload)),
        tags(
            (name = "captionrs", description = "Image captioning and action recognition API")
        ),
        info(
            title = "Action Recognition API",
            description = "AI-powered image action detection and caption generation",
            license(
            name = "MIT",
        )
        )
    )]
    struct ApiDoc;

    let doc = { ApiDoc::openapi() };

    let cors_layer = CorsLayer::new()
        .allow_methods(AllowMethods::any())
        .allow_headers(AllowHeaders::any())
        .allow_origin(AllowOrigin::any());

    Router::new()
        .merge(SwaggerUi::new("/docs").url("/api-doc/openapi.json", doc))
        .route("/", get(root))
        .route("/health", get(health))
        .route("/predict", post(predict))
        .layer(cors_layer)
        .layer(DefaultBodyLimit::max(max_upload_mb * MB_TO_B))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    initialize_logging();

    let ip = args.serve_ip.unwrap_or_else(|| "0.0.0.0".to_string());
    let port = args.port;

    // Create listener early to validate address before model loading
    let listener = tokio::net::TcpListener::bind(format!("{ip}:{port}")).await?;

    let max_length = match args.max_length {
        Some(0) => anyhow::bail!("`max_length` must be a strictly positive integer, got 0."),
        Some(x) => NonZeroUsize::new(x),
        None => None,
    };

    #[cfg(feature = "metal")]
    let device = Device::new_metal(0)?;
    #[cfg(not(feature = "metal"))]
    let device = if args.cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available(0)?
    };

    info!("Loading model & vocabulary...");
    let state = LoadState::load(&LoadOptions {
        model_path: args.model,
        model_config_path: args.model_config,
        vocab_path: args.vocab,
        max_length,
        device,
    });
    match &state {
        LoadState::Loaded(ctx) => info!(
            "Ready: {} vocabulary words, max length {}.",
            ctx.vocabulary().len(),
            ctx.max_length()
        ),
        LoadState::LoadFailed(failure) => warn!(
            "Model unavailable ({}); `/predict` will answer 503.",
            failure.reason
        ),
    }

    let app = get_router(Arc::new(state), args.max_upload_mb);
    info!("Serving on http://{ip}:{port}.");
    axum::serve(listener, app).await?;

    Ok(())
}
