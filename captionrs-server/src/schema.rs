use serde::Serialize;
use utoipa::ToSchema;

#[derive(Debug, Serialize, ToSchema)]
pub struct StatusResponse {
    #[schema(example = "active")]
    pub status: &'static str,
    pub message: &'static str,
    #[schema(example = "0.1.0")]
    pub version: &'static str,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    #[schema(example = "healthy")]
    pub status: &'static str,
    pub model_loaded: bool,
    pub tokenizer_loaded: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PredictResponse {
    #[schema(example = "success")]
    pub status: String,
    #[schema(example = "Running")]
    pub action: String,
    #[schema(example = "A dog runs through the grass")]
    pub annotation: String,
}

/// Multipart form accepted by `/predict`.
#[allow(dead_code)]
#[derive(ToSchema)]
pub struct PredictUpload {
    /// JPG, PNG, GIF, WebP or BMP file.
    #[schema(value_type = String, format = Binary)]
    pub image: Vec<u8>,
}
