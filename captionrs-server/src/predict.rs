use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{multipart::MultipartError, Json, Multipart, State},
    http::{self, StatusCode},
    response::IntoResponse,
};
use captionrs_core::LoadState;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::schema::PredictResponse;

const IMAGE_FIELD: &str = "image";

pub enum PredictResponder {
    Json(PredictResponse),
    ServiceUnavailable(String),
    ValidationError(String),
    InvalidUpload(StatusCode, String),
    InternalError(String),
}

trait ErrorToResponse: Serialize {
    fn to_response(&self, code: StatusCode) -> axum::response::Response {
        let mut r = Json(self).into_response();
        *r.status_mut() = code;
        r
    }
}

#[derive(Serialize)]
struct JsonError {
    detail: String,
}

impl JsonError {
    fn new(detail: String) -> Self {
        Self { detail }
    }
}
impl ErrorToResponse for JsonError {}

impl IntoResponse for PredictResponder {
    fn into_response(self) -> axum::response::Response {
        match self {
            PredictResponder::Json(s) => Json(s).into_response(),
            PredictResponder::ServiceUnavailable(m) => {
                JsonError::new(m).to_response(http::StatusCode::SERVICE_UNAVAILABLE)
            }
            PredictResponder::ValidationError(m) => {
                JsonError::new(m).to_response(http::StatusCode::BAD_REQUEST)
            }
            PredictResponder::InvalidUpload(code, m) => JsonError::new(m).to_response(code),
            PredictResponder::InternalError(m) => {
                JsonError::new(m).to_response(http::StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

// Oversized bodies answer 413; malformed ones 400.
fn invalid_upload(e: MultipartError) -> PredictResponder {
    PredictResponder::InvalidUpload(e.status(), format!("Invalid multipart body: {e}"))
}

struct Upload {
    content_type: Option<String>,
    bytes: Bytes,
}

/// Take the `image` field, or the first file field if none is named `image`.
async fn read_upload(multipart: &mut Multipart) -> Result<Option<Upload>, PredictResponder> {
    let mut fallback = None;
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return Err(invalid_upload(e)),
        };
        let is_image_field = field.name() == Some(IMAGE_FIELD);
        if !is_image_field && (fallback.is_some() || field.file_name().is_none()) {
            continue;
        }
        let content_type = field.content_type().map(ToString::to_string);
        let bytes = field.bytes().await.map_err(invalid_upload)?;
        let upload = Upload {
            content_type,
            bytes,
        };
        if is_image_field {
            return Ok(Some(upload));
        }
        fallback = Some(upload);
    }
    Ok(fallback)
}

#[utoipa::path(
    post,
    tag = "captionrs",
    path = "/predict",
    request_body(content = crate::schema::PredictUpload, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Detected action and generated annotation", body = PredictResponse),
        (status = 400, description = "Upload is not an image"),
        (status = 413, description = "Upload exceeds the size limit"),
        (status = 500, description = "Preprocessing or decoding failed"),
        (status = 503, description = "Model not loaded"),
    )
)]
pub async fn predict(
    State(state): State<Arc<LoadState>>,
    mut multipart: Multipart,
) -> PredictResponder {
    let Some(ctx) = state.context().cloned() else {
        warn!("Rejecting prediction: model not loaded.");
        return PredictResponder::ServiceUnavailable("Model not loaded".to_string());
    };

    let upload = match read_upload(&mut multipart).await {
        Ok(Some(upload)) => upload,
        Ok(None) => {
            return PredictResponder::ValidationError(format!(
                "Missing `{IMAGE_FIELD}` file field"
            ))
        }
        Err(responder) => return responder,
    };
    let is_image = upload
        .content_type
        .as_deref()
        .is_some_and(|ct| ct.starts_with("image/"));
    if !is_image {
        warn!(
            "Rejecting upload with content type {:?}.",
            upload.content_type
        );
        return PredictResponder::ValidationError("File must be an image".to_string());
    }

    let bytes = upload.bytes;
    let result = tokio::task::spawn_blocking(move || ctx.annotate(&bytes)).await;
    match result {
        Ok(Ok(annotation)) => {
            info!(
                "Predicted `{}` for caption `{}`.",
                annotation.action, annotation.annotation
            );
            PredictResponder::Json(PredictResponse {
                status: "success".to_string(),
                action: annotation.action.to_string(),
                annotation: annotation.annotation,
            })
        }
        Ok(Err(e)) => {
            error!("Error processing image: {e}");
            PredictResponder::InternalError(format!("Error processing image: {e}"))
        }
        Err(e) => {
            error!("Prediction task failed: {e}");
            PredictResponder::InternalError(format!("Error processing image: {e}"))
        }
    }
}
