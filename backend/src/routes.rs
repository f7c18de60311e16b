use actix_multipart::{Field, Multipart};
use actix_web::error::{InternalError, JsonPayloadError};
use actix_web::http::StatusCode;
use actix_web::{HttpRequest, HttpResponse, web};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::{StreamExt, TryStreamExt};
use log::{info, warn};
use shared::{HealthResponse, InferenceRequest, PredictionResponse};
use uuid::Uuid;

use crate::inference::{InferenceService, PredictionResult};

/// Largest accepted image upload, in bytes.
#[derive(Debug, Clone, Copy)]
pub struct UploadLimit(pub usize);

/// Registers the prediction routes and the request-body limits they enforce.
pub fn configure_routes(cfg: &mut web::ServiceConfig, limit: UploadLimit) {
    cfg.app_data(web::Data::new(limit))
        .app_data(json_config(limit))
        .service(web::resource("/predict").route(web::post().to(predict)))
        .service(web::resource("/predict/base64").route(web::post().to(predict_base64)))
        .service(web::resource("/health").route(web::get().to(health)))
        .service(web::resource("/model").route(web::get().to(model_info)));
}

/// base64 inflates the body by a third over the decoded image.
fn json_config(limit: UploadLimit) -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(limit.0 / 3 * 4 + 1024)
        .error_handler(json_error)
}

fn json_error(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = match &err {
        JsonPayloadError::Overflow { .. } | JsonPayloadError::OverflowKnownLength { .. } => {
            failure(StatusCode::PAYLOAD_TOO_LARGE, format!("Request body too large: {}", err))
        }
        JsonPayloadError::ContentType => failure(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Expected an application/json body",
        ),
        _ => failure(StatusCode::BAD_REQUEST, format!("Invalid JSON body: {}", err)),
    };
    InternalError::from_response(err, response).into()
}

fn failure(status: StatusCode, message: impl Into<String>) -> HttpResponse {
    HttpResponse::build(status).json(PredictionResponse {
        predicted_class: None,
        confidence: None,
        success: false,
        error: Some(message.into()),
        model_provenance: None,
    })
}

fn respond(request_id: Uuid, result: PredictionResult) -> HttpResponse {
    let status = result.status_code();
    if result.success() {
        info!("[{}] prediction served", request_id);
    } else {
        warn!("[{}] prediction failed with status {}", request_id, status);
    }
    HttpResponse::build(status).json(result.to_response())
}

enum UploadError {
    Malformed(String),
    TooLarge(usize),
}

/// Reads one field to memory, refusing to buffer more than `limit` bytes.
async fn read_field(field: &mut Field, limit: usize) -> Result<Vec<u8>, UploadError> {
    let mut data = Vec::new();
    while let Some(chunk) = field.next().await {
        let chunk = chunk.map_err(|e| UploadError::Malformed(e.to_string()))?;
        if data.len() + chunk.len() > limit {
            return Err(UploadError::TooLarge(limit));
        }
        data.extend_from_slice(&chunk);
    }
    Ok(data)
}

/// The contents of the `file` field, or of the first field that carries a filename.
async fn first_file(payload: &mut Multipart, limit: usize) -> Result<Option<Vec<u8>>, UploadError> {
    while let Some(mut field) = payload
        .try_next()
        .await
        .map_err(|e| UploadError::Malformed(e.to_string()))?
    {
        let is_file = field.name() == Some("file")
            || field
                .content_disposition()
                .and_then(|cd| cd.get_filename())
                .is_some();
        if is_file {
            return read_field(&mut field, limit).await.map(Some);
        }
    }
    Ok(None)
}

async fn predict(
    service: web::Data<InferenceService>,
    limit: web::Data<UploadLimit>,
    mut payload: Multipart,
) -> HttpResponse {
    let request_id = Uuid::new_v4();
    let image = match first_file(&mut payload, limit.0).await {
        Ok(Some(image)) if !image.is_empty() => image,
        Ok(_) => return failure(StatusCode::BAD_REQUEST, "No file uploaded"),
        Err(UploadError::TooLarge(limit)) => {
            return failure(
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("Upload exceeds {} bytes", limit),
            );
        }
        Err(UploadError::Malformed(e)) => {
            return failure(StatusCode::BAD_REQUEST, format!("Invalid multipart body: {}", e));
        }
    };

    info!("[{}] received {} bytes", request_id, image.len());
    respond(request_id, service.predict(image).await)
}

/// Accepts raw base64 or a `data:<mime>;base64,` URL.
fn decode_image_data(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let encoded = match data.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => data,
    };
    STANDARD.decode(encoded.trim())
}

async fn predict_base64(
    service: web::Data<InferenceService>,
    limit: web::Data<UploadLimit>,
    request: web::Json<InferenceRequest>,
) -> HttpResponse {
    let request_id = Uuid::new_v4();
    let image = match decode_image_data(&request.image_data) {
        Ok(image) if image.is_empty() => {
            return failure(StatusCode::BAD_REQUEST, "No file uploaded");
        }
        Ok(image) => image,
        Err(e) => {
            return failure(StatusCode::BAD_REQUEST, format!("Invalid base64 image data: {}", e));
        }
    };
    if image.len() > limit.0 {
        return failure(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("Upload exceeds {} bytes", limit.0),
        );
    }

    info!("[{}] received {} bytes (base64)", request_id, image.len());
    respond(request_id, service.predict(image).await)
}

async fn health(service: web::Data<InferenceService>) -> HttpResponse {
    let handle = service.model();
    let model = handle.loaded();
    let status = match (&model, handle.is_initialized()) {
        (Some(_), _) => "ok",
        (None, false) => "loading",
        (None, true) => "unavailable",
    };
    HttpResponse::Ok().json(HealthResponse {
        status: status.to_string(),
        model_loaded: model.is_some(),
        model_provenance: model.map(|m| m.provenance()),
    })
}

async fn model_info(service: web::Data<InferenceService>) -> HttpResponse {
    match service.model().get().await {
        Some(model) => HttpResponse::Ok().json(model.summary()),
        None => failure(StatusCode::SERVICE_UNAVAILABLE, "Model not loaded"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_urls_and_raw_base64_decode_alike() {
        let raw = STANDARD.encode(b"\x89PNG");
        assert_eq!(decode_image_data(&raw).unwrap(), b"\x89PNG");
        let url = format!("data:image/png;base64,{}", raw);
        assert_eq!(decode_image_data(&url).unwrap(), b"\x89PNG");
        assert!(decode_image_data("not base64!").is_err());
    }
}
