use actix_web::http::StatusCode;
use actix_web::http::header::CONTENT_TYPE;
use actix_web::{App, test, web};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hairscan::config::ModelConfig;
use hairscan::inference::{InferenceService, ModelHandle, ModelLoader};
use hairscan::routes::{UploadLimit, configure_routes};
use image::{DynamicImage, Rgb, RgbImage};
use serde_json::{Value, json};
use shared::{DiseaseLabel, HealthResponse, ModelInfo, ModelProvenance, PredictionResponse};
use std::io::Cursor;
use std::time::Duration;

const BOUNDARY: &str = "hairscan-test-boundary";

fn jpeg(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| Rgb([(x * 3) as u8, (y * 5) as u8, 120]));
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Jpeg)
        .unwrap();
    bytes
}

fn multipart(name: &str, filename: Option<&str>, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
    match filename {
        Some(filename) => body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                name, filename
            )
            .as_bytes(),
        ),
        None => body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes(),
        ),
    }
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
    body
}

fn upload(body: Vec<u8>) -> test::TestRequest {
    test::TestRequest::post()
        .uri("/predict")
        .insert_header((
            CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        ))
        .set_payload(body)
}

/// A handle whose resolver finds nothing, so the untrained network is served.
fn fallback_handle(dir: &tempfile::TempDir) -> ModelHandle {
    let config = ModelConfig {
        compatible_path: dir.path().join("hair-diseases-compatible.pt"),
        legacy_paths: vec![dir.path().join("hair-diseases.safetensors")],
        ..ModelConfig::default()
    };
    ModelHandle::new(ModelLoader::from_config(&config), None)
}

fn service(handle: ModelHandle) -> InferenceService {
    InferenceService::new(handle, Duration::from_secs(120))
}

macro_rules! app {
    ($service:expr, $limit:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new($service))
                .configure(|cfg| configure_routes(cfg, UploadLimit($limit))),
        )
        .await
    };
}

#[actix_web::test]
async fn missing_artifact_still_yields_a_labelled_prediction() {
    let dir = tempfile::tempdir().unwrap();
    let app = app!(service(fallback_handle(&dir)), 1 << 20);

    let resp = test::call_service(&app, upload(multipart("file", Some("scalp.jpg"), &jpeg(320, 240))).to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: PredictionResponse = test::read_body_json(resp).await;

    assert!(body.success);
    assert!(DiseaseLabel::names().contains(&body.predicted_class.unwrap()));
    let confidence = body.confidence.unwrap();
    assert!((0.0..=1.0).contains(&confidence));
    assert_eq!(body.model_provenance, Some(ModelProvenance::Untrained));
    assert!(body.error.is_none());
}

#[actix_web::test]
async fn any_named_file_field_is_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let app = app!(service(fallback_handle(&dir)), 1 << 20);

    let resp = test::call_service(&app, upload(multipart("image", Some("a.jpg"), &jpeg(64, 64))).to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[actix_web::test]
async fn malformed_image_is_a_structured_failure() {
    let dir = tempfile::tempdir().unwrap();
    let app = app!(service(fallback_handle(&dir)), 1 << 20);

    let resp = test::call_service(
        &app,
        upload(multipart("file", Some("notes.txt"), b"definitely not an image")).to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: PredictionResponse = test::read_body_json(resp).await;
    assert!(!body.success);
    assert!(body.error.unwrap().starts_with("Failed to preprocess image"));
    assert!(body.predicted_class.is_none());
}

#[actix_web::test]
async fn request_without_a_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let app = app!(service(fallback_handle(&dir)), 1 << 20);

    let resp = test::call_service(&app, upload(multipart("note", None, b"hello")).to_request()).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: PredictionResponse = test::read_body_json(resp).await;
    assert!(!body.success);
    assert_eq!(body.error.as_deref(), Some("No file uploaded"));
}

#[actix_web::test]
async fn oversized_upload_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let app = app!(service(fallback_handle(&dir)), 64);

    let resp = test::call_service(&app, upload(multipart("file", Some("big.jpg"), &[0u8; 512])).to_request()).await;
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[actix_web::test]
async fn base64_endpoint_matches_multipart_result() {
    let dir = tempfile::tempdir().unwrap();
    let app = app!(service(fallback_handle(&dir)), 1 << 20);
    let image = jpeg(64, 48);

    let resp = test::call_service(&app, upload(multipart("file", Some("a.jpg"), &image)).to_request()).await;
    let multipart_body: PredictionResponse = test::read_body_json(resp).await;

    let req = test::TestRequest::post()
        .uri("/predict/base64")
        .set_json(json!({ "image_data": STANDARD.encode(&image) }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let base64_body: PredictionResponse = test::read_body_json(resp).await;

    assert_eq!(multipart_body, base64_body);
}

#[actix_web::test]
async fn invalid_base64_is_a_client_error() {
    let dir = tempfile::tempdir().unwrap();
    let app = app!(service(fallback_handle(&dir)), 1 << 20);

    let req = test::TestRequest::post()
        .uri("/predict/base64")
        .set_json(json!({ "image_data": "%%%" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["success"], json!(false));
}

#[actix_web::test]
async fn malformed_json_gets_a_structured_error() {
    let dir = tempfile::tempdir().unwrap();
    let app = app!(service(fallback_handle(&dir)), 1 << 20);

    let req = test::TestRequest::post()
        .uri("/predict/base64")
        .insert_header((CONTENT_TYPE, "application/json"))
        .set_payload("{not json")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: PredictionResponse = test::read_body_json(resp).await;
    assert!(!body.success);
    assert!(body.error.unwrap().starts_with("Invalid JSON body"));
}

#[actix_web::test]
async fn oversized_json_gets_a_structured_error() {
    let dir = tempfile::tempdir().unwrap();
    let app = app!(service(fallback_handle(&dir)), 64);

    let req = test::TestRequest::post()
        .uri("/predict/base64")
        .set_json(json!({ "image_data": "A".repeat(4096) }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let body: PredictionResponse = test::read_body_json(resp).await;
    assert!(!body.success);
    assert!(body.error.is_some());
}

#[actix_web::test]
async fn lazy_model_is_loaded_by_the_first_request() {
    let dir = tempfile::tempdir().unwrap();
    let app = app!(service(fallback_handle(&dir)), 1 << 20);

    let req = test::TestRequest::get().uri("/health").to_request();
    let health: HealthResponse = test::call_and_read_body_json(&app, req).await;
    assert_eq!(health.status, "loading");
    assert!(!health.model_loaded);

    let req = test::TestRequest::get().uri("/model").to_request();
    let info: ModelInfo = test::call_and_read_body_json(&app, req).await;
    assert_eq!(info.input_shape, [1, 128, 128, 3]);
    assert_eq!(info.num_classes, 10);
    assert_eq!(info.class_labels, DiseaseLabel::names());
    assert_eq!(info.provenance, ModelProvenance::Untrained);
    assert!(info.artifact_path.is_none());
    assert!(info.parameter_count > 0);

    let req = test::TestRequest::get().uri("/health").to_request();
    let health: HealthResponse = test::call_and_read_body_json(&app, req).await;
    assert_eq!(health.status, "ok");
    assert_eq!(health.model_provenance, Some(ModelProvenance::Untrained));
}

#[actix_web::test]
async fn unavailable_model_answers_every_prediction_with_an_error() {
    let app = app!(service(ModelHandle::unavailable()), 1 << 20);

    let resp = test::call_service(&app, upload(multipart("file", Some("a.jpg"), &jpeg(32, 32))).to_request()).await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: PredictionResponse = test::read_body_json(resp).await;
    assert!(!body.success);
    assert_eq!(body.error.as_deref(), Some("Model not loaded"));

    let req = test::TestRequest::get().uri("/model").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    let req = test::TestRequest::get().uri("/health").to_request();
    let health: HealthResponse = test::call_and_read_body_json(&app, req).await;
    assert_eq!(health.status, "unavailable");
}
