use actix_web::http::StatusCode;
use actix_web::web;
use image::DynamicImage;
use shared::{ModelProvenance, PredictionResponse};
use std::time::Duration;

use super::handle::ModelHandle;
use super::loader::LoadedModel;
use super::postprocess::{PostprocessError, Prediction, top_class};
use super::preprocess::{self, PreprocessError};

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("Model not loaded")]
    ModelUnavailable,
    #[error("Failed to preprocess image: {0}")]
    PreprocessingFailed(#[from] PreprocessError),
    #[error("Prediction failed: {0}")]
    InferenceFailed(String),
    #[error("Prediction failed: {0}")]
    OutputMismatch(#[from] PostprocessError),
    #[error("Prediction timed out after {0:?}")]
    Timeout(Duration),
}

impl InferenceError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            InferenceError::ModelUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            InferenceError::PreprocessingFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            InferenceError::InferenceFailed(_) | InferenceError::OutputMismatch(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            InferenceError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

/// Outcome of one `predict` call. Failures are values, never panics.
#[derive(Debug)]
pub struct PredictionResult {
    pub outcome: Result<Prediction, InferenceError>,
    pub provenance: Option<ModelProvenance>,
}

impl PredictionResult {
    pub fn success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn status_code(&self) -> StatusCode {
        match &self.outcome {
            Ok(_) => StatusCode::OK,
            Err(e) => e.status_code(),
        }
    }

    pub fn to_response(&self) -> PredictionResponse {
        match &self.outcome {
            Ok(prediction) => PredictionResponse {
                predicted_class: Some(prediction.label.to_string()),
                confidence: Some(prediction.confidence),
                success: true,
                error: None,
                model_provenance: self.provenance,
            },
            Err(e) => PredictionResponse {
                predicted_class: None,
                confidence: None,
                success: false,
                error: Some(e.to_string()),
                model_provenance: self.provenance,
            },
        }
    }
}

/// Preprocess, forward, argmax. Blocking.
pub fn classify(model: &LoadedModel, image: &DynamicImage) -> Result<Prediction, InferenceError> {
    let input = preprocess::preprocess(image)?;
    let output = model
        .forward(&input)
        .map_err(|e| InferenceError::InferenceFailed(e.to_string()))?;
    Ok(top_class(&output)?)
}

pub fn classify_bytes(model: &LoadedModel, bytes: &[u8]) -> Result<Prediction, InferenceError> {
    let image = preprocess::decode(bytes)?;
    classify(model, &image)
}

#[derive(Clone)]
pub struct InferenceService {
    model: ModelHandle,
    timeout: Duration,
}

impl InferenceService {
    pub fn new(model: ModelHandle, timeout: Duration) -> Self {
        Self { model, timeout }
    }

    pub fn model(&self) -> &ModelHandle {
        &self.model
    }

    /// Classifies an encoded image. The forward pass runs on the blocking pool
    /// and is abandoned after the configured timeout.
    pub async fn predict(&self, image: Vec<u8>) -> PredictionResult {
        self.run(move |model| classify_bytes(model, &image)).await
    }

    pub async fn predict_image(&self, image: DynamicImage) -> PredictionResult {
        self.run(move |model| classify(model, &image)).await
    }

    async fn run<F>(&self, job: F) -> PredictionResult
    where
        F: FnOnce(&LoadedModel) -> Result<Prediction, InferenceError> + Send + 'static,
    {
        let Some(model) = self.model.get().await else {
            return PredictionResult {
                outcome: Err(InferenceError::ModelUnavailable),
                provenance: None,
            };
        };
        let provenance = model.provenance();

        let task = web::block(move || job(model.as_ref()));
        let outcome = match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(InferenceError::InferenceFailed(e.to_string())),
            Err(_) => Err(InferenceError::Timeout(self.timeout)),
        };

        match &outcome {
            Ok(prediction) => log::info!(
                "Predicted {} (confidence {:.4}, model {})",
                prediction.label,
                prediction.confidence,
                provenance
            ),
            Err(e) => log::warn!("Prediction failed: {}", e),
        }

        PredictionResult {
            outcome,
            provenance: Some(provenance),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::loader::testing::FixedNetwork;
    use crate::inference::network::{Network, NetworkError};
    use image::{Rgb, RgbImage};
    use ndarray::Array4;
    use shared::{DiseaseLabel, LoadStrategyKind};
    use std::io::Cursor;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| Rgb([x as u8, y as u8, 90]));
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn service_with(network: Box<dyn Network>, provenance: ModelProvenance) -> InferenceService {
        let model = LoadedModel::from_network(network, LoadStrategyKind::NativeLoad, provenance);
        InferenceService::new(ModelHandle::from_model(model), Duration::from_secs(30))
    }

    struct Broken;

    impl Network for Broken {
        fn forward(&self, _input: &Array4<f32>) -> Result<Vec<f32>, NetworkError> {
            Err(NetworkError::Forward("device lost".into()))
        }

        fn parameter_count(&self) -> u64 {
            0
        }
    }

    struct Slow;

    impl Network for Slow {
        fn forward(&self, _input: &Array4<f32>) -> Result<Vec<f32>, NetworkError> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(vec![0.1; 10])
        }

        fn parameter_count(&self) -> u64 {
            0
        }
    }

    #[actix_web::test]
    async fn maps_the_highest_score_to_its_label() {
        let mut output = vec![0.02; 10];
        output[7] = 0.82;
        let service = service_with(Box::new(FixedNetwork(output)), ModelProvenance::Trained);

        let result = service.predict(png(300, 200)).await;
        let response = result.to_response();
        assert!(response.success);
        assert_eq!(
            response.predicted_class.as_deref(),
            Some(DiseaseLabel::SeborrheicDermatitis.as_ref())
        );
        assert!((response.confidence.unwrap() - 0.82).abs() < 1e-6);
        assert_eq!(response.model_provenance, Some(ModelProvenance::Trained));
        assert_eq!(result.status_code(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn missing_model_is_a_structured_failure() {
        let service = InferenceService::new(ModelHandle::unavailable(), Duration::from_secs(1));
        let result = service.predict(png(10, 10)).await;
        let response = result.to_response();
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("Model not loaded"));
        assert_eq!(result.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[actix_web::test]
    async fn undecodable_upload_is_a_structured_failure() {
        let service = service_with(Box::new(FixedNetwork(vec![0.1; 10])), ModelProvenance::Trained);
        let result = service.predict(b"<html>not an image</html>".to_vec()).await;
        assert!(!result.success());
        assert!(matches!(
            result.outcome,
            Err(InferenceError::PreprocessingFailed(_))
        ));
        let response = result.to_response();
        assert!(response.error.unwrap().starts_with("Failed to preprocess image"));
    }

    #[actix_web::test]
    async fn forward_errors_do_not_escape() {
        let service = service_with(Box::new(Broken), ModelProvenance::Trained);
        let result = service.predict(png(16, 16)).await;
        assert_eq!(result.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(result.to_response().error.unwrap().contains("device lost"));
    }

    #[actix_web::test]
    async fn misconfigured_output_width_is_reported() {
        let service = service_with(Box::new(FixedNetwork(vec![0.5, 0.5])), ModelProvenance::Trained);
        let result = service.predict(png(16, 16)).await;
        assert!(matches!(result.outcome, Err(InferenceError::OutputMismatch(_))));
    }

    #[actix_web::test]
    async fn slow_forward_pass_times_out() {
        let model = LoadedModel::from_network(
            Box::new(Slow),
            LoadStrategyKind::NativeLoad,
            ModelProvenance::Trained,
        );
        let service =
            InferenceService::new(ModelHandle::from_model(model), Duration::from_millis(20));
        let result = service.predict(png(8, 8)).await;
        assert!(matches!(result.outcome, Err(InferenceError::Timeout(_))));
        assert_eq!(result.status_code(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[actix_web::test]
    async fn untrained_fallback_still_answers_and_says_so() {
        let model = LoadedModel::from_network(
            Box::new(crate::inference::fallback::FallbackCnn::new(3)),
            LoadStrategyKind::FreshFallbackNetwork,
            ModelProvenance::Untrained,
        );
        let service = InferenceService::new(ModelHandle::from_model(model), Duration::from_secs(60));

        let bytes = png(200, 150);
        let first = service.predict(bytes.clone()).await.to_response();
        let second = service.predict(bytes).await.to_response();

        assert!(first.success);
        let label = first.predicted_class.clone().unwrap();
        assert!(DiseaseLabel::names().contains(&label));
        let confidence = first.confidence.unwrap();
        assert!((0.0..=1.0).contains(&confidence));
        assert_eq!(first.model_provenance, Some(ModelProvenance::Untrained));
        assert_eq!(first, second);
    }

    #[actix_web::test]
    async fn predict_image_skips_decoding() {
        let mut output = vec![0.0; 10];
        output[0] = 1.0;
        let service = service_with(Box::new(FixedNetwork(output)), ModelProvenance::Degraded);
        let image = DynamicImage::ImageRgb8(RgbImage::new(5, 5));
        let response = service.predict_image(image).await.to_response();
        assert_eq!(response.predicted_class.as_deref(), Some("Alopecia Areata"));
        assert_eq!(response.model_provenance, Some(ModelProvenance::Degraded));
    }
}
