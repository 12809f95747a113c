use crate::{
    decoder::{self, DecodeError},
    lifecycle::ModelLifecycle,
    model_service::{InferenceError, ModelService},
    response::{self, DetectionResponse, ErrorResponse},
    upload::UploadedImage,
};
use axum::{
    body::Bytes,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::{io, path::PathBuf, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::instrument;

pub const MODEL_NOT_READY_MESSAGE: &str = "Model not loaded yet. Please try again later.";
pub const PROCESSING_FAILED_MESSAGE: &str = "Failed to process image";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    ModelCheck,
    Storing,
    Decoding,
    Detecting,
    Shaping,
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Model not loaded yet")]
    NotReady,
    #[error("Failed to store upload: {0}")]
    Storage(#[source] io::Error),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error("Processing timed out after {0:?}")]
    Timeout(Duration),
    #[error("Processing task failed: {0}")]
    Task(String),
}

impl PipelineError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            PipelineError::NotReady => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Metric and log label.
    pub fn outcome(&self) -> &'static str {
        match self {
            PipelineError::NotReady => "not_ready",
            PipelineError::Storage(_) => "storage_error",
            PipelineError::Decode(_) => "decode_error",
            PipelineError::Inference(_) => "inference_error",
            PipelineError::Timeout(_) => "timeout",
            PipelineError::Task(_) => "task_error",
        }
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match self {
            PipelineError::NotReady => {
                tracing::info!("Rejecting upload, model is not ready");
                MODEL_NOT_READY_MESSAGE
            }
            PipelineError::Decode(ref e) => {
                tracing::warn!("Rejecting undecodable upload: {}", e);
                PROCESSING_FAILED_MESSAGE
            }
            ref e => {
                tracing::error!("Request failed: {} ({})", e, status);
                PROCESSING_FAILED_MESSAGE
            }
        };

        (status, Json(ErrorResponse::new(message))).into_response()
    }
}

/// Per-request orchestration: readiness check, upload storage, decode, detect
/// and shape. Decoding and detection run on the blocking pool under
/// `timeout`.
pub struct RequestPipeline<M> {
    lifecycle: Arc<ModelLifecycle<M>>,
    upload_dir: PathBuf,
    timeout: Duration,
}

impl<M: ModelService> RequestPipeline<M> {
    pub fn new(lifecycle: Arc<ModelLifecycle<M>>, upload_dir: PathBuf, timeout: Duration) -> Self {
        Self {
            lifecycle,
            upload_dir,
            timeout,
        }
    }

    pub fn lifecycle(&self) -> &Arc<ModelLifecycle<M>> {
        &self.lifecycle
    }

    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    pub async fn process(&self, bytes: Bytes) -> Result<DetectionResponse, PipelineError> {
        tracing::debug!(stage = ?Stage::ModelCheck);
        let model = self.lifecycle.model().ok_or(PipelineError::NotReady)?;

        tracing::debug!(stage = ?Stage::Storing);
        let upload_dir = self.upload_dir.clone();
        let upload = tokio::task::spawn_blocking(move || UploadedImage::persist(&upload_dir, &bytes))
            .await
            .map_err(|e| PipelineError::Task(e.to_string()))?
            .map_err(PipelineError::Storage)?;

        // From here on `upload` is dropped on every return, which removes the
        // stored file before the response is written.
        let path = upload.path().to_path_buf();
        let work = tokio::task::spawn_blocking(move || {
            tracing::debug!(stage = ?Stage::Decoding);
            let bytes = std::fs::read(&path).map_err(PipelineError::Storage)?;
            let image = decoder::decode(&bytes)?;
            drop(bytes);

            tracing::debug!(stage = ?Stage::Detecting);
            let detections = model.detect(&image)?;
            drop(image);

            Ok::<_, PipelineError>(detections)
        });

        let detections = match tokio::time::timeout(self.timeout, work).await {
            Ok(Ok(result)) => result?,
            Ok(Err(e)) => return Err(PipelineError::Task(e.to_string())),
            Err(_) => return Err(PipelineError::Timeout(self.timeout)),
        };

        tracing::debug!(stage = ?Stage::Shaping, detections = detections.len());
        let response = response::shape(&detections);

        drop(upload);
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        decoder::DecodedImage,
        detection::{BoundingBox, Detection},
    };
    use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
    use std::{
        io::Cursor,
        path::Path,
        sync::atomic::{AtomicUsize, Ordering},
    };
    use tempfile::TempDir;

    enum Behaviour {
        Detect(Vec<Detection>),
        Fail,
        Sleep(Duration),
    }

    struct MockModelService {
        behaviour: Behaviour,
        calls: Arc<AtomicUsize>,
    }

    impl ModelService for MockModelService {
        fn detect(&self, image: &DecodedImage) -> Result<Vec<Detection>, InferenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(image.channels(), 3);
            match &self.behaviour {
                Behaviour::Detect(detections) => Ok(detections.clone()),
                Behaviour::Fail => Err(InferenceError::Run("malformed tensor".to_string())),
                Behaviour::Sleep(duration) => {
                    std::thread::sleep(*duration);
                    Ok(vec![])
                }
            }
        }
    }

    fn detection(label: &str, x: f32) -> Detection {
        Detection {
            class_label: label.to_string(),
            confidence: 0.8,
            bbox: BoundingBox {
                x,
                y: 1.,
                width: 2.,
                height: 3.,
            },
        }
    }

    fn png_bytes() -> Bytes {
        let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_pixel(16, 16, Rgb([0, 128, 255]));
        let mut image_data: Vec<u8> = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut image_data), ImageFormat::Png)
            .unwrap();
        Bytes::from(image_data)
    }

    fn pipeline(
        behaviour: Behaviour,
        ready: bool,
        upload_dir: &Path,
    ) -> (RequestPipeline<MockModelService>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let model = MockModelService {
            behaviour,
            calls: calls.clone(),
        };
        let lifecycle = if ready {
            ModelLifecycle::ready(model)
        } else {
            ModelLifecycle::new()
        };
        let pipeline = RequestPipeline::new(
            Arc::new(lifecycle),
            upload_dir.to_path_buf(),
            Duration::from_millis(200),
        );
        (pipeline, calls)
    }

    fn is_empty(dir: &Path) -> bool {
        std::fs::read_dir(dir).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn test_success_preserves_model_order() {
        let dir = TempDir::new().unwrap();
        let detections = vec![detection("dog", 34.), detection("cat", 5.), detection("dog", 9.)];
        let (pipeline, calls) = pipeline(Behaviour::Detect(detections), true, dir.path());

        let response = pipeline.process(png_bytes()).await.unwrap();

        assert_eq!(response.objects, vec!["dog", "cat", "dog"]);
        for (object, bbox) in response.objects.iter().zip(&response.boxes) {
            assert_eq!(object, &bbox.class);
        }
        assert_eq!(response.boxes[0].bbox, [34., 1., 2., 3.]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(is_empty(dir.path()));
    }

    #[tokio::test]
    async fn test_no_objects_is_success() {
        let dir = TempDir::new().unwrap();
        let (pipeline, _) = pipeline(Behaviour::Detect(vec![]), true, dir.path());

        let response = pipeline.process(png_bytes()).await.unwrap();

        assert!(response.objects.is_empty());
        assert!(response.boxes.is_empty());
    }

    #[tokio::test]
    async fn test_not_ready_does_no_work() {
        let dir = TempDir::new().unwrap();
        let (pipeline, calls) = pipeline(Behaviour::Detect(vec![]), false, dir.path());

        let result = pipeline.process(png_bytes()).await;

        assert!(matches!(result, Err(PipelineError::NotReady)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(is_empty(dir.path()));
    }

    #[tokio::test]
    async fn test_empty_payload_is_decode_error() {
        let dir = TempDir::new().unwrap();
        let (pipeline, calls) = pipeline(Behaviour::Detect(vec![]), true, dir.path());

        let result = pipeline.process(Bytes::new()).await;

        assert!(matches!(
            result,
            Err(PipelineError::Decode(DecodeError::Empty))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(is_empty(dir.path()));
    }

    #[tokio::test]
    async fn test_non_image_payload_is_decode_error() {
        let dir = TempDir::new().unwrap();
        let (pipeline, _) = pipeline(Behaviour::Detect(vec![]), true, dir.path());

        let result = pipeline
            .process(Bytes::from_static(b"<html>not an image</html>"))
            .await;

        assert!(matches!(result, Err(PipelineError::Decode(_))));
        assert!(is_empty(dir.path()));
    }

    #[tokio::test]
    async fn test_inference_failure_cleans_up() {
        let dir = TempDir::new().unwrap();
        let (pipeline, calls) = pipeline(Behaviour::Fail, true, dir.path());

        let result = pipeline.process(png_bytes()).await;

        assert!(matches!(result, Err(PipelineError::Inference(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(is_empty(dir.path()));
    }

    #[tokio::test]
    async fn test_timeout_cleans_up() {
        let dir = TempDir::new().unwrap();
        let (pipeline, _) = pipeline(
            Behaviour::Sleep(Duration::from_millis(600)),
            true,
            dir.path(),
        );

        let result = pipeline.process(png_bytes()).await;

        assert!(matches!(result, Err(PipelineError::Timeout(_))));
        assert!(is_empty(dir.path()));
    }

    #[tokio::test]
    async fn test_missing_upload_dir_is_storage_error() {
        let dir = TempDir::new().unwrap();
        let (pipeline, calls) = pipeline(
            Behaviour::Detect(vec![]),
            true,
            &dir.path().join("missing"),
        );

        let result = pipeline.process(png_bytes()).await;

        assert!(matches!(result, Err(PipelineError::Storage(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_error_responses() {
        let response = PipelineError::NotReady.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(body.error, MODEL_NOT_READY_MESSAGE);

        let response = PipelineError::Decode(DecodeError::Empty).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(body.error, PROCESSING_FAILED_MESSAGE);

        let response =
            PipelineError::Inference(InferenceError::Run("boom".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
