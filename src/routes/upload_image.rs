use crate::{
    model_service::ModelService,
    pipeline::PipelineError,
    response::DetectionResponse,
    server::SharedState,
};
use axum::{
    body::Bytes,
    extract::{multipart::MultipartRejection, Multipart, State},
    Json,
};
use std::time::Instant;
use tracing::instrument;
use uuid::Uuid;

const IMAGE_FIELD: &str = "image";

/// Returns the first `image` field. Anything that prevents reading it yields
/// an empty payload, which the pipeline reports as a decode failure.
async fn read_image_field(multipart: Result<Multipart, MultipartRejection>) -> Bytes {
    let mut multipart = match multipart {
        Ok(multipart) => multipart,
        Err(e) => {
            tracing::warn!("Request is not a readable multipart body: {}", e);
            return Bytes::new();
        }
    };

    loop {
        match multipart.next_field().await {
            Ok(Some(field)) if field.name() == Some(IMAGE_FIELD) => {
                return match field.bytes().await {
                    Ok(data) => {
                        tracing::debug!("Received image field: {} bytes", data.len());
                        data
                    }
                    Err(e) => {
                        tracing::warn!("Failed to read image field: {}", e);
                        Bytes::new()
                    }
                };
            }
            Ok(Some(field)) => {
                tracing::debug!("Ignoring multipart field {:?}", field.name());
            }
            Ok(None) => {
                tracing::warn!("Multipart body has no `{}` field", IMAGE_FIELD);
                return Bytes::new();
            }
            Err(e) => {
                tracing::warn!("Failed to read multipart field: {}", e);
                return Bytes::new();
            }
        }
    }
}

#[instrument(skip(state, multipart), fields(request_id = %Uuid::new_v4()))]
pub async fn upload_image<M: ModelService>(
    State(state): State<SharedState<M>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<DetectionResponse>, PipelineError> {
    let image_data = read_image_field(multipart).await;

    let started = Instant::now();
    let result = state.pipeline.process(image_data).await;

    let outcome = match &result {
        Ok(_) => "ok",
        Err(e) => e.outcome(),
    };
    state.metrics.record_request(outcome);

    if !matches!(result, Err(PipelineError::NotReady)) {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        state.metrics.record_inference_duration(elapsed_ms, outcome);
    }

    if let Ok(response) = &result {
        state.metrics.record_detections(response.objects.len());
        tracing::info!(
            objects = response.objects.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Detection completed"
        );
    }

    result.map(Json)
}
