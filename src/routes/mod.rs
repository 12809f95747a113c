mod health;
mod metrics;
mod upload_image;

use crate::{model_service::ModelService, server::SharedState};
use axum::{
    routing::{get, post},
    Router,
};

pub use health::healthcheck;
pub use metrics::metrics_handler;
pub use upload_image::upload_image;

pub fn api_routes<M: ModelService>() -> Router<SharedState<M>> {
    Router::new()
        .route("/upload-image", post(upload_image::<M>))
        .route("/health", get(healthcheck::<M>))
        .route("/metrics", get(metrics_handler::<M>))
}
