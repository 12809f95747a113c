use crate::{lifecycle::ModelState, model_service::ModelService, server::SharedState};
use axum::{extract::State, response::IntoResponse, response::Json};
use serde::Serialize;

#[derive(Serialize)]
pub struct Status {
    status: String,
    model: ModelState,
}

pub async fn healthcheck<M: ModelService>(State(state): State<SharedState<M>>) -> impl IntoResponse {
    Json(Status {
        status: "Available".into(),
        model: state.pipeline.lifecycle().state(),
    })
}
