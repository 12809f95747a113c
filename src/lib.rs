mod routes;
mod server;
mod telemetry;

pub mod app;
pub mod config;
pub mod decoder;
pub mod detection;
pub mod labels;
pub mod lifecycle;
pub mod model_service;
pub mod ort_service;
pub mod pipeline;
pub mod response;
pub mod upload;

pub use app::start_app;
