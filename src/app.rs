use crate::{
    config::Config,
    labels::ClassLabels,
    lifecycle::ModelLifecycle,
    ort_service::{LoadError, OrtModelService},
    pipeline::RequestPipeline,
    server::HttpServer,
    telemetry::Metrics,
    upload::ensure_upload_dir,
};
use std::{error::Error, sync::Arc};
use tokio::{signal, sync::broadcast};

pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    if let Err(e) = ensure_upload_dir(&config.server.upload_dir) {
        tracing::error!(
            "Failed to create upload directory {:?}: {}",
            config.server.upload_dir,
            e
        );
        return Err(Box::new(e));
    }

    // The listener comes up while the model is still loading; uploads get a
    // 503 until the lifecycle reports ready.
    let lifecycle = Arc::new(ModelLifecycle::<OrtModelService>::new());
    let model_config = config.model.clone();
    let labels_config = config.labels.clone();
    let _ = lifecycle.spawn_load(move || -> Result<OrtModelService, LoadError> {
        let labels = ClassLabels::from_config(&labels_config)?;
        OrtModelService::new(&model_config, labels)
    });

    let pipeline = Arc::new(RequestPipeline::new(
        lifecycle,
        config.server.upload_dir.clone(),
        config.server.request_timeout(),
    ));
    let metrics = Arc::new(Metrics::new()?);

    let server = HttpServer::new(pipeline, metrics, &config.server).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_handle = server.run(shutdown_tx.subscribe()).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    let _ = shutdown_tx.send(());
    match server_handle.await {
        Ok(Err(e)) => tracing::error!("HTTP server failed: {}", e),
        Err(e) => tracing::error!("HTTP server task failed: {}", e),
        Ok(Ok(())) => {}
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
