use crate::{
    config::Config,
    explanation::Explainer,
    llm::ChatClient,
    server::{HttpServer, SharedState},
    telemetry::Metrics,
};
use deepfake_detection::{detector::Detector, ort_service::init_runtime};
use std::{error::Error, sync::Arc};
use tokio::{signal, sync::broadcast};

pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    init_runtime()?;

    let detector = match Detector::from_config(&config.detector) {
        Ok(detector) => Arc::new(detector),
        Err(e) => {
            tracing::error!("Failed to load detection models: {:?}", e);
            return Err(Box::new(e));
        }
    };

    if config.llm.api_key.is_none() {
        tracing::warn!("No LLM API key configured, explanations will use fallback text");
    }

    let metrics = Arc::new(Metrics::new()?);
    let explainer = Arc::new(Explainer::new(ChatClient::new(&config.llm)?, metrics.clone()));

    let state = SharedState {
        detector,
        explainer,
        metrics,
    };
    let server = HttpServer::new(state, &config.server).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_handle = server.run(shutdown_tx.subscribe()).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    let _ = shutdown_tx.send(());
    server_handle.await??;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
