//! modelsync - keeps served model deployments in sync with a model registry

use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use modelsync::config::Config;
use modelsync::deploy::KubeBackend;
use modelsync::reconcile::{ReconciliationState, Reconciler};
use modelsync::registry::{MlflowRegistry, SnapshotReader};
use modelsync::status;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let config = Config::parse();
    config.validate()?;

    info!(
        registry = %config.registry_url,
        namespace = %config.namespace,
        stages = ?config.stages,
        "modelsync starting"
    );

    let reader: Arc<dyn SnapshotReader> = Arc::new(MlflowRegistry::new(&config)?);

    let client = kube::Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {e}"))?;
    let backend = Arc::new(KubeBackend::new(client, &config));

    let (state_tx, state_rx) = watch::channel(Arc::new(ReconciliationState::new()));
    let cancel = CancellationToken::new();

    // Termination requests start the drain; the loop exits cleanly afterwards
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            info!("termination signal received, draining deployments");
            cancel.cancel();
        }
    });

    if let Some(addr) = config.status_addr {
        let state = state_rx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = status::serve(addr, state, cancel).await {
                error!(error = %e, "status surface failed");
            }
        });
    }

    let reconciler = Reconciler::new(reader, backend, config.interval(), state_tx);
    reconciler.run(cancel).await;

    info!("modelsync stopped");
    Ok(())
}

/// Resolve when the process is asked to terminate (SIGTERM or ctrl-c)
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM, falling back to ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
