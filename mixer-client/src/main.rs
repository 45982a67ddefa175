use mixer_client::config;
use mixer_client::hasher::CommitmentHasher;
use mixer_client::orchestrator::{Orchestrator, OrchestratorSettings};
use mixer_client::prover::CommandProver;
use mixer_client::relay::{HttpPoolConnector, PoolRegistry};
use mixer_client::router;
use mixer_client::state::AppState;
use mixer_client::store::CommitmentStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,mixer_client=debug".into()),
        )
        .init();

    let cfg = config::load_config()?;
    let mut pools: Vec<&String> = cfg.deployments.keys().collect();
    pools.sort();
    info!(
        "starting mixer-client (bind={}, store={}, pools={:?})",
        cfg.api_bind,
        cfg.store_path.display(),
        pools
    );
    info!(
        "prover: bin={} depth={} verify={}",
        cfg.prover.bin.display(),
        cfg.prover.tree_depth,
        cfg.prover.verifying_key.is_some()
    );

    let store = Arc::new(
        CommitmentStore::open(&cfg.store_path)
            .map_err(|e| anyhow::anyhow!("open commitment store failed: {e}"))?,
    );
    let poll_interval = Duration::from_millis(cfg.poll_interval_ms);
    let registry = Arc::new(PoolRegistry::new(
        cfg.deployments.clone(),
        Arc::new(HttpPoolConnector {
            poll_interval,
            receipt_poll_interval: Duration::from_millis(cfg.receipt_poll_interval_ms),
        }),
    ));
    let hasher = Arc::new(CommitmentHasher::from_config(cfg.leaf_source, &cfg.nullifier));
    let orchestrator = Arc::new(Orchestrator::new(
        store,
        registry,
        Arc::new(CommandProver::new(cfg.prover.clone())),
        hasher,
        OrchestratorSettings {
            retry_delay: poll_interval,
        },
    ));
    let follower = orchestrator.start();

    let state = Arc::new(AppState::new(orchestrator.clone(), cfg.api_token.clone()));
    let app = router::build(state);

    let listener = tokio::net::TcpListener::bind(cfg.api_bind.as_str()).await?;
    info!("api listening on http://{}", cfg.api_bind);
    let shutdown_handle = orchestrator.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested; stopping watches");
        shutdown_handle.shutdown();
    })
    .await?;
    follower.abort();
    Ok(())
}
