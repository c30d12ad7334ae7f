mod args;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use keel_common::telemetry::{init_tracing, OtlpSettings};
use keel_common::PlatformConfig;
use keel_meta::{
    EndpointStore, EtcdMetaStore, KvEndpointStore, MemoryMetaStore, PgEndpointStore,
};
use keel_reconciler::adapter::{
    AdapterRegistry, KServeAdapter, KubernetesAdapter, RayServeAdapter,
};
use keel_reconciler::engine::ReconciliationEngine;
use keel_reconciler::handlers::router;
use keel_reconciler::health::HealthProber;
use keel_reconciler::metrics::SharedMetrics;
use keel_reconciler::state::AppState;

use crate::args::{Args, StoreBackend};

async fn build_store(args: &Args) -> anyhow::Result<Arc<dyn EndpointStore>> {
    let store: Arc<dyn EndpointStore> = match args.store {
        StoreBackend::Memory => {
            tracing::warn!("using in-memory endpoint store; state is lost on restart");
            Arc::new(KvEndpointStore::new(MemoryMetaStore::new()))
        }
        StoreBackend::Etcd => {
            let kv = EtcdMetaStore::connect(std::slice::from_ref(&args.etcd_endpoint)).await?;
            info!("connected to etcd at {}", args.etcd_endpoint);
            Arc::new(KvEndpointStore::new(kv))
        }
        StoreBackend::Postgres => {
            let url = args
                .database_url
                .as_deref()
                .context("--database-url is required for the postgres store")?;
            let pg = PgEndpointStore::connect(url, args.db_max_connections).await?;
            pg.migrate().await?;
            info!("connected to postgres");
            Arc::new(pg)
        }
    };
    Ok(store)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let tracer = init_tracing(
        "keel-reconciler",
        &OtlpSettings {
            endpoint: args.otlp_endpoint.clone(),
            token: args.otlp_token.clone(),
        },
    );
    info!("keel-reconciler starting...");

    let cfg = PlatformConfig::load(args.policy_config.as_deref())?;
    let cfg = keel_common::config::install(cfg)?;
    info!(
        images = cfg.images.table.len(),
        families = cfg.whitelist.model_families.len(),
        "policy config loaded"
    );

    let client = kube::Client::try_default()
        .await
        .context("failed to build kubernetes client")?;
    let adapters = AdapterRegistry::new()
        .with(Arc::new(KubernetesAdapter::new(client.clone(), cfg.cluster.clone())))
        .with(Arc::new(KServeAdapter::new(client.clone(), cfg.cluster.clone())))
        .with(Arc::new(RayServeAdapter::new(client, cfg.cluster.clone())));
    info!(
        frameworks = ?adapters.frameworks().collect::<Vec<_>>(),
        "framework adapters registered"
    );

    let store = build_store(&args).await?;
    let metrics = Arc::new(SharedMetrics::default());
    let engine = ReconciliationEngine::new(store, adapters, cfg, metrics);

    if !args.disable_prober {
        let prober = HealthProber::new(engine.clone());
        tokio::spawn(prober.run());
    }

    let app = router(AppState { engine });
    let listener = tokio::net::TcpListener::bind(&args.listen_addr).await?;
    info!("keel-reconciler listening on {}", args.listen_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    if let Some(provider) = tracer {
        let _ = provider.shutdown();
    }
    Ok(())
}
