// Tessera worker
//
// Runs one worker pool per configured task queue. Adapters are constructed
// once here and injected into the activity registration table; nothing in
// the activity library reaches for globals.

mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::get, routing::post, Json, Router};
use serde_json::json;

use tessera_durable::worker::WorkerPoolConfig;
use tessera_durable::{
    ExecutionStore, InMemoryExecutionStore, PostgresExecutionStore, SignalFanout, WorkerPool,
};
use tessera_workflows::adapters::{
    Adapters, FanoutNotifier, FsBlobStore, MemoryBlobStore, MemoryGraphStore, MemoryMetadataStore,
    MemoryVectorIndex, OpenAiCompatProvider,
};
use tessera_workflows::adapters::{BlobStore, FakeLlm, LlmProvider};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::WorkerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tessera_worker=debug,tessera_durable=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("tessera-worker starting...");

    let config = WorkerConfig::from_env();

    let store: Arc<dyn ExecutionStore> = match &config.database_url {
        Some(database_url) => {
            let pool = sqlx::PgPool::connect(database_url)
                .await
                .context("Failed to connect to database")?;
            tracing::info!("Connected to Postgres");
            Arc::new(PostgresExecutionStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory store (dev only)");
            Arc::new(InMemoryExecutionStore::new())
        }
    };

    let adapters = build_adapters(&config, Arc::clone(&store));
    let queues = config.queues.clone();

    tracing::info!(
        queues = ?queues.iter().map(|q| q.as_str()).collect::<Vec<_>>(),
        "starting worker pools"
    );

    // One pool per queue class; each carries the full activity table and
    // lets the queue's routing decide what it actually receives.
    let mut pools = Vec::with_capacity(queues.len());
    for queue in queues {
        let pool_config = WorkerPoolConfig::new(queue)
            .with_worker_id(format!("{}-{}", config.worker_id_prefix, queue.as_str()));
        let pool = Arc::new(WorkerPool::new(
            Arc::clone(&store),
            pool_config,
            tessera_workflows::activity_set(&adapters),
        ));
        pool.start().await.context("Failed to start worker pool")?;
        pools.push(pool);
    }

    let health = spawn_health_server(&config.health_addr, pools.clone()).await?;

    tokio::signal::ctrl_c().await.context("signal handler")?;
    tracing::info!("Received shutdown signal; draining");

    for pool in &pools {
        if let Err(e) = pool.drain().await {
            tracing::error!(worker_id = %pool.worker_id(), "drain failed: {e}");
        }
    }

    health.abort();
    tracing::info!("tessera-worker stopped");
    Ok(())
}

fn build_adapters(config: &WorkerConfig, store: Arc<dyn ExecutionStore>) -> Adapters {
    let blobs: Arc<dyn BlobStore> = match &config.blob_root {
        Some(root) => {
            tracing::info!(%root, "using filesystem blob store");
            Arc::new(FsBlobStore::new(root.clone()))
        }
        None => {
            tracing::warn!("BLOB_ROOT not set; using in-memory blob store (dev only)");
            Arc::new(MemoryBlobStore::new())
        }
    };

    let llm: Arc<dyn LlmProvider> = match &config.llm_api_url {
        Some(url) => {
            tracing::info!(%url, model = %config.llm_model, "using OpenAI-compatible LLM provider");
            Arc::new(OpenAiCompatProvider::new(
                url.clone(),
                config.llm_api_key.clone(),
                config.llm_model.clone(),
            ))
        }
        None => {
            tracing::warn!("LLM_API_URL not set; using scripted fake LLM (dev only)");
            Arc::new(FakeLlm::new())
        }
    };

    let fanout = Arc::new(SignalFanout::new(store));

    Adapters {
        blobs,
        vectors: Arc::new(MemoryVectorIndex::new()),
        graph: Arc::new(MemoryGraphStore::new()),
        llm,
        metadata: Arc::new(MemoryMetadataStore::new()),
        notifier: Arc::new(FanoutNotifier::new(fanout)),
    }
}

/// Liveness (`/healthz`), readiness (`/readyz`) and drain (`/drain`).
async fn spawn_health_server(
    addr: &str,
    pools: Vec<Arc<WorkerPool>>,
) -> Result<tokio::task::JoinHandle<()>> {
    let live_pools = pools.clone();
    let ready_pools = pools.clone();
    let drain_pools = pools;

    let app = Router::new()
        .route(
            "/healthz",
            get(move || {
                let pools = live_pools.clone();
                async move {
                    let live = pools.iter().all(|p| p.is_live());
                    Json(json!({"live": live}))
                }
            }),
        )
        .route(
            "/readyz",
            get(move || {
                let pools = ready_pools.clone();
                async move {
                    let ready = pools.iter().all(|p| p.is_ready());
                    let status = if ready {
                        axum::http::StatusCode::OK
                    } else {
                        axum::http::StatusCode::SERVICE_UNAVAILABLE
                    };
                    (status, Json(json!({"ready": ready})))
                }
            }),
        )
        .route(
            "/drain",
            post(move || {
                let pools = drain_pools.clone();
                async move {
                    for pool in &pools {
                        if let Err(e) = pool.drain().await {
                            tracing::error!(worker_id = %pool.worker_id(), "drain failed: {e}");
                        }
                    }
                    Json(json!({"drained": true}))
                }
            }),
        );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind health listener")?;
    tracing::info!(%addr, "health endpoints listening");

    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("health server error: {e}");
        }
    }))
}
