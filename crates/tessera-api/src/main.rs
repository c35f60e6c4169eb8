// Tessera API server
//
// The front door of the platform: starts workflows, serves introspection and
// the HITL surfaces, and hosts the engine runtime that keeps executions
// moving. Connects to Postgres when DATABASE_URL is set; otherwise runs on
// the in-memory store for local development.

mod auth;
mod documents;
mod error;
mod inbox;
mod questions;
mod reviews;
mod state;
mod workflows;
mod ws;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::get, Json, Router};
use serde::Serialize;
use tessera_durable::{
    EngineRuntime, ExecutionStore, InMemoryExecutionStore, PostgresExecutionStore, SignalFanout,
    WorkflowExecutor,
};
use tessera_workflows::register_workflows;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use state::AppState;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    store: &'static str,
}

#[derive(Clone)]
struct HealthState {
    store_kind: &'static str,
}

async fn health(
    axum::extract::State(state): axum::extract::State<HealthState>,
) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        store: state.store_kind,
    })
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        documents::create_document,
        questions::create_question,
        reviews::create_review,
        workflows::list_workflows,
        workflows::describe_workflow,
        workflows::workflow_status,
        workflows::workflow_results,
        workflows::signal_workflow,
        inbox::list_signals,
        inbox::unread_count,
        inbox::mark_read,
    ),
    components(schemas(
        documents::CreateDocumentRequest,
        documents::WorkflowAccepted,
        questions::CreateQuestionRequest,
        reviews::CreateReviewRequest,
        workflows::WorkflowSummary,
        workflows::DescribeResponse,
        workflows::SignalRequest,
    )),
    tags(
        (name = "documents", description = "Document ingestion"),
        (name = "questions", description = "Question answering"),
        (name = "reviews", description = "Quality reviews"),
        (name = "workflows", description = "Workflow introspection and signals"),
        (name = "inbox", description = "Per-principal signal inboxes")
    ),
    info(
        title = "Tessera API",
        description = "Workflow-driven knowledge ingestion and question answering",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tessera_api=debug,tessera_durable=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("tessera-api starting...");

    // Store selection: Postgres when configured, in-memory otherwise.
    let (store, store_kind): (Arc<dyn ExecutionStore>, &'static str) =
        match std::env::var("DATABASE_URL") {
            Ok(database_url) => {
                let pool = sqlx::PgPool::connect(&database_url)
                    .await
                    .context("Failed to connect to database")?;
                sqlx::migrate!("../tessera-durable/migrations")
                    .run(&pool)
                    .await
                    .context("Failed to run migrations")?;
                tracing::info!("Connected to Postgres");
                (Arc::new(PostgresExecutionStore::new(pool)), "postgres")
            }
            Err(_) => {
                tracing::warn!("DATABASE_URL not set; using in-memory store");
                (Arc::new(InMemoryExecutionStore::new()), "memory")
            }
        };

    // Executor with every workflow definition registered.
    let mut executor = WorkflowExecutor::new(Arc::clone(&store));
    register_workflows(&mut executor);
    let executor = Arc::new(executor);

    // Background sweeps: completion pump, timers, timeouts.
    let runtime = Arc::new(EngineRuntime::new(Arc::clone(&executor)));
    runtime.start();

    let fanout = Arc::new(SignalFanout::new(Arc::clone(&store)));

    let state = AppState {
        executor,
        store,
        fanout,
    };
    let health_state = HealthState { store_kind };

    let app = Router::new()
        .route("/health", get(health).with_state(health_state))
        .merge(documents::routes(state.clone()))
        .merge(questions::routes(state.clone()))
        .merge(reviews::routes(state.clone()))
        .merge(workflows::routes(state.clone()))
        .merge(inbox::routes(state.clone()))
        .merge(ws::routes(state))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;
    tracing::info!("Listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Received shutdown signal");
        })
        .await
        .context("Server error")?;

    runtime.shutdown().await;
    tracing::info!("tessera-api stopped");
    Ok(())
}
