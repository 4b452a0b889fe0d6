use axum::{Json, Router, extract::State, routing::get};
use chrono::Utc;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use anyhow::Context;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use tracing::{error, info, warn};

use crate::AppState;
use crate::config::{AppConfig, SessionsConfig};
use crate::gateway::auth::{IdentityProvider, JwtIdentityProvider, PassthroughIdentityProvider};
use crate::gateway::registry::ConnectionRegistry;
use crate::gateway::{self, Gateway, RateLimit};
use crate::llm::embedding::EmbeddingService;
use crate::llm::{ChatCompletionsClient, FastEmbedService, LlmSettings, OpenAiEmbeddingService};
use crate::persistence::{
    PersistenceLayer,
    providers::{memory::InMemoryProvider, postgres::PostgresProvider, surreal::SurrealDbProvider},
};
use crate::wizard::{AnswerAnalyzer, SessionManager, TemplateMatcher, catalog};

/// Longest stale window honoured, about a century.
const MAX_STALE_HOURS: u64 = 876_000;

/// Connect the configured store.
pub async fn connect_store(config: &AppConfig) -> anyhow::Result<Arc<dyn PersistenceLayer>> {
    let url = &config.persistence.database_url;
    let store: Arc<dyn PersistenceLayer> = match config.persistence.provider.as_str() {
        "postgres" => Arc::new(
            PostgresProvider::new(url)
                .await
                .context("Failed to initialize Postgres")?,
        ),
        "surrealdb" => Arc::new(
            SurrealDbProvider::new(url)
                .await
                .context("Failed to initialize SurrealDB")?,
        ),
        _ => Arc::new(InMemoryProvider::new()),
    };
    info!(provider = %config.persistence.provider, "Persistence initialized");
    Ok(store)
}

/// Build the configured embedding service, loading local weights if needed.
pub async fn build_embedder(config: &AppConfig, settings: &LlmSettings) -> Arc<dyn EmbeddingService> {
    if config.embedding.provider == "openai" {
        return Arc::new(OpenAiEmbeddingService::new(
            settings.clone(),
            config.embedding.model.clone(),
        ));
    }

    let local = FastEmbedService::new(&config.embedding.model);
    // Keep serving; classification reports the embedding service as unavailable.
    if let Err(e) = local.initialize().await {
        error!("Failed to initialize embedding model: {:?}", e);
    }
    Arc::new(local)
}

/// Wire every component into shared application state.
pub async fn build_state(config: Arc<AppConfig>, settings: LlmSettings) -> anyhow::Result<AppState> {
    let store = connect_store(&config).await?;
    let embedder = build_embedder(&config, &settings).await;

    let templates = catalog::load_dir(Path::new(&config.matching.templates_dir));
    if templates.is_empty() {
        warn!(dir = %config.matching.templates_dir, "No templates found, every request will miss");
    }
    catalog::seed(
        &templates,
        embedder.as_ref(),
        store.as_ref(),
        Some(config.persistence.vector_dimension),
    )
    .await;

    let timeout = config.resilience.service_timeout();
    let completion = Arc::new(ChatCompletionsClient::new(settings));
    let matcher = TemplateMatcher::new(
        embedder,
        completion.clone(),
        Arc::clone(&store),
        config.matching.similarity_threshold,
        timeout,
    );
    let analyzer = AnswerAnalyzer::new(completion, timeout);
    let sessions = Arc::new(SessionManager::new(
        store,
        matcher,
        analyzer,
        timeout,
        config.sessions.history_token_budget,
    ));

    let identity: Arc<dyn IdentityProvider> = if config.security.jwt_required {
        Arc::new(JwtIdentityProvider::new(&config.security.jwt_secret))
    } else {
        warn!("JWT authentication disabled, the credential is taken as the user id");
        Arc::new(PassthroughIdentityProvider)
    };

    Ok(AppState::new(
        Gateway::new(
            Arc::new(ConnectionRegistry::new()),
            sessions,
            rate_limit_for(&config),
        ),
        identity,
        config,
    ))
}

/// Per-connection limits, if enabled.
pub fn rate_limit_for(config: &AppConfig) -> Option<RateLimit> {
    config.resilience.rate_limit_enabled.then_some(RateLimit {
        messages_per_second: config.resilience.messages_per_second,
        burst_size: config.resilience.burst_size,
    })
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(gateway::ws_handler))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Periodically delete incomplete sessions nobody has touched in a while.
pub fn spawn_session_cleanup(
    sessions: Arc<SessionManager>,
    config: SessionsConfig,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(config.cleanup_interval_secs.max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let hours = i64::try_from(config.stale_after_hours.min(MAX_STALE_HOURS)).unwrap_or(0);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let cutoff = Utc::now() - chrono::Duration::hours(hours);
            match sessions.cleanup_stale(cutoff).await {
                Ok(removed) => info!(
                    name: "wizard.cleanup.completed",
                    removed,
                    "Stale session cleanup finished"
                ),
                Err(e) => warn!(error = %e, "Stale session cleanup failed"),
            }
        }
    })
}

/// Start the Axum server with the provided configuration.
pub async fn start_server(config: Arc<AppConfig>, settings: LlmSettings) -> anyhow::Result<()> {
    info!(
        name: "llm.config.loaded",
        base_url = %settings.base_url,
        model = %settings.model,
        "LLM configuration loaded"
    );

    let state = build_state(Arc::clone(&config), settings).await?;

    let shutdown = CancellationToken::new();
    let cleanup = spawn_session_cleanup(
        Arc::clone(state.gateway.sessions()),
        config.sessions.clone(),
        shutdown.clone(),
    );

    let app = build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        name: "server.started",
        address = %addr,
        "Server started"
    );

    let signal = shutdown.clone();
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Err(e) = cleanup.await {
        error!("Cleanup task failed: {:?}", e);
    }
    Ok(())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    connections: usize,
    admitted: u64,
    superseded: u64,
    uptime_secs: u64,
}

/// GET /health - liveness and connection counts.
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.gateway.registry().stats();
    Json(HealthResponse {
        status: "ok",
        connections: stats.active,
        admitted: stats.admitted,
        superseded: stats.superseded,
        uptime_secs: Instant::now().duration_since(state.started_at).as_secs(),
    })
}
