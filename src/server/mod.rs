//! HTTP surface: iteration submission, worker callbacks, event history and
//! the live progress stream.

pub mod api;
pub mod stream;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, http::Uri};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::config::{ClassifierBackend, ClassifierSection, ServiceConfig};
use crate::context::ContextAssembler;
use crate::distributor::{EventDistributor, EventPersister};
use crate::intent::{AnthropicClient, ClaudeCliClient, IntentClassifier, ModelClient};
use crate::service::IterationService;
use crate::store::{ConversationStore, SqliteStore};
use crate::trigger::{ExecutionTrigger, ExecutionWorker, HttpWorker, UnconfiguredWorker};

pub use api::{AppState, SharedState, api_router};

/// Build the full application router.
pub fn build_router(state: SharedState, dev_mode: bool) -> Router {
    let app = api_router().fallback(not_found).with_state(state);
    if dev_mode {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

async fn not_found(uri: Uri) -> api::ApiError {
    api::ApiError::NotFound(format!("No route for {}", uri.path()))
}

fn model_client(section: &ClassifierSection) -> Option<Arc<dyn ModelClient>> {
    match section.backend {
        ClassifierBackend::Rules => None,
        ClassifierBackend::ClaudeCli => Some(Arc::new(ClaudeCliClient::new(section.claude_cmd()))),
        ClassifierBackend::Http => match &section.api_key {
            Some(key) => {
                let mut client = AnthropicClient::new(key.clone(), section.model.clone());
                if let Some(url) = &section.api_url {
                    client = client.with_base_url(url.clone());
                }
                Some(Arc::new(client))
            }
            None => {
                warn!("no API key for the http classifier backend; using rules only");
                None
            }
        },
    }
}

/// Wire the core components over an opened store. Must run inside a Tokio
/// runtime since the persister is spawned here.
pub fn build_state(config: &ServiceConfig, store: SqliteStore) -> Result<SharedState> {
    let worker: Arc<dyn ExecutionWorker> = match &config.worker.endpoint {
        Some(endpoint) => Arc::new(HttpWorker::new(
            endpoint.clone(),
            Some(config.server.callback_base()),
        )),
        None => Arc::new(UnconfiguredWorker),
    };
    build_state_with_worker(config, store, worker)
}

pub fn build_state_with_worker(
    config: &ServiceConfig,
    store: SqliteStore,
    worker: Arc<dyn ExecutionWorker>,
) -> Result<SharedState> {
    let shared: Arc<dyn ConversationStore> = Arc::new(store.clone());
    let persister = EventPersister::spawn(shared.clone());
    let distributor = Arc::new(
        EventDistributor::new(config.distributor_config()).with_persister(persister),
    );

    let classifier =
        IntentClassifier::new(model_client(&config.classifier), config.classifier.timeout());
    let assembler = ContextAssembler::new(shared.clone(), config.context_budget()?);

    let trigger = ExecutionTrigger::new(worker, distributor.clone());
    let service = IterationService::new(shared, classifier, assembler, trigger);

    Ok(Arc::new(AppState {
        store,
        distributor,
        service,
    }))
}

/// Start the server and run until Ctrl-C.
pub async fn start_server(config: ServiceConfig) -> Result<()> {
    let db_path = config.server.resolved_db_path();
    let store = SqliteStore::open(&db_path)
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;
    let state = build_state(&config, store)?;

    let sweeper = state.distributor.spawn_sweeper();
    let app = build_router(state.clone(), config.server.dev);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(address = %local_addr, db = %db_path.display(), "iterforge listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    sweeper.abort();
    state.distributor.flush().await;
    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl-C; shutting down");
        return;
    }
    info!("shutting down");
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::trigger::{EventSink, ExecutionRequest};
    use async_trait::async_trait;

    fn config() -> ServiceConfig {
        let mut config = ServiceConfig::default();
        config.classifier.backend = ClassifierBackend::Rules;
        config
    }

    /// In-memory state with the rule classifier and no worker.
    pub fn state() -> SharedState {
        build_state(&config(), SqliteStore::in_memory().unwrap()).unwrap()
    }

    /// Accepts every run and reports nothing; progress is posted to the
    /// events endpoint by the test, as a remote worker would.
    struct RemoteWorker;

    #[async_trait]
    impl ExecutionWorker for RemoteWorker {
        async fn execute(&self, _request: ExecutionRequest, _events: EventSink) -> anyhow::Result<()> {
            Ok(())
        }

        fn completes_inline(&self) -> bool {
            false
        }
    }

    pub fn remote_worker_state() -> SharedState {
        build_state_with_worker(&config(), SqliteStore::in_memory().unwrap(), Arc::new(RemoteWorker))
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health_via_full_router() {
        let app = build_router(test_support::state(), false);
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route_is_json_404() {
        let app = build_router(test_support::state(), false);
        let req = Request::builder()
            .uri("/api/nope")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "No route for /api/nope");
    }

    #[tokio::test]
    async fn test_dev_mode_adds_cors_headers() {
        let app = build_router(test_support::state(), true);
        let req = Request::builder()
            .uri("/health")
            .header("origin", "http://localhost:5173")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert!(resp.headers().contains_key("access-control-allow-origin"));
    }

    #[test]
    fn test_model_client_per_backend() {
        let mut section = ClassifierSection::default();
        section.backend = ClassifierBackend::Rules;
        assert!(model_client(&section).is_none());

        section.backend = ClassifierBackend::Http;
        section.api_key = None;
        assert!(model_client(&section).is_none());

        section.api_key = Some("sk-test".into());
        assert_eq!(model_client(&section).map(|c| c.name()), Some("anthropic-http"));

        section.backend = ClassifierBackend::ClaudeCli;
        assert!(model_client(&section).is_some());
    }
}
