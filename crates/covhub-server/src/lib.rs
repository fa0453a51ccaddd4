//! Coverage registry HTTP server
//!
//! Serves the agent tunnel and watch sockets, the `/v2` query API and the
//! legacy `/v1` service API on a single axum router.

pub mod config;
pub mod handlers;
pub mod legacy;
pub mod models;
pub mod socket;
pub mod tunnel;
pub mod watch;

use axum::{
    routing::{get, post},
    Json, Router,
};
use std::future::Future;
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;

use covhub_control::{
    AgentRegistry, ControlPlane, FileStore, MemoryStore, ServiceStore, TaskTracker, WatchHub,
};
use covhub_proto::{TUNNEL_PATH, WATCH_PUSH_PATH, WATCH_SUBSCRIBE_PATH};

pub use config::{KeepaliveConfig, ServerConfig, StoreConfig};

/// Application state shared across handlers
pub struct AppState {
    pub control: ControlPlane,
    pub registry: Arc<AgentRegistry>,
    pub hub: WatchHub,
    pub tasks: TaskTracker,
    pub config: ServerConfig,
}

impl AppState {
    /// Close every socket and stop the watch hub
    pub fn shutdown(&self) {
        let agents = self.registry.drain();
        self.hub.shutdown();
        self.tasks.abort_all();
        info!(agents = agents.len(), "Registry shut down");
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Covhub API",
        version = "0.1.0",
        description = "Live coverage collection registry"
    ),
    paths(
        handlers::list_agents,
        handlers::delete_agents,
        handlers::get_profile,
        handlers::clear_profile,
        tunnel::tunnel_handler,
        watch::watch_push_handler,
        watch::watch_subscribe_handler,
        legacy::register_service,
        legacy::list_services,
        legacy::init_services,
        legacy::get_profile,
        legacy::clear_services,
        legacy::remove_services,
    ),
    components(
        schemas(
            models::Agent,
            models::AgentList,
            models::DeleteAgentsResponse,
            models::ProfileResponse,
            models::ClearFailure,
            models::ClearResponse,
            models::LegacyResult,
            models::ServiceMap,
            models::ProfileRequest,
            models::ErrorResponse,
        )
    ),
    tags(
        (name = "agents", description = "Registered agents"),
        (name = "cover", description = "Coverage profiles and watch events"),
        (name = "internal", description = "Agent sockets"),
        (name = "legacy", description = "Services registered by address")
    )
)]
pub struct ApiDoc;

/// Coverage registry server
pub struct ApiServer {
    state: Arc<AppState>,
}

impl ApiServer {
    /// Build the shared state; must run inside a tokio runtime
    pub fn new(config: ServerConfig) -> anyhow::Result<Self> {
        let store: Arc<dyn ServiceStore> = match &config.store {
            StoreConfig::Memory => Arc::new(MemoryStore::new()),
            StoreConfig::File(path) => Arc::new(FileStore::open(path)?),
        };
        let registry = Arc::new(AgentRegistry::new());
        let control = ControlPlane::new(registry.clone(), store, config.rpc_timeout);

        let state = Arc::new(AppState {
            control,
            registry,
            hub: WatchHub::start(config.watch_queue_capacity),
            tasks: TaskTracker::new(),
            config,
        });
        Ok(Self { state })
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        let v2 = Router::new()
            .route(
                "/v2/agents",
                get(handlers::list_agents).delete(handlers::delete_agents),
            )
            .route(
                "/v2/cover/profile",
                get(handlers::get_profile).delete(handlers::clear_profile),
            )
            .route(WATCH_SUBSCRIBE_PATH, get(watch::watch_subscribe_handler))
            .route(TUNNEL_PATH, get(tunnel::tunnel_handler))
            .route(WATCH_PUSH_PATH, get(watch::watch_push_handler))
            .route("/v2/openapi.json", get(|| async { Json(ApiDoc::openapi()) }));

        let v1 = Router::new()
            .route("/v1/cover/register", post(legacy::register_service))
            .route("/v1/cover/list", get(legacy::list_services))
            .route("/v1/cover/init", post(legacy::init_services))
            .route("/v1/cover/profile", post(legacy::get_profile))
            .route("/v1/cover/clear", post(legacy::clear_services))
            .route("/v1/cover/remove", post(legacy::remove_services));

        v2.merge(v1)
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Serve on `listener` until `shutdown` resolves
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self.build_router();
        let state = self.state.clone();
        info!("Coverage registry listening on {}", listener.local_addr()?);

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("Shutting down");
            state.shutdown();
        })
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        Ok(())
    }

    /// Bind the configured address and serve until Ctrl-C
    pub async fn start(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.state.config.bind_addr).await?;
        self.serve(listener, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_generation() {
        let doc = ApiDoc::openapi();
        let paths = &doc.paths.paths;
        assert!(paths.contains_key("/v2/cover/profile"));
        assert!(paths.contains_key("/v1/cover/register"));
        assert!(paths.contains_key(TUNNEL_PATH));
    }
}
