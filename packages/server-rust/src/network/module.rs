//! HTTP/`WebSocket` server with deferred startup.
//!
//! `new()` wires the router state, `start()` binds the listener, and
//! `serve()` accepts connections until the shutdown future resolves.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::NetworkConfig;
use super::connection::{ConnectionRegistry, OutboundMessage};
use super::handlers::{
    chat_log_handler, chat_upgrade_handler, health_handler, liveness_handler, query_list_handler,
    readiness_handler, save_query_handler, AppState,
};
use super::middleware::build_http_layers;
use super::shutdown::ShutdownController;
use crate::service::error::ConfigError;
use crate::service::lifecycle::Lifecycle;

/// Owns the listener and the router state.
pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    state: AppState,
}

impl NetworkModule {
    /// Wires the flows of `lifecycle` into a router state. Binds nothing.
    ///
    /// # Errors
    ///
    /// Fails if the lifecycle's configuration cannot be wired into flows.
    pub fn new(config: NetworkConfig, lifecycle: &Lifecycle) -> Result<Self, ConfigError> {
        let state = AppState {
            services: Arc::new(lifecycle.services()?),
            resources: lifecycle.resources(),
            connections: lifecycle.connections(),
            shutdown: lifecycle.shutdown_controller(),
            config: Arc::new(config.clone()),
            start_time: Instant::now(),
        };
        Ok(Self {
            config,
            listener: None,
            state,
        })
    }

    #[must_use]
    pub fn connections(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.state.connections)
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.state.shutdown)
    }

    /// Routes:
    /// - `POST /saveQuery` -- save-and-enrich pipeline
    /// - `GET /queryList`, `GET /chatLog` -- JSON listings
    /// - `GET /websocket/chat` -- chat room
    /// - `GET /health`, `/health/live`, `/health/ready`
    pub fn build_router(&self) -> Router {
        Router::new()
            .route("/saveQuery", post(save_query_handler))
            .route("/queryList", get(query_list_handler))
            .route("/chatLog", get(chat_log_handler))
            .route("/websocket/chat", get(chat_upgrade_handler))
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .layer(build_http_layers(&self.config))
            .with_state(self.state.clone())
    }

    /// Binds the listener and returns the bound port (useful with port 0).
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        info!("TCP listener bound to {}:{}", self.config.host, port);

        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves until `shutdown` resolves, then drains.
    ///
    /// When `shutdown` resolves the controller moves to `Draining` (chat
    /// fan-out stops, `WebSocket` loops close) and the listener stops
    /// accepting. After the server returns, remaining connections get a close
    /// frame and in-flight requests get up to `drain_timeout` to finish.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called or the server hits a
    /// fatal I/O error.
    pub async fn serve(
        mut self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow::anyhow!("start() must be called before serve()"))?;
        let router = self.build_router();
        let controller = Arc::clone(&self.state.shutdown);

        controller.set_ready();
        info!("serving HTTP/WS connections");

        let signal_controller = Arc::clone(&controller);
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown.await;
                signal_controller.trigger_shutdown();
            })
            .await?;

        drain_connections(&self.state.connections, &controller, &self.config).await;
        Ok(())
    }
}

/// Closes every remaining connection and waits for in-flight requests.
async fn drain_connections(
    connections: &ConnectionRegistry,
    controller: &ShutdownController,
    config: &NetworkConfig,
) {
    controller.trigger_shutdown();

    let handles = connections.drain_all();
    if !handles.is_empty() {
        info!("Draining {} connections", handles.len());
        for handle in &handles {
            let _ = handle.try_send(OutboundMessage::Close(Some(
                "server shutting down".to_string(),
            )));
        }
    }

    if controller.wait_for_drain(config.drain_timeout).await {
        info!("All connections drained successfully");
    } else {
        warn!("Drain timeout expired with in-flight requests remaining");
    }
}
