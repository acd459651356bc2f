//! HTTP handlers for the courier server.
//!
//! A poll registers a one-shot [`Client`], answers at once when the client
//! already has a backlog, and otherwise holds the request until the fan-out
//! delivers a message or the cleanup timer closes it empty. Live messages
//! that arrive while the backlog is being read are held by the client and
//! sent after it.

use crate::config::{BusConfig, Config, StoreKind};
use crate::metrics;
use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use courier_core::{
    Client, ClientError, ConnectionManager, HandlerError, MemoryStore, MessageBus, PubSubError,
    PublishOptions, ReliablePubSub, Store,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The message bus.
    pub bus: Arc<MessageBus>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create app state over `store`.
    #[must_use]
    pub fn with_store(config: Config, store: Arc<dyn Store>) -> Self {
        let pubsub = Arc::new(ReliablePubSub::with_config(store, config.bus.pubsub_config()));

        Self {
            bus: Arc::new(MessageBus::new(pubsub)),
            config,
        }
    }

    /// Create app state over the store named in the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be opened.
    pub async fn connect(config: Config) -> Result<Self> {
        let store = open_store(&config.bus).await?;
        Ok(Self::with_store(config, store))
    }
}

/// Open the configured store backend.
///
/// # Errors
///
/// Returns an error if the store cannot be reached, or if it needs a
/// feature this build lacks.
pub async fn open_store(config: &BusConfig) -> Result<Arc<dyn Store>> {
    match config.store {
        StoreKind::Memory => {
            warn!("Using the in-process store; messages are lost on restart and not shared");
            Ok(Arc::new(MemoryStore::with_notification_capacity(
                config.notification_capacity,
            )))
        }
        #[cfg(feature = "redis")]
        StoreKind::Redis => {
            use anyhow::Context as _;
            let store =
                courier_core::RedisStore::connect(&config.redis_url, config.notification_capacity)
                    .await
                    .with_context(|| format!("Failed to connect to {}", config.redis_url))?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        StoreKind::Redis => anyhow::bail!("store = \"redis\" needs the `redis` feature"),
    }
}

/// Request failures.
#[derive(Debug, Error)]
pub enum AppError {
    /// The request is invalid.
    #[error("{0}")]
    BadRequest(String),

    /// No such handler.
    #[error(transparent)]
    NotFound(#[from] HandlerError),

    /// Anything else.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<PubSubError> for AppError {
    fn from(e: PubSubError) -> Self {
        match e {
            PubSubError::InvalidChannel(_) => Self::BadRequest(e.to_string()),
            other => Self::Internal(other.into()),
        }
    }
}

impl From<ClientError> for AppError {
    fn from(e: ClientError) -> Self {
        Self::Internal(e.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(e) => {
                error!(error = %e, "Request failed");
                metrics::record_error("internal");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// Build the HTTP routes.
pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/message-bus/:client_id/poll", post(poll_handler))
        .route("/message-bus/handle/:name", post(handle_handler))
        .route("/publish", post(publish_handler))
        .route("/stats", get(stats_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::connect(config.clone()).await?);
    info!(store = state.bus.pubsub().store_name(), "Message log ready");

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let fanout = state.bus.spawn_fanout(|_, delivered| {
        if delivered > 0 {
            metrics::record_deliveries(delivered, "live");
        }
    });

    let app = routes(state.clone());
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Courier server listening on {}", addr);
    info!("Poll endpoint: http://{}/message-bus/:client_id/poll", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.bus.clone()))
        .await?;

    if tokio::time::timeout(Duration::from_secs(5), fanout).await.is_err() {
        warn!("Fan-out subscriber did not stop in time");
    }
    Ok(())
}

async fn shutdown_signal(bus: Arc<MessageBus>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }

    info!("Shutting down");
    if let Err(e) = bus.shutdown().await {
        error!(error = %e, "Failed to stop message bus");
    }
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Bus statistics handler.
async fn stats_handler(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, AppError> {
    let pubsub = state.bus.pubsub();
    Ok(Json(serde_json::json!({
        "site_id": pubsub.site_id(),
        "global_last_id": pubsub.global_last_id().await?,
        "connections": state.bus.connections().stats(),
    })))
}

/// Poll query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct PollParams {
    /// Authenticated user.
    pub user_id: Option<u64>,
}

/// Removes a client from the registry when its request ends, whether it
/// was answered or the connection dropped.
struct Registration {
    connections: Arc<ConnectionManager>,
    client: Arc<Client>,
}

impl Registration {
    fn new(connections: Arc<ConnectionManager>, client: Arc<Client>) -> Self {
        connections.add_client(client.clone());
        metrics::set_waiting_clients(connections.client_count());
        Self {
            connections,
            client,
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.connections.remove_client(&self.client);
        self.client.cancel_cleanup_timer();
        metrics::set_waiting_clients(self.connections.client_count());
    }
}

/// Long-poll handler.
///
/// The body maps channels to the last id seen on each; `null` means
/// "from now" and `-1` asks for the head id through a status message.
async fn poll_handler(
    State(state): State<Arc<AppState>>,
    Path(client_id): Path<String>,
    Query(params): Query<PollParams>,
    Json(channels): Json<BTreeMap<String, Option<i64>>>,
) -> Result<Response, AppError> {
    metrics::record_poll();

    let max_channels = state.config.long_poll.max_channels_per_client;
    if channels.len() > max_channels {
        return Err(AppError::BadRequest(format!(
            "Too many channels: {} (max {max_channels})",
            channels.len()
        )));
    }

    let mut client =
        Client::new(client_id.as_str(), state.bus.pubsub().clone()).with_user_id(params.user_id);
    for (channel, last_seen_id) in channels {
        client.subscribe(channel, last_seen_id).await?;
    }
    let client = Arc::new(client);
    let response = client.attach_response();

    // Registered before reading the backlog so nothing published in between
    // is missed; priming keeps such messages behind the backlog.
    client.start_priming();
    let _registration = Registration::new(state.bus.connections().clone(), client.clone());

    let backlog = client.backlog().await?;
    let pending = backlog.len();
    if client.finish_priming(backlog)? {
        metrics::record_deliveries(pending, "backlog");
    } else {
        let timeout = state.config.long_poll.timeout();
        let waiting = Arc::downgrade(&client);
        client.set_cleanup_timer(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(client) = waiting.upgrade() {
                client.close();
            }
        }));
    }

    let body = response.await.unwrap_or_else(|_| "[]".to_string());
    let elapsed = client.age();
    metrics::record_poll_duration(elapsed);
    debug!(client = %client_id, elapsed_ms = elapsed.as_millis() as u64, "Poll answered");

    Ok(([(header::CONTENT_TYPE, "application/json")], body).into_response())
}

/// Publish request body.
#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    /// Channel to publish on.
    pub channel: String,
    /// Payload, stored as JSON text.
    pub data: serde_json::Value,
    /// Restrict delivery to these users.
    pub user_ids: Option<Vec<u64>>,
    /// Override the channel's retained backlog size.
    pub max_backlog_size: Option<usize>,
}

/// Publish handler.
async fn publish_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PublishRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let data = request.data.to_string();
    let bytes = data.len();

    let mut options = match request.user_ids {
        Some(user_ids) => PublishOptions::for_users(user_ids),
        None => PublishOptions::default(),
    };
    options.max_backlog_size = request.max_backlog_size;

    let message_id = state.bus.publish(&request.channel, data, options).await?;
    metrics::record_publish(bytes);

    Ok(Json(serde_json::json!({ "message_id": message_id })))
}

/// Named handler invocation.
async fn handle_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(params): Query<PollParams>,
    body: String,
) -> Result<Json<serde_json::Value>, AppError> {
    let site_id = state.bus.pubsub().site_id();
    let value = state
        .bus
        .handlers()
        .call(site_id, &name, &body, params.user_id)?;
    Ok(Json(value))
}
