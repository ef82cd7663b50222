//! Main server implementation

use axum::{
    Router,
    extract::{DefaultBodyLimit, Request},
    http::{HeaderName, Method, header},
};
use std::time::Duration;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::{
    core::ServiceConfig,
    error::{Result, ServiceError},
    routes,
    services::AppState,
};

const REQUEST_ID: &str = "x-request-id";

/// FHIR validation HTTP server
pub struct Server {
    config: ServiceConfig,
    app_state: AppState,
}

impl Server {
    /// Create a new server instance.
    ///
    /// Fails with [`ServiceError::Init`] when the engine session cannot be
    /// built; no listener exists until this has succeeded.
    pub async fn new(config: ServiceConfig) -> Result<Self> {
        let app_state = AppState::new(&config).await?;
        Ok(Self { config, app_state })
    }

    /// Create a server around prepared application state
    pub fn with_state(app_state: AppState) -> Self {
        Self {
            config: app_state.config.as_ref().clone(),
            app_state,
        }
    }

    pub fn app_state(&self) -> &AppState {
        &self.app_state
    }

    /// The application router with all middleware applied
    pub fn router(&self) -> Router {
        create_app(self.app_state.clone())
    }

    /// Start the server
    pub async fn start(self) -> Result<()> {
        let app = self.router();
        let host = self.config.server.host.as_str();
        let port = self.config.server.port;

        let listener = tokio::net::TcpListener::bind((host, port))
            .await
            .map_err(|e| ServiceError::Init(format!("Could not bind {host}:{port}: {e}")))?;

        info!(
            address = %listener.local_addr()?,
            max_concurrent_validations = self.config.server.max_concurrent_validations,
            "Validation server listening"
        );

        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| ServiceError::Internal(format!("Server error: {e}")))?;

        info!("Server stopped gracefully");
        Ok(())
    }
}

/// Create the Axum application
pub fn create_app(state: AppState) -> Router {
    let config = state.config.clone();

    let app = Router::new()
        .merge(routes::info::create_routes())
        .merge(routes::definitions::create_routes())
        .merge(routes::validation::create_routes())
        .with_state(state);

    add_middleware_layers(app, &config)
}

/// Add middleware layers to the application
fn add_middleware_layers(mut app: Router, config: &ServiceConfig) -> Router {
    let request_id = HeaderName::from_static(REQUEST_ID);

    // Set body size limit
    app = app.layer(DefaultBodyLimit::max(config.server.max_body_size));

    // Add timeout layer
    app = app.layer(TimeoutLayer::new(Duration::from_secs(config.server.timeout)));

    // Add CORS layer if enabled
    if config.server.cors_enabled {
        app = app.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE, header::ACCEPT, header::AUTHORIZATION])
                .expose_headers([request_id.clone()]),
        );
    }

    // Request ids are assigned before the trace span is opened
    app.layer(
        ServiceBuilder::new()
            .layer(SetRequestIdLayer::new(request_id.clone(), MakeRequestUuid))
            .layer(TraceLayer::new_for_http().make_span_with(|request: &Request| {
                let request_id = request
                    .headers()
                    .get(REQUEST_ID)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");
                tracing::info_span!(
                    "request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = %request_id,
                )
            }))
            .layer(PropagateRequestIdLayer::new(request_id)),
    )
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }

    warn!("Starting graceful shutdown...");
}
