//! Application state management

use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::{DefinitionService, SessionHandle, ValidationService};
use crate::core::ServiceConfig;
use crate::engine::EngineSession;
use crate::engine::session::package_loader;
use crate::error::{Result, ServiceError};
use crate::terminology::TerminologyController;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Service configuration
    pub config: Arc<ServiceConfig>,

    /// Current engine session
    pub sessions: Arc<SessionHandle>,

    /// Validation service
    pub validation_service: Arc<ValidationService>,

    /// Introspection and runtime definition loading
    pub definition_service: Arc<DefinitionService>,

    /// When the service finished initializing
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Create new application state.
    ///
    /// Builds the terminology controller and the engine session; nothing is
    /// returned until both are fully initialized.
    pub async fn new(config: &ServiceConfig) -> Result<Self> {
        let terminology = TerminologyController::from_config(&config.terminology)
            .map_err(|e| ServiceError::Init(format!("Terminology setup failed: {e}")))?;

        let session = EngineSession::initialize(&config.engine, terminology).await?;
        Self::with_session(config.clone(), session)
    }

    /// Create application state around an already initialized session
    pub fn with_session(config: ServiceConfig, session: EngineSession) -> Result<Self> {
        let loader = package_loader(&config.engine)?;
        let sessions = Arc::new(SessionHandle::new(session));

        let validation_service = Arc::new(ValidationService::new(
            sessions.clone(),
            config.server.max_concurrent_validations,
        ));
        let definition_service = Arc::new(DefinitionService::new(sessions.clone(), loader));

        Ok(Self {
            config: Arc::new(config),
            sessions,
            validation_service,
            definition_service,
            started_at: Utc::now(),
        })
    }

    /// Get the session new requests are served with
    pub async fn session(&self) -> Arc<EngineSession> {
        self.sessions.current().await
    }
}
