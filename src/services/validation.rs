//! Validation service

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use super::SessionHandle;
use crate::core::ValidationRequest;
use crate::error::{Result, ServiceError};
use crate::outcome::{IssueSeverity, ValidationOutcome};

/// Runs validation requests against the current session.
///
/// The engine is read-only and shared, so calls are not serialized. A
/// semaphore bounds how many run at once, which caps the transient memory
/// of parsed resources on top of the loaded definitions.
pub struct ValidationService {
    sessions: Arc<SessionHandle>,
    permits: Arc<Semaphore>,
}

impl ValidationService {
    /// Create new validation service
    pub fn new(sessions: Arc<SessionHandle>, max_concurrent: usize) -> Self {
        Self {
            sessions,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Validation slots currently free
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Validate a translated request.
    ///
    /// The engine runs on its own task so neither a slow terminology lookup
    /// nor a large resource holds up the connection that accepted it. The
    /// permit moves with the task and is released when the engine finishes,
    /// even if the client has gone away.
    pub async fn validate(&self, request: ValidationRequest) -> Result<ValidationOutcome> {
        let session = self.sessions.current().await;
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| {
                ServiceError::ServiceUnavailable("Validation pool is closed".to_string())
            })?;

        debug!(
            media_type = %request.media_type(),
            profiles = request.profiles().len(),
            "Dispatching validation"
        );

        let started = Instant::now();
        let task = tokio::spawn(async move {
            let _permit = permit;
            session.validate(&request).await
        });

        let outcome = task
            .await
            .map_err(|e| ServiceError::Internal(format!("Validation task failed: {e}")))??;

        info!(
            success = outcome.success(),
            issues = outcome.issues().len(),
            errors = outcome.count(IssueSeverity::Error) + outcome.count(IssueSeverity::Fatal),
            warnings = outcome.count(IssueSeverity::Warning),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Validation completed"
        );

        Ok(outcome)
    }
}
