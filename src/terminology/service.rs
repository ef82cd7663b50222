//! Terminology services used for binding checks.
//!
//! - `TerminologyService` trait defines the interface
//! - `CachedTerminologyService` wraps any service with TTL-based caching
//! - `InMemoryTerminologyService` answers from in-memory value sets

use async_trait::async_trait;
use moka::future::Cache;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while asking a terminology service
#[derive(Debug, Clone, Error)]
pub enum TerminologyError {
    /// Value set was not found
    #[error("Value set not found: {url}")]
    ValueSetNotFound { url: String },

    /// The service did not answer in time
    #[error("Terminology service did not respond within {0:?}")]
    Timeout(Duration),

    /// Network or communication error
    #[error("Network error: {0}")]
    Network(String),

    /// Service answered with a server-side failure
    #[error("Terminology service unavailable: {message}")]
    ServiceUnavailable { message: String },

    /// Service refused the request
    #[error("Terminology service rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TerminologyError {
    /// Whether a retry could plausibly succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TerminologyError::Timeout(_)
                | TerminologyError::Network(_)
                | TerminologyError::ServiceUnavailable { .. }
        )
    }
}

/// Result type for terminology operations
pub type TerminologyResult<T> = Result<T, TerminologyError>;

/// A code to check, optionally against a value set
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CodeCheck {
    pub system: Option<String>,
    pub code: String,
    pub display: Option<String>,
    pub value_set: Option<String>,
}

/// Result of validating a code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeValidationResult {
    /// Whether the code is valid
    pub valid: bool,
    /// Display text for the code (if found)
    pub display: Option<String>,
    /// Explanation supplied by the service
    pub message: Option<String>,
}

impl CodeValidationResult {
    /// Create a valid result
    pub fn valid() -> Self {
        Self {
            valid: true,
            display: None,
            message: None,
        }
    }

    /// Create a valid result with display
    pub fn valid_with_display(display: impl Into<String>) -> Self {
        Self {
            valid: true,
            display: Some(display.into()),
            message: None,
        }
    }

    /// Create an invalid result
    pub fn invalid() -> Self {
        Self {
            valid: false,
            display: None,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Trait for terminology validation services.
///
/// Implementations can connect to FHIR terminology servers or answer from
/// memory. The trait is async to support network-based services.
#[async_trait]
pub trait TerminologyService: Send + Sync {
    /// Validate a code against its value set, or against its code system
    /// when no value set is given.
    async fn validate_code(&self, check: &CodeCheck) -> TerminologyResult<CodeValidationResult>;
}

/// A cached wrapper around a TerminologyService.
///
/// Only successful answers are cached; failures always reach the inner
/// service again on the next call.
pub struct CachedTerminologyService {
    inner: Arc<dyn TerminologyService>,
    cache: Cache<CodeCheck, CodeValidationResult>,
}

impl CachedTerminologyService {
    pub fn new(inner: Arc<dyn TerminologyService>, ttl: Duration, max_size: u64) -> Self {
        let cache = Cache::builder()
            .time_to_live(ttl)
            .max_capacity(max_size)
            .build();

        Self { inner, cache }
    }

    /// Number of cached answers
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Clear all cached entries
    pub fn clear_cache(&self) {
        self.cache.invalidate_all();
    }
}

#[async_trait]
impl TerminologyService for CachedTerminologyService {
    async fn validate_code(&self, check: &CodeCheck) -> TerminologyResult<CodeValidationResult> {
        if let Some(result) = self.cache.get(check).await {
            return Ok(result);
        }

        let result = self.inner.validate_code(check).await?;
        self.cache.insert(check.clone(), result.clone()).await;

        Ok(result)
    }
}

/// Type alias for code map: (code, system) -> display
type CodeMap = HashMap<(String, Option<String>), Option<String>>;

/// A simple in-memory terminology service.
///
/// Value sets map to valid codes; code systems are the union of the codes
/// registered under their system URL.
#[derive(Debug, Default)]
pub struct InMemoryTerminologyService {
    value_sets: HashMap<String, CodeMap>,
}

impl InMemoryTerminologyService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a code to a value set
    pub fn add_code(
        &mut self,
        value_set_url: &str,
        code: &str,
        system: Option<&str>,
        display: Option<&str>,
    ) {
        self.value_sets
            .entry(value_set_url.to_string())
            .or_default()
            .insert(
                (code.to_string(), system.map(str::to_string)),
                display.map(str::to_string),
            );
    }

    fn lookup(&self, codes: &CodeMap, check: &CodeCheck) -> Option<Option<String>> {
        if let Some(display) = codes.get(&(check.code.clone(), check.system.clone())) {
            return Some(display.clone());
        }
        // Loose matching when the caller gave no system
        if check.system.is_none() {
            return codes
                .iter()
                .find(|((code, _), _)| *code == check.code)
                .map(|(_, display)| display.clone());
        }
        codes.get(&(check.code.clone(), None)).cloned()
    }
}

#[async_trait]
impl TerminologyService for InMemoryTerminologyService {
    async fn validate_code(&self, check: &CodeCheck) -> TerminologyResult<CodeValidationResult> {
        let found = match (&check.value_set, &check.system) {
            (Some(url), _) => {
                let codes = self
                    .value_sets
                    .get(url)
                    .ok_or_else(|| TerminologyError::ValueSetNotFound { url: url.clone() })?;
                self.lookup(codes, check)
            }
            (None, Some(system)) => self.value_sets.values().find_map(|codes| {
                codes
                    .get(&(check.code.clone(), Some(system.clone())))
                    .cloned()
            }),
            (None, None) => None,
        };

        Ok(match found {
            Some(Some(display)) => CodeValidationResult::valid_with_display(display),
            Some(None) => CodeValidationResult::valid(),
            None => CodeValidationResult::invalid(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const GENDER_VS: &str = "http://hl7.org/fhir/ValueSet/administrative-gender";
    const GENDER_CS: &str = "http://hl7.org/fhir/administrative-gender";

    fn check(system: Option<&str>, code: &str, value_set: Option<&str>) -> CodeCheck {
        CodeCheck {
            system: system.map(str::to_string),
            code: code.to_string(),
            display: None,
            value_set: value_set.map(str::to_string),
        }
    }

    fn gender_service() -> InMemoryTerminologyService {
        let mut service = InMemoryTerminologyService::new();
        service.add_code(GENDER_VS, "male", Some(GENDER_CS), Some("Male"));
        service.add_code(GENDER_VS, "female", Some(GENDER_CS), Some("Female"));
        service
    }

    #[tokio::test]
    async fn test_in_memory_value_set() {
        let service = gender_service();

        let result = service
            .validate_code(&check(Some(GENDER_CS), "male", Some(GENDER_VS)))
            .await
            .unwrap();
        assert!(result.valid);
        assert_eq!(result.display, Some("Male".to_string()));

        let result = service
            .validate_code(&check(Some(GENDER_CS), "unknown", Some(GENDER_VS)))
            .await
            .unwrap();
        assert!(!result.valid);

        // No system given: loose match on the code alone
        let result = service
            .validate_code(&check(None, "female", Some(GENDER_VS)))
            .await
            .unwrap();
        assert!(result.valid);
    }

    #[tokio::test]
    async fn test_in_memory_code_system_lookup() {
        let service = gender_service();

        let result = service
            .validate_code(&check(Some(GENDER_CS), "female", None))
            .await
            .unwrap();
        assert!(result.valid);

        let result = service
            .validate_code(&check(Some("http://example.org/other"), "female", None))
            .await
            .unwrap();
        assert!(!result.valid);
    }

    #[tokio::test]
    async fn test_unknown_value_set() {
        let service = gender_service();
        let err = service
            .validate_code(&check(None, "x", Some("http://example.org/vs")))
            .await
            .unwrap_err();
        assert!(matches!(err, TerminologyError::ValueSetNotFound { .. }));
        assert!(!err.is_transient());
    }

    struct CountingService {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TerminologyService for CountingService {
        async fn validate_code(
            &self,
            _check: &CodeCheck,
        ) -> TerminologyResult<CodeValidationResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(CodeValidationResult::valid())
        }
    }

    #[tokio::test]
    async fn test_cached_service() {
        let inner = Arc::new(CountingService {
            calls: AtomicUsize::new(0),
        });
        let cached = CachedTerminologyService::new(inner.clone(), Duration::from_secs(60), 100);
        let request = check(Some(GENDER_CS), "male", None);

        assert!(cached.validate_code(&request).await.unwrap().valid);
        assert!(cached.validate_code(&request).await.unwrap().valid);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        // Sync the cache to ensure stats are updated (moka is eventually consistent)
        cached.cache.run_pending_tasks().await;
        assert_eq!(cached.entry_count(), 1);
    }

    #[test]
    fn test_transient_errors() {
        assert!(TerminologyError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(TerminologyError::Network("reset".into()).is_transient());
        assert!(
            !TerminologyError::Rejected {
                status: 400,
                message: "bad".into()
            }
            .is_transient()
        );
    }
}
