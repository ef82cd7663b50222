//! Terminology mode controller.
//!
//! Decides, once per process, whether binding checks may reach a terminology
//! server. With terminology disabled the controller holds no service at all,
//! so a binding check can only ever produce a "skipped" information issue.
//! With terminology enabled every call is bounded by a timeout, retried once on
//! transient failure, and degraded to a warning when the server cannot answer.
//! The calls made for one resource run with a fixed concurrency cap.

pub mod service;
pub mod tx_client;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::core::TerminologyConfig;
use crate::engine::{EngineIssue, EngineLevel, IssueType};

pub use service::{
    CachedTerminologyService, CodeCheck, CodeValidationResult, InMemoryTerminologyService,
    TerminologyError, TerminologyResult, TerminologyService,
};
pub use tx_client::TxServerClient;

/// Whether terminology server calls are permitted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminologyMode {
    #[default]
    Enabled,
    Disabled,
}

impl std::fmt::Display for TerminologyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminologyMode::Enabled => write!(f, "enabled"),
            TerminologyMode::Disabled => write!(f, "disabled"),
        }
    }
}

/// Strength of a value set binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingStrength {
    Required,
    Extensible,
    Preferred,
    Example,
}

impl BindingStrength {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "required" => Some(BindingStrength::Required),
            "extensible" => Some(BindingStrength::Extensible),
            "preferred" => Some(BindingStrength::Preferred),
            "example" => Some(BindingStrength::Example),
            _ => None,
        }
    }
}

/// A coded value found by the engine that needs a terminology answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingCheck {
    /// Path of the coded element, e.g. `Patient.maritalStatus.coding[0]`
    pub location: String,
    pub system: Option<String>,
    pub code: String,
    pub display: Option<String>,
    pub value_set: Option<String>,
    pub strength: Option<BindingStrength>,
}

impl BindingCheck {
    fn describe(&self) -> String {
        match &self.system {
            Some(system) => format!("{system}#{}", self.code),
            None => self.code.clone(),
        }
    }

    fn code_check(&self) -> CodeCheck {
        CodeCheck {
            system: self.system.clone(),
            code: self.code.clone(),
            display: self.display.clone(),
            value_set: self.value_set.clone(),
        }
    }
}

enum Backend {
    Disabled,
    Enabled(Arc<dyn TerminologyService>),
}

const DEFAULT_MAX_CONCURRENT_CHECKS: usize = 8;

/// Process-wide terminology policy, fixed at construction
pub struct TerminologyController {
    backend: Backend,
    timeout: Duration,
    retries: u32,
    display_issues_are_warnings: bool,
    max_concurrent_checks: usize,
}

impl TerminologyController {
    /// A controller that never calls a terminology service
    pub fn disabled() -> Self {
        Self {
            backend: Backend::Disabled,
            timeout: Duration::ZERO,
            retries: 0,
            display_issues_are_warnings: false,
            max_concurrent_checks: DEFAULT_MAX_CONCURRENT_CHECKS,
        }
    }

    /// A controller that checks codes through `service`
    pub fn enabled(service: Arc<dyn TerminologyService>, timeout: Duration) -> Self {
        Self {
            backend: Backend::Enabled(service),
            timeout,
            retries: 1,
            display_issues_are_warnings: false,
            max_concurrent_checks: DEFAULT_MAX_CONCURRENT_CHECKS,
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_display_issues_as_warnings(mut self, warnings: bool) -> Self {
        self.display_issues_are_warnings = warnings;
        self
    }

    /// Cap the terminology calls one `check_all` keeps in flight (at least one)
    pub fn with_max_concurrent_checks(mut self, limit: usize) -> Self {
        self.max_concurrent_checks = limit.max(1);
        self
    }

    /// Build the controller described by the configuration.
    ///
    /// Enabled mode talks to the configured server through a result cache.
    pub fn from_config(config: &TerminologyConfig) -> TerminologyResult<Self> {
        let controller = match config.mode {
            TerminologyMode::Disabled => Self::disabled(),
            TerminologyMode::Enabled => {
                let client = TxServerClient::new(&config.server_url, config.timeout())?;
                let cached = CachedTerminologyService::new(
                    Arc::new(client),
                    Duration::from_secs(config.cache_ttl),
                    config.cache_size,
                );
                Self::enabled(Arc::new(cached), config.timeout()).with_retries(config.retries)
            }
        };
        Ok(controller
            .with_display_issues_as_warnings(config.display_issues_are_warnings)
            .with_max_concurrent_checks(config.max_concurrent_checks))
    }

    pub fn mode(&self) -> TerminologyMode {
        match self.backend {
            Backend::Disabled => TerminologyMode::Disabled,
            Backend::Enabled(_) => TerminologyMode::Enabled,
        }
    }

    /// Check every binding, at most `max_concurrent_checks` at a time.
    /// Results line up with `checks`.
    pub async fn check_all(&self, checks: &[BindingCheck]) -> Vec<Option<EngineIssue>> {
        let pending: Vec<_> = checks.iter().map(|check| self.check(check)).collect();
        futures::stream::iter(pending)
            .buffered(self.max_concurrent_checks)
            .collect()
            .await
    }

    /// Check one binding, returning the issue it produces, if any
    pub async fn check(&self, check: &BindingCheck) -> Option<EngineIssue> {
        let service = match &self.backend {
            Backend::Disabled => return Some(skipped_issue(check)),
            Backend::Enabled(service) => service,
        };

        match self.call_with_retry(service.as_ref(), &check.code_check()).await {
            Ok(result) => self.judge(check, &result),
            Err(error) => {
                warn!(
                    code = %check.describe(),
                    error = %error,
                    "Terminology check degraded to a warning"
                );
                let issue_type = match error {
                    TerminologyError::Timeout(_) => IssueType::Timeout,
                    _ => IssueType::Exception,
                };
                Some(
                    EngineIssue::warning(
                        issue_type,
                        &check.location,
                        format!("Unable to check code '{}': {error}", check.describe()),
                    )
                    .with_message_id("TX_UNAVAILABLE"),
                )
            }
        }
    }

    async fn call_with_retry(
        &self,
        service: &dyn TerminologyService,
        request: &CodeCheck,
    ) -> TerminologyResult<CodeValidationResult> {
        let mut attempt = 0;
        loop {
            let error =
                match tokio::time::timeout(self.timeout, service.validate_code(request)).await {
                    Ok(Ok(result)) => return Ok(result),
                    Ok(Err(error)) => error,
                    Err(_) => TerminologyError::Timeout(self.timeout),
                };

            if !error.is_transient() || attempt >= self.retries {
                return Err(error);
            }
            attempt += 1;
            debug!(code = %request.code, attempt, error = %error, "Retrying terminology call");
        }
    }

    fn judge(&self, check: &BindingCheck, result: &CodeValidationResult) -> Option<EngineIssue> {
        if !result.valid {
            let level = match check.strength {
                Some(BindingStrength::Example) => return None,
                Some(BindingStrength::Extensible) | Some(BindingStrength::Preferred) => {
                    EngineLevel::Warning
                }
                Some(BindingStrength::Required) | None => EngineLevel::Error,
            };
            let message = result.message.clone().unwrap_or_else(|| match &check.value_set {
                Some(value_set) => format!(
                    "The code '{}' is not in the value set '{value_set}'",
                    check.describe()
                ),
                None => format!("Unknown code '{}'", check.describe()),
            });
            return Some(
                EngineIssue::new(level, IssueType::CodeInvalid, &check.location, message)
                    .with_message_id("TX_CODE_INVALID"),
            );
        }

        match (&check.display, &result.display) {
            (Some(given), Some(expected)) if !given.eq_ignore_ascii_case(expected) => {
                let level = if self.display_issues_are_warnings {
                    EngineLevel::Warning
                } else {
                    EngineLevel::Error
                };
                Some(
                    EngineIssue::new(
                        level,
                        IssueType::Invalid,
                        &check.location,
                        format!(
                            "Wrong display '{given}' for {}, should be '{expected}'",
                            check.describe()
                        ),
                    )
                    .with_message_id("TX_DISPLAY_MISMATCH"),
                )
            }
            _ => None,
        }
    }
}

fn skipped_issue(check: &BindingCheck) -> EngineIssue {
    let target = check
        .value_set
        .as_deref()
        .or(check.system.as_deref())
        .unwrap_or("its code system");
    EngineIssue::information(
        IssueType::Informational,
        &check.location,
        format!(
            "Terminology check skipped: code '{}' could not be verified against {target} \
             because terminology server calls are disabled",
            check.describe()
        ),
    )
    .with_message_id("TX_CHECK_SKIPPED")
}
