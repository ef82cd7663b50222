//! Engine adapter: the boundary between the service and the conformance engine.
//!
//! The service never evaluates conformance rules itself. It talks to a
//! [`ValidationEngine`] through the types in this module, which play the role
//! of the engine's native issue model. The outcome formatter translates them
//! into the stable wire representation, so an engine upgrade never changes what
//! clients see.
//!
//! - [`ValidationEngine`] - the pluggable capability
//! - [`EngineSession`] - an initialized engine shared read-only by all requests
//! - [`ConformanceEngine`] - the built-in package-backed implementation

pub mod base;
pub mod conformance;
pub mod definitions;
pub mod resource;
pub mod session;

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

use crate::core::ValidationRequest;
use crate::package::FhirPackage;

pub use conformance::ConformanceEngine;
pub use definitions::{DefinitionSet, ElementBinding, ElementDefinition, StructureSummary};
pub use session::EngineSession;

/// Issue level as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineLevel {
    Fatal,
    Error,
    Warning,
    Information,
    Hint,
}

/// Issue category as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum IssueType {
    Invalid,
    Structure,
    Required,
    Value,
    CodeInvalid,
    NotFound,
    NotSupported,
    Processing,
    Informational,
    Exception,
    Timeout,
}

impl IssueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueType::Invalid => "invalid",
            IssueType::Structure => "structure",
            IssueType::Required => "required",
            IssueType::Value => "value",
            IssueType::CodeInvalid => "code-invalid",
            IssueType::NotFound => "not-found",
            IssueType::NotSupported => "not-supported",
            IssueType::Processing => "processing",
            IssueType::Informational => "informational",
            IssueType::Exception => "exception",
            IssueType::Timeout => "timeout",
        }
    }
}

/// A message produced by the engine for one validation call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineIssue {
    pub level: EngineLevel,
    pub issue_type: IssueType,
    /// Path into the resource, e.g. `Patient.name[0].given`
    pub location: String,
    pub message: String,
    /// Stable engine message identifier, when the engine provides one
    pub message_id: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl EngineIssue {
    pub fn new(
        level: EngineLevel,
        issue_type: IssueType,
        location: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            level,
            issue_type,
            location: location.into(),
            message: message.into(),
            message_id: None,
            line: None,
            column: None,
        }
    }

    pub fn error(
        issue_type: IssueType,
        location: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(EngineLevel::Error, issue_type, location, message)
    }

    pub fn warning(
        issue_type: IssueType,
        location: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(EngineLevel::Warning, issue_type, location, message)
    }

    pub fn information(
        issue_type: IssueType,
        location: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(EngineLevel::Information, issue_type, location, message)
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_position(mut self, line: u32, column: u32) -> Self {
        self.line = Some(line);
        self.column = Some(column);
        self
    }
}

/// Why the engine refused to process a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorKind {
    /// The content is not a resource the engine knows
    UnsupportedResourceType,
    /// The request names a FHIR version the session was not built for
    UnsupportedVersion,
    /// The content could not be interpreted as a resource
    Unprocessable,
    /// The engine does not offer the requested operation
    Unsupported,
    /// The engine failed internally
    Internal,
}

/// Invocation-level engine failure
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub message: String,
    /// Issues explaining the failure, in engine order
    pub issues: Vec<EngineIssue>,
}

impl EngineError {
    pub fn new(kind: EngineErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            issues: Vec::new(),
        }
    }

    /// Build an error that carries a single explanatory issue with the same text
    pub fn with_issue(kind: EngineErrorKind, issue: EngineIssue) -> Self {
        Self {
            kind,
            message: issue.message.clone(),
            issues: vec![issue],
        }
    }

    pub fn unsupported(operation: &str) -> Self {
        Self::new(
            EngineErrorKind::Unsupported,
            format!("The validation engine does not support {operation}"),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Internal, message)
    }
}

/// Name and version of an engine implementation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineInfo {
    pub name: String,
    pub version: String,
}

/// Summary of a package known to an engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageSummary {
    pub id: String,
    pub version: String,
    pub canonical: Option<String>,
    /// StructureDefinition URLs contributed by the package, sorted
    pub profiles: Vec<String>,
}

/// Definitions to add when deriving an extended engine
#[derive(Debug, Default, Clone)]
pub struct DefinitionAdditions {
    pub packages: Vec<FhirPackage>,
    /// Standalone conformance resources (StructureDefinitions) as JSON
    pub resources: Vec<serde_json::Value>,
}

impl DefinitionAdditions {
    pub fn package(package: FhirPackage) -> Self {
        Self {
            packages: vec![package],
            resources: Vec::new(),
        }
    }

    pub fn resource(resource: serde_json::Value) -> Self {
        Self {
            packages: Vec::new(),
            resources: vec![resource],
        }
    }
}

/// The conformance-checking capability the service delegates to.
///
/// Implementations hold their loaded definitions and must be safe to call
/// concurrently through a shared reference. `validate` must not change any
/// state visible to later calls: the same request always yields the same
/// issues, terminology-server answers aside.
#[async_trait]
pub trait ValidationEngine: Send + Sync {
    /// Name and version of the engine
    fn info(&self) -> EngineInfo;

    /// Validate one request, returning issues in the order the engine found them
    async fn validate(
        &self,
        request: &ValidationRequest,
    ) -> Result<Vec<EngineIssue>, EngineError>;

    /// Resource type names known to the engine, sorted and distinct
    fn resource_types(&self) -> Vec<String>;

    /// StructureDefinition URLs known to the engine, sorted and distinct
    fn structures(&self) -> Vec<String>;

    /// Packages loaded into the engine
    fn packages(&self) -> Vec<PackageSummary>;

    /// Derive a new engine with additional definitions.
    ///
    /// The receiver is left untouched; callers swap the returned engine in.
    fn extend(
        &self,
        additions: DefinitionAdditions,
    ) -> Result<Arc<dyn ValidationEngine>, EngineError> {
        let _ = additions;
        Err(EngineError::unsupported("loading definitions at runtime"))
    }
}
