//! # OctoFHIR Validator Service
//!
//! An HTTP service that validates FHIR resources by delegating to a
//! pluggable conformance engine.
//!
//! ## Features
//!
//! - **Engine adapter**: the service talks to a [`ValidationEngine`] only; the
//!   built-in [`ConformanceEngine`] checks resources against IG packages
//! - **Terminology mode**: binding checks go to a terminology server, or are
//!   reported as skipped when network calls are disabled
//! - **Stable wire format**: engine issues become [`ValidationOutcome`]s with
//!   fixed field names, or a FHIR OperationOutcome on request
//! - **Runtime loading**: profiles and IG packages can be added while serving,
//!   without disturbing requests already in flight
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use octofhir_validator_service::*;
//!
//! # async fn example() -> Result<()> {
//! let config = ServiceConfig::default();
//! let server = Server::new(config).await?;
//! server.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod engine;
pub mod error;
pub mod outcome;
pub mod package;
pub mod routes;
pub mod server;
pub mod services;
pub mod terminology;
pub mod translator;

pub use crate::core::{FhirVersion, MediaType, ServiceConfig, ValidationRequest};
pub use engine::{
    ConformanceEngine, EngineError, EngineErrorKind, EngineIssue, EngineSession, ValidationEngine,
};
pub use error::{Result, ServiceError};
pub use outcome::{IssueSeverity, OutcomeFormatter, ValidationIssue, ValidationOutcome};
pub use server::{Server, create_app};
pub use services::AppState;
pub use terminology::{TerminologyController, TerminologyMode};
pub use translator::{RequestTranslator, ValidationParams};
