pub mod config;
pub mod types;

pub use config::{
    Args, Command, EngineConfig, FhirVersion, MonitoringConfig, ServerSettings, ServiceConfig,
    TerminologyConfig,
};
pub use types::{MediaType, ValidationRequest};
