//! Service configuration management

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, ServiceError};
use crate::terminology::TerminologyMode;

/// Service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// HTTP server settings
    #[serde(default)]
    pub server: ServerSettings,

    /// Engine and IG package settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Terminology server settings
    #[serde(default)]
    pub terminology: TerminologyConfig,

    /// Logging configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Server host
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Maximum request body size in bytes
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,

    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,

    /// Validation calls allowed to run at once
    #[serde(default = "default_max_concurrent_validations")]
    pub max_concurrent_validations: usize,
}

/// Engine configuration: FHIR version and the IG packages to preload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// FHIR version of the base specification
    #[serde(default)]
    pub fhir_version: FhirVersion,

    /// Packages to preload (`id#version`, a `.tgz` path or a package directory)
    #[serde(default)]
    pub packages: Vec<String>,

    /// Directory scanned for additional packages at startup
    #[serde(default = "default_ig_directory")]
    pub ig_directory: Option<PathBuf>,

    /// Local FHIR package cache (`<cache>/<id>#<version>/package`)
    #[serde(default = "default_package_cache")]
    pub package_cache: PathBuf,

    /// Package registry used when a package is missing from the cache
    #[serde(default = "default_registry_url")]
    pub registry_url: String,

    /// Allow downloading missing packages from the registry
    #[serde(default)]
    pub allow_download: bool,
}

/// Terminology server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminologyConfig {
    /// Whether terminology server calls are permitted
    #[serde(default)]
    pub mode: TerminologyMode,

    /// Base URL of the FHIR terminology server
    #[serde(default = "default_tx_server")]
    pub server_url: String,

    /// Per-call timeout in seconds
    #[serde(default = "default_tx_timeout")]
    pub timeout: u64,

    /// Retries after a transient failure
    #[serde(default = "default_tx_retries")]
    pub retries: u32,

    /// Report display mismatches as warnings instead of errors
    #[serde(default)]
    pub display_issues_are_warnings: bool,

    /// Lifetime of cached terminology answers in seconds
    #[serde(default = "default_tx_cache_ttl")]
    pub cache_ttl: u64,

    /// Maximum cached terminology answers
    #[serde(default = "default_tx_cache_size")]
    pub cache_size: u64,

    /// Terminology calls in flight at once for a single validation
    #[serde(default = "default_tx_max_concurrent_checks")]
    pub max_concurrent_checks: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines
    #[serde(default)]
    pub structured_logging: bool,
}

/// FHIR specification versions the service can be configured for
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FhirVersion {
    #[default]
    #[serde(rename = "4.0.1")]
    R4,
    #[serde(rename = "4.3.0")]
    R4B,
    #[serde(rename = "5.0.0")]
    R5,
}

impl FhirVersion {
    /// Parse a version string, accepting `R4`-style names and `4.0`/`4.0.1` numbers
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "R4" | "4.0" | "4.0.0" | "4.0.1" => Some(FhirVersion::R4),
            "R4B" | "4.3" | "4.3.0" => Some(FhirVersion::R4B),
            "R5" | "5.0" | "5.0.0" => Some(FhirVersion::R5),
            _ => None,
        }
    }

    /// Package id of the core specification for this version
    pub fn core_package(&self) -> &'static str {
        match self {
            FhirVersion::R4 => "hl7.fhir.r4.core",
            FhirVersion::R4B => "hl7.fhir.r4b.core",
            FhirVersion::R5 => "hl7.fhir.r5.core",
        }
    }

    /// Whether a package declaring `fhir_version` targets this version
    pub fn matches(&self, fhir_version: &str) -> bool {
        FhirVersion::parse(fhir_version).is_some_and(|v| v == *self)
    }
}

impl std::fmt::Display for FhirVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FhirVersion::R4 => write!(f, "4.0.1"),
            FhirVersion::R4B => write!(f, "4.3.0"),
            FhirVersion::R5 => write!(f, "5.0.0"),
        }
    }
}

/// Command line arguments
#[derive(Parser, Debug, Default)]
#[command(name = "validator-server")]
#[command(about = "FHIR validation HTTP service")]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Server host
    #[arg(long, env = "VALIDATOR_HOST", global = true)]
    pub host: Option<String>,

    /// Server port
    #[arg(short, long, env = "VALIDATOR_PORT", global = true)]
    pub port: Option<u16>,

    /// FHIR version of the base specification
    #[arg(long, global = true)]
    pub fhir_version: Option<String>,

    /// IG package to preload (repeatable)
    #[arg(long = "package", global = true)]
    pub packages: Vec<String>,

    /// Directory scanned for IG packages
    #[arg(long, global = true)]
    pub ig_directory: Option<PathBuf>,

    /// FHIR package cache directory
    #[arg(long, global = true)]
    pub package_cache: Option<PathBuf>,

    /// Disable all terminology server calls
    #[arg(
        long,
        env = "DISABLE_TX",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        global = true
    )]
    pub disable_tx: Option<String>,

    /// Terminology server base URL
    #[arg(long, env = "TX_SERVER_URL", global = true)]
    pub tx_server_url: Option<String>,

    /// Report coding display mismatches as warnings
    #[arg(long, env = "DISPLAY_ISSUES_ARE_WARNINGS", global = true)]
    pub display_issues_are_warnings: Option<bool>,

    /// Log level
    #[arg(long, env = "RUST_LOG", global = true)]
    pub log_level: Option<String>,
}

/// Process subcommands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Start the HTTP service (default)
    Serve,
    /// Resolve and cache the configured IG packages, then exit
    Prepare,
}

impl ServiceConfig {
    /// Load configuration from defaults, file, environment and command line
    pub fn load(args: &Args) -> Result<Self> {
        let mut builder = config::Config::builder();

        // Load default configuration
        builder = builder.add_source(config::Config::try_from(&Self::default())?);

        // Load from configuration file if provided
        if let Some(config_path) = &args.config {
            builder = builder.add_source(config::File::from(config_path.clone()));
        }

        // Override with environment variables
        builder = builder.add_source(
            config::Environment::with_prefix("VALIDATOR")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: ServiceConfig = builder.build()?.try_deserialize()?;
        config.apply_args(args)?;
        config.validate()?;

        Ok(config)
    }

    /// Apply command line overrides
    pub fn apply_args(&mut self, args: &Args) -> Result<()> {
        if let Some(host) = &args.host {
            self.server.host = host.clone();
        }
        if let Some(port) = args.port {
            self.server.port = port;
        }
        if let Some(version) = &args.fhir_version {
            self.engine.fhir_version = FhirVersion::parse(version).ok_or_else(|| {
                ServiceError::Config(config::ConfigError::Message(format!(
                    "Unsupported FHIR version: {version}"
                )))
            })?;
        }
        self.engine.packages.extend(args.packages.iter().cloned());
        if let Some(dir) = &args.ig_directory {
            self.engine.ig_directory = Some(dir.clone());
        }
        if let Some(cache) = &args.package_cache {
            self.engine.package_cache = cache.clone();
        }
        // Any value of DISABLE_TX turns terminology off, matching the legacy flag.
        if args.disable_tx.is_some() {
            self.terminology.mode = TerminologyMode::Disabled;
        }
        if let Some(url) = &args.tx_server_url {
            self.terminology.server_url = url.clone();
        }
        if let Some(warnings) = args.display_issues_are_warnings {
            self.terminology.display_issues_are_warnings = warnings;
        }
        if let Some(log_level) = &args.log_level {
            self.monitoring.log_level = log_level.clone();
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(config_error("Server port must be greater than 0"));
        }

        if self.server.max_concurrent_validations == 0 {
            return Err(config_error(
                "max_concurrent_validations must be greater than 0",
            ));
        }

        if self.terminology.max_concurrent_checks == 0 {
            return Err(config_error(
                "terminology.max_concurrent_checks must be greater than 0",
            ));
        }

        if self.terminology.mode == TerminologyMode::Enabled {
            if self.terminology.server_url.is_empty() {
                return Err(config_error(
                    "A terminology server URL is required when terminology is enabled",
                ));
            }
            url::Url::parse(&self.terminology.server_url).map_err(|e| {
                config_error(&format!(
                    "Invalid terminology server URL '{}': {e}",
                    self.terminology.server_url
                ))
            })?;
        }

        url::Url::parse(&self.engine.registry_url).map_err(|e| {
            config_error(&format!(
                "Invalid registry URL '{}': {e}",
                self.engine.registry_url
            ))
        })?;

        Ok(())
    }
}

impl TerminologyConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

fn config_error(message: &str) -> ServiceError {
    ServiceError::Config(config::ConfigError::Message(message.to_string()))
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            timeout: default_timeout(),
            max_body_size: default_max_body_size(),
            cors_enabled: default_true(),
            max_concurrent_validations: default_max_concurrent_validations(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fhir_version: FhirVersion::default(),
            packages: Vec::new(),
            ig_directory: default_ig_directory(),
            package_cache: default_package_cache(),
            registry_url: default_registry_url(),
            allow_download: false,
        }
    }
}

impl Default for TerminologyConfig {
    fn default() -> Self {
        Self {
            mode: TerminologyMode::default(),
            server_url: default_tx_server(),
            timeout: default_tx_timeout(),
            retries: default_tx_retries(),
            display_issues_are_warnings: false,
            cache_ttl: default_tx_cache_ttl(),
            cache_size: default_tx_cache_size(),
            max_concurrent_checks: default_tx_max_concurrent_checks(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            structured_logging: false,
        }
    }
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 4567 }
fn default_timeout() -> u64 { 60 }
fn default_max_body_size() -> usize { 16 * 1024 * 1024 } // 16MB
fn default_true() -> bool { true }
fn default_max_concurrent_validations() -> usize { num_cpus::get() * 2 }
fn default_ig_directory() -> Option<PathBuf> { Some(PathBuf::from("./igs")) }
fn default_package_cache() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".fhir")
        .join("packages")
}
fn default_registry_url() -> String { "https://packages.fhir.org".to_string() }
fn default_tx_server() -> String { "http://tx.fhir.org/r4".to_string() }
fn default_tx_timeout() -> u64 { 10 }
fn default_tx_retries() -> u32 { 1 }
fn default_tx_cache_ttl() -> u64 { 3600 } // 1 hour
fn default_tx_cache_size() -> u64 { 10_000 }
fn default_tx_max_concurrent_checks() -> usize { 8 }
fn default_log_level() -> String { "info".to_string() }
