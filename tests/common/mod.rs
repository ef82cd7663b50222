#![allow(dead_code)]

use axum_test::TestServer;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde_json::{Value, json};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use tempfile::TempDir;
use tokio::net::TcpListener;

use octofhir_validator_service::core::ServiceConfig;
use octofhir_validator_service::{AppState, EngineSession, TerminologyController, create_app};

pub const GENDER_VS: &str = "http://hl7.org/fhir/ValueSet/administrative-gender";
pub const STRICT_PATIENT: &str = "http://example.org/fhir/StructureDefinition/strict-patient";
pub const VITALS: &str = "http://example.org/vitals/StructureDefinition/vital-observation";

/// Patient base definition, enough of it for cardinality and binding checks
pub fn patient_base() -> Value {
    json!({
        "resourceType": "StructureDefinition",
        "url": "http://hl7.org/fhir/StructureDefinition/Patient",
        "name": "Patient",
        "kind": "resource",
        "abstract": false,
        "type": "Patient",
        "derivation": "specialization",
        "snapshot": {"element": [
            {"path": "Patient", "min": 0, "max": "*"},
            {"path": "Patient.id", "min": 0, "max": "1"},
            {"path": "Patient.meta", "min": 0, "max": "1"},
            {"path": "Patient.text", "min": 0, "max": "1"},
            {"path": "Patient.active", "min": 0, "max": "1"},
            {"path": "Patient.name", "min": 0, "max": "*"},
            {"path": "Patient.gender", "min": 0, "max": "1", "type": [{"code": "code"}],
             "binding": {"strength": "required", "valueSet": format!("{GENDER_VS}|4.0.1")}},
            {"path": "Patient.birthDate", "min": 0, "max": "1"},
            {"path": "Patient.contact", "min": 0, "max": "*"},
            {"path": "Patient.contact.name", "min": 0, "max": "1"}
        ]}
    })
}

pub fn strict_patient() -> Value {
    json!({
        "resourceType": "StructureDefinition",
        "url": STRICT_PATIENT,
        "type": "Patient",
        "kind": "resource",
        "derivation": "constraint",
        "baseDefinition": "http://hl7.org/fhir/StructureDefinition/Patient",
        "differential": {"element": [
            {"path": "Patient.birthDate", "min": 1, "max": "1"}
        ]}
    })
}

pub fn vital_observation() -> Value {
    json!({
        "resourceType": "StructureDefinition",
        "url": VITALS,
        "type": "Observation",
        "kind": "resource",
        "derivation": "constraint",
        "differential": {"element": [{"path": "Observation.status", "min": 1}]}
    })
}

pub fn manifest(name: &str, canonical: &str) -> Value {
    json!({
        "name": name,
        "version": "1.0.0",
        "canonical": canonical,
        "fhirVersions": ["4.0.1"],
        "dependencies": {"hl7.fhir.r4.core": "4.0.1"}
    })
}

/// Write an unpacked package (`<dir>/package/...`)
pub fn write_package_dir(dir: &Path, manifest: &Value, resources: &[Value]) {
    let root = dir.join("package");
    fs::create_dir_all(&root).unwrap();
    fs::write(root.join("package.json"), serde_json::to_vec(manifest).unwrap()).unwrap();
    for (index, resource) in resources.iter().enumerate() {
        fs::write(
            root.join(format!("resource-{index}.json")),
            serde_json::to_vec(resource).unwrap(),
        )
        .unwrap();
    }
}

/// Build a gzipped package tarball in memory
pub fn package_archive(manifest: &Value, resources: &[Value]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));

    let mut append = |name: String, value: &Value| {
        let data = serde_json::to_vec(value).unwrap();
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, data.as_slice()).unwrap();
    };

    append("package/package.json".to_string(), manifest);
    for (index, resource) in resources.iter().enumerate() {
        append(format!("package/resource-{index}.json"), resource);
    }

    builder.into_inner().unwrap().finish().unwrap()
}

/// Temporary directories backing a test service
pub struct Fixture {
    pub cache: TempDir,
    pub igs: TempDir,
}

impl Fixture {
    /// An empty package cache plus an IG directory holding the base and a profile package
    pub fn new() -> Self {
        let cache = tempfile::tempdir().unwrap();
        let igs = tempfile::tempdir().unwrap();
        write_package_dir(
            &igs.path().join("example.base"),
            &manifest("example.base", "http://example.org/base"),
            &[patient_base()],
        );
        write_package_dir(
            &igs.path().join("example.ig"),
            &manifest("example.ig", "http://example.org/fhir"),
            &[strict_patient()],
        );
        Self { cache, igs }
    }

    pub fn config(&self) -> ServiceConfig {
        let mut config = ServiceConfig::default();
        config.engine.package_cache = self.cache.path().to_path_buf();
        config.engine.ig_directory = Some(self.igs.path().to_path_buf());
        config.server.max_concurrent_validations = 4;
        config
    }

    pub async fn session(&self, terminology: TerminologyController) -> EngineSession {
        EngineSession::initialize(&self.config().engine, terminology)
            .await
            .unwrap()
    }

    pub async fn server(&self, terminology: TerminologyController) -> TestServer {
        let session = self.session(terminology).await;
        let state = AppState::with_session(self.config(), session).unwrap();
        TestServer::new(create_app(state)).unwrap()
    }

    /// Serve the app on an ephemeral local port and return its base URL
    pub async fn serve_http(&self, terminology: TerminologyController) -> String {
        let session = self.session(terminology).await;
        let state = AppState::with_session(self.config(), session).unwrap();
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, create_app(state)).await.unwrap();
        });
        format!("http://{address}")
    }
}
