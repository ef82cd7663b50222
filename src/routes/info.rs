//! Service information endpoints

use axum::{
    Json, Router,
    extract::State,
    http::header,
    response::IntoResponse,
    routing::get,
};
use serde_json::{Value, json};
use std::collections::BTreeMap;

use crate::services::AppState;

const VALIDATE_OPERATION: &str = "http://hl7.org/fhir/OperationDefinition/Resource-validate";

/// Create info routes
pub fn create_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/version", get(version))
        .route("/metadata", get(metadata))
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let session = state.session().await;
    Json(json!({
        "status": "healthy",
        "fhirVersion": session.fhir_version().to_string(),
        "terminology": session.terminology_mode().to_string(),
        "startedAt": state.started_at.to_rfc3339(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// Versions of the service and the engine behind it
async fn version(State(state): State<AppState>) -> Json<BTreeMap<String, String>> {
    let engine = state.session().await.engine().info();
    let mut versions = BTreeMap::new();
    versions.insert(env!("CARGO_PKG_NAME").to_string(), env!("CARGO_PKG_VERSION").to_string());
    versions.insert(engine.name, engine.version);
    Json(versions)
}

/// CapabilityStatement advertising `$validate` on every known resource type
async fn metadata(State(state): State<AppState>) -> impl IntoResponse {
    let session = state.session().await;
    let resources: Vec<Value> = session
        .engine()
        .resource_types()
        .into_iter()
        .map(|resource_type| {
            json!({
                "type": resource_type,
                "operation": [{"name": "validate", "definition": VALIDATE_OPERATION}]
            })
        })
        .collect();

    let statement = json!({
        "resourceType": "CapabilityStatement",
        "status": "active",
        "date": state.started_at.to_rfc3339(),
        "kind": "instance",
        "software": {
            "name": "OctoFHIR Validation Service",
            "version": env!("CARGO_PKG_VERSION")
        },
        "implementation": {"description": "FHIR resource validator"},
        "fhirVersion": session.fhir_version().to_string(),
        "format": ["json", "xml"],
        "rest": [{"mode": "server", "resource": resources}]
    });

    ([(header::CONTENT_TYPE, "application/fhir+json")], Json(statement))
}
