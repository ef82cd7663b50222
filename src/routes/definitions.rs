//! Definition endpoints: what the session knows, and loading more of it

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    routing::{get, put},
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;

use crate::engine::PackageSummary;
use crate::error::{Result, ServiceError};
use crate::services::AppState;
use crate::translator::RequestTranslator;

/// Create definition routes
pub fn create_routes() -> Router<AppState> {
    Router::new()
        .route("/resources", get(list_resources))
        .route("/profiles", get(list_profiles).post(load_profile))
        .route("/profiles-by-ig", get(profiles_by_ig))
        .route("/igs", get(list_igs).post(upload_ig))
        .route("/igs/:id", put(load_ig))
}

#[derive(Debug, Deserialize)]
struct LoadIgParams {
    version: Option<String>,
}

async fn list_resources(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.definition_service.resource_types().await)
}

async fn list_profiles(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.definition_service.profiles().await)
}

async fn profiles_by_ig(State(state): State<AppState>) -> Json<BTreeMap<String, Vec<String>>> {
    Json(state.definition_service.profiles_by_package().await)
}

async fn list_igs(State(state): State<AppState>) -> Result<Json<BTreeMap<String, Option<String>>>> {
    Ok(Json(state.definition_service.packages().await?))
}

/// Load a StructureDefinition sent as JSON or XML
async fn load_profile(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>)> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());
    let definition = RequestTranslator::definition(&body, content_type)?;

    let url = state.definition_service.load_profile(definition).await?;
    Ok((StatusCode::CREATED, Json(json!({ "url": url }))))
}

/// Load an IG package uploaded as a `.tgz` body
async fn upload_ig(State(state): State<AppState>, body: Bytes) -> Result<Json<PackageSummary>> {
    if body.is_empty() {
        return Err(ServiceError::BadRequest(
            "Request body is empty; expected a gzipped IG package".to_string(),
        ));
    }
    Ok(Json(state.definition_service.load_archive(body.to_vec()).await?))
}

/// Load an IG package by id from the package cache or registry
async fn load_ig(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<LoadIgParams>,
) -> Result<Json<PackageSummary>> {
    let summary = state
        .definition_service
        .load_package(&id, params.version.as_deref())
        .await?;
    Ok(Json(summary))
}
