//! Validation endpoints

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, RawQuery, State},
    http::{HeaderMap, header},
    response::{IntoResponse, Response},
    routing::post,
};

use crate::error::{Result, ServiceError};
use crate::outcome::{OutcomeFormatter, ValidationOutcome};
use crate::services::AppState;
use crate::translator::{RequestTranslator, ValidationParams};

const FHIR_JSON: &str = "application/fhir+json";

/// Create validation routes
pub fn create_routes() -> Router<AppState> {
    Router::new()
        .route("/validate", post(validate_resource))
        .route("/:resource_type/$validate", post(validate_typed))
        .route("/:resource_type/:id/$validate", post(validate_instance))
}

/// Validate a resource of any type
async fn validate_resource(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    validate(&state, query.as_deref(), &headers, &body, None).await
}

/// `$validate` on a resource type
async fn validate_typed(
    State(state): State<AppState>,
    Path(resource_type): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    validate(&state, query.as_deref(), &headers, &body, Some(resource_type.as_str())).await
}

/// `$validate` on an instance; the id is not checked against the body
async fn validate_instance(
    State(state): State<AppState>,
    Path((resource_type, _id)): Path<(String, String)>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    validate(&state, query.as_deref(), &headers, &body, Some(resource_type.as_str())).await
}

async fn validate(
    state: &AppState,
    query: Option<&str>,
    headers: &HeaderMap,
    body: &[u8],
    expected_type: Option<&str>,
) -> Result<Response> {
    let params = ValidationParams::from_query(query)?;
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .map(|value| value.to_str())
        .transpose()
        .map_err(|_| {
            ServiceError::BadRequest("Content-Type header is not valid text".to_string())
        })?;

    let request = RequestTranslator::translate(body, content_type, params, expected_type)?;
    let outcome = state.validation_service.validate(request).await?;

    Ok(render(headers, &outcome))
}

/// The stable outcome document, or an OperationOutcome when the client asks for FHIR JSON
fn render(headers: &HeaderMap, outcome: &ValidationOutcome) -> Response {
    let wants_fhir = headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|accept| accept.contains(FHIR_JSON));

    if wants_fhir {
        (
            [(header::CONTENT_TYPE, FHIR_JSON)],
            Json(OutcomeFormatter::operation_outcome(outcome)),
        )
            .into_response()
    } else {
        Json(outcome).into_response()
    }
}
