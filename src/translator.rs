//! Request translation: HTTP payload and query into a [`ValidationRequest`]

use tracing::debug;

use crate::core::{FhirVersion, MediaType, ValidationRequest};
use crate::engine::resource;
use crate::error::{Result, ServiceError};

/// Query parameters of a validate call.
///
/// `profile` may be repeated, and each value may itself be a comma separated
/// list. Values are passed on uninterpreted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationParams {
    pub profiles: Vec<String>,
    pub fhir_version: Option<FhirVersion>,
}

impl ValidationParams {
    pub fn from_query(query: Option<&str>) -> Result<Self> {
        let mut params = Self::default();
        let Some(query) = query else {
            return Ok(params);
        };

        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "profile" | "profiles" => params.profiles.extend(
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|p| !p.is_empty())
                        .map(str::to_string),
                ),
                "fhirVersion" | "fhir_version" => {
                    let version = FhirVersion::parse(&value).ok_or_else(|| {
                        ServiceError::BadRequest(format!("Unsupported FHIR version '{value}'"))
                    })?;
                    params.fhir_version = Some(version);
                }
                _ => {}
            }
        }

        Ok(params)
    }
}

/// Turns inbound HTTP payloads into engine requests
pub struct RequestTranslator;

impl RequestTranslator {
    /// Build a validation request.
    ///
    /// The body must be non-empty and well-formed for its media type. A
    /// missing content type is inferred from the body; an unsupported one is
    /// rejected.
    pub fn translate(
        body: &[u8],
        content_type: Option<&str>,
        params: ValidationParams,
        expected_type: Option<&str>,
    ) -> Result<ValidationRequest> {
        if body.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(ServiceError::BadRequest(
                "Request body is empty; expected a FHIR resource".to_string(),
            ));
        }

        let media_type = Self::media_type(body, content_type)?;

        resource::check_well_formed(body, media_type).map_err(|e| {
            let position = match (e.line, e.column) {
                (Some(line), Some(column)) => format!(" (line {line}, column {column})"),
                _ => String::new(),
            };
            ServiceError::BadRequest(format!("{}{position}", e.message))
        })?;

        debug!(
            media_type = %media_type,
            bytes = body.len(),
            profiles = params.profiles.len(),
            "Translated validation request"
        );

        let mut request = ValidationRequest::new(body, media_type).with_profiles(params.profiles);
        if let Some(version) = params.fhir_version {
            request = request.with_fhir_version(version);
        }
        if let Some(resource_type) = expected_type {
            request = request.with_expected_type(resource_type);
        }
        Ok(request)
    }

    /// Parse an uploaded conformance resource into its JSON form
    pub fn definition(body: &[u8], content_type: Option<&str>) -> Result<serde_json::Value> {
        if body.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(ServiceError::BadRequest(
                "Request body is empty; expected a StructureDefinition".to_string(),
            ));
        }

        let media_type = Self::media_type(body, content_type)?;
        resource::parse(body, media_type).map_err(|e| ServiceError::BadRequest(e.message))
    }

    fn media_type(body: &[u8], content_type: Option<&str>) -> Result<MediaType> {
        match content_type.map(str::trim).filter(|ct| !ct.is_empty()) {
            Some(content_type) => MediaType::from_content_type(content_type).ok_or_else(|| {
                ServiceError::BadRequest(format!(
                    "Unsupported content type '{content_type}'; expected application/json or application/xml"
                ))
            }),
            None => MediaType::sniff(body).ok_or_else(|| {
                ServiceError::BadRequest(
                    "No content type given and the body is neither JSON nor XML".to_string(),
                )
            }),
        }
    }
}
