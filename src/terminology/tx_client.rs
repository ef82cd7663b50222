//! Client for a remote FHIR terminology server (`$validate-code`)

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::service::{
    CodeCheck, CodeValidationResult, TerminologyError, TerminologyResult, TerminologyService,
};

/// Terminology service backed by a FHIR terminology server
#[derive(Debug, Clone)]
pub struct TxServerClient {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl TxServerClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> TerminologyResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TerminologyError::Internal(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    fn request_url(&self, check: &CodeCheck) -> TerminologyResult<Url> {
        let mut params: Vec<(&str, &str)> = Vec::new();
        let endpoint = match (&check.value_set, &check.system) {
            (Some(value_set), system) => {
                params.push(("url", value_set));
                if let Some(system) = system {
                    params.push(("system", system));
                }
                "ValueSet/$validate-code"
            }
            (None, Some(system)) => {
                params.push(("url", system));
                "CodeSystem/$validate-code"
            }
            (None, None) => {
                return Err(TerminologyError::Internal(format!(
                    "Code '{}' has neither a system nor a value set to check against",
                    check.code
                )));
            }
        };
        params.push(("code", &check.code));
        if let Some(display) = &check.display {
            params.push(("display", display));
        }

        Url::parse_with_params(&format!("{}/{endpoint}", self.base_url), &params)
            .map_err(|e| TerminologyError::Internal(e.to_string()))
    }
}

#[async_trait]
impl TerminologyService for TxServerClient {
    async fn validate_code(&self, check: &CodeCheck) -> TerminologyResult<CodeValidationResult> {
        let url = self.request_url(check)?;
        debug!(url = %url, "Calling terminology server");

        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/fhir+json")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TerminologyError::Timeout(self.timeout)
                } else {
                    TerminologyError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            if let Some(url) = &check.value_set {
                return Err(TerminologyError::ValueSetNotFound { url: url.clone() });
            }
        }
        if status.is_server_error() {
            return Err(TerminologyError::ServiceUnavailable {
                message: format!("HTTP {status}"),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| TerminologyError::Network(e.to_string()))?;

        if !status.is_success() {
            return Err(TerminologyError::Rejected {
                status: status.as_u16(),
                message: outcome_text(&body).unwrap_or_else(|| status.to_string()),
            });
        }

        parse_parameters(&body)
    }
}

/// Read a `$validate-code` Parameters response
pub fn parse_parameters(body: &Value) -> TerminologyResult<CodeValidationResult> {
    if body.get("resourceType").and_then(|v| v.as_str()) != Some("Parameters") {
        return Err(TerminologyError::Internal(
            "Terminology server did not return a Parameters resource".to_string(),
        ));
    }

    let parameter = |name: &str| -> Option<&Value> {
        body.get("parameter")?
            .as_array()?
            .iter()
            .find(|p| p.get("name").and_then(|n| n.as_str()) == Some(name))
    };

    let valid = parameter("result")
        .and_then(|p| p.get("valueBoolean"))
        .and_then(|v| v.as_bool())
        .ok_or_else(|| {
            TerminologyError::Internal("Parameters response has no 'result'".to_string())
        })?;

    Ok(CodeValidationResult {
        valid,
        display: parameter("display")
            .and_then(|p| p.get("valueString"))
            .and_then(|v| v.as_str())
            .map(str::to_string),
        message: parameter("message")
            .and_then(|p| p.get("valueString"))
            .and_then(|v| v.as_str())
            .map(str::to_string),
    })
}

fn outcome_text(body: &Value) -> Option<String> {
    let issue = body.get("issue")?.as_array()?.first()?;
    issue
        .get("diagnostics")
        .or_else(|| issue.pointer("/details/text"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}
