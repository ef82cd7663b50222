mod common;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{HeaderName, HeaderValue, Method, StatusCode, header};
use axum_test::TestServer;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::{Fixture, STRICT_PATIENT, VITALS};
use octofhir_validator_service::engine::{EngineInfo, PackageSummary};
use octofhir_validator_service::terminology::InMemoryTerminologyService;
use octofhir_validator_service::{
    AppState, EngineError, EngineIssue, EngineSession, FhirVersion, TerminologyController,
    TerminologyMode, ValidationEngine, ValidationRequest, create_app,
};

fn json_body(value: Value) -> Bytes {
    Bytes::from(serde_json::to_vec(&value).unwrap())
}

fn diagnostics(body: &Value) -> Vec<String> {
    body["issues"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|issue| issue["diagnostics"].as_str().map(str::to_string))
        .collect()
}

#[tokio::test]
async fn test_valid_patient() {
    let fixture = Fixture::new();
    let server = fixture.server(TerminologyController::disabled()).await;

    let response = server
        .post("/validate")
        .content_type("application/fhir+json")
        .bytes(json_body(json!({
            "resourceType": "Patient",
            "id": "example",
            "name": [{"family": "Doe"}]
        })))
        .await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body, json!({"success": true, "issues": []}));
}

#[tokio::test]
async fn test_malformed_json_is_bad_request() {
    let fixture = Fixture::new();
    let server = fixture.server(TerminologyController::disabled()).await;

    let response = server
        .post("/validate")
        .content_type("application/json")
        .bytes(Bytes::from_static(b"{\"resourceType\": \"Patient\""))
        .await;

    response.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["error"]["code"], "BAD_REQUEST");
    assert_eq!(body["error"]["status"], 400);
}

/// Accepts everything and counts how often it is asked
struct CountingEngine {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ValidationEngine for CountingEngine {
    fn info(&self) -> EngineInfo {
        EngineInfo {
            name: "counting".to_string(),
            version: "0".to_string(),
        }
    }

    async fn validate(
        &self,
        _request: &ValidationRequest,
    ) -> Result<Vec<EngineIssue>, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    }

    fn resource_types(&self) -> Vec<String> {
        vec!["Patient".to_string()]
    }

    fn structures(&self) -> Vec<String> {
        Vec::new()
    }

    fn packages(&self) -> Vec<PackageSummary> {
        Vec::new()
    }
}

#[tokio::test]
async fn test_rejected_payloads_never_reach_the_engine() {
    let fixture = Fixture::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = Arc::new(CountingEngine {
        calls: calls.clone(),
    });
    let session = EngineSession::with_engine(engine, FhirVersion::R4, TerminologyMode::Disabled);
    let state = AppState::with_session(fixture.config(), session).unwrap();
    let server = TestServer::new(create_app(state)).unwrap();

    let rejected: [(&str, &'static [u8]); 5] = [
        ("application/json", b"{\"resourceType\": \"Patient\""),
        ("application/fhir+json", b"{\"resourceType\": }"),
        ("application/xml", b"<Patient><id value=\"x\"></Patient>"),
        ("application/json", b"   "),
        ("text/plain", b"{\"resourceType\": \"Patient\"}"),
    ];
    for (content_type, body) in rejected {
        let response = server
            .post("/validate")
            .content_type(content_type)
            .bytes(Bytes::from_static(body))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let response = server
        .post("/Patient/$validate")
        .content_type("application/json")
        .bytes(json_body(json!({"resourceType": "Patient"})))
        .await;
    response.assert_status_ok();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unsupported_content_type_is_bad_request() {
    let fixture = Fixture::new();
    let server = fixture.server(TerminologyController::disabled()).await;

    let response = server
        .post("/validate")
        .content_type("text/plain")
        .bytes(json_body(json!({"resourceType": "Patient"})))
        .await;

    response.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_resource_type_is_unprocessable() {
    let fixture = Fixture::new();
    let server = fixture.server(TerminologyController::disabled()).await;

    let response = server
        .post("/validate")
        .content_type("application/json")
        .bytes(json_body(json!({"resourceType": "Spaceship"})))
        .await;

    response.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = response.json();
    assert_eq!(body["error"]["code"], "UNSUPPORTED_RESOURCE_TYPE");
    assert!(body["issues"][0]["message"].as_str().unwrap().contains("Spaceship"));
}

#[tokio::test]
async fn test_requested_profile() {
    let fixture = Fixture::new();
    let server = fixture.server(TerminologyController::disabled()).await;

    let response = server
        .post("/validate")
        .add_query_param("profile", STRICT_PATIENT)
        .content_type("application/json")
        .bytes(json_body(json!({"resourceType": "Patient", "id": "x"})))
        .await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["success"], false);
    assert_eq!(diagnostics(&body), vec!["CARDINALITY_MIN"]);

    let response = server
        .post("/validate")
        .add_query_param("profile", "http://example.org/unknown")
        .content_type("application/json")
        .bytes(json_body(json!({"resourceType": "Patient"})))
        .await;
    let body: Value = response.json();
    assert_eq!(body["success"], false);
    assert_eq!(diagnostics(&body), vec!["PROFILE_UNKNOWN"]);
}

#[tokio::test]
async fn test_issues_in_document_order() {
    let fixture = Fixture::new();
    let server = fixture.server(TerminologyController::disabled()).await;

    let response = server
        .post("/validate")
        .content_type("application/json")
        .bytes(json_body(json!({
            "resourceType": "Patient",
            "colour": "blue",
            "gender": "male",
            "birthDate": ["1970-01-01", "1971-01-01"]
        })))
        .await;

    let body: Value = response.json();
    assert_eq!(
        diagnostics(&body),
        vec!["ELEMENT_UNKNOWN", "TX_CHECK_SKIPPED", "CARDINALITY_MAX"]
    );
    assert_eq!(body["issues"][0]["location"], "Patient.colour");
    assert_eq!(body["issues"][1]["severity"], "information");
}

#[tokio::test]
async fn test_typed_validate_routes() {
    let fixture = Fixture::new();
    let server = fixture.server(TerminologyController::disabled()).await;

    let response = server
        .post("/Patient/$validate")
        .content_type("application/json")
        .bytes(json_body(json!({"resourceType": "Patient"})))
        .await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>()["success"], true);

    let response = server
        .post("/Patient/12345/$validate")
        .content_type("application/json")
        .bytes(json_body(json!({"resourceType": "Observation", "status": "final"})))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["success"], false);
    assert_eq!(diagnostics(&body)[0], "RESOURCE_TYPE_MISMATCH");
}

#[tokio::test]
async fn test_xml_and_sniffed_bodies() {
    let fixture = Fixture::new();
    let server = fixture.server(TerminologyController::disabled()).await;

    let response = server
        .post("/validate")
        .content_type("application/fhir+xml")
        .bytes(Bytes::from_static(
            br#"<Patient xmlns="http://hl7.org/fhir">
  <id value="x"/>
  <colour value="blue"/>
</Patient>"#,
        ))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(diagnostics(&body), vec!["ELEMENT_UNKNOWN"]);
    assert_eq!(body["issues"][0]["location"], "Patient.colour");

    let response = server
        .post("/validate")
        .bytes(json_body(json!({"resourceType": "Patient"})))
        .await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>()["success"], true);
}

#[tokio::test]
async fn test_operation_outcome_rendering() {
    let fixture = Fixture::new();
    let server = fixture.server(TerminologyController::disabled()).await;

    let response = server
        .post("/validate")
        .content_type("application/json")
        .add_header(header::ACCEPT, HeaderValue::from_static("application/fhir+json"))
        .bytes(json_body(json!({"resourceType": "Patient"})))
        .await;

    response.assert_status_ok();
    assert_eq!(
        response.header(header::CONTENT_TYPE),
        HeaderValue::from_static("application/fhir+json")
    );
    let body: Value = response.json();
    assert_eq!(body["resourceType"], "OperationOutcome");
    assert_eq!(body["issue"][0]["details"]["text"], "All OK");
}

#[tokio::test]
async fn test_terminology_enabled() {
    let mut codes = InMemoryTerminologyService::new();
    codes.add_code(
        common::GENDER_VS,
        "female",
        Some("http://hl7.org/fhir/administrative-gender"),
        None,
    );
    let terminology = TerminologyController::enabled(Arc::new(codes), Duration::from_secs(2));

    let fixture = Fixture::new();
    let server = fixture.server(terminology).await;

    let response = server
        .post("/validate")
        .content_type("application/json")
        .bytes(json_body(json!({"resourceType": "Patient", "gender": "female"})))
        .await;
    assert_eq!(response.json::<Value>(), json!({"success": true, "issues": []}));

    let response = server
        .post("/validate")
        .content_type("application/json")
        .bytes(json_body(json!({"resourceType": "Patient", "gender": "robot"})))
        .await;
    let body: Value = response.json();
    assert_eq!(body["success"], false);
    assert_eq!(diagnostics(&body), vec!["TX_CODE_INVALID"]);
    assert_eq!(body["issues"][0]["location"], "Patient.gender");
}

#[tokio::test]
async fn test_introspection() {
    let fixture = Fixture::new();
    let server = fixture.server(TerminologyController::disabled()).await;

    let resources: Vec<String> = server.get("/resources").await.json();
    assert!(resources.contains(&"Patient".to_string()));
    let mut sorted = resources.clone();
    sorted.sort();
    assert_eq!(resources, sorted);

    let profiles: Vec<String> = server.get("/profiles").await.json();
    assert!(profiles.contains(&STRICT_PATIENT.to_string()));

    let igs: Value = server.get("/igs").await.json();
    assert_eq!(igs["example.ig"], "http://example.org/fhir");
    assert_eq!(igs["example.base"], "http://example.org/base");

    let by_ig: Value = server.get("/profiles-by-ig").await.json();
    assert_eq!(by_ig["example.ig"], json!([STRICT_PATIENT]));

    let version: Value = server.get("/version").await.json();
    assert_eq!(version["octofhir-validator-service"], env!("CARGO_PKG_VERSION"));
    assert!(version.get("octofhir-conformance").is_some());

    let health: Value = server.get("/health").await.json();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["terminology"], "disabled");

    let metadata: Value = server.get("/metadata").await.json();
    assert_eq!(metadata["resourceType"], "CapabilityStatement");
    let patient = metadata["rest"][0]["resource"]
        .as_array()
        .unwrap()
        .iter()
        .find(|r| r["type"] == "Patient")
        .unwrap();
    assert_eq!(patient["operation"][0]["name"], "validate");
}

#[tokio::test]
async fn test_load_profile_at_runtime() {
    let fixture = Fixture::new();
    let server = fixture.server(TerminologyController::disabled()).await;

    let response = server
        .post("/validate")
        .add_query_param("profile", VITALS)
        .content_type("application/json")
        .bytes(json_body(json!({"resourceType": "Observation", "status": "final"})))
        .await;
    assert_eq!(diagnostics(&response.json()), vec!["PROFILE_UNKNOWN"]);

    let response = server
        .post("/profiles")
        .content_type("application/json")
        .bytes(json_body(common::vital_observation()))
        .await;
    response.assert_status(StatusCode::CREATED);
    assert_eq!(response.json::<Value>()["url"], VITALS);

    let profiles: Vec<String> = server.get("/profiles").await.json();
    assert!(profiles.contains(&VITALS.to_string()));

    let response = server
        .post("/validate")
        .add_query_param("profile", VITALS)
        .content_type("application/json")
        .bytes(json_body(json!({"resourceType": "Observation", "status": "final"})))
        .await;
    assert_eq!(response.json::<Value>()["success"], true);
}

#[tokio::test]
async fn test_load_profile_rejects_non_definitions() {
    let fixture = Fixture::new();
    let server = fixture.server(TerminologyController::disabled()).await;

    let response = server
        .post("/profiles")
        .content_type("application/json")
        .bytes(json_body(json!({"resourceType": "Patient"})))
        .await;
    response.assert_status(StatusCode::UNPROCESSABLE_ENTITY);

    let response = server
        .post("/profiles")
        .content_type("application/json")
        .bytes(Bytes::from_static(b"{"))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_upload_ig_archive() {
    let fixture = Fixture::new();
    let server = fixture.server(TerminologyController::disabled()).await;

    let archive = common::package_archive(
        &common::manifest("example.vitals", "http://example.org/vitals"),
        &[common::vital_observation()],
    );
    let response = server.post("/igs").bytes(Bytes::from(archive)).await;
    response.assert_status_ok();
    let summary: Value = response.json();
    assert_eq!(summary["id"], "example.vitals");
    assert_eq!(summary["version"], "1.0.0");
    assert_eq!(summary["profiles"], json!([VITALS]));

    let by_ig: Value = server.get("/profiles-by-ig").await.json();
    assert_eq!(by_ig["example.vitals"], json!([VITALS]));

    let response = server
        .post("/igs")
        .bytes(Bytes::from_static(b"not an archive"))
        .await;
    response.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_load_ig_from_cache() {
    let fixture = Fixture::new();
    common::write_package_dir(
        &fixture.cache.path().join("example.vitals#1.0.0"),
        &common::manifest("example.vitals", "http://example.org/vitals"),
        &[common::vital_observation()],
    );
    let server = fixture.server(TerminologyController::disabled()).await;

    let response = server
        .put("/igs/example.vitals")
        .add_query_param("version", "1.0.0")
        .await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>()["profiles"], json!([VITALS]));

    let response = server.put("/igs/example.absent").await;
    response.assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_request_id_and_cors() {
    let fixture = Fixture::new();
    let server = fixture.server(TerminologyController::disabled()).await;

    let response = server.get("/health").await;
    let request_id = response.header(HeaderName::from_static("x-request-id"));
    assert!(uuid::Uuid::parse_str(request_id.to_str().unwrap()).is_ok());

    let response = server
        .method(Method::OPTIONS, "/validate")
        .add_header(header::ORIGIN, HeaderValue::from_static("http://example.com"))
        .add_header(
            header::ACCESS_CONTROL_REQUEST_METHOD,
            HeaderValue::from_static("POST"),
        )
        .await;
    response.assert_status_ok();
    assert_eq!(
        response.header(header::ACCESS_CONTROL_ALLOW_ORIGIN),
        HeaderValue::from_static("*")
    );
}

/// Expected outcome of one request in the concurrent batch
enum Expect {
    Valid,
    Issue { diagnostics: &'static str, mentions: String },
    Unprocessable { mentions: String },
}

fn concurrent_case(i: usize) -> (String, Value, Expect) {
    let id = format!("p{i}");
    match i % 5 {
        0 => (
            "/validate".to_string(),
            json!({"resourceType": "Patient", "id": id, "active": true}),
            Expect::Valid,
        ),
        1 => {
            let element = format!("extra{i}");
            (
                "/validate".to_string(),
                json!({"resourceType": "Patient", "id": id, (element.clone()): true}),
                Expect::Issue {
                    diagnostics: "ELEMENT_UNKNOWN",
                    mentions: format!("Patient.{element}"),
                },
            )
        }
        2 => (
            format!("/validate?profile={STRICT_PATIENT}"),
            json!({"resourceType": "Patient", "id": id}),
            Expect::Issue {
                diagnostics: "CARDINALITY_MIN",
                mentions: "Patient".to_string(),
            },
        ),
        3 => {
            let profile = format!("http://example.org/missing/{i}");
            (
                format!("/validate?profile={profile}"),
                json!({"resourceType": "Patient", "id": id}),
                Expect::Issue {
                    diagnostics: "PROFILE_UNKNOWN",
                    mentions: profile,
                },
            )
        }
        _ => {
            let resource_type = format!("Spaceship{i}");
            (
                "/validate".to_string(),
                json!({"resourceType": resource_type.clone(), "id": id}),
                Expect::Unprocessable {
                    mentions: resource_type,
                },
            )
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_validations_share_session() {
    let fixture = Fixture::new();
    let base_url = fixture.serve_http(TerminologyController::disabled()).await;
    let client = reqwest::Client::new();

    let calls = (0..50).map(|i| {
        let client = client.clone();
        let base_url = base_url.clone();
        async move {
            let (path, resource, expect) = concurrent_case(i);
            let response = client
                .post(format!("{base_url}{path}"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(serde_json::to_vec(&resource).unwrap())
                .send()
                .await
                .unwrap();
            let status = response.status().as_u16();
            let body: Value = response.json().await.unwrap();
            (i, status, body, expect)
        }
    });

    let results = tokio::time::timeout(Duration::from_secs(30), futures::future::join_all(calls))
        .await
        .expect("concurrent validations did not finish");
    assert_eq!(results.len(), 50);

    for (i, status, body, expect) in results {
        let text = body.to_string();
        match expect {
            Expect::Valid => {
                assert_eq!(status, 200, "request {i}: {text}");
                assert_eq!(body, json!({"success": true, "issues": []}), "request {i}");
            }
            Expect::Issue {
                diagnostics: expected,
                mentions,
            } => {
                assert_eq!(status, 200, "request {i}: {text}");
                assert_eq!(body["success"], false, "request {i}: {text}");
                assert_eq!(diagnostics(&body), vec![expected], "request {i}: {text}");
                assert!(text.contains(&mentions), "request {i}: {text}");
            }
            Expect::Unprocessable { mentions } => {
                assert_eq!(status, 422, "request {i}: {text}");
                assert!(text.contains(&mentions), "request {i}: {text}");
            }
        }
    }
}
