//! Built-in package-backed conformance engine.
//!
//! Checks a resource against the definitions it has loaded: the resource type,
//! requested and declared profiles, element cardinality, unknown elements of
//! the base definition, and coded values through the terminology controller.
//! Issues come out in document order.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

use super::base::RESOURCE_ELEMENTS;
use super::definitions::{DefinitionSet, ElementBinding, ElementDefinition, StructureSummary};
use super::resource::{self, occurrences};
use super::{
    DefinitionAdditions, EngineError, EngineErrorKind, EngineInfo, EngineIssue, IssueType,
    PackageSummary, ValidationEngine,
};
use crate::core::ValidationRequest;
use crate::terminology::{BindingCheck, BindingStrength, TerminologyController};

pub const ENGINE_NAME: &str = "octofhir-conformance";

/// Elements every backbone element may carry
const BACKBONE_ELEMENTS: &[&str] = &["id", "extension", "modifierExtension"];

pub struct ConformanceEngine {
    definitions: Arc<DefinitionSet>,
    terminology: Arc<TerminologyController>,
}

impl ConformanceEngine {
    pub fn new(definitions: DefinitionSet, terminology: Arc<TerminologyController>) -> Self {
        Self {
            definitions: Arc::new(definitions),
            terminology,
        }
    }

    pub fn definitions(&self) -> &DefinitionSet {
        &self.definitions
    }

    pub fn terminology(&self) -> &TerminologyController {
        &self.terminology
    }
}

#[async_trait]
impl ValidationEngine for ConformanceEngine {
    fn info(&self) -> EngineInfo {
        EngineInfo {
            name: ENGINE_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    async fn validate(&self, request: &ValidationRequest) -> Result<Vec<EngineIssue>, EngineError> {
        let resource = resource::parse(request.content(), request.media_type()).map_err(|e| {
            let mut issue = EngineIssue::error(IssueType::Structure, "", e.message.clone())
                .with_message_id("CONTENT_MALFORMED");
            if let (Some(line), Some(column)) = (e.line, e.column) {
                issue = issue.with_position(line, column);
            }
            EngineError::with_issue(EngineErrorKind::Unprocessable, issue)
        })?;

        if let Some(version) = request.fhir_version() {
            if version != self.definitions.fhir_version() {
                return Err(EngineError::new(
                    EngineErrorKind::UnsupportedVersion,
                    format!(
                        "FHIR version {version} was requested, but the engine is loaded with {}",
                        self.definitions.fhir_version()
                    ),
                ));
            }
        }

        let (findings, checks) = Walker::new(&self.definitions).run(&resource, request)?;
        debug!(
            findings = findings.len(),
            binding_checks = checks.len(),
            "Structural checks complete"
        );

        let mut results = self.terminology.check_all(&checks).await;
        Ok(findings
            .into_iter()
            .filter_map(|finding| match finding {
                Finding::Issue(issue) => Some(issue),
                Finding::Binding(index) => results.get_mut(index).and_then(Option::take),
            })
            .collect())
    }

    fn resource_types(&self) -> Vec<String> {
        self.definitions.resource_types()
    }

    fn structures(&self) -> Vec<String> {
        self.definitions.structure_urls()
    }

    fn packages(&self) -> Vec<PackageSummary> {
        self.definitions.packages().to_vec()
    }

    fn extend(
        &self,
        additions: DefinitionAdditions,
    ) -> Result<Arc<dyn ValidationEngine>, EngineError> {
        let mut definitions = DefinitionSet::clone(&self.definitions);
        for package in &additions.packages {
            definitions.add_package(package)?;
        }
        for resource in &additions.resources {
            definitions.add_resource(resource)?;
        }

        Ok(Arc::new(Self {
            definitions: Arc::new(definitions),
            terminology: Arc::clone(&self.terminology),
        }))
    }
}

/// Something found during the walk: an issue, or the slot of a binding check
enum Finding {
    Issue(EngineIssue),
    Binding(usize),
}

struct Walker<'d> {
    definitions: &'d DefinitionSet,
    findings: Vec<Finding>,
    checks: Vec<BindingCheck>,
}

impl<'d> Walker<'d> {
    fn new(definitions: &'d DefinitionSet) -> Self {
        Self {
            definitions,
            findings: Vec::new(),
            checks: Vec::new(),
        }
    }

    fn run(
        mut self,
        resource: &Value,
        request: &ValidationRequest,
    ) -> Result<(Vec<Finding>, Vec<BindingCheck>), EngineError> {
        let object = resource.as_object().ok_or_else(|| {
            EngineError::with_issue(
                EngineErrorKind::Unprocessable,
                EngineIssue::error(
                    IssueType::Structure,
                    "",
                    "The content is not a FHIR resource: expected an object",
                )
                .with_message_id("RESOURCE_NOT_OBJECT"),
            )
        })?;

        let resource_type = match object.get("resourceType") {
            Some(Value::String(resource_type)) => resource_type.as_str(),
            _ => {
                return Err(EngineError::with_issue(
                    EngineErrorKind::Unprocessable,
                    EngineIssue::error(
                        IssueType::Required,
                        "",
                        "Unable to find the 'resourceType' property",
                    )
                    .with_message_id("RESOURCE_TYPE_MISSING"),
                ));
            }
        };

        if !self.definitions.is_resource_type(resource_type) {
            return Err(EngineError::with_issue(
                EngineErrorKind::UnsupportedResourceType,
                EngineIssue::error(
                    IssueType::NotSupported,
                    resource_type,
                    format!("Unknown resource type '{resource_type}'"),
                )
                .with_message_id("RESOURCE_TYPE_UNKNOWN"),
            ));
        }

        if let Some(expected) = request.expected_type() {
            if expected != resource_type {
                self.issue(
                    EngineIssue::error(
                        IssueType::Invalid,
                        resource_type,
                        format!(
                            "Resource type '{resource_type}' does not match the requested type '{expected}'"
                        ),
                    )
                    .with_message_id("RESOURCE_TYPE_MISMATCH"),
                );
            }
        }

        let base = self.definitions.base_structure(resource_type);
        let mut structures: Vec<&'d StructureSummary> = base.into_iter().collect();

        for profile in request.profiles() {
            if let Some(structure) = self.requested_profile(profile, resource_type) {
                if !structures.iter().any(|s| s.url == structure.url) {
                    structures.push(structure);
                }
            }
        }

        let declared = object.get("meta").and_then(|meta| meta.get("profile"));
        for (index, profile) in occurrences(declared).into_iter().enumerate() {
            let Some(profile) = profile.as_str() else {
                continue;
            };
            let location = format!("{resource_type}.meta.profile[{index}]");
            if let Some(structure) = self.declared_profile(profile, resource_type, &location) {
                if !structures.iter().any(|s| s.url == structure.url) {
                    structures.push(structure);
                }
            }
        }

        self.walk_object(&structures, base, resource_type, object, resource_type, None);
        Ok((self.findings, self.checks))
    }

    /// A profile named by the caller: unknown or mismatched profiles are errors
    fn requested_profile(
        &mut self,
        profile: &str,
        resource_type: &str,
    ) -> Option<&'d StructureSummary> {
        let Some(structure) = self.definitions.structure(profile) else {
            self.issue(
                EngineIssue::error(
                    IssueType::NotFound,
                    resource_type,
                    format!("Profile '{profile}' is not known to the validator"),
                )
                .with_message_id("PROFILE_UNKNOWN"),
            );
            return None;
        };

        if structure.type_name != resource_type {
            self.issue(
                EngineIssue::error(
                    IssueType::Invalid,
                    resource_type,
                    format!(
                        "Profile '{profile}' applies to {}, not to {resource_type}",
                        structure.type_name
                    ),
                )
                .with_message_id("PROFILE_WRONG_TYPE"),
            );
            return None;
        }

        Some(structure)
    }

    /// A profile the resource claims in `meta.profile`: problems are warnings
    fn declared_profile(
        &mut self,
        profile: &str,
        resource_type: &str,
        location: &str,
    ) -> Option<&'d StructureSummary> {
        match self.definitions.structure(profile) {
            None => {
                self.issue(
                    EngineIssue::warning(
                        IssueType::NotFound,
                        location,
                        format!(
                            "Profile '{profile}' from meta.profile is not known, so the resource was not checked against it"
                        ),
                    )
                    .with_message_id("META_PROFILE_UNKNOWN"),
                );
                None
            }
            Some(structure) if structure.type_name != resource_type => {
                self.issue(
                    EngineIssue::warning(
                        IssueType::Invalid,
                        location,
                        format!(
                            "Profile '{profile}' from meta.profile applies to {}, not to {resource_type}",
                            structure.type_name
                        ),
                    )
                    .with_message_id("META_PROFILE_WRONG_TYPE"),
                );
                None
            }
            Some(structure) => Some(structure),
        }
    }

    /// Check one object against the definitions of `def_path`.
    ///
    /// `structures` are the definitions in force (base first, then profiles);
    /// `base` is set when the base definition describes this object's
    /// children, which enables the unknown-element check.
    fn walk_object(
        &mut self,
        structures: &[&'d StructureSummary],
        base: Option<&'d StructureSummary>,
        def_path: &str,
        object: &Map<String, Value>,
        location: &str,
        binding: Option<&'d ElementBinding>,
    ) {
        self.coding(object, location, binding);

        let at_root = !def_path.contains('.');
        let base_has_children = base.is_some_and(|b| b.children(def_path).next().is_some());

        for (key, value) in object {
            if key == "resourceType" || key.starts_with('_') {
                continue;
            }
            let child_location = format!("{location}.{key}");

            if at_root && key == "contained" {
                self.walk_contained(value, &child_location);
                continue;
            }

            let matched: Vec<(&'d StructureSummary, &'d ElementDefinition)> = structures
                .iter()
                .copied()
                .filter_map(|s| s.child(def_path, key).map(|def| (s, def)))
                .collect();
            let base_def = base.and_then(|b| b.child(def_path, key));

            if base_has_children && base_def.is_none() {
                let allowed = if at_root {
                    RESOURCE_ELEMENTS.contains(&key.as_str())
                } else {
                    BACKBONE_ELEMENTS.contains(&key.as_str())
                };
                if !allowed {
                    self.issue(
                        EngineIssue::error(
                            IssueType::Structure,
                            &child_location,
                            format!("Unrecognized element '{key}' in {def_path}"),
                        )
                        .with_message_id("ELEMENT_UNKNOWN"),
                    );
                    continue;
                }
            }

            let items = occurrences(Some(value));
            for (structure, def) in &matched {
                if let Some(max) = def.max {
                    if items.len() > max as usize {
                        self.issue(
                            EngineIssue::error(
                                IssueType::Structure,
                                &child_location,
                                format!(
                                    "{}: max allowed = {max}, but found {}{}",
                                    def.path,
                                    items.len(),
                                    profile_suffix(structure)
                                ),
                            )
                            .with_message_id("CARDINALITY_MAX"),
                        );
                    }
                }
            }

            let child_binding = matched
                .iter()
                .rev()
                .find_map(|(_, def)| def.binding.as_ref())
                .or(if key == "coding" { binding } else { None });
            let is_code = matched
                .iter()
                .any(|(_, def)| def.types.iter().any(|t| t == "code"));
            let child_path = matched
                .first()
                .map(|(_, def)| def.path.clone())
                .unwrap_or_else(|| format!("{def_path}.{key}"));
            let nested: Vec<&'d StructureSummary> = matched.iter().map(|(s, _)| *s).collect();

            for (index, item) in items.iter().enumerate() {
                let item_location = if value.is_array() {
                    format!("{child_location}[{index}]")
                } else {
                    child_location.clone()
                };
                match item {
                    Value::Object(child) => self.walk_object(
                        &nested,
                        base.filter(|_| base_def.is_some()),
                        &child_path,
                        child,
                        &item_location,
                        child_binding,
                    ),
                    Value::String(code) if is_code => {
                        self.primitive_code(code, &item_location, child_binding)
                    }
                    _ => {}
                }
            }
        }

        for structure in structures {
            for def in structure.children(def_path) {
                let found = present(object, def);
                if found < def.min as usize {
                    self.issue(
                        EngineIssue::error(
                            IssueType::Required,
                            location,
                            format!(
                                "{}: minimum required = {}, but only found {found}{}",
                                def.path,
                                def.min,
                                profile_suffix(structure)
                            ),
                        )
                        .with_message_id("CARDINALITY_MIN"),
                    );
                }
            }
        }
    }

    /// Contained resources are checked against their own base definitions
    fn walk_contained(&mut self, value: &Value, location: &str) {
        for (index, item) in occurrences(Some(value)).into_iter().enumerate() {
            let item_location = if value.is_array() {
                format!("{location}[{index}]")
            } else {
                location.to_string()
            };
            let Some(object) = item.as_object() else {
                continue;
            };
            let resource_type = object.get("resourceType").and_then(|v| v.as_str());
            match resource_type {
                Some(resource_type) if self.definitions.is_resource_type(resource_type) => {
                    let base = self.definitions.base_structure(resource_type);
                    let structures: Vec<&'d StructureSummary> = base.into_iter().collect();
                    self.walk_object(
                        &structures,
                        base,
                        resource_type,
                        object,
                        &item_location,
                        None,
                    );
                }
                _ => self.issue(
                    EngineIssue::error(
                        IssueType::NotSupported,
                        &item_location,
                        format!(
                            "Contained resource has unknown resource type '{}'",
                            resource_type.unwrap_or_default()
                        ),
                    )
                    .with_message_id("RESOURCE_TYPE_UNKNOWN"),
                ),
            }
        }
    }

    /// Queue a terminology check for a Coding-shaped object
    fn coding(
        &mut self,
        object: &Map<String, Value>,
        location: &str,
        binding: Option<&'d ElementBinding>,
    ) {
        let Some(code) = object.get("code").and_then(|v| v.as_str()) else {
            return;
        };
        let system = object.get("system").and_then(|v| v.as_str());
        let (value_set, strength) = effective_binding(binding);
        if system.is_none() && value_set.is_none() {
            return;
        }

        self.check(BindingCheck {
            location: location.to_string(),
            system: system.map(str::to_string),
            code: code.to_string(),
            display: object
                .get("display")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            value_set,
            strength,
        });
    }

    /// Queue a terminology check for a bound `code` primitive
    fn primitive_code(&mut self, code: &str, location: &str, binding: Option<&'d ElementBinding>) {
        let (Some(value_set), strength) = effective_binding(binding) else {
            return;
        };
        self.check(BindingCheck {
            location: location.to_string(),
            system: None,
            code: code.to_string(),
            display: None,
            value_set: Some(value_set),
            strength,
        });
    }

    fn issue(&mut self, issue: EngineIssue) {
        self.findings.push(Finding::Issue(issue));
    }

    fn check(&mut self, check: BindingCheck) {
        self.findings.push(Finding::Binding(self.checks.len()));
        self.checks.push(check);
    }
}

/// Value set and strength of a binding worth checking. Example bindings only
/// illustrate, so they are treated as no binding.
fn effective_binding(
    binding: Option<&ElementBinding>,
) -> (Option<String>, Option<BindingStrength>) {
    match binding {
        Some(binding) if binding.strength != BindingStrength::Example => (
            binding
                .value_set
                .as_deref()
                .map(|vs| vs.split('|').next().unwrap_or(vs).to_string()),
            Some(binding.strength),
        ),
        _ => (None, None),
    }
}

/// How many values an object holds for an element
fn present(object: &Map<String, Value>, def: &ElementDefinition) -> usize {
    if def.is_choice() {
        return object
            .iter()
            .filter(|(key, _)| def.matches(key))
            .map(|(_, value)| occurrences(Some(value)).len())
            .sum();
    }
    let found = occurrences(object.get(def.name())).len();
    if found == 0 && object.contains_key(&format!("_{}", def.name())) {
        1
    } else {
        found
    }
}

fn profile_suffix(structure: &StructureSummary) -> String {
    if structure.is_profile() {
        format!(" (profile {})", structure.url)
    } else {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FhirVersion, MediaType};
    use crate::engine::EngineLevel;
    use crate::terminology::InMemoryTerminologyService;
    use serde_json::json;
    use std::time::Duration;

    const GENDER_VS: &str = "http://hl7.org/fhir/ValueSet/administrative-gender";
    const STRICT_PATIENT: &str = "http://example.org/StructureDefinition/strict-patient";

    fn patient_base() -> Value {
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
                {"path": "Patient.maritalStatus", "min": 0, "max": "1",
                 "type": [{"code": "CodeableConcept"}]},
                {"path": "Patient.contact", "min": 0, "max": "*"},
                {"path": "Patient.contact.name", "min": 0, "max": "1"},
                {"path": "Patient.contact.gender", "min": 0, "max": "1"}
            ]}
        })
    }

    fn strict_profile() -> Value {
        json!({
            "resourceType": "StructureDefinition",
            "url": STRICT_PATIENT,
            "type": "Patient",
            "kind": "resource",
            "derivation": "constraint",
            "baseDefinition": "http://hl7.org/fhir/StructureDefinition/Patient",
            "differential": {"element": [
                {"path": "Patient.birthDate", "min": 1, "max": "1"},
                {"path": "Patient.name", "min": 1, "max": "1"}
            ]}
        })
    }

    fn engine(terminology: TerminologyController) -> ConformanceEngine {
        let definitions =
            DefinitionSet::build(FhirVersion::R4, &[], &[patient_base(), strict_profile()])
                .unwrap();
        ConformanceEngine::new(definitions, Arc::new(terminology))
    }

    fn request(resource: Value) -> ValidationRequest {
        ValidationRequest::new(serde_json::to_vec(&resource).unwrap(), MediaType::Json)
    }

    #[tokio::test]
    async fn test_valid_patient_has_no_issues() {
        let engine = engine(TerminologyController::disabled());
        let issues = engine
            .validate(&request(json!({
                "resourceType": "Patient",
                "id": "example",
                "active": true,
                "name": [{"family": "Doe"}]
            })))
            .await
            .unwrap();
        assert!(issues.is_empty(), "unexpected issues: {issues:?}");
    }

    #[tokio::test]
    async fn test_unknown_resource_type() {
        let engine = engine(TerminologyController::disabled());
        let err = engine
            .validate(&request(json!({"resourceType": "Spaceship"})))
            .await
            .unwrap_err();
        assert_eq!(err.kind, EngineErrorKind::UnsupportedResourceType);
        assert_eq!(err.issues.len(), 1);
        assert!(err.issues[0].message.contains("Spaceship"));
    }

    #[tokio::test]
    async fn test_missing_resource_type() {
        let engine = engine(TerminologyController::disabled());
        let err = engine
            .validate(&request(json!({"id": "x"})))
            .await
            .unwrap_err();
        assert_eq!(err.kind, EngineErrorKind::Unprocessable);
    }

    #[tokio::test]
    async fn test_fhir_version_mismatch() {
        let engine = engine(TerminologyController::disabled());
        let err = engine
            .validate(
                &request(json!({"resourceType": "Patient"})).with_fhir_version(FhirVersion::R5),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, EngineErrorKind::UnsupportedVersion);
    }

    #[tokio::test]
    async fn test_unknown_element_and_max_cardinality() {
        let engine = engine(TerminologyController::disabled());
        let issues = engine
            .validate(&request(json!({
                "resourceType": "Patient",
                "colour": "blue",
                "birthDate": ["1970-01-01", "1971-01-01"],
                "contact": [{"name": {"family": "X"}, "shoeSize": 44}]
            })))
            .await
            .unwrap();

        let ids: Vec<_> = issues.iter().map(|i| i.message_id.as_deref().unwrap()).collect();
        assert_eq!(ids, vec!["ELEMENT_UNKNOWN", "CARDINALITY_MAX", "ELEMENT_UNKNOWN"]);
        assert_eq!(issues[0].location, "Patient.colour");
        assert_eq!(issues[2].location, "Patient.contact[0].shoeSize");
    }

    #[tokio::test]
    async fn test_requested_profile_checks() {
        let engine = engine(TerminologyController::disabled());
        let issues = engine
            .validate(
                &request(json!({
                    "resourceType": "Patient",
                    "name": [{"family": "A"}, {"family": "B"}]
                }))
                .with_profiles([STRICT_PATIENT]),
            )
            .await
            .unwrap();

        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].message_id.as_deref(), Some("CARDINALITY_MAX"));
        assert!(issues[0].message.contains(STRICT_PATIENT));
        assert_eq!(issues[1].message_id.as_deref(), Some("CARDINALITY_MIN"));
        assert!(issues[1].message.contains("Patient.birthDate"));
    }

    #[tokio::test]
    async fn test_unknown_profiles() {
        let engine = engine(TerminologyController::disabled());
        let issues = engine
            .validate(
                &request(json!({
                    "resourceType": "Patient",
                    "meta": {"profile": ["http://example.org/unknown-declared"]}
                }))
                .with_profiles(["http://example.org/unknown-requested"]),
            )
            .await
            .unwrap();

        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].level, EngineLevel::Error);
        assert_eq!(issues[0].message_id.as_deref(), Some("PROFILE_UNKNOWN"));
        assert_eq!(issues[1].level, EngineLevel::Warning);
        assert_eq!(issues[1].location, "Patient.meta.profile[0]");
    }

    #[tokio::test]
    async fn test_expected_type_mismatch_is_an_issue() {
        let engine = engine(TerminologyController::disabled());
        let issues = engine
            .validate(
                &request(json!({"resourceType": "Patient"})).with_expected_type("Observation"),
            )
            .await
            .unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].message_id.as_deref(), Some("RESOURCE_TYPE_MISMATCH"));
    }

    #[tokio::test]
    async fn test_disabled_terminology_reports_skipped_bindings_in_order() {
        let engine = engine(TerminologyController::disabled());
        let issues = engine
            .validate(&request(json!({
                "resourceType": "Patient",
                "gender": "male",
                "colour": "blue",
                "maritalStatus": {"coding": [{
                    "system": "http://terminology.hl7.org/CodeSystem/v3-MaritalStatus",
                    "code": "M"
                }]}
            })))
            .await
            .unwrap();

        let ids: Vec<_> = issues.iter().map(|i| i.message_id.as_deref().unwrap()).collect();
        assert_eq!(ids, vec!["TX_CHECK_SKIPPED", "ELEMENT_UNKNOWN", "TX_CHECK_SKIPPED"]);
        assert_eq!(issues[0].location, "Patient.gender");
        assert_eq!(issues[2].location, "Patient.maritalStatus.coding[0]");
        assert!(
            issues
                .iter()
                .filter(|i| i.message_id.as_deref() == Some("TX_CHECK_SKIPPED"))
                .all(|i| i.level == EngineLevel::Information)
        );
    }

    #[tokio::test]
    async fn test_enabled_terminology_rejects_bad_code() {
        let mut service = InMemoryTerminologyService::new();
        service.add_code(GENDER_VS, "male", None, Some("Male"));
        service.add_code(GENDER_VS, "female", None, Some("Female"));
        let controller =
            TerminologyController::enabled(Arc::new(service), Duration::from_secs(1));
        let engine = engine(controller);

        let ok = engine
            .validate(&request(json!({"resourceType": "Patient", "gender": "female"})))
            .await
            .unwrap();
        assert!(ok.is_empty());

        let issues = engine
            .validate(&request(json!({"resourceType": "Patient", "gender": "dragon"})))
            .await
            .unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].level, EngineLevel::Error);
        assert_eq!(issues[0].issue_type, IssueType::CodeInvalid);
    }

    #[tokio::test]
    async fn test_xml_content() {
        let engine = engine(TerminologyController::disabled());
        let xml = br#"<Patient xmlns="http://hl7.org/fhir">
  <id value="x"/>
  <colour value="blue"/>
</Patient>"#;
        let issues = engine
            .validate(&ValidationRequest::new(xml.to_vec(), MediaType::Xml))
            .await
            .unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].location, "Patient.colour");
    }

    #[tokio::test]
    async fn test_validation_is_repeatable() {
        let engine = engine(TerminologyController::disabled());
        let req = request(json!({"resourceType": "Patient", "gender": "male", "colour": 1}))
            .with_profiles([STRICT_PATIENT]);
        let first = engine.validate(&req).await.unwrap();
        let second = engine.validate(&req).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_extend_leaves_original_untouched() {
        let engine = engine(TerminologyController::disabled());
        let extra = json!({
            "resourceType": "StructureDefinition",
            "url": "http://example.org/StructureDefinition/named-patient",
            "type": "Patient",
            "kind": "resource",
            "derivation": "constraint",
            "differential": {"element": [{"path": "Patient.name", "min": 1}]}
        });

        let extended = engine.extend(DefinitionAdditions::resource(extra)).unwrap();
        assert!(extended
            .structures()
            .contains(&"http://example.org/StructureDefinition/named-patient".to_string()));
        assert!(!engine
            .structures()
            .contains(&"http://example.org/StructureDefinition/named-patient".to_string()));
    }
}
