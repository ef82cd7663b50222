//! Outcome formatting.
//!
//! Engine issues are translated into [`ValidationIssue`]s with stable field
//! names, so the JSON clients see does not change when the engine behind the
//! adapter does. Issues keep the order the engine reported them in and are
//! never merged or deduplicated.

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Value, json};

use crate::engine::{EngineIssue, EngineLevel};

const LINE_EXTENSION: &str = "http://hl7.org/fhir/StructureDefinition/operationoutcome-issue-line";
const COLUMN_EXTENSION: &str = "http://hl7.org/fhir/StructureDefinition/operationoutcome-issue-col";

/// Issue severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Information,
    Warning,
    Error,
    Fatal,
}

impl IssueSeverity {
    /// Whether an issue of this severity fails validation
    pub fn is_failure(&self) -> bool {
        matches!(self, IssueSeverity::Error | IssueSeverity::Fatal)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IssueSeverity::Information => "information",
            IssueSeverity::Warning => "warning",
            IssueSeverity::Error => "error",
            IssueSeverity::Fatal => "fatal",
        }
    }
}

impl From<EngineLevel> for IssueSeverity {
    fn from(level: EngineLevel) -> Self {
        match level {
            EngineLevel::Fatal => IssueSeverity::Fatal,
            EngineLevel::Error => IssueSeverity::Error,
            EngineLevel::Warning => IssueSeverity::Warning,
            EngineLevel::Information | EngineLevel::Hint => IssueSeverity::Information,
        }
    }
}

/// One issue as it appears on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub severity: IssueSeverity,
    /// Issue category, e.g. `structure` or `code-invalid`
    pub code: String,
    /// Path into the resource; empty for problems with the content as a whole
    pub location: String,
    pub message: String,
    /// Engine diagnostic code, when the engine gives one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

/// The result of one validation call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationOutcome {
    issues: Vec<ValidationIssue>,
}

impl ValidationOutcome {
    pub fn new(issues: Vec<ValidationIssue>) -> Self {
        Self { issues }
    }

    /// True when no issue is an error or fatal
    pub fn success(&self) -> bool {
        !self.issues.iter().any(|issue| issue.severity.is_failure())
    }

    pub fn issues(&self) -> &[ValidationIssue] {
        &self.issues
    }

    pub fn count(&self, severity: IssueSeverity) -> usize {
        self.issues.iter().filter(|i| i.severity == severity).count()
    }

    /// Most severe issue level present
    pub fn highest_severity(&self) -> Option<IssueSeverity> {
        self.issues.iter().map(|i| i.severity).max()
    }
}

impl Serialize for ValidationOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("ValidationOutcome", 2)?;
        state.serialize_field("success", &self.success())?;
        state.serialize_field("issues", &self.issues)?;
        state.end()
    }
}

/// Translates engine issues into the wire representation
pub struct OutcomeFormatter;

impl OutcomeFormatter {
    pub fn issue(issue: EngineIssue) -> ValidationIssue {
        ValidationIssue {
            severity: issue.level.into(),
            code: issue.issue_type.as_str().to_string(),
            location: issue.location,
            message: issue.message,
            diagnostics: issue.message_id,
            line: issue.line,
            column: issue.column,
        }
    }

    pub fn format(issues: Vec<EngineIssue>) -> ValidationOutcome {
        ValidationOutcome::new(issues.into_iter().map(Self::issue).collect())
    }

    /// Render an outcome as a FHIR OperationOutcome
    pub fn operation_outcome(outcome: &ValidationOutcome) -> Value {
        let issues: Vec<Value> = if outcome.issues().is_empty() {
            vec![json!({
                "severity": "information",
                "code": "informational",
                "details": {"text": "All OK"}
            })]
        } else {
            outcome.issues().iter().map(fhir_issue).collect()
        };

        json!({
            "resourceType": "OperationOutcome",
            "issue": issues
        })
    }
}

fn fhir_issue(issue: &ValidationIssue) -> Value {
    let mut value = json!({
        "severity": issue.severity.as_str(),
        "code": issue.code,
        "details": {"text": issue.message},
    });

    if let Some(diagnostics) = &issue.diagnostics {
        value["diagnostics"] = json!(diagnostics);
    }
    if !issue.location.is_empty() {
        value["expression"] = json!([issue.location]);
        value["location"] = json!([issue.location]);
    }

    let mut extensions = Vec::new();
    if let Some(line) = issue.line {
        extensions.push(json!({"url": LINE_EXTENSION, "valueInteger": line}));
    }
    if let Some(column) = issue.column {
        extensions.push(json!({"url": COLUMN_EXTENSION, "valueInteger": column}));
    }
    if !extensions.is_empty() {
        value["extension"] = Value::Array(extensions);
    }

    value
}
