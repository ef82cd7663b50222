use serde::{Deserialize, Serialize};

use super::config::FhirVersion;

/// Serialization formats a resource can arrive in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Json,
    Xml,
}

impl MediaType {
    /// Map a `Content-Type` header value onto a supported media type.
    ///
    /// Parameters such as `charset` are ignored. FHIR-specific subtypes are
    /// accepted as aliases of their generic counterparts.
    pub fn from_content_type(value: &str) -> Option<Self> {
        let essence = value.split(';').next().unwrap_or_default().trim();
        match essence.to_ascii_lowercase().as_str() {
            "application/json" | "application/fhir+json" => Some(MediaType::Json),
            "application/xml" | "application/fhir+xml" | "text/xml" => Some(MediaType::Xml),
            _ => None,
        }
    }

    /// Guess the media type from the first significant byte of a payload
    pub fn sniff(content: &[u8]) -> Option<Self> {
        let first = content
            .iter()
            .find(|b| !b.is_ascii_whitespace() && **b != 0xEF && **b != 0xBB && **b != 0xBF)?;
        match first {
            b'{' | b'[' => Some(MediaType::Json),
            b'<' => Some(MediaType::Xml),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Json => "application/json",
            MediaType::Xml => "application/xml",
        }
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single validation call: resource content plus the profiles to check it against.
///
/// Built by the request translator and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationRequest {
    content: Vec<u8>,
    media_type: MediaType,
    profiles: Vec<String>,
    fhir_version: Option<FhirVersion>,
    expected_type: Option<String>,
}

impl ValidationRequest {
    pub fn new(content: impl Into<Vec<u8>>, media_type: MediaType) -> Self {
        Self {
            content: content.into(),
            media_type,
            profiles: Vec::new(),
            fhir_version: None,
            expected_type: None,
        }
    }

    pub fn with_profiles<I, S>(mut self, profiles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.profiles = profiles.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_fhir_version(mut self, version: FhirVersion) -> Self {
        self.fhir_version = Some(version);
        self
    }

    pub fn with_expected_type(mut self, resource_type: impl Into<String>) -> Self {
        self.expected_type = Some(resource_type.into());
        self
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    /// Profile canonicals to validate against, in request order.
    /// Empty means "the resource's declared type only".
    pub fn profiles(&self) -> &[String] {
        &self.profiles
    }

    pub fn fhir_version(&self) -> Option<FhirVersion> {
        self.fhir_version
    }

    /// Resource type named by a typed route such as `/Patient/$validate`
    pub fn expected_type(&self) -> Option<&str> {
        self.expected_type.as_deref()
    }
}
