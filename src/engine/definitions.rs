//! Definitions an engine validates against: resource types and StructureDefinitions

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use super::base::R4_RESOURCE_TYPES;
use super::{EngineError, EngineErrorKind, PackageSummary};
use crate::core::FhirVersion;
use crate::package::FhirPackage;
use crate::terminology::BindingStrength;

const CORE_STRUCTURE_PREFIX: &str = "http://hl7.org/fhir/StructureDefinition/";

/// Value set binding of an element
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementBinding {
    pub strength: BindingStrength,
    pub value_set: Option<String>,
}

/// The parts of an ElementDefinition the engine checks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementDefinition {
    /// Element path, e.g. `Patient.name.given`
    pub path: String,
    pub min: u32,
    /// `None` means unbounded (`*`)
    pub max: Option<u32>,
    pub binding: Option<ElementBinding>,
    pub types: Vec<String>,
    /// Set on slice entries, which repeat the path of the sliced element
    pub slice_name: Option<String>,
}

impl ElementDefinition {
    fn from_json(element: &Value) -> Option<Self> {
        let path = element.get("path")?.as_str()?.to_string();
        let min = element
            .get("min")
            .and_then(|v| v.as_u64())
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(0);
        let max = match element.get("max").and_then(|v| v.as_str()) {
            Some("*") | None => None,
            Some(max) => max.parse().ok(),
        };
        let binding = element.get("binding").and_then(|binding| {
            let strength = BindingStrength::parse(binding.get("strength")?.as_str()?)?;
            let value_set = binding
                .get("valueSet")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            Some(ElementBinding {
                strength,
                value_set,
            })
        });
        let types = element
            .get("type")
            .and_then(|v| v.as_array())
            .map(|types| {
                types
                    .iter()
                    .filter_map(|t| t.get("code").and_then(|c| c.as_str()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Some(Self {
            path,
            min,
            max,
            binding,
            types,
            slice_name: element
                .get("sliceName")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        })
    }

    /// Last path segment, without a choice-type suffix
    pub fn name(&self) -> &str {
        let name = self.path.rsplit('.').next().unwrap_or(&self.path);
        name.strip_suffix("[x]").unwrap_or(name)
    }

    pub fn is_choice(&self) -> bool {
        self.path.ends_with("[x]")
    }

    /// Whether a JSON property name refers to this element.
    ///
    /// Choice elements (`value[x]`) match any property that continues the
    /// name with a type, such as `valueQuantity`.
    pub fn matches(&self, property: &str) -> bool {
        if self.is_choice() {
            property
                .strip_prefix(self.name())
                .and_then(|rest| rest.chars().next())
                .is_some_and(|c| c.is_ascii_uppercase())
        } else {
            self.name() == property
        }
    }

    /// Path of the parent element, e.g. `Patient.name` for `Patient.name.given`
    pub fn parent_path(&self) -> Option<&str> {
        self.path.rsplit_once('.').map(|(parent, _)| parent)
    }
}

/// A StructureDefinition, reduced to what validation needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructureSummary {
    pub url: String,
    pub name: Option<String>,
    pub kind: Option<String>,
    /// The resource or data type constrained or defined
    pub type_name: String,
    pub derivation: Option<String>,
    pub base_definition: Option<String>,
    pub is_abstract: bool,
    /// Snapshot elements, or the differential when no snapshot is present
    pub elements: Vec<ElementDefinition>,
}

impl StructureSummary {
    pub fn from_json(resource: &Value) -> Option<Self> {
        if resource.get("resourceType").and_then(|v| v.as_str()) != Some("StructureDefinition") {
            return None;
        }
        let url = resource.get("url")?.as_str()?.to_string();
        let type_name = resource.get("type")?.as_str()?.to_string();
        let text = |key: &str| {
            resource
                .get(key)
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };

        let elements = ["snapshot", "differential"]
            .iter()
            .find_map(|section| resource.get(*section)?.get("element")?.as_array())
            .map(|elements| elements.iter().filter_map(ElementDefinition::from_json).collect())
            .unwrap_or_default();

        Some(Self {
            url,
            name: text("name"),
            kind: text("kind"),
            type_name,
            derivation: text("derivation"),
            base_definition: text("baseDefinition"),
            is_abstract: resource
                .get("abstract")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            elements,
        })
    }

    /// A profile constrains another definition rather than defining a type
    pub fn is_profile(&self) -> bool {
        self.derivation.as_deref() == Some("constraint")
    }

    /// Whether this defines a concrete resource type
    pub fn defines_resource_type(&self) -> bool {
        self.kind.as_deref() == Some("resource")
            && !self.is_abstract
            && !self.is_profile()
            && self.url == format!("{CORE_STRUCTURE_PREFIX}{}", self.type_name)
    }

    pub fn element(&self, path: &str) -> Option<&ElementDefinition> {
        self.elements
            .iter()
            .find(|e| e.path == path && e.slice_name.is_none())
    }

    /// Direct children of an element path, slices excluded
    pub fn children<'a>(&'a self, path: &str) -> impl Iterator<Item = &'a ElementDefinition> {
        self.elements
            .iter()
            .filter(move |e| e.slice_name.is_none() && e.parent_path() == Some(path))
    }

    /// The child definition a JSON property name refers to
    pub fn child(&self, parent: &str, property: &str) -> Option<&ElementDefinition> {
        self.children(parent).find(|e| e.matches(property))
    }
}

/// Every definition an engine has loaded
#[derive(Debug, Clone)]
pub struct DefinitionSet {
    fhir_version: FhirVersion,
    resource_types: BTreeSet<String>,
    structures: BTreeMap<String, StructureSummary>,
    packages: Vec<PackageSummary>,
}

impl DefinitionSet {
    /// Base definitions for a FHIR version, before any package is added
    pub fn base(fhir_version: FhirVersion) -> Self {
        let resource_types = match fhir_version {
            FhirVersion::R4 => R4_RESOURCE_TYPES.iter().map(|t| t.to_string()).collect(),
            _ => BTreeSet::new(),
        };
        Self {
            fhir_version,
            resource_types,
            structures: BTreeMap::new(),
            packages: Vec::new(),
        }
    }

    /// Build definitions from packages and standalone StructureDefinitions.
    ///
    /// Fails when a package targets a different FHIR version, or when no
    /// resource types are known at all (a non-R4 session without its core
    /// package).
    pub fn build(
        fhir_version: FhirVersion,
        packages: &[FhirPackage],
        resources: &[Value],
    ) -> Result<Self, EngineError> {
        let mut set = Self::base(fhir_version);
        for package in packages {
            set.add_package(package)?;
        }
        for resource in resources {
            set.add_resource(resource)?;
        }

        if set.resource_types.is_empty() {
            return Err(EngineError::new(
                EngineErrorKind::UnsupportedVersion,
                format!(
                    "No resource definitions for FHIR {fhir_version}; load the {} package",
                    fhir_version.core_package()
                ),
            ));
        }
        Ok(set)
    }

    /// Add a package. A package with the same id replaces the earlier summary.
    pub fn add_package(&mut self, package: &FhirPackage) -> Result<(), EngineError> {
        if !package.fhir_versions.is_empty()
            && !package
                .fhir_versions
                .iter()
                .any(|v| self.fhir_version.matches(v))
        {
            return Err(EngineError::new(
                EngineErrorKind::UnsupportedVersion,
                format!(
                    "Package {} targets FHIR {}, but the engine is configured for {}",
                    package.key(),
                    package.fhir_versions.join(", "),
                    self.fhir_version
                ),
            ));
        }

        for resource in &package.resources {
            if let Some(structure) = StructureSummary::from_json(resource) {
                self.insert_structure(structure);
            }
        }

        self.packages.retain(|p| p.id != package.id);
        self.packages.push(package.summary());
        debug!(
            package = %package.key(),
            structures = self.structures.len(),
            "Added package definitions"
        );
        Ok(())
    }

    /// Add a standalone StructureDefinition
    pub fn add_resource(&mut self, resource: &Value) -> Result<(), EngineError> {
        let structure = StructureSummary::from_json(resource).ok_or_else(|| {
            EngineError::new(
                EngineErrorKind::Unprocessable,
                "Expected a StructureDefinition with 'url' and 'type'",
            )
        })?;
        self.insert_structure(structure);
        Ok(())
    }

    fn insert_structure(&mut self, structure: StructureSummary) {
        if structure.defines_resource_type() {
            self.resource_types.insert(structure.type_name.clone());
        }
        self.structures.insert(structure.url.clone(), structure);
    }

    pub fn fhir_version(&self) -> FhirVersion {
        self.fhir_version
    }

    pub fn is_resource_type(&self, name: &str) -> bool {
        self.resource_types.contains(name)
    }

    /// Look up a StructureDefinition by canonical, ignoring any `|version` suffix
    pub fn structure(&self, canonical: &str) -> Option<&StructureSummary> {
        let url = canonical.split('|').next().unwrap_or(canonical);
        self.structures.get(url)
    }

    /// The base StructureDefinition of a resource type, when one is loaded
    pub fn base_structure(&self, resource_type: &str) -> Option<&StructureSummary> {
        self.structures
            .get(&format!("{CORE_STRUCTURE_PREFIX}{resource_type}"))
    }

    pub fn resource_types(&self) -> Vec<String> {
        self.resource_types.iter().cloned().collect()
    }

    pub fn structure_urls(&self) -> Vec<String> {
        self.structures.keys().cloned().collect()
    }

    pub fn packages(&self) -> &[PackageSummary] {
        &self.packages
    }
}
