//! Static source → target field mapping.
//!
//! A [`FieldMapping`] is a table of [`FieldRule`]s. [`FieldMapping::map`] is a
//! pure function: it reads a source [`Record`], applies each rule, and
//! produces a [`MappedRecord`]. Source fields that no rule mentions are
//! dropped silently.
//!
//! The same table doubles as the schema for [`RecordBuilder`], which rejects
//! undeclared fields and missing required fields at construction time.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::MappingError;
use crate::models::{FieldValue, Fields, MappedRecord, Record};

/// Value transform applied after a source field is read.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Transform {
    Trim,
    Lowercase,
    Uppercase,
}

impl Transform {
    /// Only text values are transformed; numbers and dates pass through.
    pub fn apply(self, value: FieldValue) -> FieldValue {
        match value {
            FieldValue::Text(s) => FieldValue::Text(match self {
                Self::Trim => s.trim().to_string(),
                Self::Lowercase => s.to_lowercase(),
                Self::Uppercase => s.to_uppercase(),
            }),
            other => other,
        }
    }
}

/// One row of the mapping table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldRule {
    /// Field name on the source record.
    pub source: String,

    /// Field name on the target record.
    pub target: String,

    #[serde(default)]
    pub transform: Option<Transform>,

    /// The target requires this field.
    #[serde(default)]
    pub required: bool,

    /// Used when the source value is absent or blank.
    #[serde(default)]
    pub default: Option<FieldValue>,
}

impl FieldRule {
    pub fn new(source: &str, target: &str) -> Self {
        Self {
            source: source.to_string(),
            target: target.to_string(),
            transform: None,
            required: false,
            default: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn with_default(mut self, value: impl Into<FieldValue>) -> Self {
        self.default = Some(value.into());
        self
    }
}

/// The mapping table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct FieldMapping {
    rules: Vec<FieldRule>,
}

impl Default for FieldMapping {
    fn default() -> Self {
        Self::contacts()
    }
}

impl FieldMapping {
    /// Build a mapping, rejecting tables where two rules write the same
    /// target field.
    pub fn new(rules: Vec<FieldRule>) -> Result<Self, MappingError> {
        let mut seen = HashSet::new();
        for rule in &rules {
            if !seen.insert(rule.target.as_str()) {
                return Err(MappingError::DuplicateTarget(rule.target.clone()));
            }
        }
        Ok(Self { rules })
    }

    /// Contact mapping from a Salesforce-style source to a Dynamics-style
    /// target.
    pub fn contacts() -> Self {
        Self {
            rules: vec![
                FieldRule::new("LastName", "lastname").required(),
                FieldRule::new("Email", "emailaddress1"),
                FieldRule::new("Description", "description"),
                FieldRule::new("Fax", "fax"),
                FieldRule::new("Phone", "telephone1"),
            ],
        }
    }

    pub fn rules(&self) -> &[FieldRule] {
        &self.rules
    }

    /// Source field feeding `target`, if any rule produces it.
    pub fn source_for(&self, target: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|r| r.target == target)
            .map(|r| r.source.as_str())
    }

    /// Check that every field the target requires is produced by a rule.
    pub fn validate_required<S: AsRef<str>>(&self, required_targets: &[S]) -> Result<(), MappingError> {
        for target in required_targets {
            let target = target.as_ref();
            if self.source_for(target).is_none() {
                return Err(MappingError::UnmappedTargetField(target.to_string()));
            }
        }
        Ok(())
    }

    /// Map a source record onto the target schema.
    ///
    /// Values are copied verbatim unless the rule names a transform. A blank
    /// value only counts as missing for a required rule.
    pub fn map(&self, record: &Record) -> Result<MappedRecord, MappingError> {
        let mut fields = Fields::new();

        for rule in &self.rules {
            let value = record
                .get(&rule.source)
                .filter(|v| !(rule.required && v.is_blank()))
                .cloned()
                .map(|v| match rule.transform {
                    Some(t) => t.apply(v),
                    None => v,
                })
                .or_else(|| rule.default.clone());

            match value {
                Some(v) => {
                    fields.insert(rule.target.clone(), v);
                }
                None if rule.required => {
                    return Err(MappingError::MissingRequiredField {
                        field: rule.target.clone(),
                    });
                }
                None => {}
            }
        }

        debug!(
            source_id = %record.id,
            mapped = fields.len(),
            dropped = record.fields.len().saturating_sub(fields.len()),
            "mapped record"
        );

        Ok(MappedRecord {
            source_id: record.id.clone(),
            fields,
        })
    }

    /// Start a schema-checked source record.
    pub fn record_builder(&self) -> RecordBuilder<'_> {
        RecordBuilder {
            mapping: self,
            fields: Fields::new(),
            errors: Vec::new(),
        }
    }
}

/// Builds source-side [`Fields`] validated against a [`FieldMapping`].
pub struct RecordBuilder<'a> {
    mapping: &'a FieldMapping,
    fields: Fields,
    errors: Vec<MappingError>,
}

impl RecordBuilder<'_> {
    /// Set a source field. Undeclared names are reported by [`build`](Self::build).
    pub fn with(mut self, field: &str, value: impl Into<FieldValue>) -> Self {
        if self.mapping.rules.iter().any(|r| r.source == field) {
            self.fields.insert(field.to_string(), value.into());
        } else {
            self.errors.push(MappingError::UnknownField(field.to_string()));
        }
        self
    }

    pub fn build(self) -> Result<Fields, MappingError> {
        if let Some(err) = self.errors.into_iter().next() {
            return Err(err);
        }
        for rule in self.mapping.rules.iter().filter(|r| r.required && r.default.is_none()) {
            let present = self
                .fields
                .get(&rule.source)
                .is_some_and(|v| !v.is_blank());
            if !present {
                return Err(MappingError::MissingRequiredField {
                    field: rule.source.clone(),
                });
            }
        }
        Ok(self.fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordId;
    use chrono::Utc;

    fn source(fields: Fields) -> Record {
        Record {
            id: RecordId::new("003A"),
            modified_at: Utc::now(),
            fields,
        }
    }

    #[test]
    fn test_contact_mapping_copies_all_fields() {
        let mapping = FieldMapping::contacts();
        let fields = mapping
            .record_builder()
            .with("LastName", "Test-1234")
            .with("Phone", "1234567")
            .with("Fax", "5556666")
            .with("Description", "Testing description")
            .with("Email", "test-1234@x.com")
            .build()
            .unwrap();

        let mapped = mapping.map(&source(fields)).unwrap();
        assert_eq!(mapped.source_id.as_str(), "003A");
        assert_eq!(mapped.fields["emailaddress1"], FieldValue::from("test-1234@x.com"));
        assert_eq!(mapped.fields["description"], FieldValue::from("Testing description"));
        assert_eq!(mapped.fields["fax"], FieldValue::from("5556666"));
        assert_eq!(mapped.fields["telephone1"], FieldValue::from("1234567"));
        assert_eq!(mapped.fields["lastname"], FieldValue::from("Test-1234"));
    }

    #[test]
    fn test_values_are_copied_verbatim() {
        let mut fields = Fields::new();
        fields.insert("LastName".into(), "Doe".into());
        fields.insert("Email".into(), " doe@x.com ".into());
        fields.insert("Description".into(), "  ".into());

        let mapped = FieldMapping::contacts().map(&source(fields)).unwrap();
        assert_eq!(mapped.fields["emailaddress1"], FieldValue::from(" doe@x.com "));
        assert_eq!(mapped.fields["description"], FieldValue::from("  "));

        let mut blank_name = Fields::new();
        blank_name.insert("LastName".into(), " ".into());
        assert!(FieldMapping::contacts().map(&source(blank_name)).is_err());
    }

    #[test]
    fn test_unmapped_source_fields_are_dropped() {
        let mut fields = Fields::new();
        fields.insert("LastName".into(), "Doe".into());
        fields.insert("MailingCity".into(), "Springfield".into());

        let mapped = FieldMapping::contacts().map(&source(fields)).unwrap();
        assert_eq!(mapped.fields.len(), 1);
        assert!(!mapped.fields.values().any(|v| v == &FieldValue::from("Springfield")));
    }

    #[test]
    fn test_missing_required_field() {
        let mut fields = Fields::new();
        fields.insert("Email".into(), "a@b.c".into());
        let err = FieldMapping::contacts().map(&source(fields)).unwrap_err();
        assert_eq!(
            err,
            MappingError::MissingRequiredField {
                field: "lastname".into()
            }
        );
    }

    #[test]
    fn test_default_fills_missing_value() {
        let mapping = FieldMapping::new(vec![
            FieldRule::new("LastName", "lastname").required(),
            FieldRule::new("LeadSource", "leadsourcecode")
                .required()
                .with_default("Web"),
        ])
        .unwrap();
        let mut fields = Fields::new();
        fields.insert("LastName".into(), "Doe".into());
        fields.insert("LeadSource".into(), "   ".into());

        let mapped = mapping.map(&source(fields)).unwrap();
        assert_eq!(mapped.fields["leadsourcecode"], FieldValue::from("Web"));
    }

    #[test]
    fn test_transform_applies_to_text_only() {
        assert_eq!(
            Transform::Lowercase.apply("ABC@X.COM".into()),
            FieldValue::from("abc@x.com")
        );
        assert_eq!(
            Transform::Uppercase.apply(FieldValue::Number(2.0)),
            FieldValue::Number(2.0)
        );
    }

    #[test]
    fn test_validate_required_targets() {
        let mapping = FieldMapping::contacts();
        assert!(mapping.validate_required(&["lastname", "emailaddress1"]).is_ok());
        assert_eq!(
            mapping.validate_required(&["mobilephone"]).unwrap_err(),
            MappingError::UnmappedTargetField("mobilephone".into())
        );
    }

    #[test]
    fn test_duplicate_target_rejected() {
        let err = FieldMapping::new(vec![
            FieldRule::new("Phone", "telephone1"),
            FieldRule::new("MobilePhone", "telephone1"),
        ])
        .unwrap_err();
        assert_eq!(err, MappingError::DuplicateTarget("telephone1".into()));
    }

    #[test]
    fn test_builder_rejects_unknown_and_missing() {
        let mapping = FieldMapping::contacts();
        let err = mapping
            .record_builder()
            .with("LastName", "Doe")
            .with("Nickname", "DJ")
            .build()
            .unwrap_err();
        assert_eq!(err, MappingError::UnknownField("Nickname".into()));

        let err = mapping.record_builder().with("Email", "x@y.z").build().unwrap_err();
        assert_eq!(
            err,
            MappingError::MissingRequiredField {
                field: "LastName".into()
            }
        );
    }

    #[test]
    fn test_mapping_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            mapping: FieldMapping,
        }
        let parsed: Wrapper = toml::from_str(
            r#"
[[mapping]]
source = "LastName"
target = "lastname"
required = true

[[mapping]]
source = "Email"
target = "emailaddress1"
transform = "lowercase"
"#,
        )
        .unwrap();
        assert_eq!(parsed.mapping.rules().len(), 2);
        assert_eq!(parsed.mapping.rules()[1].transform, Some(Transform::Lowercase));
    }
}
