//! Job requirement documents.
//!
//! Producers describe what a job needs as a loosely typed document. This
//! module parses and validates it into a [`TaskQueueDefinition`].

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

use super::definition::{CpuSegments, MultiValueField, TaskQueueDefinition};

/// Requirements attached to a job at insertion time.
///
/// Mandatory fields are `ownerIdentity`, `ownerGroup`, `setup` and `cpuTime`.
/// List fields are optional, but when present must hold at least one value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequirements {
    pub owner_identity: Option<String>,
    pub owner_group: Option<String>,
    pub setup: Option<String>,
    pub cpu_time: Option<u64>,
    pub sites: Option<Vec<String>>,
    pub compute_elements: Option<Vec<String>>,
    pub middlewares: Option<Vec<String>>,
    pub banned_sites: Option<Vec<String>>,
    pub platforms: Option<Vec<String>>,
    pub pilot_types: Option<Vec<String>>,
    pub submit_pools: Option<Vec<String>>,
}

impl JobRequirements {
    /// Creates requirements with the mandatory single-value fields set.
    pub fn new(
        owner_identity: impl Into<String>,
        owner_group: impl Into<String>,
        setup: impl Into<String>,
        cpu_time: u64,
    ) -> Self {
        Self {
            owner_identity: Some(owner_identity.into()),
            owner_group: Some(owner_group.into()),
            setup: Some(setup.into()),
            cpu_time: Some(cpu_time),
            ..Default::default()
        }
    }

    /// Parses a JSON requirements document.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::Malformed` when a field has the wrong type.
    pub fn from_json(value: serde_json::Value) -> Result<Self, ValidationError> {
        Ok(serde_json::from_value(value)?)
    }

    /// Parses a JSON requirements document from text.
    pub fn from_json_str(text: &str) -> Result<Self, ValidationError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Sets a list attribute.
    pub fn with_values<I, S>(mut self, field: MultiValueField, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.slot_mut(field) = Some(values.into_iter().map(Into::into).collect());
        self
    }

    /// Returns the list declared for `field`, if any.
    pub fn values(&self, field: MultiValueField) -> Option<&Vec<String>> {
        match field {
            MultiValueField::Sites => self.sites.as_ref(),
            MultiValueField::ComputeElements => self.compute_elements.as_ref(),
            MultiValueField::Middlewares => self.middlewares.as_ref(),
            MultiValueField::BannedSites => self.banned_sites.as_ref(),
            MultiValueField::Platforms => self.platforms.as_ref(),
            MultiValueField::PilotTypes => self.pilot_types.as_ref(),
            MultiValueField::SubmitPools => self.submit_pools.as_ref(),
        }
    }

    fn slot_mut(&mut self, field: MultiValueField) -> &mut Option<Vec<String>> {
        match field {
            MultiValueField::Sites => &mut self.sites,
            MultiValueField::ComputeElements => &mut self.compute_elements,
            MultiValueField::Middlewares => &mut self.middlewares,
            MultiValueField::BannedSites => &mut self.banned_sites,
            MultiValueField::Platforms => &mut self.platforms,
            MultiValueField::PilotTypes => &mut self.pilot_types,
            MultiValueField::SubmitPools => &mut self.submit_pools,
        }
    }

    /// Validates the requirements and builds the task-queue definition.
    ///
    /// The CPU time is bucketed into `segments`; list values are trimmed and
    /// deduplicated.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` describing the first offending field.
    pub fn to_definition(
        &self,
        segments: &CpuSegments,
    ) -> Result<TaskQueueDefinition, ValidationError> {
        let owner_identity = required_text(&self.owner_identity, "ownerIdentity")?;
        let owner_group = required_text(&self.owner_group, "ownerGroup")?;
        let setup = required_text(&self.setup, "setup")?;
        let cpu_time = self
            .cpu_time
            .ok_or(ValidationError::MissingField("cpuTime"))?;

        let mut definition = TaskQueueDefinition::new(
            owner_identity,
            owner_group,
            setup,
            segments.bucket(cpu_time),
        );

        for field in MultiValueField::ALL {
            let Some(values) = self.values(field) else {
                continue;
            };
            let tag = field.as_str();
            if values.is_empty() {
                return Err(ValidationError::EmptyList(tag));
            }
            let mut cleaned = Vec::with_capacity(values.len());
            for value in values {
                let value = value.trim();
                if value.is_empty() {
                    return Err(ValidationError::InvalidValue {
                        field: tag,
                        reason: "list values must not be blank".to_string(),
                    });
                }
                cleaned.push(value.to_string());
            }
            definition = definition.with_values(field, cleaned);
        }

        Ok(definition)
    }
}

fn required_text(value: &Option<String>, field: &'static str) -> Result<String, ValidationError> {
    let value = value.as_deref().ok_or(ValidationError::MissingField(field))?;
    let value = value.trim();
    if value.is_empty() {
        return Err(ValidationError::EmptyField(field));
    }
    Ok(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_and_bucket() {
        let reqs = JobRequirements::from_json(json!({
            "ownerIdentity": "/DC=org/CN=alice",
            "ownerGroup": "biomed_user",
            "setup": "Production",
            "cpuTime": 1000,
            "sites": ["LCG.CERN.ch", " LCG.PIC.es ", "LCG.CERN.ch"]
        }))
        .expect("document should parse");

        let def = reqs
            .to_definition(&CpuSegments::default())
            .expect("requirements should validate");
        assert_eq!(def.cpu_time, 5_000);
        let sites = def.values(MultiValueField::Sites).expect("sites present");
        assert_eq!(sites.len(), 2);
        assert!(sites.contains("LCG.PIC.es"));
        assert!(def.values(MultiValueField::BannedSites).is_none());
    }

    #[test]
    fn test_document_without_owner_identity_is_rejected() {
        let reqs = JobRequirements::from_json(json!({
            "ownerGroup": "g",
            "setup": "S",
            "cpuTime": 1000
        }))
        .expect("document should parse");

        let err = reqs.to_definition(&CpuSegments::default()).unwrap_err();
        assert!(matches!(err, ValidationError::MissingField("ownerIdentity")));
        assert!(err.to_string().contains("ownerIdentity"));
    }

    #[test]
    fn test_missing_mandatory_field() {
        let reqs = JobRequirements {
            owner_group: Some("g".to_string()),
            setup: Some("S".to_string()),
            cpu_time: Some(10),
            ..Default::default()
        };
        let err = reqs
            .to_definition(&CpuSegments::default())
            .expect_err("owner identity is mandatory");
        assert!(matches!(err, ValidationError::MissingField("ownerIdentity")));

        let reqs = JobRequirements {
            cpu_time: None,
            ..JobRequirements::new("u", "g", "S", 0)
        };
        assert!(matches!(
            reqs.to_definition(&CpuSegments::default()),
            Err(ValidationError::MissingField("cpuTime"))
        ));
    }

    #[test]
    fn test_blank_single_value_rejected() {
        let reqs = JobRequirements::new("u", "  ", "S", 10);
        assert!(matches!(
            reqs.to_definition(&CpuSegments::default()),
            Err(ValidationError::EmptyField("ownerGroup"))
        ));
    }

    #[test]
    fn test_empty_list_rejected() {
        let reqs = JobRequirements::new("u", "g", "S", 10)
            .with_values(MultiValueField::Platforms, Vec::<String>::new());
        assert!(matches!(
            reqs.to_definition(&CpuSegments::default()),
            Err(ValidationError::EmptyList("platforms"))
        ));

        let reqs = JobRequirements::new("u", "g", "S", 10)
            .with_values(MultiValueField::Sites, ["A", " "]);
        assert!(matches!(
            reqs.to_definition(&CpuSegments::default()),
            Err(ValidationError::InvalidValue { field: "sites", .. })
        ));
    }

    #[test]
    fn test_wrong_type_is_malformed() {
        let err = JobRequirements::from_json(json!({
            "ownerIdentity": "u",
            "ownerGroup": "g",
            "setup": "S",
            "cpuTime": "lots"
        }))
        .expect_err("cpuTime must be an integer");
        assert!(matches!(err, ValidationError::Malformed(_)));

        let err = JobRequirements::from_json(json!({ "sites": "LCG.CERN.ch" }))
            .expect_err("sites must be a list");
        assert!(matches!(err, ValidationError::Malformed(_)));
    }

    #[test]
    fn test_identical_documents_give_identical_definitions() {
        let doc = json!({
            "ownerIdentity": "u",
            "ownerGroup": "g",
            "setup": "S",
            "cpuTime": 4000,
            "platforms": ["EL9", "EL8"]
        });
        let segments = CpuSegments::default();
        let first = JobRequirements::from_json(doc.clone())
            .and_then(|r| r.to_definition(&segments))
            .expect("valid");
        let second = JobRequirements::from_json(doc)
            .and_then(|r| r.to_definition(&segments))
            .expect("valid");
        assert_eq!(first, second);
        assert_eq!(first.fingerprint(), second.fingerprint());
    }
}
