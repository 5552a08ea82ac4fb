//! Resource capability descriptions and the candidate predicate.
//!
//! A [`Capabilities`] document is the dual of a task-queue definition: every
//! field is optional and single-valued. Once validated into a
//! [`MatchFilter`] it decides which task queues a resource may run.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

use super::definition::{MultiValueField, TaskQueueDefinition};

/// What a resource offers when asking for work.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    /// Identity of the requester (needed for private pilots).
    pub owner_identity: Option<String>,
    /// Group of the requester (needed for private pilots).
    pub owner_group: Option<String>,
    pub setup: Option<String>,
    /// CPU time the resource can offer, in seconds.
    pub cpu_time: Option<u64>,
    pub pilot_type: Option<String>,
    pub site: Option<String>,
    pub compute_element: Option<String>,
    pub middleware: Option<String>,
    pub platform: Option<String>,
    pub submit_pool: Option<String>,
}

impl Capabilities {
    /// Creates an empty description that matches every enabled task queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON capabilities document.
    pub fn from_json(value: serde_json::Value) -> Result<Self, ValidationError> {
        Ok(serde_json::from_value(value)?)
    }

    /// Parses a JSON capabilities document from text.
    pub fn from_json_str(text: &str) -> Result<Self, ValidationError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Sets the setup.
    pub fn with_setup(mut self, setup: impl Into<String>) -> Self {
        self.setup = Some(setup.into());
        self
    }

    /// Sets the offered CPU time.
    pub fn with_cpu_time(mut self, cpu_time: u64) -> Self {
        self.cpu_time = Some(cpu_time);
        self
    }

    /// Sets the requester identity and group.
    pub fn with_owner(mut self, identity: impl Into<String>, group: impl Into<String>) -> Self {
        self.owner_identity = Some(identity.into());
        self.owner_group = Some(group.into());
        self
    }

    /// Sets the pilot type.
    pub fn with_pilot_type(mut self, pilot_type: impl Into<String>) -> Self {
        self.pilot_type = Some(pilot_type.into());
        self
    }

    /// Sets the offered value of a matched multi-value attribute.
    ///
    /// Attributes a resource cannot offer (`bannedSites`, `pilotTypes`) are
    /// ignored.
    pub fn with_value(mut self, field: MultiValueField, value: impl Into<String>) -> Self {
        let value = Some(value.into());
        match field {
            MultiValueField::Sites => self.site = value,
            MultiValueField::ComputeElements => self.compute_element = value,
            MultiValueField::Middlewares => self.middleware = value,
            MultiValueField::Platforms => self.platform = value,
            MultiValueField::SubmitPools => self.submit_pool = value,
            MultiValueField::BannedSites | MultiValueField::PilotTypes => {}
        }
        self
    }

    /// Returns the offered value for a matched multi-value attribute.
    pub fn value(&self, field: MultiValueField) -> Option<&str> {
        match field {
            MultiValueField::Sites => self.site.as_deref(),
            MultiValueField::ComputeElements => self.compute_element.as_deref(),
            MultiValueField::Middlewares => self.middleware.as_deref(),
            MultiValueField::Platforms => self.platform.as_deref(),
            MultiValueField::SubmitPools => self.submit_pool.as_deref(),
            MultiValueField::BannedSites | MultiValueField::PilotTypes => None,
        }
    }

    /// Validates the description into a [`MatchFilter`].
    ///
    /// A pilot type listed in `private_pilot_types` restricts matching to the
    /// requester's own task queues, so the requester identity and group become
    /// mandatory.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` for blank values or an incomplete private
    /// pilot request.
    pub fn validate(
        &self,
        private_pilot_types: &BTreeSet<String>,
    ) -> Result<MatchFilter, ValidationError> {
        let setup = optional_text(&self.setup, "setup")?;
        let pilot_type = optional_text(&self.pilot_type, "pilotType")?;
        let owner_identity = optional_text(&self.owner_identity, "ownerIdentity")?;
        let owner_group = optional_text(&self.owner_group, "ownerGroup")?;

        let owner = match pilot_type {
            Some(pilot) if private_pilot_types.contains(&pilot) => {
                match (owner_identity, owner_group) {
                    (Some(identity), Some(group)) => Some(OwnerRestriction { identity, group }),
                    _ => return Err(ValidationError::PrivatePilotWithoutOwner(pilot)),
                }
            }
            _ => None,
        };

        let mut offered = Vec::new();
        for field in MultiValueField::MATCHED {
            let Some(value) = self.value(field) else {
                continue;
            };
            let value = value.trim();
            if value.is_empty() {
                return Err(ValidationError::EmptyField(capability_name(field)));
            }
            offered.push((field, value.to_string()));
        }

        Ok(MatchFilter {
            setup,
            cpu_time: self.cpu_time,
            owner,
            offered,
        })
    }
}

/// Owner a private pilot is restricted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerRestriction {
    pub identity: String,
    pub group: String,
}

/// A validated capability description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchFilter {
    setup: Option<String>,
    cpu_time: Option<u64>,
    owner: Option<OwnerRestriction>,
    offered: Vec<(MultiValueField, String)>,
}

impl MatchFilter {
    /// Required setup, if any.
    pub fn setup(&self) -> Option<&str> {
        self.setup.as_deref()
    }

    /// Maximum task-queue CPU time the resource accepts, if any.
    pub fn cpu_time(&self) -> Option<u64> {
        self.cpu_time
    }

    /// Owner restriction for private pilots.
    pub fn owner(&self) -> Option<&OwnerRestriction> {
        self.owner.as_ref()
    }

    /// Offered values for the matched multi-value attributes.
    pub fn offered(&self) -> impl Iterator<Item = (MultiValueField, &str)> {
        self.offered
            .iter()
            .map(|(field, value)| (*field, value.as_str()))
    }

    /// Offered site, checked against `bannedSites`.
    pub fn site(&self) -> Option<&str> {
        self.offered()
            .find(|(field, _)| *field == MultiValueField::Sites)
            .map(|(_, value)| value)
    }

    /// Returns true if a task queue with this definition may run on the
    /// resource. The `enabled` gate is checked by the store, not here.
    pub fn admits(&self, definition: &TaskQueueDefinition) -> bool {
        if let Some(setup) = &self.setup {
            if &definition.setup != setup {
                return false;
            }
        }

        if let Some(cpu_time) = self.cpu_time {
            if definition.cpu_time > cpu_time {
                return false;
            }
        }

        if let Some(owner) = &self.owner {
            if definition.owner_identity != owner.identity || definition.owner_group != owner.group
            {
                return false;
            }
        }

        for (field, value) in self.offered() {
            if let Some(accepted) = definition.values(field) {
                if !accepted.contains(value) {
                    return false;
                }
            }
        }

        if let Some(site) = self.site() {
            if let Some(banned) = definition.values(MultiValueField::BannedSites) {
                if banned.contains(site) {
                    return false;
                }
            }
        }

        true
    }
}

fn optional_text(
    value: &Option<String>,
    field: &'static str,
) -> Result<Option<String>, ValidationError> {
    match value.as_deref().map(str::trim) {
        None => Ok(None),
        Some("") => Err(ValidationError::EmptyField(field)),
        Some(text) => Ok(Some(text.to_string())),
    }
}

fn capability_name(field: MultiValueField) -> &'static str {
    match field {
        MultiValueField::Sites => "site",
        MultiValueField::ComputeElements => "computeElement",
        MultiValueField::Middlewares => "middleware",
        MultiValueField::Platforms => "platform",
        MultiValueField::SubmitPools => "submitPool",
        MultiValueField::BannedSites => "bannedSites",
        MultiValueField::PilotTypes => "pilotType",
    }
}
