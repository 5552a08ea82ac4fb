//! Task-queue definitions.
//!
//! A [`TaskQueueDefinition`] is the equivalence-class key for pending jobs:
//! two jobs land in the same task queue iff their definitions are equal.
//! Single-value attributes compare by value; multi-value attributes compare
//! as sets, and an absent attribute (wildcard) is never equal to a present
//! one, even a present-but-empty one.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ValidationError;

/// Identifier of a persisted task queue.
pub type TaskQueueId = i64;

/// Default CPU time segment boundaries, in seconds.
pub const DEFAULT_CPU_SEGMENTS: [u64; 4] = [500, 5_000, 50_000, 300_000];

/// Multi-value attributes of a task queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MultiValueField {
    Sites,
    ComputeElements,
    Middlewares,
    BannedSites,
    Platforms,
    PilotTypes,
    SubmitPools,
}

impl MultiValueField {
    /// Every multi-value attribute, in canonical order.
    pub const ALL: [MultiValueField; 7] = [
        MultiValueField::Sites,
        MultiValueField::ComputeElements,
        MultiValueField::Middlewares,
        MultiValueField::BannedSites,
        MultiValueField::Platforms,
        MultiValueField::PilotTypes,
        MultiValueField::SubmitPools,
    ];

    /// Attributes a resource offers a single value for during matching.
    pub const MATCHED: [MultiValueField; 5] = [
        MultiValueField::Sites,
        MultiValueField::ComputeElements,
        MultiValueField::Middlewares,
        MultiValueField::Platforms,
        MultiValueField::SubmitPools,
    ];

    /// Stable tag used in documents and in the multi-value table.
    pub fn as_str(&self) -> &'static str {
        match self {
            MultiValueField::Sites => "sites",
            MultiValueField::ComputeElements => "computeElements",
            MultiValueField::Middlewares => "middlewares",
            MultiValueField::BannedSites => "bannedSites",
            MultiValueField::Platforms => "platforms",
            MultiValueField::PilotTypes => "pilotTypes",
            MultiValueField::SubmitPools => "submitPools",
        }
    }

    /// Parses a tag produced by [`MultiValueField::as_str`].
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|field| field.as_str() == tag)
    }
}

impl fmt::Display for MultiValueField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ascending CPU time segment boundaries used to bucket job requirements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuSegments(Vec<u64>);

impl CpuSegments {
    /// Creates a segment sequence.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidValue` if the boundaries are empty or
    /// not strictly ascending.
    pub fn new(boundaries: Vec<u64>) -> Result<Self, ValidationError> {
        if boundaries.is_empty() {
            return Err(ValidationError::InvalidValue {
                field: "cpuSegments",
                reason: "at least one boundary is required".to_string(),
            });
        }
        if boundaries.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(ValidationError::InvalidValue {
                field: "cpuSegments",
                reason: format!("boundaries must be strictly ascending: {:?}", boundaries),
            });
        }
        Ok(Self(boundaries))
    }

    /// Maps a requested CPU time to its segment boundary.
    ///
    /// Values up to a boundary map to the first boundary that is >= the
    /// value; values above the last boundary map to the last boundary.
    pub fn bucket(&self, cpu_time: u64) -> u64 {
        self.0
            .iter()
            .copied()
            .find(|boundary| cpu_time <= *boundary)
            .or_else(|| self.0.last().copied())
            .unwrap_or(cpu_time)
    }

    /// Returns the boundaries in ascending order.
    pub fn boundaries(&self) -> &[u64] {
        &self.0
    }
}

impl Default for CpuSegments {
    fn default() -> Self {
        Self(DEFAULT_CPU_SEGMENTS.to_vec())
    }
}

/// The equivalence-class key of a task queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskQueueDefinition {
    /// Principal owning the jobs.
    pub owner_identity: String,
    /// Group the owner submitted under.
    pub owner_group: String,
    /// Deployment instance jobs and resources must agree on.
    pub setup: String,
    /// CPU time requirement, always a segment boundary.
    pub cpu_time: u64,
    /// Present multi-value attributes. A missing key is a wildcard.
    multi_values: BTreeMap<MultiValueField, BTreeSet<String>>,
}

impl TaskQueueDefinition {
    /// Creates a definition with no multi-value constraints.
    pub fn new(
        owner_identity: impl Into<String>,
        owner_group: impl Into<String>,
        setup: impl Into<String>,
        cpu_time: u64,
    ) -> Self {
        Self {
            owner_identity: owner_identity.into(),
            owner_group: owner_group.into(),
            setup: setup.into(),
            cpu_time,
            multi_values: BTreeMap::new(),
        }
    }

    /// Declares a multi-value attribute. Duplicate values collapse.
    pub fn with_values<I, S>(mut self, field: MultiValueField, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.multi_values
            .insert(field, values.into_iter().map(Into::into).collect());
        self
    }

    /// Returns the set declared for `field`, or `None` for a wildcard.
    pub fn values(&self, field: MultiValueField) -> Option<&BTreeSet<String>> {
        self.multi_values.get(&field)
    }

    /// Iterates over the declared multi-value attributes.
    pub fn multi_values(&self) -> impl Iterator<Item = (MultiValueField, &BTreeSet<String>)> {
        self.multi_values.iter().map(|(field, values)| (*field, values))
    }

    /// Canonical SHA-256 fingerprint of this definition.
    ///
    /// Equal definitions share a fingerprint. Every string is length-prefixed
    /// and absent attributes are encoded as `*`, so wildcard, empty set and
    /// populated sets never collide.
    pub fn fingerprint(&self) -> String {
        let mut canonical = String::new();
        push_field(&mut canonical, "ownerIdentity", &self.owner_identity);
        push_field(&mut canonical, "ownerGroup", &self.owner_group);
        push_field(&mut canonical, "setup", &self.setup);
        canonical.push_str(&format!("cpuTime={};", self.cpu_time));

        for field in MultiValueField::ALL {
            match self.multi_values.get(&field) {
                None => canonical.push_str(&format!("{}=*;", field)),
                Some(values) => {
                    canonical.push_str(&format!("{}=[", field));
                    for value in values {
                        canonical.push_str(&format!("{}:{},", value.len(), value));
                    }
                    canonical.push_str("];");
                }
            }
        }

        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }
}

fn push_field(buffer: &mut String, name: &str, value: &str) {
    buffer.push_str(&format!("{}={}:{};", name, value.len(), value));
}
