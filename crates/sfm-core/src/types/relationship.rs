//! # Relationship Records
//!
//! Directed, weighted edges between nodes. The graph is a multigraph: no
//! uniqueness constraint applies to (source, target, kind).

use super::{AttrValue, Metadata, NodeId, RelationshipId, SfmError, check_unit_interval};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The closed set of relationship kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RelationshipKind {
    Governs,
    Regulates,
    Implements,
    Enacts,
    Uses,
    Produces,
    Serves,
    Funds,
    ExchangesWith,
    Transfers,
    Trades,
    Supplies,
    Distributes,
    Consumes,
    Transforms,
    Influences,
    Affects,
    CollaboratesWith,
    CoordinatesWith,
    ParticipatesIn,
    Supports,
    Owns,
    Employs,
    Monitors,
    Measures,
}

impl RelationshipKind {
    /// Canonical upper-snake name, used in cache keys and error messages.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Governs => "GOVERNS",
            Self::Regulates => "REGULATES",
            Self::Implements => "IMPLEMENTS",
            Self::Enacts => "ENACTS",
            Self::Uses => "USES",
            Self::Produces => "PRODUCES",
            Self::Serves => "SERVES",
            Self::Funds => "FUNDS",
            Self::ExchangesWith => "EXCHANGES_WITH",
            Self::Transfers => "TRANSFERS",
            Self::Trades => "TRADES",
            Self::Supplies => "SUPPLIES",
            Self::Distributes => "DISTRIBUTES",
            Self::Consumes => "CONSUMES",
            Self::Transforms => "TRANSFORMS",
            Self::Influences => "INFLUENCES",
            Self::Affects => "AFFECTS",
            Self::CollaboratesWith => "COLLABORATES_WITH",
            Self::CoordinatesWith => "COORDINATES_WITH",
            Self::ParticipatesIn => "PARTICIPATES_IN",
            Self::Supports => "SUPPORTS",
            Self::Owns => "OWNS",
            Self::Employs => "EMPLOYS",
            Self::Monitors => "MONITORS",
            Self::Measures => "MEASURES",
        }
    }
}

impl fmt::Display for RelationshipKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed, directed, weighted edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: RelationshipId,
    pub source_id: NodeId,
    pub target_id: NodeId,
    pub kind: RelationshipKind,
    /// Strength. Unbounded; analytic code treats non-positive weights as
    /// impassable where a cost is derived from it.
    pub weight: f64,
    /// Confidence in [0, 1].
    pub certainty: f64,
    pub time: Option<String>,
    pub space: Option<String>,
    pub scenario: Option<String>,
    pub metadata: Metadata,
}

impl Relationship {
    /// New relationship with weight 1.0 and certainty 1.0.
    pub fn new(source_id: NodeId, target_id: NodeId, kind: RelationshipKind) -> Self {
        Self {
            id: RelationshipId::new(),
            source_id,
            target_id,
            kind,
            weight: 1.0,
            certainty: 1.0,
            time: None,
            space: None,
            scenario: None,
            metadata: Metadata::new(),
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: RelationshipId) -> Self {
        self.id = id;
        self
    }

    #[must_use]
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    #[must_use]
    pub fn with_certainty(mut self, certainty: f64) -> Self {
        self.certainty = certainty;
        self
    }

    #[must_use]
    pub fn with_time(mut self, time: impl Into<String>) -> Self {
        self.time = Some(time.into());
        self
    }

    #[must_use]
    pub fn with_space(mut self, space: impl Into<String>) -> Self {
        self.space = Some(space.into());
        self
    }

    #[must_use]
    pub fn with_scenario(mut self, scenario: impl Into<String>) -> Self {
        self.scenario = Some(scenario.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The endpoint opposite to `node`, if `node` is an endpoint at all.
    #[must_use]
    pub fn other_end(&self, node: NodeId) -> Option<NodeId> {
        if self.source_id == node {
            Some(self.target_id)
        } else if self.target_id == node {
            Some(self.source_id)
        } else {
            None
        }
    }

    pub fn validate(&self) -> Result<(), SfmError> {
        check_unit_interval("certainty", self.certainty)?;
        if self.weight.is_nan() {
            return Err(SfmError::InvalidValue {
                field: "weight",
                reason: "weight is NaN".to_string(),
            });
        }
        Ok(())
    }
}
