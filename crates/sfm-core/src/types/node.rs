//! # Node Records
//!
//! Every node kind is one variant of the closed [`Node`] enum. Variants share
//! the identity/versioning contract through [`NodeBase`] and add their own
//! typed fields.

use super::{AttrValue, Metadata, NodeId, SfmError, check_unit_interval};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// KIND TAGS
// =============================================================================

/// The closed set of node kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Actor,
    Institution,
    Policy,
    Resource,
    Process,
    Flow,
    Indicator,
    BeliefSystem,
    TechnologySystem,
    GovernanceStructure,
}

impl NodeKind {
    /// Every kind, in declaration order.
    pub const ALL: [NodeKind; 10] = [
        NodeKind::Actor,
        NodeKind::Institution,
        NodeKind::Policy,
        NodeKind::Resource,
        NodeKind::Process,
        NodeKind::Flow,
        NodeKind::Indicator,
        NodeKind::BeliefSystem,
        NodeKind::TechnologySystem,
        NodeKind::GovernanceStructure,
    ];

    /// Stable name used in cache keys and logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Actor => "Actor",
            Self::Institution => "Institution",
            Self::Policy => "Policy",
            Self::Resource => "Resource",
            Self::Process => "Process",
            Self::Flow => "Flow",
            Self::Indicator => "Indicator",
            Self::BeliefSystem => "BeliefSystem",
            Self::TechnologySystem => "TechnologySystem",
            Self::GovernanceStructure => "GovernanceStructure",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Confidence in the provenance of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum DataQuality {
    #[default]
    Unknown,
    Low,
    Medium,
    High,
    Verified,
}

/// Hayden's institutional layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstitutionLayer {
    FormalRule,
    Organization,
    InformalNorm,
    CulturalValue,
    KnowledgeSystem,
}

/// Classification of resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ResourceType {
    #[default]
    Natural,
    Produced,
    Human,
    Information,
    Financial,
    SocialCapital,
    Built,
    Knowledge,
}

/// Direction of a flow relative to the system it crosses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum FlowNature {
    Input,
    Output,
    #[default]
    Transfer,
    Internal,
    External,
    Circular,
}

/// Medium carried by a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum FlowType {
    #[default]
    Material,
    Energy,
    Information,
    Financial,
    Social,
}

// =============================================================================
// SHARED BASE
// =============================================================================

/// Fields every node kind carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeBase {
    pub id: NodeId,
    pub label: String,
    pub description: Option<String>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    /// Confidence in [0, 1].
    pub certainty: f64,
    pub data_quality: DataQuality,
    /// Backward link to the record this one supersedes.
    pub previous_version_id: Option<NodeId>,
}

impl NodeBase {
    /// Fresh base with a random identity.
    pub fn new(label: impl Into<String>) -> Self {
        Self::with_id(NodeId::new(), label)
    }

    /// Fresh base with a caller-chosen identity.
    pub fn with_id(id: NodeId, label: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            label: label.into(),
            description: None,
            metadata: Metadata::new(),
            created_at: now,
            modified_at: now,
            certainty: 1.0,
            data_quality: DataQuality::Unknown,
            previous_version_id: None,
        }
    }

    fn heap_size(&self) -> usize {
        self.label.len()
            + self.description.as_ref().map_or(0, String::len)
            + self
                .metadata
                .iter()
                .map(|(k, v)| k.len() + std::mem::size_of::<AttrValue>() + v.heap_size())
                .sum::<usize>()
    }
}

// =============================================================================
// KIND-SPECIFIC RECORDS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Actor {
    pub base: NodeBase,
    pub legal_form: Option<String>,
    pub sector: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Institution {
    pub base: NodeBase,
    pub layer: Option<InstitutionLayer>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub base: NodeBase,
    pub authority: Option<String>,
    /// Enforcement strength in [0, 1].
    pub enforcement: f64,
    pub target_sectors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub base: NodeBase,
    pub rtype: ResourceType,
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
    pub base: NodeBase,
    pub technology: Option<String>,
    pub responsible_actor_id: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub base: NodeBase,
    pub nature: FlowNature,
    pub flow_type: FlowType,
    pub quantity: Option<f64>,
    pub unit: Option<String>,
    /// Fraction lost in transit, in [0, 1].
    pub loss_factor: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Indicator {
    pub base: NodeBase,
    pub current_value: Option<f64>,
    pub target_value: Option<f64>,
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeliefSystem {
    pub base: NodeBase,
    pub domain: Option<String>,
    /// Strength of adherence in [0, 1].
    pub strength: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TechnologySystem {
    pub base: NodeBase,
    pub maturity: Option<String>,
    pub compatibility: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernanceStructure {
    pub base: NodeBase,
    pub governance_type: Option<String>,
    pub scope: Option<String>,
}

// =============================================================================
// NODE ENUM
// =============================================================================

/// A typed entity in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    Actor(Actor),
    Institution(Institution),
    Policy(Policy),
    Resource(Resource),
    Process(Process),
    Flow(Flow),
    Indicator(Indicator),
    BeliefSystem(BeliefSystem),
    TechnologySystem(TechnologySystem),
    GovernanceStructure(GovernanceStructure),
}

/// Dispatch an expression over the `base` of whichever variant is held.
macro_rules! with_base {
    ($node:expr, $inner:ident => $body:expr) => {
        match $node {
            Node::Actor($inner) => $body,
            Node::Institution($inner) => $body,
            Node::Policy($inner) => $body,
            Node::Resource($inner) => $body,
            Node::Process($inner) => $body,
            Node::Flow($inner) => $body,
            Node::Indicator($inner) => $body,
            Node::BeliefSystem($inner) => $body,
            Node::TechnologySystem($inner) => $body,
            Node::GovernanceStructure($inner) => $body,
        }
    };
}

impl Node {
    pub fn actor(label: impl Into<String>) -> Self {
        Self::Actor(Actor {
            base: NodeBase::new(label),
            legal_form: None,
            sector: None,
        })
    }

    pub fn institution(label: impl Into<String>) -> Self {
        Self::Institution(Institution {
            base: NodeBase::new(label),
            layer: None,
        })
    }

    pub fn policy(label: impl Into<String>) -> Self {
        Self::Policy(Policy {
            base: NodeBase::new(label),
            authority: None,
            enforcement: 0.0,
            target_sectors: Vec::new(),
        })
    }

    pub fn resource(label: impl Into<String>, rtype: ResourceType) -> Self {
        Self::Resource(Resource {
            base: NodeBase::new(label),
            rtype,
            unit: None,
        })
    }

    pub fn process(label: impl Into<String>) -> Self {
        Self::Process(Process {
            base: NodeBase::new(label),
            technology: None,
            responsible_actor_id: None,
        })
    }

    pub fn flow(label: impl Into<String>, nature: FlowNature, flow_type: FlowType) -> Self {
        Self::Flow(Flow {
            base: NodeBase::new(label),
            nature,
            flow_type,
            quantity: None,
            unit: None,
            loss_factor: None,
        })
    }

    pub fn indicator(label: impl Into<String>) -> Self {
        Self::Indicator(Indicator {
            base: NodeBase::new(label),
            current_value: None,
            target_value: None,
            unit: None,
        })
    }

    pub fn belief_system(label: impl Into<String>) -> Self {
        Self::BeliefSystem(BeliefSystem {
            base: NodeBase::new(label),
            domain: None,
            strength: 0.5,
        })
    }

    pub fn technology_system(label: impl Into<String>) -> Self {
        Self::TechnologySystem(TechnologySystem {
            base: NodeBase::new(label),
            maturity: None,
            compatibility: Metadata::new(),
        })
    }

    pub fn governance_structure(label: impl Into<String>) -> Self {
        Self::GovernanceStructure(GovernanceStructure {
            base: NodeBase::new(label),
            governance_type: None,
            scope: None,
        })
    }

    /// Replace the identity. Intended for builders and imports.
    #[must_use]
    pub fn with_id(mut self, id: NodeId) -> Self {
        self.base_mut().id = id;
        self
    }

    /// Link this record to the one it supersedes.
    #[must_use]
    pub fn with_previous_version(mut self, previous: NodeId) -> Self {
        self.base_mut().previous_version_id = Some(previous);
        self
    }

    #[must_use]
    pub fn with_certainty(mut self, certainty: f64) -> Self {
        self.base_mut().certainty = certainty;
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.base_mut().metadata.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Actor(_) => NodeKind::Actor,
            Self::Institution(_) => NodeKind::Institution,
            Self::Policy(_) => NodeKind::Policy,
            Self::Resource(_) => NodeKind::Resource,
            Self::Process(_) => NodeKind::Process,
            Self::Flow(_) => NodeKind::Flow,
            Self::Indicator(_) => NodeKind::Indicator,
            Self::BeliefSystem(_) => NodeKind::BeliefSystem,
            Self::TechnologySystem(_) => NodeKind::TechnologySystem,
            Self::GovernanceStructure(_) => NodeKind::GovernanceStructure,
        }
    }

    #[must_use]
    pub fn base(&self) -> &NodeBase {
        with_base!(self, n => &n.base)
    }

    pub fn base_mut(&mut self) -> &mut NodeBase {
        with_base!(self, n => &mut n.base)
    }

    #[must_use]
    pub fn id(&self) -> NodeId {
        self.base().id
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.base().label
    }

    /// The flow record, if this node is a Flow.
    #[must_use]
    pub fn as_flow(&self) -> Option<&Flow> {
        match self {
            Self::Flow(flow) => Some(flow),
            _ => None,
        }
    }

    /// Check field domains that the type system cannot express.
    pub fn validate(&self) -> Result<(), SfmError> {
        let base = self.base();
        check_unit_interval("certainty", base.certainty)?;
        if base.previous_version_id == Some(base.id) {
            return Err(SfmError::InvalidValue {
                field: "previous_version_id",
                reason: format!("node {} cannot supersede itself", base.id),
            });
        }
        match self {
            Self::Flow(flow) => {
                if let Some(loss) = flow.loss_factor {
                    check_unit_interval("loss_factor", loss)?;
                }
                if let Some(quantity) = flow.quantity
                    && !quantity.is_finite()
                {
                    return Err(SfmError::InvalidValue {
                        field: "quantity",
                        reason: format!("{quantity} is not finite"),
                    });
                }
            }
            Self::Policy(policy) => check_unit_interval("enforcement", policy.enforcement)?,
            Self::BeliefSystem(belief) => check_unit_interval("strength", belief.strength)?,
            _ => {}
        }
        Ok(())
    }

    /// Structural size estimate: the inline enum plus owned heap data.
    #[must_use]
    pub fn estimated_size(&self) -> usize {
        let extra = match self {
            Self::Actor(a) => opt_len(&a.legal_form) + opt_len(&a.sector),
            Self::Policy(p) => {
                opt_len(&p.authority) + p.target_sectors.iter().map(String::len).sum::<usize>()
            }
            Self::Resource(r) => opt_len(&r.unit),
            Self::Process(p) => opt_len(&p.technology),
            Self::Flow(f) => opt_len(&f.unit),
            Self::Indicator(i) => opt_len(&i.unit),
            Self::BeliefSystem(b) => opt_len(&b.domain),
            Self::TechnologySystem(t) => {
                opt_len(&t.maturity)
                    + t.compatibility
                        .iter()
                        .map(|(k, v)| k.len() + v.heap_size())
                        .sum::<usize>()
            }
            Self::GovernanceStructure(g) => opt_len(&g.governance_type) + opt_len(&g.scope),
            Self::Institution(_) => 0,
        };
        std::mem::size_of::<Node>() + self.base().heap_size() + extra
    }
}

fn opt_len(value: &Option<String>) -> usize {
    value.as_ref().map_or(0, String::len)
}

// =============================================================================
// TESTS
// =============================================================================
