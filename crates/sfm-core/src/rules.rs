//! # Domain Rule Checker
//!
//! The graph consults a [`RuleChecker`] synchronously on every relationship
//! insertion. A rejection is a hard validation failure.
//!
//! Two implementations ship with the crate:
//! - [`AcceptAll`]: no domain rules (default for `Graph::new`)
//! - [`RuleTable`]: allow-lists of source and target kinds per relationship
//!   kind, seeded with Social Fabric Matrix conventions by
//!   [`RuleTable::sfm_defaults`]

use crate::{NodeKind, RelationshipKind};
use std::collections::{BTreeMap, BTreeSet};

/// Outcome of a rule check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleVerdict {
    Accept,
    /// Rejected, with a human-readable explanation.
    Reject(String),
}

impl RuleVerdict {
    #[must_use]
    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept)
    }
}

/// Validates (relationship kind, source kind, target kind) triples.
///
/// Implementors must be `Send + Sync`; the graph is shared across threads.
/// A checker must not call back into the graph.
pub trait RuleChecker: Send + Sync {
    fn check(&self, kind: RelationshipKind, source: NodeKind, target: NodeKind) -> RuleVerdict;
}

impl<F> RuleChecker for F
where
    F: Fn(RelationshipKind, NodeKind, NodeKind) -> RuleVerdict + Send + Sync,
{
    fn check(&self, kind: RelationshipKind, source: NodeKind, target: NodeKind) -> RuleVerdict {
        self(kind, source, target)
    }
}

/// Accepts every triple.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl RuleChecker for AcceptAll {
    fn check(&self, _kind: RelationshipKind, _source: NodeKind, _target: NodeKind) -> RuleVerdict {
        RuleVerdict::Accept
    }
}

// =============================================================================
// RULE TABLE
// =============================================================================

#[derive(Debug, Clone, Default)]
struct KindRule {
    sources: BTreeSet<NodeKind>,
    targets: BTreeSet<NodeKind>,
}

/// Allow-list rule set keyed by relationship kind.
///
/// Relationship kinds without an entry are unconstrained.
#[derive(Debug, Clone, Default)]
pub struct RuleTable {
    rules: BTreeMap<RelationshipKind, KindRule>,
}

impl RuleTable {
    /// Empty table (accepts everything until rules are added).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict `kind` to the given source and target kinds.
    ///
    /// Calling this again for the same kind widens the allow-lists.
    #[must_use]
    pub fn allow(
        mut self,
        kind: RelationshipKind,
        sources: &[NodeKind],
        targets: &[NodeKind],
    ) -> Self {
        let rule = self.rules.entry(kind).or_default();
        rule.sources.extend(sources.iter().copied());
        rule.targets.extend(targets.iter().copied());
        self
    }

    /// Number of constrained relationship kinds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules used by Social Fabric Matrix models.
    #[must_use]
    pub fn sfm_defaults() -> Self {
        use NodeKind::{
            Actor, Flow, GovernanceStructure, Indicator, Institution, Policy, Process, Resource,
            TechnologySystem,
        };
        use RelationshipKind as R;

        let authorities = [Actor, Institution, Policy, GovernanceStructure];
        let organisations = [Actor, Institution, GovernanceStructure];

        Self::new()
            .allow(
                R::Governs,
                &authorities,
                &[Actor, Institution, Policy, Resource, Process, GovernanceStructure],
            )
            .allow(
                R::Regulates,
                &[Institution, Policy, GovernanceStructure],
                &[Actor, Institution, Process, Resource, Flow, TechnologySystem],
            )
            .allow(
                R::Implements,
                &organisations,
                &[Policy, Process, TechnologySystem],
            )
            .allow(R::Enacts, &organisations, &[Policy])
            .allow(R::Transforms, &[Process, TechnologySystem], &[Resource, Flow])
            .allow(R::Employs, &[Actor, Institution], &[Actor])
            .allow(R::Owns, &[Actor, Institution], &[Resource, TechnologySystem])
            .allow(
                R::Funds,
                &organisations,
                &[Actor, Institution, Policy, Process, GovernanceStructure],
            )
            .allow(
                R::Supplies,
                &[Actor, Institution, Resource, Process, Flow],
                &[Actor, Institution, Process, Flow],
            )
            .allow(R::Measures, &[Indicator], &NodeKind::ALL)
            .allow(
                R::Monitors,
                &[Actor, Institution, GovernanceStructure, Indicator],
                &NodeKind::ALL,
            )
    }
}

impl RuleChecker for RuleTable {
    fn check(&self, kind: RelationshipKind, source: NodeKind, target: NodeKind) -> RuleVerdict {
        let Some(rule) = self.rules.get(&kind) else {
            return RuleVerdict::Accept;
        };
        if rule.sources.contains(&source) && rule.targets.contains(&target) {
            return RuleVerdict::Accept;
        }
        RuleVerdict::Reject(format!(
            "{kind} relationship requires source in [{}] and target in [{}], got {source}->{target}",
            join(&rule.sources),
            join(&rule.targets),
        ))
    }
}

fn join(kinds: &BTreeSet<NodeKind>) -> String {
    kinds
        .iter()
        .map(NodeKind::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

// =============================================================================
// TESTS
// =============================================================================
