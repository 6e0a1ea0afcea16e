//! Supervisor unit graph
//!
//! The ordering between token derivation, issuance, gates, dependent services
//! and the reconciler is plain data: a set of units with `requires`/`after`
//! edges. The graph is checked (every edge resolves, no cycles) and handed to
//! the supervisor as JSON.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::IdentityRegistry;
use crate::readiness::{self, ReadinessRequirement};

/// Token derivation unit
pub const TOKEN_UNIT: &str = "trellis-token";

/// Bundle synthesis unit
pub const BUNDLES_UNIT: &str = "trellis-bundles";

/// Authorization reconciler unit
pub const RECONCILE_UNIT: &str = "trellis-reconcile";

/// Issuance unit name for an identity
pub fn issue_unit(identity: &str) -> String {
    format!("trellis-issue@{}", identity)
}

/// Unit graph errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    /// Two units share a name
    #[error("duplicate unit {0}")]
    DuplicateUnit(String),

    /// An edge points at a unit that is not in the graph
    #[error("unit {unit} references unknown unit {target}")]
    Dangling {
        /// Unit holding the edge
        unit: String,
        /// Missing target
        target: String,
    },

    /// The ordering edges contain a cycle
    #[error("dependency cycle through {0:?}")]
    Cycle(Vec<String>),

    /// The API service has no readiness requirement to order the reconciler after
    #[error("API service {0} has no readiness requirement")]
    UngatedApiService(String),
}

/// What a unit is for the supervisor
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UnitKind {
    /// Runs to completion once
    Oneshot,
    /// Blocks until its identities are ready
    Gate,
    /// Extra ordering for a service the supervisor already knows
    DropIn,
}

/// One supervisor unit
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Unit {
    /// Unit name
    pub name: String,
    /// Unit kind
    pub kind: UnitKind,
    /// Human readable description
    pub description: String,
    /// Units that must succeed for this one to start
    pub requires: BTreeSet<String>,
    /// Units that must finish before this one starts
    pub after: BTreeSet<String>,
    /// Command line, absent for drop-ins
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<Vec<String>>,
}

impl Unit {
    fn oneshot(name: impl Into<String>, description: String, exec: Vec<String>) -> Self {
        Self {
            name: name.into(),
            kind: UnitKind::Oneshot,
            description,
            requires: BTreeSet::new(),
            after: BTreeSet::new(),
            exec: Some(exec),
        }
    }

    /// Require and order after `other`
    fn depends_on(mut self, other: impl Into<String>) -> Self {
        let other = other.into();
        self.requires.insert(other.clone());
        self.after.insert(other);
        self
    }
}

/// Validated unit graph
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitGraph {
    units: BTreeMap<String, Unit>,
}

impl UnitGraph {
    /// Build the bootstrap graph
    ///
    /// `invocation` is the command prefix every unit runs, e.g.
    /// `["/usr/bin/trellis", "--config", "/etc/trellis/config.yaml"]`.
    pub fn build(
        registry: &IdentityRegistry,
        requirements: &[ReadinessRequirement],
        api_service: &str,
        invocation: &[String],
    ) -> Result<Self, GraphError> {
        let exec = |args: &[&str]| -> Vec<String> {
            invocation
                .iter()
                .cloned()
                .chain(args.iter().map(|a| a.to_string()))
                .collect()
        };

        let mut units = vec![Unit::oneshot(
            TOKEN_UNIT,
            "Derive the CA bootstrap token".to_string(),
            exec(&["token"]),
        )];

        let mut bundles = Unit::oneshot(
            BUNDLES_UNIT,
            "Write connection bundles".to_string(),
            exec(&["bundles"]),
        );
        for identity in registry.list_identities() {
            let name = issue_unit(&identity.name);
            units.push(
                Unit::oneshot(
                    name.clone(),
                    format!("Issue certificate for {}", identity.name),
                    exec(&["issue", "--identity", &identity.name]),
                )
                .depends_on(TOKEN_UNIT),
            );
            bundles = bundles.depends_on(name);
        }
        units.push(bundles);

        let mut api_gated = false;
        for requirement in requirements {
            let gate_name = readiness::unit_name(&requirement.service);
            let mut gate = Unit {
                kind: UnitKind::Gate,
                ..Unit::oneshot(
                    gate_name.clone(),
                    format!("Wait for certificates of {}", requirement.service),
                    exec(&["gate", "--service", &requirement.service]),
                )
            };
            for identity in &requirement.required_identities {
                gate = gate.depends_on(issue_unit(identity));
            }
            units.push(gate);

            units.push(
                Unit {
                    kind: UnitKind::DropIn,
                    exec: None,
                    ..Unit::oneshot(
                        requirement.service.clone(),
                        format!("Start {} after its readiness gate", requirement.service),
                        vec![],
                    )
                }
                .depends_on(gate_name),
            );
            api_gated |= requirement.service == api_service;
        }
        if !api_gated {
            return Err(GraphError::UngatedApiService(api_service.to_string()));
        }

        units.push(
            Unit::oneshot(
                RECONCILE_UNIT,
                "Reconcile authorization bindings".to_string(),
                exec(&["reconcile"]),
            )
            .depends_on(readiness::unit_name(api_service))
            .depends_on(api_service),
        );

        Self::from_units(units)
    }

    /// Check and index an arbitrary unit list
    pub fn from_units(units: Vec<Unit>) -> Result<Self, GraphError> {
        let mut index = BTreeMap::new();
        for unit in units {
            if index.contains_key(&unit.name) {
                return Err(GraphError::DuplicateUnit(unit.name));
            }
            index.insert(unit.name.clone(), unit);
        }

        for unit in index.values() {
            if let Some(target) = unit
                .requires
                .iter()
                .chain(&unit.after)
                .find(|t| !index.contains_key(*t))
            {
                return Err(GraphError::Dangling {
                    unit: unit.name.clone(),
                    target: target.clone(),
                });
            }
        }

        let graph = Self { units: index };
        graph.start_order()?;
        Ok(graph)
    }

    /// Look up a unit
    pub fn get(&self, name: &str) -> Option<&Unit> {
        self.units.get(name)
    }

    /// All units, sorted by name
    pub fn units(&self) -> impl Iterator<Item = &Unit> {
        self.units.values()
    }

    /// Number of units
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Whether the graph has no units
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// A start order honoring every `after` edge (Kahn's algorithm)
    pub fn start_order(&self) -> Result<Vec<&str>, GraphError> {
        let mut in_degree: BTreeMap<&str, usize> =
            self.units.keys().map(|name| (name.as_str(), 0)).collect();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

        for unit in self.units.values() {
            for before in &unit.after {
                if let Some(degree) = in_degree.get_mut(unit.name.as_str()) {
                    *degree += 1;
                }
                dependents
                    .entry(before.as_str())
                    .or_default()
                    .push(unit.name.as_str());
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(name, _)| *name)
            .collect();
        let mut order = Vec::with_capacity(self.units.len());

        while let Some(name) = queue.pop_front() {
            order.push(name);
            for &dependent in dependents.get(name).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }

        if order.len() != self.units.len() {
            let members = in_degree
                .into_iter()
                .filter(|(_, degree)| *degree > 0)
                .map(|(name, _)| name.to_string())
                .collect();
            return Err(GraphError::Cycle(members));
        }
        Ok(order)
    }

    /// Render the graph as pretty JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.units.values().collect::<Vec<_>>())
    }
}
