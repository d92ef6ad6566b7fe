//! Generic, table-driven state machine shared by incidents, measures and risks.
//!
//! Each entity supplies a [`TransitionTable`] of `(from, to, roles)` rules and an
//! action map naming the `(from, to)` pairs that are exposed outward. The engine
//! itself knows nothing about a particular entity.
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::types::Role;

/// A closed set of workflow statuses.
pub trait Status: Copy + Ord + fmt::Debug + 'static {
    fn code(&self) -> &'static str;
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Status '{from}' has no defined transitions.")]
    NoTransitions { from: String },
    #[error("Transition from '{from}' to '{to}' is not defined.")]
    NotDefined { from: String, to: String },
    #[error("Role '{role}' is not authorized to move from '{from}' to '{to}'.")]
    RoleNotAuthorized { role: String, from: String, to: String },
    #[error("{0}")]
    Blocked(String),
}

/// An outward action identifier plus its display name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Action {
    pub action: &'static str,
    pub name: &'static str,
}

impl Action {
    pub const fn new(action: &'static str, name: &'static str) -> Self {
        Self { action, name }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionTable<S: Status> {
    rules: BTreeMap<S, BTreeMap<S, BTreeSet<Role>>>,
}

impl<S: Status> Default for TransitionTable<S> {
    fn default() -> Self {
        Self {
            rules: BTreeMap::new(),
        }
    }
}

impl<S: Status> TransitionTable<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a table from `(from, to, roles)` triples.
    pub fn from_rules<'a>(rules: impl IntoIterator<Item = (S, S, &'a [Role])>) -> Self {
        let mut table = Self::new();
        for (from, to, roles) in rules {
            for role in roles {
                table.allow(from, to, *role);
            }
        }
        table
    }

    /// Builds a table from flat `(from, to, role)` rows, as persisted.
    pub fn from_rows(rows: impl IntoIterator<Item = (S, S, Role)>) -> Self {
        let mut table = Self::new();
        for (from, to, role) in rows {
            table.allow(from, to, role);
        }
        table
    }

    pub fn allow(&mut self, from: S, to: S, role: Role) {
        self.rules
            .entry(from)
            .or_default()
            .entry(to)
            .or_default()
            .insert(role);
    }

    pub fn is_empty(&self) -> bool {
        self.rules.values().all(|targets| targets.is_empty())
    }

    pub fn roles(&self, from: S, to: S) -> Option<&BTreeSet<Role>> {
        self.rules.get(&from).and_then(|targets| targets.get(&to))
    }

    /// Lookup order matters: a missing source, then a missing target, then the role.
    pub fn validate(&self, from: S, to: S, role: Role) -> Result<(), TransitionError> {
        let targets = match self.rules.get(&from) {
            Some(targets) if !targets.is_empty() => targets,
            _ => {
                return Err(TransitionError::NoTransitions {
                    from: from.code().to_string(),
                });
            }
        };

        let Some(roles) = targets.get(&to) else {
            return Err(TransitionError::NotDefined {
                from: from.code().to_string(),
                to: to.code().to_string(),
            });
        };

        if !roles.contains(&role) {
            return Err(TransitionError::RoleNotAuthorized {
                role: role.name().to_string(),
                from: from.code().to_string(),
                to: to.code().to_string(),
            });
        }

        Ok(())
    }

    /// Targets reachable from `from` by `role`, in status declaration order.
    pub fn targets_for(&self, from: S, role: Role) -> impl Iterator<Item = S> + '_ {
        self.rules
            .get(&from)
            .into_iter()
            .flat_map(|targets| targets.iter())
            .filter(move |(_, roles)| roles.contains(&role))
            .map(|(to, _)| *to)
    }
}

/// A transition table bound to the action map of one entity type.
#[derive(Debug, Clone)]
pub struct WorkflowEngine<S: Status> {
    table: TransitionTable<S>,
    actions: fn(S, S) -> Option<Action>,
}

impl<S: Status> WorkflowEngine<S> {
    pub fn new(table: TransitionTable<S>, actions: fn(S, S) -> Option<Action>) -> Self {
        Self { table, actions }
    }

    pub fn table(&self) -> &TransitionTable<S> {
        &self.table
    }

    pub fn validate_transition(&self, from: S, to: S, role: Role) -> Result<(), TransitionError> {
        self.table.validate(from, to, role)
    }

    /// Actions `role` may take from `status`. Pairs without an action name are omitted.
    pub fn available_transitions(&self, status: S, role: Role) -> Vec<Action> {
        self.table
            .targets_for(status, role)
            .filter_map(|to| (self.actions)(status, to))
            .collect()
    }
}
