//! Field-level access control: which attributes a contextual role may mutate in a status.
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::types::Role;
use crate::workflow::Status;

/// A named, patchable attribute of an entity.
pub trait Field: Copy + Ord + fmt::Debug + 'static {
    fn name(&self) -> &'static str;
}

/// The capability a user has with respect to one entity instance.
///
/// Computed once per request and passed to both the editable-field and the
/// available-transition lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextualRole {
    role: Role,
    for_responsible: bool,
}

impl ContextualRole {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            for_responsible: false,
        }
    }

    /// The responsible party (or their manager) acting as the doer.
    pub fn responsible_party() -> Self {
        Self {
            role: Role::Employee,
            for_responsible: true,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn acts_for_responsible(&self) -> bool {
        self.for_responsible
    }
}

/// The set of fields writable for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Editable<F: Field>(BTreeSet<F>);

impl<F: Field> Default for Editable<F> {
    fn default() -> Self {
        Self(BTreeSet::new())
    }
}

impl<F: Field> Editable<F> {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn contains(&self, field: F) -> bool {
        self.0.contains(&field)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn insert(&mut self, field: F) {
        self.0.insert(field);
    }

    pub fn remove(&mut self, field: F) {
        self.0.remove(&field);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.0.iter().map(Field::name).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = F> + '_ {
        self.0.iter().copied()
    }

    /// Writes `value` into `slot` when `field` is editable; otherwise records it as ignored.
    pub fn assign<T>(
        &self,
        field: F,
        value: Option<T>,
        slot: &mut T,
        outcome: &mut PatchOutcome<F>,
    ) {
        let Some(value) = value else {
            return;
        };
        if self.contains(field) {
            *slot = value;
            outcome.applied.push(field);
        } else {
            outcome.ignored.push(field);
        }
    }
}

impl<F: Field> FromIterator<F> for Editable<F> {
    fn from_iter<I: IntoIterator<Item = F>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Which fields of a patch were written and which were silently dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchOutcome<F: Field> {
    pub applied: Vec<F>,
    pub ignored: Vec<F>,
}

impl<F: Field> Default for PatchOutcome<F> {
    fn default() -> Self {
        Self {
            applied: Vec::new(),
            ignored: Vec::new(),
        }
    }
}

impl<F: Field> PatchOutcome<F> {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }

    pub fn ignored_names(&self) -> Vec<&'static str> {
        self.ignored.iter().map(Field::name).collect()
    }
}

/// `(status, role) -> fields` grants, unique per triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRules<S: Status, F: Field> {
    grants: BTreeMap<(S, Role), BTreeSet<F>>,
}

impl<S: Status, F: Field> Default for FieldRules<S, F> {
    fn default() -> Self {
        Self {
            grants: BTreeMap::new(),
        }
    }
}

impl<S: Status, F: Field> FieldRules<S, F> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: impl IntoIterator<Item = (S, Role, F)>) -> Self {
        let mut rules = Self::new();
        for (status, role, field) in rows {
            rules.grant(status, role, field);
        }
        rules
    }

    pub fn grant(&mut self, status: S, role: Role, field: F) {
        self.grants.entry((status, role)).or_default().insert(field);
    }

    pub fn grant_all(&mut self, status: S, roles: &[Role], fields: &[F]) {
        for role in roles {
            for field in fields {
                self.grant(status, *role, *field);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }

    pub fn editable(&self, status: S, role: Role) -> Editable<F> {
        self.grants
            .get(&(status, role))
            .map(|fields| Editable(fields.clone()))
            .unwrap_or_default()
    }
}

/// What the acting user may do with one entity, derived from one contextual role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permissions {
    pub can_edit: bool,
    pub can_delete: bool,
    pub can_transition: bool,
}
