//! Measures (remediation actions): model, static workflow table and field rules.
use std::collections::BTreeSet;

use chrono::NaiveDate;

use crate::access::{ContextualRole, Editable, Field, FieldRules, PatchOutcome};
use crate::notes::Notes;
use crate::store::Record;
use crate::types::{DueDate, Id, Role, TimeStamp, User};
use crate::workflow::{Action, Status, TransitionTable, WorkflowEngine};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, minicbor::Encode, minicbor::Decode,
)]
pub enum MeasureStatus {
    #[n(0)]
    Open,
    #[n(1)]
    InProgress,
    #[n(2)]
    PendingReview,
    #[n(3)]
    Completed,
    #[n(4)]
    Cancelled,
}

impl Status for MeasureStatus {
    fn code(&self) -> &'static str {
        match self {
            MeasureStatus::Open => "OPEN",
            MeasureStatus::InProgress => "IN_PROGRESS",
            MeasureStatus::PendingReview => "PENDING_REVIEW",
            MeasureStatus::Completed => "COMPLETED",
            MeasureStatus::Cancelled => "CANCELLED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MeasureField {
    Description,
    Deadline,
    Responsible,
}

impl Field for MeasureField {
    fn name(&self) -> &'static str {
        match self {
            MeasureField::Description => "description",
            MeasureField::Deadline => "deadline",
            MeasureField::Responsible => "responsible",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Measure {
    #[n(0)]
    pub id: Id,
    #[n(1)]
    pub description: String,
    #[n(2)]
    pub responsible_id: Id,
    #[n(3)]
    pub deadline: Option<DueDate>,
    #[n(4)]
    pub status: MeasureStatus,
    #[n(5)]
    pub created_by: Id,
    #[n(6)]
    pub created_at: TimeStamp,
    #[n(7)]
    pub updated_at: TimeStamp,
    #[n(8)]
    pub closed_at: Option<TimeStamp>,
    #[n(9)]
    pub closure_comment: Option<String>,
    #[n(10)]
    pub incident_ids: BTreeSet<Id>,
    #[n(11)]
    pub notes: Notes,
}

impl Record for Measure {
    const ENTITY: &'static str = "measure";
    const TREE: &'static str = "measures";

    fn id(&self) -> Id {
        self.id
    }
}

impl Measure {
    /// Past its deadline while work is still outstanding.
    pub fn is_overdue(&self, today: NaiveDate) -> bool {
        matches!(self.status, MeasureStatus::Open | MeasureStatus::InProgress)
            && self.deadline.is_some_and(|d| d.date() < today)
    }

    pub fn is_linked_to(&self, incident_id: Id) -> bool {
        self.incident_ids.contains(&incident_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMeasure {
    pub description: String,
    pub responsible_id: Id,
    pub deadline: Option<DueDate>,
    pub incident_id: Option<Id>,
}

impl NewMeasure {
    pub fn new(description: impl Into<String>, responsible_id: Id) -> Self {
        Self {
            description: description.into(),
            responsible_id,
            deadline: None,
            incident_id: None,
        }
    }

    pub fn due(mut self, deadline: DueDate) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn for_incident(mut self, incident_id: Id) -> Self {
        self.incident_id = Some(incident_id);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeasurePatch {
    pub description: Option<String>,
    pub deadline: Option<Option<DueDate>>,
    pub responsible_id: Option<Id>,
}

impl MeasurePatch {
    pub(crate) fn apply(
        &self,
        measure: &mut Measure,
        editable: &Editable<MeasureField>,
    ) -> PatchOutcome<MeasureField> {
        let mut outcome = PatchOutcome::default();
        editable.assign(
            MeasureField::Description,
            self.description.as_ref().map(|d| d.trim().to_string()),
            &mut measure.description,
            &mut outcome,
        );
        editable.assign(MeasureField::Deadline, self.deadline, &mut measure.deadline, &mut outcome);
        editable.assign(
            MeasureField::Responsible,
            self.responsible_id,
            &mut measure.responsible_id,
            &mut outcome,
        );
        outcome
    }
}

pub fn actions(from: MeasureStatus, to: MeasureStatus) -> Option<Action> {
    use MeasureStatus::*;

    match (from, to) {
        (PendingReview, InProgress) => {
            Some(Action::new("return-to-progress", "Return to Progress"))
        }
        (_, InProgress) => Some(Action::new("start-progress", "Start Progress")),
        (_, PendingReview) => Some(Action::new("submit-for-review", "Submit for Review")),
        (_, Completed) => Some(Action::new("complete", "Complete Measure")),
        (_, Cancelled) => Some(Action::new("cancel", "Cancel Measure")),
        _ => None,
    }
}

pub fn transitions() -> TransitionTable<MeasureStatus> {
    use MeasureStatus::*;
    const DOERS: &[Role] = &[Role::Employee, Role::Manager];
    const OFFICER: &[Role] = &[Role::RiskOfficer];

    TransitionTable::from_rules([
        (Open, InProgress, DOERS),
        (InProgress, PendingReview, DOERS),
        (InProgress, Cancelled, OFFICER),
        (PendingReview, InProgress, OFFICER),
        (PendingReview, Completed, OFFICER),
        (PendingReview, Cancelled, OFFICER),
    ])
}

pub fn engine() -> WorkflowEngine<MeasureStatus> {
    WorkflowEngine::new(transitions(), actions)
}

pub fn field_rules() -> FieldRules<MeasureStatus, MeasureField> {
    use MeasureField::*;

    let mut rules = FieldRules::new();
    rules.grant_all(MeasureStatus::Open, &[Role::Employee], &[Description, Deadline]);
    rules.grant_all(
        MeasureStatus::Open,
        &[Role::Manager, Role::RiskOfficer],
        &[Description, Deadline, Responsible],
    );
    rules.grant(MeasureStatus::InProgress, Role::Employee, Description);
    rules.grant_all(MeasureStatus::InProgress, &[Role::RiskOfficer], &[Deadline, Responsible]);
    rules.grant(MeasureStatus::PendingReview, Role::RiskOfficer, Deadline);
    rules
}

/// Editable fields for one request.
///
/// An employee looking at someone else's in-progress measure cannot touch its description.
pub fn editable_fields(status: MeasureStatus, role: ContextualRole) -> Editable<MeasureField> {
    let mut editable = field_rules().editable(status, role.role());
    if status == MeasureStatus::InProgress
        && role.role() == Role::Employee
        && !role.acts_for_responsible()
    {
        editable.remove(MeasureField::Description);
    }
    editable
}

/// The responsible user and their manager act as the doer; everyone else keeps their role.
pub fn contextual_role(responsible: Option<&User>, user: &User) -> ContextualRole {
    if user.role == Role::Unknown {
        return ContextualRole::new(Role::Unknown);
    }
    let Some(responsible) = responsible else {
        return ContextualRole::new(user.role);
    };
    if user.id == responsible.id || user.is_manager_of(responsible) {
        return ContextualRole::responsible_party();
    }
    ContextualRole::new(user.role)
}
