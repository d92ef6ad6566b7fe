//! Incidents (recorded loss events): model, statuses, patchable fields and rule tables.
//!
//! Transition, editable-field and required-field rules for incidents are data.
//! They live in their own sled trees and are reloaded on every request; when a
//! tree is empty the built-in defaults below apply.
use crate::access::{Editable, Field, FieldRules, PatchOutcome};
use crate::error::{Error, Result};
use crate::notes::Notes;
use crate::store::{Record, Store};
use crate::types::{DueDate, Id, Money, Role, TimeStamp};
use crate::workflow::{Action, Status, TransitionTable, WorkflowEngine};

const TRANSITIONS: &str = "incident_transitions";
const EDITABLE_FIELDS: &str = "incident_editable_fields";
const REQUIRED_FIELDS: &str = "incident_required_fields";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, minicbor::Encode, minicbor::Decode,
)]
pub enum IncidentStatus {
    #[n(0)]
    Draft,
    #[n(1)]
    PendingReview,
    #[n(2)]
    PendingValidation,
    #[n(3)]
    Validated,
    #[n(4)]
    Closed,
}

impl Status for IncidentStatus {
    fn code(&self) -> &'static str {
        match self {
            IncidentStatus::Draft => "DRAFT",
            IncidentStatus::PendingReview => "PENDING_REVIEW",
            IncidentStatus::PendingValidation => "PENDING_VALIDATION",
            IncidentStatus::Validated => "VALIDATED",
            IncidentStatus::Closed => "CLOSED",
        }
    }
}

impl IncidentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, IncidentStatus::Validated | IncidentStatus::Closed)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, minicbor::Encode, minicbor::Decode,
)]
pub enum IncidentField {
    #[n(0)]
    Title,
    #[n(1)]
    Description,
    #[n(2)]
    StartTime,
    #[n(3)]
    EndTime,
    #[n(4)]
    DiscoveredAt,
    #[n(5)]
    BusinessUnit,
    #[n(6)]
    BusinessProcess,
    #[n(7)]
    Product,
    #[n(8)]
    BaselEventType,
    #[n(9)]
    SimplifiedEventType,
    #[n(10)]
    GrossLossAmount,
    #[n(11)]
    RecoveryAmount,
    #[n(12)]
    NetLossAmount,
    #[n(13)]
    CurrencyCode,
    #[n(14)]
    NearMiss,
}

impl Field for IncidentField {
    fn name(&self) -> &'static str {
        match self {
            IncidentField::Title => "title",
            IncidentField::Description => "description",
            IncidentField::StartTime => "start_time",
            IncidentField::EndTime => "end_time",
            IncidentField::DiscoveredAt => "discovered_at",
            IncidentField::BusinessUnit => "business_unit",
            IncidentField::BusinessProcess => "business_process",
            IncidentField::Product => "product",
            IncidentField::BaselEventType => "basel_event_type",
            IncidentField::SimplifiedEventType => "simplified_event_type",
            IncidentField::GrossLossAmount => "gross_loss_amount",
            IncidentField::RecoveryAmount => "recovery_amount",
            IncidentField::NetLossAmount => "net_loss_amount",
            IncidentField::CurrencyCode => "currency_code",
            IncidentField::NearMiss => "near_miss",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Incident {
    #[n(0)]
    pub id: Id,
    #[n(1)]
    pub title: String,
    #[n(2)]
    pub description: String,
    #[n(3)]
    pub start_time: Option<TimeStamp>,
    #[n(4)]
    pub end_time: Option<TimeStamp>,
    #[n(5)]
    pub discovered_at: Option<TimeStamp>,
    #[n(6)]
    pub business_unit_id: Option<Id>,
    #[n(7)]
    pub business_process_id: Option<Id>,
    #[n(8)]
    pub product_id: Option<Id>,
    #[n(9)]
    pub basel_event_type_id: Option<Id>,
    #[n(10)]
    pub simplified_event_type_id: Option<Id>,
    #[n(11)]
    pub gross_loss_amount: Option<Money>,
    #[n(12)]
    pub recovery_amount: Option<Money>,
    #[n(13)]
    pub net_loss_amount: Option<Money>,
    #[n(14)]
    pub currency_code: Option<String>,
    #[n(15)]
    pub near_miss: bool,
    #[n(16)]
    pub status: IncidentStatus,
    #[n(17)]
    pub created_by: Id,
    #[n(18)]
    pub created_at: TimeStamp,
    #[n(19)]
    pub updated_at: TimeStamp,
    #[n(20)]
    pub assigned_to: Option<Id>,
    #[n(21)]
    pub reviewed_by: Option<Id>,
    #[n(22)]
    pub validated_by: Option<Id>,
    #[n(23)]
    pub validated_at: Option<TimeStamp>,
    #[n(24)]
    pub closed_by: Option<Id>,
    #[n(25)]
    pub closed_at: Option<TimeStamp>,
    #[n(26)]
    pub draft_due_at: Option<DueDate>,
    #[n(27)]
    pub review_due_at: Option<DueDate>,
    #[n(28)]
    pub validation_due_at: Option<DueDate>,
    #[n(29)]
    pub deleted_at: Option<TimeStamp>,
    #[n(30)]
    pub deleted_by: Option<Id>,
    #[n(31)]
    pub notes: Notes,
}

impl Record for Incident {
    const ENTITY: &'static str = "incident";
    const TREE: &'static str = "incidents";

    fn id(&self) -> Id {
        self.id
    }
}

impl Incident {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Whether `field` currently holds no value.
    pub fn is_missing(&self, field: IncidentField) -> bool {
        match field {
            IncidentField::Title => self.title.trim().is_empty(),
            IncidentField::Description => self.description.trim().is_empty(),
            IncidentField::StartTime => self.start_time.is_none(),
            IncidentField::EndTime => self.end_time.is_none(),
            IncidentField::DiscoveredAt => self.discovered_at.is_none(),
            IncidentField::BusinessUnit => self.business_unit_id.is_none(),
            IncidentField::BusinessProcess => self.business_process_id.is_none(),
            IncidentField::Product => self.product_id.is_none(),
            IncidentField::BaselEventType => self.basel_event_type_id.is_none(),
            IncidentField::SimplifiedEventType => self.simplified_event_type_id.is_none(),
            IncidentField::GrossLossAmount => self.gross_loss_amount.is_none(),
            IncidentField::RecoveryAmount => self.recovery_amount.is_none(),
            IncidentField::NetLossAmount => self.net_loss_amount.is_none(),
            IncidentField::CurrencyCode => self.currency_code.is_none(),
            IncidentField::NearMiss => false,
        }
    }

    /// Fails with the list of `required` fields that are still empty.
    pub fn check_required(&self, target: IncidentStatus, required: &[IncidentField]) -> Result<()> {
        let missing: Vec<&str> = required
            .iter()
            .filter(|field| self.is_missing(**field))
            .map(Field::name)
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        Err(Error::blocked(format!(
            "Fields {} are required for {}.",
            missing.join(", "),
            target.code()
        )))
    }
}

/// Payload for a new incident. Everything beyond title and description is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewIncident {
    pub title: String,
    pub description: String,
    pub start_time: Option<TimeStamp>,
    pub end_time: Option<TimeStamp>,
    pub discovered_at: Option<TimeStamp>,
    pub business_unit_id: Option<Id>,
    pub business_process_id: Option<Id>,
    pub product_id: Option<Id>,
    pub simplified_event_type_id: Option<Id>,
    pub gross_loss_amount: Option<Money>,
    pub currency_code: Option<String>,
    pub near_miss: bool,
}

impl NewIncident {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn in_business_unit(mut self, business_unit_id: Id) -> Self {
        self.business_unit_id = Some(business_unit_id);
        self
    }

    pub fn with_gross_loss(mut self, amount: Money) -> Self {
        self.gross_loss_amount = Some(amount);
        self
    }

    pub fn with_simplified_event_type(mut self, event_type_id: Id) -> Self {
        self.simplified_event_type_id = Some(event_type_id);
        self
    }

    pub(crate) fn into_incident(
        self,
        id: Id,
        created_by: Id,
        now: TimeStamp,
        draft_due_at: DueDate,
    ) -> Incident {
        Incident {
            id,
            title: self.title.trim().to_string(),
            description: self.description.trim().to_string(),
            start_time: self.start_time,
            end_time: self.end_time,
            discovered_at: self.discovered_at,
            business_unit_id: self.business_unit_id,
            business_process_id: self.business_process_id,
            product_id: self.product_id,
            basel_event_type_id: None,
            simplified_event_type_id: self.simplified_event_type_id,
            gross_loss_amount: self.gross_loss_amount,
            recovery_amount: None,
            net_loss_amount: None,
            currency_code: self.currency_code,
            near_miss: self.near_miss,
            status: IncidentStatus::Draft,
            created_by,
            created_at: now,
            updated_at: now,
            assigned_to: None,
            reviewed_by: None,
            validated_by: None,
            validated_at: None,
            closed_by: None,
            closed_at: None,
            draft_due_at: Some(draft_due_at),
            review_due_at: None,
            validation_due_at: None,
            deleted_at: None,
            deleted_by: None,
            notes: Notes::new(),
        }
    }
}

/// A partial update. `None` leaves a field alone; `Some(None)` clears a nullable one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncidentPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub start_time: Option<Option<TimeStamp>>,
    pub end_time: Option<Option<TimeStamp>>,
    pub discovered_at: Option<Option<TimeStamp>>,
    pub business_unit_id: Option<Option<Id>>,
    pub business_process_id: Option<Option<Id>>,
    pub product_id: Option<Option<Id>>,
    pub basel_event_type_id: Option<Option<Id>>,
    pub simplified_event_type_id: Option<Option<Id>>,
    pub gross_loss_amount: Option<Option<Money>>,
    pub recovery_amount: Option<Option<Money>>,
    pub net_loss_amount: Option<Option<Money>>,
    pub currency_code: Option<Option<String>>,
    pub near_miss: Option<bool>,
}

impl IncidentPatch {
    pub(crate) fn apply(
        &self,
        incident: &mut Incident,
        editable: &Editable<IncidentField>,
    ) -> PatchOutcome<IncidentField> {
        use IncidentField as F;

        let mut outcome = PatchOutcome::default();
        let p = self.clone();
        editable.assign(
            F::Title,
            p.title.map(|t| t.trim().to_string()),
            &mut incident.title,
            &mut outcome,
        );
        editable.assign(
            F::Description,
            p.description.map(|d| d.trim().to_string()),
            &mut incident.description,
            &mut outcome,
        );
        editable.assign(F::StartTime, p.start_time, &mut incident.start_time, &mut outcome);
        editable.assign(F::EndTime, p.end_time, &mut incident.end_time, &mut outcome);
        editable.assign(
            F::DiscoveredAt,
            p.discovered_at,
            &mut incident.discovered_at,
            &mut outcome,
        );
        editable.assign(
            F::BusinessUnit,
            p.business_unit_id,
            &mut incident.business_unit_id,
            &mut outcome,
        );
        editable.assign(
            F::BusinessProcess,
            p.business_process_id,
            &mut incident.business_process_id,
            &mut outcome,
        );
        editable.assign(F::Product, p.product_id, &mut incident.product_id, &mut outcome);
        editable.assign(
            F::BaselEventType,
            p.basel_event_type_id,
            &mut incident.basel_event_type_id,
            &mut outcome,
        );
        editable.assign(
            F::SimplifiedEventType,
            p.simplified_event_type_id,
            &mut incident.simplified_event_type_id,
            &mut outcome,
        );
        editable.assign(
            F::GrossLossAmount,
            p.gross_loss_amount,
            &mut incident.gross_loss_amount,
            &mut outcome,
        );
        editable.assign(
            F::RecoveryAmount,
            p.recovery_amount,
            &mut incident.recovery_amount,
            &mut outcome,
        );
        editable.assign(
            F::NetLossAmount,
            p.net_loss_amount,
            &mut incident.net_loss_amount,
            &mut outcome,
        );
        editable.assign(
            F::CurrencyCode,
            p.currency_code,
            &mut incident.currency_code,
            &mut outcome,
        );
        editable.assign(F::NearMiss, p.near_miss, &mut incident.near_miss, &mut outcome);
        outcome
    }
}

pub fn actions(from: IncidentStatus, to: IncidentStatus) -> Option<Action> {
    use IncidentStatus::*;

    match (from, to) {
        (Draft, PendingReview) => Some(Action::new("submit", "Submit")),
        (PendingReview, PendingValidation) => Some(Action::new("review", "Review")),
        (PendingReview, Draft) => Some(Action::new("return-to-draft", "Return to Draft")),
        (PendingValidation, Validated) => Some(Action::new("validate", "Validate")),
        (PendingValidation, PendingReview) => {
            Some(Action::new("return-to-review", "Return to Review"))
        }
        (Validated, Closed) => Some(Action::new("close", "Close")),
        _ => None,
    }
}

pub fn default_transitions() -> TransitionTable<IncidentStatus> {
    use IncidentStatus::*;
    const OFFICERS: &[Role] = &[Role::RiskOfficer, Role::GroupOrm];

    TransitionTable::from_rules([
        (Draft, PendingReview, &[Role::Employee, Role::Manager][..]),
        (PendingReview, PendingValidation, &[Role::Manager][..]),
        (PendingReview, Draft, &[Role::Manager][..]),
        (PendingValidation, Validated, OFFICERS),
        (PendingValidation, PendingReview, OFFICERS),
        (Validated, Closed, OFFICERS),
    ])
}

pub fn default_field_rules() -> FieldRules<IncidentStatus, IncidentField> {
    use IncidentField::*;

    const DRAFT: &[IncidentField] = &[
        Title,
        Description,
        BusinessUnit,
        SimplifiedEventType,
        GrossLossAmount,
        CurrencyCode,
        NearMiss,
        StartTime,
        EndTime,
    ];
    const REVIEW_EXTRA: &[IncidentField] =
        &[BusinessProcess, Product, RecoveryAmount, NetLossAmount];
    const VALIDATION: &[IncidentField] = &[
        BaselEventType,
        BusinessProcess,
        Product,
        GrossLossAmount,
        RecoveryAmount,
        NetLossAmount,
        CurrencyCode,
        NearMiss,
    ];

    let mut rules = FieldRules::new();
    rules.grant_all(IncidentStatus::Draft, &[Role::Employee, Role::Manager], DRAFT);
    rules.grant_all(IncidentStatus::PendingReview, &[Role::Manager], DRAFT);
    rules.grant_all(IncidentStatus::PendingReview, &[Role::Manager], REVIEW_EXTRA);
    rules.grant_all(
        IncidentStatus::PendingValidation,
        &[Role::RiskOfficer, Role::GroupOrm],
        VALIDATION,
    );
    rules
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
struct TransitionRow {
    #[n(0)]
    from: IncidentStatus,
    #[n(1)]
    to: IncidentStatus,
    #[n(2)]
    role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
struct FieldRow {
    #[n(0)]
    status: IncidentStatus,
    #[n(1)]
    role: Role,
    #[n(2)]
    field: IncidentField,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
struct RequiredRow {
    #[n(0)]
    status: IncidentStatus,
    #[n(1)]
    field: IncidentField,
}

/// Reconfigurable incident rule tables kept in storage.
#[derive(Clone)]
pub struct IncidentRules {
    store: Store,
}

impl IncidentRules {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn engine(&self) -> Result<WorkflowEngine<IncidentStatus>> {
        Ok(WorkflowEngine::new(self.transitions()?, actions))
    }

    pub fn transitions(&self) -> Result<TransitionTable<IncidentStatus>> {
        let rows: Vec<TransitionRow> = self.store.rows(TRANSITIONS)?;
        if rows.is_empty() {
            return Ok(default_transitions());
        }
        Ok(TransitionTable::from_rows(
            rows.into_iter().map(|r| (r.from, r.to, r.role)),
        ))
    }

    pub fn field_rules(&self) -> Result<FieldRules<IncidentStatus, IncidentField>> {
        let rows: Vec<FieldRow> = self.store.rows(EDITABLE_FIELDS)?;
        if rows.is_empty() {
            return Ok(default_field_rules());
        }
        Ok(FieldRules::from_rows(
            rows.into_iter().map(|r| (r.status, r.role, r.field)),
        ))
    }

    pub fn required_fields(&self, status: IncidentStatus) -> Result<Vec<IncidentField>> {
        let rows: Vec<RequiredRow> = self.store.rows(REQUIRED_FIELDS)?;
        Ok(rows
            .into_iter()
            .filter(|r| r.status == status)
            .map(|r| r.field)
            .collect())
    }

    /// Adds one transition row. Self-transitions are rejected.
    pub fn allow_transition(
        &self,
        from: IncidentStatus,
        to: IncidentStatus,
        role: Role,
    ) -> Result<()> {
        if from == to {
            return Err(Error::Config(format!(
                "transition from '{}' to itself is not allowed",
                from.code()
            )));
        }
        self.store
            .insert_row(TRANSITIONS, &TransitionRow { from, to, role })
    }

    pub fn grant_field(
        &self,
        status: IncidentStatus,
        role: Role,
        field: IncidentField,
    ) -> Result<()> {
        self.store
            .insert_row(EDITABLE_FIELDS, &FieldRow { status, role, field })
    }

    pub fn require_field(&self, status: IncidentStatus, field: IncidentField) -> Result<()> {
        self.store
            .insert_row(REQUIRED_FIELDS, &RequiredRow { status, field })
    }

    /// Drops every stored transition row, reverting to the built-in table.
    pub fn reset_transitions(&self) -> Result<()> {
        self.store.clear_rows(TRANSITIONS)
    }
}
