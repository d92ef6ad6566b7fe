//! Risks (potential loss events): model, workflow table, categories and field rules.
use std::collections::{BTreeMap, BTreeSet};

use crate::access::{ContextualRole, Editable, Field, PatchOutcome};
use crate::error::{Error, Result};
use crate::notes::Notes;
use crate::store::Record;
use crate::types::{DueDate, Id, Role, TimeStamp, User};
use crate::workflow::{Action, Status, TransitionTable, WorkflowEngine};

pub const BASEL_MISMATCH: &str = "Basel event type is not valid for risk category.";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, minicbor::Encode, minicbor::Decode,
)]
pub enum RiskStatus {
    #[n(0)]
    Draft,
    #[n(1)]
    Assessed,
    #[n(2)]
    Active,
    #[n(3)]
    Retired,
}

impl Status for RiskStatus {
    fn code(&self) -> &'static str {
        match self {
            RiskStatus::Draft => "DRAFT",
            RiskStatus::Assessed => "ASSESSED",
            RiskStatus::Active => "ACTIVE",
            RiskStatus::Retired => "RETIRED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RiskField {
    Title,
    Description,
    RiskCategory,
    BaselEventType,
    BusinessUnit,
    BusinessProcess,
    Product,
    Owner,
    InherentLikelihood,
    InherentImpact,
    ResidualLikelihood,
    ResidualImpact,
}

impl Field for RiskField {
    fn name(&self) -> &'static str {
        match self {
            RiskField::Title => "title",
            RiskField::Description => "description",
            RiskField::RiskCategory => "risk_category",
            RiskField::BaselEventType => "basel_event_type",
            RiskField::BusinessUnit => "business_unit",
            RiskField::BusinessProcess => "business_process",
            RiskField::Product => "product",
            RiskField::Owner => "owner",
            RiskField::InherentLikelihood => "inherent_likelihood",
            RiskField::InherentImpact => "inherent_impact",
            RiskField::ResidualLikelihood => "residual_likelihood",
            RiskField::ResidualImpact => "residual_impact",
        }
    }
}

/// A grouping of risks, mapped to the Basel event types it admits.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct RiskCategory {
    #[n(0)]
    pub id: Id,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub description: Option<String>,
    #[n(3)]
    pub basel_event_type_ids: BTreeSet<Id>,
}

impl Record for RiskCategory {
    const ENTITY: &'static str = "risk category";
    const TREE: &'static str = "risk_categories";

    fn id(&self) -> Id {
        self.id
    }
}

impl RiskCategory {
    pub fn new(
        id: Id,
        name: impl Into<String>,
        basel_event_type_ids: impl IntoIterator<Item = Id>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            description: None,
            basel_event_type_ids: basel_event_type_ids.into_iter().collect(),
        }
    }

    pub fn admits(&self, basel_event_type_id: Id) -> bool {
        self.basel_event_type_ids.contains(&basel_event_type_id)
    }
}

/// Metadata kept for each control attached to a risk.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct ControlLink {
    #[n(0)]
    pub linked_by: Id,
    #[n(1)]
    pub linked_at: TimeStamp,
    #[n(2)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Risk {
    #[n(0)]
    pub id: Id,
    #[n(1)]
    pub title: String,
    #[n(2)]
    pub description: String,
    #[n(3)]
    pub risk_category_id: Option<Id>,
    #[n(4)]
    pub basel_event_type_id: Option<Id>,
    #[n(5)]
    pub business_unit_id: Option<Id>,
    #[n(6)]
    pub business_process_id: Option<Id>,
    #[n(7)]
    pub product_id: Option<Id>,
    #[n(8)]
    pub inherent_likelihood: Option<u8>,
    #[n(9)]
    pub inherent_impact: Option<u8>,
    #[n(10)]
    pub residual_likelihood: Option<u8>,
    #[n(11)]
    pub residual_impact: Option<u8>,
    #[n(12)]
    pub status: RiskStatus,
    #[n(13)]
    pub owner_id: Id,
    #[n(14)]
    pub created_by: Id,
    #[n(15)]
    pub created_at: TimeStamp,
    #[n(16)]
    pub updated_at: TimeStamp,
    #[n(17)]
    pub next_review_date: Option<DueDate>,
    #[n(18)]
    pub submitted_for_review_at: Option<TimeStamp>,
    #[n(19)]
    pub submitted_by: Option<Id>,
    #[n(20)]
    pub validated_at: Option<TimeStamp>,
    #[n(21)]
    pub validated_by: Option<Id>,
    #[n(22)]
    pub retirement_reason: Option<String>,
    #[n(23)]
    pub notes: Notes,
    #[n(24)]
    pub incident_ids: BTreeSet<Id>,
    #[n(25)]
    pub measure_ids: BTreeSet<Id>,
    #[n(26)]
    pub controls: BTreeMap<Id, ControlLink>,
}

impl Record for Risk {
    const ENTITY: &'static str = "risk";
    const TREE: &'static str = "risks";

    fn id(&self) -> Id {
        self.id
    }
}

fn score(likelihood: Option<u8>, impact: Option<u8>) -> Option<u32> {
    Some(u32::from(likelihood?) * u32::from(impact?))
}

impl Risk {
    pub fn inherent_score(&self) -> Option<u32> {
        score(self.inherent_likelihood, self.inherent_impact)
    }

    pub fn residual_score(&self) -> Option<u32> {
        score(self.residual_likelihood, self.residual_impact)
    }

    /// Checks the Basel event type, when set, against `category`.
    pub fn check_basel_mapping(&self, category: &RiskCategory) -> Result<()> {
        match self.basel_event_type_id {
            Some(basel) if !category.admits(basel) => Err(Error::blocked(BASEL_MISMATCH)),
            _ => Ok(()),
        }
    }

    /// Owner, creator, or the manager of either.
    pub fn is_participant(
        &self,
        user: &User,
        owner: Option<&User>,
        creator: Option<&User>,
    ) -> bool {
        user.id == self.owner_id
            || user.id == self.created_by
            || owner.is_some_and(|o| user.is_manager_of(o))
            || creator.is_some_and(|c| user.is_manager_of(c))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRisk {
    pub title: String,
    pub description: String,
    pub risk_category_id: Option<Id>,
    pub business_unit_id: Id,
    pub owner_id: Id,
    pub basel_event_type_id: Option<Id>,
    pub business_process_id: Option<Id>,
    pub product_id: Option<Id>,
    pub inherent_likelihood: Option<u8>,
    pub inherent_impact: Option<u8>,
}

impl NewRisk {
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        business_unit_id: Id,
        owner_id: Id,
    ) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            risk_category_id: None,
            business_unit_id,
            owner_id,
            basel_event_type_id: None,
            business_process_id: None,
            product_id: None,
            inherent_likelihood: None,
            inherent_impact: None,
        }
    }

    pub fn in_category(mut self, category_id: Id) -> Self {
        self.risk_category_id = Some(category_id);
        self
    }

    pub fn with_inherent(mut self, likelihood: u8, impact: u8) -> Self {
        self.inherent_likelihood = Some(likelihood);
        self.inherent_impact = Some(impact);
        self
    }

    pub fn with_basel_event_type(mut self, basel_event_type_id: Id) -> Self {
        self.basel_event_type_id = Some(basel_event_type_id);
        self
    }

    pub(crate) fn into_risk(self, id: Id, created_by: Id, now: TimeStamp) -> Risk {
        Risk {
            id,
            title: self.title.trim().to_string(),
            description: self.description.trim().to_string(),
            risk_category_id: self.risk_category_id,
            basel_event_type_id: self.basel_event_type_id,
            business_unit_id: Some(self.business_unit_id),
            business_process_id: self.business_process_id,
            product_id: self.product_id,
            inherent_likelihood: self.inherent_likelihood,
            inherent_impact: self.inherent_impact,
            residual_likelihood: None,
            residual_impact: None,
            status: RiskStatus::Draft,
            owner_id: self.owner_id,
            created_by,
            created_at: now,
            updated_at: now,
            next_review_date: None,
            submitted_for_review_at: None,
            submitted_by: None,
            validated_at: None,
            validated_by: None,
            retirement_reason: None,
            notes: Notes::new(),
            incident_ids: BTreeSet::new(),
            measure_ids: BTreeSet::new(),
            controls: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RiskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub risk_category_id: Option<Option<Id>>,
    pub basel_event_type_id: Option<Option<Id>>,
    pub business_unit_id: Option<Option<Id>>,
    pub business_process_id: Option<Option<Id>>,
    pub product_id: Option<Option<Id>>,
    pub owner_id: Option<Id>,
    pub inherent_likelihood: Option<Option<u8>>,
    pub inherent_impact: Option<Option<u8>>,
    pub residual_likelihood: Option<Option<u8>>,
    pub residual_impact: Option<Option<u8>>,
}

impl RiskPatch {
    /// Every score carried by the patch, for range checks.
    pub(crate) fn scores(&self) -> impl Iterator<Item = (RiskField, u8)> + '_ {
        [
            (RiskField::InherentLikelihood, self.inherent_likelihood),
            (RiskField::InherentImpact, self.inherent_impact),
            (RiskField::ResidualLikelihood, self.residual_likelihood),
            (RiskField::ResidualImpact, self.residual_impact),
        ]
        .into_iter()
        .filter_map(|(field, value)| Some((field, value.flatten()?)))
    }

    pub(crate) fn apply(
        &self,
        risk: &mut Risk,
        editable: &Editable<RiskField>,
    ) -> PatchOutcome<RiskField> {
        use RiskField as F;

        let mut outcome = PatchOutcome::default();
        let p = self.clone();
        editable.assign(
            F::Title,
            p.title.map(|t| t.trim().to_string()),
            &mut risk.title,
            &mut outcome,
        );
        editable.assign(
            F::Description,
            p.description.map(|d| d.trim().to_string()),
            &mut risk.description,
            &mut outcome,
        );
        editable.assign(
            F::RiskCategory,
            p.risk_category_id,
            &mut risk.risk_category_id,
            &mut outcome,
        );
        editable.assign(
            F::BaselEventType,
            p.basel_event_type_id,
            &mut risk.basel_event_type_id,
            &mut outcome,
        );
        editable.assign(
            F::BusinessUnit,
            p.business_unit_id,
            &mut risk.business_unit_id,
            &mut outcome,
        );
        editable.assign(
            F::BusinessProcess,
            p.business_process_id,
            &mut risk.business_process_id,
            &mut outcome,
        );
        editable.assign(F::Product, p.product_id, &mut risk.product_id, &mut outcome);
        editable.assign(F::Owner, p.owner_id, &mut risk.owner_id, &mut outcome);
        editable.assign(
            F::InherentLikelihood,
            p.inherent_likelihood,
            &mut risk.inherent_likelihood,
            &mut outcome,
        );
        editable.assign(
            F::InherentImpact,
            p.inherent_impact,
            &mut risk.inherent_impact,
            &mut outcome,
        );
        editable.assign(
            F::ResidualLikelihood,
            p.residual_likelihood,
            &mut risk.residual_likelihood,
            &mut outcome,
        );
        editable.assign(
            F::ResidualImpact,
            p.residual_impact,
            &mut risk.residual_impact,
            &mut outcome,
        );
        outcome
    }
}

pub fn actions(from: RiskStatus, to: RiskStatus) -> Option<Action> {
    use RiskStatus::*;

    match (from, to) {
        (Draft, Assessed) => Some(Action::new("submit-for-review", "Submit for Review")),
        (Assessed, Active) => Some(Action::new("approve", "Approve Risk")),
        (Assessed, Draft) => Some(Action::new("send-back", "Send Back for Revision")),
        (Active, Assessed) => Some(Action::new("request-reassessment", "Request Reassessment")),
        (_, Retired) => Some(Action::new("retire", "Retire Risk")),
        _ => None,
    }
}

pub fn transitions() -> TransitionTable<RiskStatus> {
    use RiskStatus::*;
    const OFFICER: &[Role] = &[Role::RiskOfficer];

    TransitionTable::from_rules([
        (Draft, Assessed, &[Role::Manager, Role::RiskOfficer][..]),
        // Direct activation is valid but never offered as an action.
        (Draft, Active, OFFICER),
        (Assessed, Active, OFFICER),
        (Assessed, Draft, OFFICER),
        (Assessed, Retired, OFFICER),
        (Active, Assessed, OFFICER),
        (Active, Retired, OFFICER),
    ])
}

pub fn engine() -> WorkflowEngine<RiskStatus> {
    WorkflowEngine::new(transitions(), actions)
}

pub fn contextual_role(user: &User) -> ContextualRole {
    ContextualRole::new(user.role)
}

pub fn editable_fields(status: RiskStatus, role: ContextualRole) -> Editable<RiskField> {
    use RiskField::*;

    let fields: &[RiskField] = match (status, role.role()) {
        (RiskStatus::Draft, Role::Manager) => &[
            Title,
            Description,
            RiskCategory,
            BaselEventType,
            BusinessUnit,
            BusinessProcess,
            Product,
            Owner,
            InherentLikelihood,
            InherentImpact,
        ],
        (RiskStatus::Draft, Role::RiskOfficer) => &[
            Title,
            Description,
            RiskCategory,
            BaselEventType,
            BusinessUnit,
            BusinessProcess,
            Product,
            Owner,
            InherentLikelihood,
            InherentImpact,
            ResidualLikelihood,
            ResidualImpact,
        ],
        (RiskStatus::Assessed, Role::RiskOfficer) => &[
            ResidualLikelihood,
            ResidualImpact,
            BaselEventType,
            RiskCategory,
            Title,
            Description,
            BusinessUnit,
            BusinessProcess,
            Product,
        ],
        _ => &[],
    };
    fields.iter().copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_activation_is_valid_but_hidden() {
        let engine = engine();
        assert!(engine
            .validate_transition(RiskStatus::Draft, RiskStatus::Active, Role::RiskOfficer)
            .is_ok());

        let offered: Vec<&str> = engine
            .available_transitions(RiskStatus::Draft, Role::RiskOfficer)
            .iter()
            .map(|a| a.action)
            .collect();
        assert_eq!(offered, vec!["submit-for-review"]);
    }

    #[test]
    fn retired_is_terminal() {
        let err = engine()
            .validate_transition(RiskStatus::Retired, RiskStatus::Draft, Role::RiskOfficer)
            .unwrap_err();
        assert_eq!(err.to_string(), "Status 'RETIRED' has no defined transitions.");
    }

    #[test]
    fn locked_statuses_are_read_only() {
        for role in [
            Role::Employee,
            Role::Manager,
            Role::RiskOfficer,
            Role::GroupOrm,
            Role::Unknown,
        ] {
            assert!(editable_fields(RiskStatus::Active, ContextualRole::new(role)).is_empty());
            assert!(editable_fields(RiskStatus::Retired, ContextualRole::new(role)).is_empty());
        }
        let manager = ContextualRole::new(Role::Manager);
        assert!(editable_fields(RiskStatus::Assessed, manager).is_empty());
    }

    #[test]
    fn only_officers_touch_residual_scores_in_draft() {
        let manager = editable_fields(RiskStatus::Draft, ContextualRole::new(Role::Manager));
        let officer = editable_fields(RiskStatus::Draft, ContextualRole::new(Role::RiskOfficer));
        assert!(!manager.contains(RiskField::ResidualImpact));
        assert!(officer.contains(RiskField::ResidualImpact));
        assert!(manager.contains(RiskField::Owner));
    }

    #[test]
    fn scores_need_both_factors() {
        let mut risk = NewRisk::new("Vendor outage", "Cloud provider failure", 1, 1)
            .with_inherent(2, 2)
            .into_risk(1, 1, TimeStamp::now());
        assert_eq!(risk.inherent_score(), Some(4));
        assert_eq!(risk.residual_score(), None);
        risk.residual_likelihood = Some(3);
        risk.residual_impact = Some(3);
        assert_eq!(risk.residual_score(), Some(9));
    }

    #[test]
    fn basel_type_must_belong_to_category() {
        let category = RiskCategory::new(1, "External fraud", [2, 3]);
        let mut risk =
            NewRisk::new("Phishing", "Credential theft", 1, 1).into_risk(1, 1, TimeStamp::now());

        assert!(risk.check_basel_mapping(&category).is_ok());
        risk.basel_event_type_id = Some(3);
        assert!(risk.check_basel_mapping(&category).is_ok());
        risk.basel_event_type_id = Some(7);
        assert_eq!(risk.check_basel_mapping(&category).unwrap_err().to_string(), BASEL_MISMATCH);
    }
}
