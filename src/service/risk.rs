use tracing::{debug, info, warn};

use crate::access::Field;
use crate::control::Control;
use crate::error::{Error, Result};
use crate::incident::Incident;
use crate::measure::Measure;
use crate::notes::Note;
use crate::payload;
use crate::risk::{self, ControlLink, NewRisk, Risk, RiskCategory, RiskField, RiskPatch, RiskStatus};
use crate::store::{Record, Store};
use crate::types::{Id, Role, TimeStamp, User};
use crate::workflow::{Status, WorkflowEngine};

use super::{EntityContext, log_transition};

#[derive(Clone)]
pub struct RiskService {
    store: Store,
    engine: WorkflowEngine<RiskStatus>,
}

impl RiskService {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            engine: risk::engine(),
        }
    }

    /// Risks are scoped to the business unit of the acting user.
    fn is_visible(risk: &Risk, user: &User) -> bool {
        user.role != Role::Unknown
            && user.business_unit_id.is_some()
            && user.business_unit_id == risk.business_unit_id
    }

    fn load_visible(&self, id: Id, user: &User) -> Result<Risk> {
        let risk: Risk = self.store.fetch(id)?;
        if !Self::is_visible(&risk, user) {
            return Err(Error::NotFound {
                entity: Risk::ENTITY,
                id,
            });
        }
        Ok(risk)
    }

    fn is_participant(&self, risk: &Risk, user: &User) -> Result<bool> {
        if user.has_role(Role::RiskOfficer) {
            return Ok(true);
        }
        let owner = self.store.get::<User>(risk.owner_id)?;
        let creator = self.store.get::<User>(risk.created_by)?;
        Ok(risk.is_participant(user, owner.as_ref(), creator.as_ref()))
    }

    fn owner_in_unit(&self, owner_id: Id, business_unit_id: Option<Id>) -> Result<()> {
        let owner: User = self.store.fetch(owner_id)?;
        if business_unit_id.is_none() || owner.business_unit_id != business_unit_id {
            return Err(Error::permission("Owner must belong to the selected Business Unit."));
        }
        Ok(())
    }

    fn category(&self, category_id: Option<Id>) -> Result<Option<RiskCategory>> {
        category_id.map(|id| self.store.fetch(id)).transpose()
    }

    pub fn create(&self, user: &User, new: NewRisk) -> Result<Risk> {
        if !matches!(user.role, Role::Manager | Role::RiskOfficer) {
            return Err(Error::permission("Only Managers and Risk Officers can create risks."));
        }
        payload::TITLE.check(&new.title)?;
        payload::DESCRIPTION.check(&new.description)?;
        for (name, value) in [
            ("inherent_likelihood", new.inherent_likelihood),
            ("inherent_impact", new.inherent_impact),
        ] {
            if let Some(value) = value {
                payload::score(name, value)?;
            }
        }
        self.owner_in_unit(new.owner_id, Some(new.business_unit_id))?;

        let risk = new.into_risk(self.store.next_id()?, user.id, TimeStamp::now());
        if let Some(category) = self.category(risk.risk_category_id)? {
            risk.check_basel_mapping(&category)?;
        }
        self.store.put(&risk)?;

        info!(id = risk.id, actor = user.id, "risk created");
        Ok(risk)
    }

    pub fn get(&self, id: Id, user: &User) -> Result<Risk> {
        self.load_visible(id, user)
    }

    /// Visible risks, newest first.
    pub fn list(&self, user: &User) -> Result<Vec<Risk>> {
        Ok(self
            .store
            .all::<Risk>()?
            .into_iter()
            .rev()
            .filter(|risk| Self::is_visible(risk, user))
            .collect())
    }

    /// Non-editable fields are dropped; the result is checked for category
    /// consistency and owner placement before it is written.
    pub fn update(&self, id: Id, user: &User, patch: RiskPatch) -> Result<Risk> {
        self.load_visible(id, user)?;
        if let Some(title) = &patch.title {
            payload::TITLE.check(title)?;
        }
        if let Some(description) = &patch.description {
            payload::DESCRIPTION.check(description)?;
        }
        for (field, value) in patch.scores() {
            payload::score(field.name(), value)?;
        }
        if let Some(Some(category_id)) = patch.risk_category_id {
            self.store.fetch::<RiskCategory>(category_id)?;
        }
        let role = risk::contextual_role(user);

        let (risk, outcome) = self.store.update::<Risk, _>(id, |risk| {
            let editable = risk::editable_fields(risk.status, role);
            let outcome = patch.apply(risk, &editable);
            if outcome.is_noop() {
                return Ok(outcome);
            }
            if let Some(category) = self.category(risk.risk_category_id)? {
                risk.check_basel_mapping(&category)?;
            }
            if outcome
                .applied
                .iter()
                .any(|f| matches!(f, RiskField::Owner | RiskField::BusinessUnit))
            {
                self.owner_in_unit(risk.owner_id, risk.business_unit_id)?;
            }
            risk.updated_at = TimeStamp::now();
            Ok(outcome)
        })?;

        if !outcome.ignored.is_empty() {
            debug!(id, ignored = ?outcome.ignored_names(), "read-only risk fields ignored");
        }
        Ok(risk)
    }

    /// DRAFT risks only, by the creator or a risk officer.
    pub fn delete(&self, id: Id, user: &User) -> Result<()> {
        self.load_visible(id, user)?;
        self.store.remove_if::<Risk>(id, |risk| {
            if risk.status != RiskStatus::Draft {
                return Err(Error::blocked("Only DRAFT risks can be deleted."));
            }
            if risk.created_by != user.id && !user.has_role(Role::RiskOfficer) {
                return Err(Error::permission(
                    "Only the creator or a Risk Officer can delete a risk.",
                ));
            }
            Ok(())
        })?;

        info!(id, actor = user.id, "risk deleted");
        Ok(())
    }

    pub fn add_comment(&self, id: Id, user: &User, comment: &str) -> Result<Risk> {
        let current = self.load_visible(id, user)?;
        refuse_retired(&current, RETIRED_READ_ONLY)?;
        if !self.is_participant(&current, user)? {
            warn!(id, actor = user.id, "comment denied");
            return Err(Error::permission("You do not have permission to comment on this risk."));
        }
        let comment = payload::RISK_COMMENT.check(comment)?;

        let (risk, ()) = self.store.update::<Risk, _>(id, |risk| {
            refuse_retired(risk, RETIRED_READ_ONLY)?;
            let now = TimeStamp::now();
            risk.notes
                .append(Note::new(now, user.email.as_str(), comment.as_str()).labelled("COMMENT"));
            risk.updated_at = now;
            Ok(())
        })?;
        Ok(risk)
    }

    /// DRAFT -> ASSESSED once inherent scores and a consistent category are in place.
    pub fn submit_for_review(&self, id: Id, user: &User) -> Result<Risk> {
        self.load_visible(id, user)?;
        self.transition(id, user, RiskStatus::Assessed, |risk, now| {
            if risk.inherent_score().is_none() {
                return Err(Error::blocked("Inherent risk scores required before submission."));
            }
            let Some(category) = self.category(risk.risk_category_id)? else {
                return Err(Error::blocked("Risk category must be selected."));
            };
            risk.check_basel_mapping(&category)?;
            risk.submitted_by = Some(user.id);
            risk.submitted_for_review_at = Some(now);
            Ok(())
        })
    }

    /// ASSESSED -> ACTIVE. Residual exposure may never exceed inherent exposure.
    pub fn approve(&self, id: Id, user: &User) -> Result<Risk> {
        self.load_visible(id, user)?;
        self.transition(id, user, RiskStatus::Active, |risk, now| {
            let Some(residual) = risk.residual_score() else {
                return Err(Error::blocked("Residual risk scores required."));
            };
            if risk.basel_event_type_id.is_none() {
                return Err(Error::blocked("Basel event type must be selected."));
            }
            let Some(category) = self.category(risk.risk_category_id)? else {
                return Err(Error::blocked("Risk category must be selected."));
            };
            risk.check_basel_mapping(&category)?;
            if risk.inherent_score().is_some_and(|inherent| residual > inherent) {
                return Err(Error::blocked(
                    "Residual risk score cannot exceed inherent risk score.",
                ));
            }
            risk.validated_by = Some(user.id);
            risk.validated_at = Some(now);
            Ok(())
        })
    }

    /// ASSESSED -> DRAFT with a reason for revision.
    pub fn send_back(&self, id: Id, user: &User, reason: &str) -> Result<Risk> {
        let reason = payload::RISK_REASON.check(reason)?;
        self.load_visible(id, user)?;
        self.transition(id, user, RiskStatus::Draft, |risk, now| {
            let note = Note::new(now, user.email.as_str(), reason.as_str());
            risk.notes.append(note.labelled("RETURNED FOR REVISION"));
            Ok(())
        })
    }

    /// ACTIVE -> ASSESSED.
    pub fn request_reassessment(&self, id: Id, user: &User) -> Result<Risk> {
        self.load_visible(id, user)?;
        self.transition(id, user, RiskStatus::Assessed, |risk, now| {
            risk.submitted_for_review_at = Some(now);
            Ok(())
        })
    }

    pub fn retire(&self, id: Id, user: &User, reason: &str) -> Result<Risk> {
        let reason = payload::RISK_REASON.check(reason)?;
        self.load_visible(id, user)?;
        self.transition(id, user, RiskStatus::Retired, |risk, now| {
            risk.retirement_reason = Some(reason.clone());
            risk.notes
                .append(Note::new(now, user.email.as_str(), reason.as_str()).labelled("RETIRED"));
            Ok(())
        })
    }

    pub fn link_incident(&self, id: Id, user: &User, incident_id: Id) -> Result<Risk> {
        self.check_linker(id, user)?;
        let incident: Incident = self.store.fetch(incident_id)?;
        if incident.is_deleted() {
            return Err(Error::NotFound {
                entity: Incident::ENTITY,
                id: incident_id,
            });
        }
        self.relink(id, user, "incident", incident_id, |risk| {
            refuse_retired(risk, "Cannot link retired risks.")?;
            if !risk.incident_ids.insert(incident_id) {
                return Err(Error::idempotency("Incident already linked."));
            }
            Ok(())
        })
    }

    pub fn unlink_incident(&self, id: Id, user: &User, incident_id: Id) -> Result<Risk> {
        self.check_linker(id, user)?;
        self.relink(id, user, "incident", incident_id, |risk| {
            if !risk.incident_ids.remove(&incident_id) {
                return Err(Error::idempotency("Incident is not linked."));
            }
            Ok(())
        })
    }

    pub fn link_measure(&self, id: Id, user: &User, measure_id: Id) -> Result<Risk> {
        self.check_linker(id, user)?;
        self.store.fetch::<Measure>(measure_id)?;
        self.relink(id, user, "measure", measure_id, |risk| {
            refuse_retired(risk, "Cannot link measures to retired risks.")?;
            if !risk.measure_ids.insert(measure_id) {
                return Err(Error::idempotency("Measure already linked."));
            }
            Ok(())
        })
    }

    pub fn unlink_measure(&self, id: Id, user: &User, measure_id: Id) -> Result<Risk> {
        self.check_linker(id, user)?;
        self.relink(id, user, "measure", measure_id, |risk| {
            if !risk.measure_ids.remove(&measure_id) {
                return Err(Error::idempotency("Measure is not linked."));
            }
            Ok(())
        })
    }

    pub fn link_control(
        &self,
        id: Id,
        user: &User,
        control_id: Id,
        notes: Option<&str>,
    ) -> Result<Risk> {
        self.check_linker(id, user)?;
        let notes = notes.map(str::trim).filter(|n| !n.is_empty()).map(str::to_string);

        // A deactivation racing this link bumps the epoch, so the activity
        // check is repeated until it holds at commit.
        loop {
            let seen = self.store.link_epoch(control_id)?;
            let control: Control = self.store.fetch(control_id)?;
            if !control.is_active {
                return Err(Error::blocked("Cannot link inactive controls."));
            }

            let linked = self.store.update_guarded::<Risk, _>(id, control_id, seen, |risk| {
                refuse_retired(risk, "Cannot link controls to retired risks.")?;
                if risk.controls.contains_key(&control_id) {
                    return Err(Error::idempotency("Control already linked."));
                }
                let now = TimeStamp::now();
                risk.controls.insert(
                    control_id,
                    ControlLink {
                        linked_by: user.id,
                        linked_at: now,
                        notes: notes.clone(),
                    },
                );
                risk.updated_at = now;
                Ok(())
            })?;

            match linked {
                Some((risk, ())) => {
                    info!(
                        id,
                        kind = "control",
                        target = control_id,
                        actor = user.id,
                        "risk links changed"
                    );
                    return Ok(risk);
                }
                None => debug!(id, control_id, "control changed while linking, retrying"),
            }
        }
    }

    pub fn unlink_control(&self, id: Id, user: &User, control_id: Id) -> Result<Risk> {
        self.check_linker(id, user)?;
        self.relink(id, user, "control", control_id, |risk| {
            refuse_retired(risk, "Cannot unlink controls from retired risks.")?;
            let remaining = risk.controls.keys().filter(|id| **id != control_id).count();
            if risk.status == RiskStatus::Active && remaining == 0 {
                return Err(Error::blocked(
                    "Cannot unlink last control from ACTIVE risk. At least one control must remain.",
                ));
            }
            if risk.controls.remove(&control_id).is_none() {
                return Err(Error::idempotency("Control is not linked."));
            }
            Ok(())
        })
    }

    pub fn context(&self, id: Id, user: &User) -> Result<EntityContext> {
        let risk = self.load_visible(id, user)?;
        let role = risk::contextual_role(user);
        let can_delete = risk.status == RiskStatus::Draft
            && (risk.created_by == user.id || user.has_role(Role::RiskOfficer));

        Ok(EntityContext::new(
            role,
            self.engine.available_transitions(risk.status, role.role()),
            risk::editable_fields(risk.status, role).names(),
            can_delete,
        ))
    }

    fn check_linker(&self, id: Id, user: &User) -> Result<()> {
        self.load_visible(id, user)?;
        if !matches!(user.role, Role::Manager | Role::RiskOfficer) {
            return Err(Error::permission("Only Managers and Risk Officers can manage risk links."));
        }
        Ok(())
    }

    fn relink(
        &self,
        id: Id,
        user: &User,
        kind: &'static str,
        target: Id,
        change: impl Fn(&mut Risk) -> Result<()>,
    ) -> Result<Risk> {
        let (risk, ()) = self.store.update::<Risk, _>(id, |risk| {
            change(risk)?;
            risk.updated_at = TimeStamp::now();
            Ok(())
        })?;

        info!(id, kind, target, actor = user.id, "risk links changed");
        Ok(risk)
    }

    fn transition(
        &self,
        id: Id,
        user: &User,
        to: RiskStatus,
        effect: impl Fn(&mut Risk, TimeStamp) -> Result<()>,
    ) -> Result<Risk> {
        let role = risk::contextual_role(user);
        let (risk, from) = self.store.update::<Risk, _>(id, |risk| {
            let from = risk.status;
            self.engine.validate_transition(from, to, role.role())?;

            let now = TimeStamp::now();
            effect(risk, now)?;
            risk.status = to;
            risk.updated_at = now;
            Ok(from)
        })?;

        log_transition(Risk::ENTITY, id, from.code(), to.code(), user);
        Ok(risk)
    }
}

const RETIRED_READ_ONLY: &str = "Retired risk cannot be modified.";

fn refuse_retired(risk: &Risk, message: &str) -> Result<()> {
    if risk.status == RiskStatus::Retired {
        return Err(Error::blocked(message));
    }
    Ok(())
}

/// Risks whose controls include `control_id`.
pub(crate) fn risks_linked_to_control(store: &Store, control_id: Id) -> Result<Vec<Risk>> {
    Ok(store
        .all::<Risk>()?
        .into_iter()
        .filter(|risk| risk.controls.contains_key(&control_id))
        .collect())
}
