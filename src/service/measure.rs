use tracing::{debug, info, warn};

use crate::access::ContextualRole;
use crate::error::{Error, Result};
use crate::incident::Incident;
use crate::measure::{self, Measure, MeasurePatch, MeasureStatus, NewMeasure};
use crate::notes::{Note, Notes};
use crate::payload::{self, TextRule};
use crate::store::{Record, Store};
use crate::types::{Id, Role, TimeStamp, User};
use crate::workflow::{Status, WorkflowEngine};

use super::{EntityContext, log_transition, today};

/// The people around one measure, loaded once per request.
struct Parties {
    responsible: Option<User>,
    creator: Option<User>,
}

impl Parties {
    fn is_responsible_or_manager(&self, user: &User) -> bool {
        self.responsible
            .as_ref()
            .is_some_and(|r| r.id == user.id || user.is_manager_of(r))
    }

    fn is_creator_or_manager(&self, user: &User) -> bool {
        self.creator
            .as_ref()
            .is_some_and(|c| c.id == user.id || user.is_manager_of(c))
    }

    fn shares_unit_with(&self, user: &User) -> bool {
        let Some(bu) = user.business_unit_id else {
            return false;
        };
        [&self.responsible, &self.creator]
            .into_iter()
            .flatten()
            .any(|party| party.business_unit_id == Some(bu))
    }

    /// Anyone involved, or a risk officer.
    fn is_participant(&self, user: &User) -> bool {
        self.is_responsible_or_manager(user)
            || self.is_creator_or_manager(user)
            || user.has_role(Role::RiskOfficer)
    }
}

#[derive(Clone)]
pub struct MeasureService {
    store: Store,
    engine: WorkflowEngine<MeasureStatus>,
}

impl MeasureService {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            engine: measure::engine(),
        }
    }

    fn parties(&self, measure: &Measure) -> Result<Parties> {
        Ok(Parties {
            responsible: self.store.get(measure.responsible_id)?,
            creator: self.store.get(measure.created_by)?,
        })
    }

    /// Responsible, creator and their managers; risk officers sharing a unit with either.
    fn is_visible(&self, parties: &Parties, user: &User) -> bool {
        parties.is_responsible_or_manager(user)
            || parties.is_creator_or_manager(user)
            || (user.has_role(Role::RiskOfficer) && parties.shares_unit_with(user))
    }

    fn load_visible(&self, id: Id, user: &User) -> Result<(Measure, Parties)> {
        let measure: Measure = self.store.fetch(id)?;
        let parties = self.parties(&measure)?;
        if !self.is_visible(&parties, user) {
            return Err(Error::NotFound {
                entity: Measure::ENTITY,
                id,
            });
        }
        Ok((measure, parties))
    }

    /// Managers and risk officers only. A given incident must exist; the link is made at once.
    pub fn create(&self, user: &User, new: NewMeasure) -> Result<Measure> {
        if !matches!(user.role, Role::Manager | Role::RiskOfficer) {
            return Err(Error::permission("Only Managers and Risk Officers can create measures."));
        }
        let description = payload::DESCRIPTION.check(&new.description)?;
        if let Some(deadline) = new.deadline {
            payload::deadline(deadline, today())?;
        }
        self.store.fetch::<User>(new.responsible_id)?;
        if let Some(incident_id) = new.incident_id {
            self.live_incident(incident_id)?;
        }

        let now = TimeStamp::now();
        let measure = Measure {
            id: self.store.next_id()?,
            description,
            responsible_id: new.responsible_id,
            deadline: new.deadline,
            status: MeasureStatus::Open,
            created_by: user.id,
            created_at: now,
            updated_at: now,
            closed_at: None,
            closure_comment: None,
            incident_ids: new.incident_id.into_iter().collect(),
            notes: Notes::new(),
        };
        self.store.put(&measure)?;

        info!(id = measure.id, actor = user.id, incident = ?new.incident_id, "measure created");
        Ok(measure)
    }

    pub fn get(&self, id: Id, user: &User) -> Result<Measure> {
        Ok(self.load_visible(id, user)?.0)
    }

    /// Visible measures, newest first.
    pub fn list(&self, user: &User) -> Result<Vec<Measure>> {
        let mut visible = Vec::new();
        for measure in self.store.all::<Measure>()?.into_iter().rev() {
            if self.is_visible(&self.parties(&measure)?, user) {
                visible.push(measure);
            }
        }
        Ok(visible)
    }

    /// Visible measures past their deadline while still open or in progress.
    pub fn overdue(&self, user: &User) -> Result<Vec<Measure>> {
        let today = today();
        Ok(self
            .list(user)?
            .into_iter()
            .filter(|m| m.is_overdue(today))
            .collect())
    }

    pub fn update(&self, id: Id, user: &User, patch: MeasurePatch) -> Result<Measure> {
        let (_, parties) = self.load_visible(id, user)?;
        if let Some(description) = &patch.description {
            payload::DESCRIPTION.check(description)?;
        }
        if let Some(Some(deadline)) = patch.deadline {
            payload::deadline(deadline, today())?;
        }
        if let Some(responsible_id) = patch.responsible_id {
            self.store.fetch::<User>(responsible_id)?;
        }
        let role = measure::contextual_role(parties.responsible.as_ref(), user);

        let (measure, outcome) = self.store.update::<Measure, _>(id, |measure| {
            let editable = measure::editable_fields(measure.status, role);
            let outcome = patch.apply(measure, &editable);
            if !outcome.is_noop() {
                measure.updated_at = TimeStamp::now();
            }
            Ok(outcome)
        })?;

        if !outcome.ignored.is_empty() {
            debug!(id, ignored = ?outcome.ignored_names(), "read-only measure fields ignored");
        }
        Ok(measure)
    }

    /// Only OPEN measures, by the creator or the creator's manager.
    pub fn delete(&self, id: Id, user: &User) -> Result<()> {
        let (_, parties) = self.load_visible(id, user)?;
        self.store.remove_if::<Measure>(id, |measure| {
            if !parties.is_creator_or_manager(user) {
                return Err(Error::permission(
                    "Only the creator or the creator's manager can delete a measure.",
                ));
            }
            if measure.status != MeasureStatus::Open {
                return Err(Error::blocked("Only OPEN measures can be deleted."));
            }
            Ok(())
        })?;

        info!(id, actor = user.id, "measure deleted");
        Ok(())
    }

    pub fn add_comment(&self, id: Id, user: &User, comment: &str) -> Result<Measure> {
        let (_, parties) = self.load_visible(id, user)?;
        if !parties.is_participant(user) {
            return Err(Error::permission("You do not have permission to comment on this measure."));
        }
        let comment = payload::MEASURE_COMMENT.check(comment)?;

        let (measure, ()) = self.store.update::<Measure, _>(id, |measure| {
            let now = TimeStamp::now();
            measure
                .notes
                .append(Note::new(now, user.email.as_str(), comment.as_str()).labelled("COMMENT"));
            measure.updated_at = now;
            Ok(())
        })?;
        Ok(measure)
    }

    /// OPEN -> IN_PROGRESS, by the responsible user or their manager.
    pub fn start_progress(&self, id: Id, user: &User) -> Result<Measure> {
        self.doer_transition(id, user, MeasureStatus::InProgress, "start progress", None)
    }

    /// IN_PROGRESS -> PENDING_REVIEW with evidence of the work done.
    pub fn submit_for_review(&self, id: Id, user: &User, evidence: &str) -> Result<Measure> {
        let evidence = payload::EVIDENCE.check(evidence)?;
        self.doer_transition(
            id,
            user,
            MeasureStatus::PendingReview,
            "submit for review",
            Some(("EVIDENCE", evidence)),
        )
    }

    /// PENDING_REVIEW -> IN_PROGRESS with a reason.
    pub fn return_to_progress(&self, id: Id, user: &User, reason: &str) -> Result<Measure> {
        self.officer_transition(
            id,
            user,
            MeasureStatus::InProgress,
            "return",
            &payload::MEASURE_REASON,
            reason,
            "REASON FOR RETURN",
        )
    }

    /// PENDING_REVIEW -> COMPLETED; the closure comment is kept on the record and in the log.
    pub fn complete(&self, id: Id, user: &User, closure_comment: &str) -> Result<Measure> {
        self.officer_transition(
            id,
            user,
            MeasureStatus::Completed,
            "complete",
            &payload::CLOSURE_COMMENT,
            closure_comment,
            "CLOSURE COMMENT",
        )
    }

    /// IN_PROGRESS or PENDING_REVIEW -> CANCELLED with a reason.
    pub fn cancel(&self, id: Id, user: &User, reason: &str) -> Result<Measure> {
        self.officer_transition(
            id,
            user,
            MeasureStatus::Cancelled,
            "cancel",
            &payload::MEASURE_REASON,
            reason,
            "REASON FOR CANCELLATION",
        )
    }

    pub fn link_to_incident(&self, id: Id, user: &User, incident_id: Id) -> Result<Measure> {
        let (_, parties) = self.load_visible(id, user)?;
        if !parties.is_participant(user) {
            return Err(Error::permission("You do not have permission to link this measure."));
        }
        self.live_incident(incident_id)?;

        let (measure, ()) = self.store.update::<Measure, _>(id, |measure| {
            if measure.status == MeasureStatus::Cancelled {
                return Err(Error::blocked("Cannot link a cancelled measure."));
            }
            if !measure.incident_ids.insert(incident_id) {
                return Err(Error::idempotency(format!(
                    "Measure {id} is already linked to Incident {incident_id}."
                )));
            }
            measure.updated_at = TimeStamp::now();
            Ok(())
        })?;

        info!(id, incident = incident_id, actor = user.id, "measure linked to incident");
        Ok(measure)
    }

    pub fn unlink_from_incident(&self, id: Id, user: &User, incident_id: Id) -> Result<Measure> {
        let (_, parties) = self.load_visible(id, user)?;
        if !parties.is_participant(user) {
            return Err(Error::permission("You do not have permission to unlink this measure."));
        }

        let (measure, ()) = self.store.update::<Measure, _>(id, |measure| {
            if !measure.incident_ids.remove(&incident_id) {
                return Err(Error::idempotency(format!(
                    "Measure {id} is not linked to Incident {incident_id}."
                )));
            }
            measure.updated_at = TimeStamp::now();
            Ok(())
        })?;

        info!(id, incident = incident_id, actor = user.id, "measure unlinked from incident");
        Ok(measure)
    }

    pub fn context(&self, id: Id, user: &User) -> Result<EntityContext> {
        let (measure, parties) = self.load_visible(id, user)?;
        let role = measure::contextual_role(parties.responsible.as_ref(), user);
        let can_delete =
            measure.status == MeasureStatus::Open && parties.is_creator_or_manager(user);

        Ok(EntityContext::new(
            role,
            self.engine.available_transitions(measure.status, role.role()),
            measure::editable_fields(measure.status, role).names(),
            can_delete,
        ))
    }

    fn live_incident(&self, incident_id: Id) -> Result<Incident> {
        let incident: Incident = self.store.fetch(incident_id)?;
        if incident.is_deleted() {
            return Err(Error::NotFound {
                entity: Incident::ENTITY,
                id: incident_id,
            });
        }
        Ok(incident)
    }

    // Transitions driven by the responsible party.
    fn doer_transition(
        &self,
        id: Id,
        user: &User,
        to: MeasureStatus,
        verb: &str,
        note: Option<(&'static str, String)>,
    ) -> Result<Measure> {
        let (_, parties) = self.load_visible(id, user)?;
        if !parties.is_responsible_or_manager(user) {
            return Err(Error::permission(format!(
                "Only the responsible user or their manager can {verb}."
            )));
        }
        let role = measure::contextual_role(parties.responsible.as_ref(), user);
        self.transition(id, user, role, to, note)
    }

    // Reviewer transitions: Risk Officers only, validated in their global role
    // even when they also manage the responsible user.
    fn officer_transition(
        &self,
        id: Id,
        user: &User,
        to: MeasureStatus,
        verb: &str,
        rule: &TextRule,
        text: &str,
        label: &'static str,
    ) -> Result<Measure> {
        self.load_visible(id, user)?;
        if !user.has_role(Role::RiskOfficer) {
            warn!(id, user = user.id, "measure review denied");
            return Err(Error::permission(format!("Only a Risk Officer can {verb} a measure.")));
        }
        let text = rule.check(text)?;
        self.transition(id, user, ContextualRole::new(user.role), to, Some((label, text)))
    }

    fn transition(
        &self,
        id: Id,
        user: &User,
        role: ContextualRole,
        to: MeasureStatus,
        note: Option<(&'static str, String)>,
    ) -> Result<Measure> {
        let (measure, from) = self.store.update::<Measure, _>(id, |measure| {
            let from = measure.status;
            self.engine.validate_transition(from, to, role.role())?;

            let now = TimeStamp::now();
            measure.status = to;
            if let Some((label, text)) = &note {
                measure
                    .notes
                    .append(Note::new(now, user.email.as_str(), text.as_str()).labelled(*label));
            }
            match to {
                MeasureStatus::Completed => {
                    measure.closure_comment = note.as_ref().map(|(_, text)| text.clone());
                    measure.closed_at = Some(now);
                }
                MeasureStatus::Cancelled => measure.closed_at = Some(now),
                _ => {}
            }
            measure.updated_at = now;
            Ok(from)
        })?;

        log_transition(Measure::ENTITY, id, from.code(), to.code(), user);
        Ok(measure)
    }
}
