use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::access::ContextualRole;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::incident::{Incident, IncidentPatch, IncidentRules, IncidentStatus, NewIncident};
use crate::notes::Note;
use crate::notification::{
    EntityType, Enqueued, EventType, NewNotification, NotificationKey, NotificationSink, SlaStage,
};
use crate::payload;
use crate::routing::{self, RoutingMatch};
use crate::store::{Record, Store};
use crate::types::{Id, Role, TimeStamp, User};
use crate::workflow::Status;

use super::{EntityContext, due_after, log_transition, manager_of, sla_days};

#[derive(Clone)]
pub struct IncidentService {
    store: Store,
    rules: IncidentRules,
    config: Config,
    sink: Arc<dyn NotificationSink + Send + Sync>,
}

impl IncidentService {
    pub fn new(store: Store, config: Config) -> Self {
        let sink = Arc::new(store.clone());
        Self::with_sink(store, config, sink)
    }

    pub fn with_sink(
        store: Store,
        config: Config,
        sink: Arc<dyn NotificationSink + Send + Sync>,
    ) -> Self {
        Self {
            rules: IncidentRules::new(store.clone()),
            store,
            config,
            sink,
        }
    }

    pub fn rules(&self) -> &IncidentRules {
        &self.rules
    }

    /// Creator and assignee; a manager also sees their direct reports' incidents;
    /// a risk officer those of their business unit; group ORM everything.
    fn is_visible(&self, incident: &Incident, user: &User) -> Result<bool> {
        if incident.is_deleted() {
            return Ok(false);
        }
        if incident.created_by == user.id || incident.assigned_to == Some(user.id) {
            return Ok(true);
        }
        Ok(match user.role {
            Role::GroupOrm => true,
            Role::RiskOfficer => {
                user.business_unit_id.is_some()
                    && incident.business_unit_id == user.business_unit_id
            }
            Role::Manager => manager_of(&self.store, incident.created_by)? == Some(user.id),
            Role::Employee | Role::Unknown => false,
        })
    }

    fn load_visible(&self, id: Id, user: &User) -> Result<Incident> {
        let incident: Incident = self.store.fetch(id)?;
        if !self.is_visible(&incident, user)? {
            return Err(Error::NotFound {
                entity: Incident::ENTITY,
                id,
            });
        }
        Ok(incident)
    }

    pub fn create(&self, user: &User, new: NewIncident) -> Result<Incident> {
        payload::TITLE.check(&new.title)?;
        payload::DESCRIPTION.check(&new.description)?;

        let now = TimeStamp::now();
        let draft_days = sla_days(&self.store, &self.config, SlaStage::Draft)?;
        let incident =
            new.into_incident(self.store.next_id()?, user.id, now, due_after(now, draft_days)?);
        self.store.put(&incident)?;

        info!(id = incident.id, actor = user.id, "incident created");
        Ok(incident)
    }

    pub fn get(&self, id: Id, user: &User) -> Result<Incident> {
        self.load_visible(id, user)
    }

    /// Visible incidents, newest first.
    pub fn list(&self, user: &User) -> Result<Vec<Incident>> {
        let mut visible = Vec::new();
        for incident in self.store.all::<Incident>()? {
            if self.is_visible(&incident, user)? {
                visible.push(incident);
            }
        }
        visible.reverse();
        Ok(visible)
    }

    /// Applies the editable part of `patch`. Everything else is dropped without error.
    pub fn update(&self, id: Id, user: &User, patch: IncidentPatch) -> Result<Incident> {
        self.load_visible(id, user)?;
        if let Some(title) = &patch.title {
            payload::TITLE.check(title)?;
        }
        if let Some(description) = &patch.description {
            payload::DESCRIPTION.check(description)?;
        }
        let field_rules = self.rules.field_rules()?;

        let (incident, outcome) = self.store.update::<Incident, _>(id, |incident| {
            let editable = field_rules.editable(incident.status, user.role);
            let outcome = patch.apply(incident, &editable);
            if !outcome.is_noop() {
                incident.updated_at = TimeStamp::now();
            }
            Ok(outcome)
        })?;

        if !outcome.ignored.is_empty() {
            debug!(id, ignored = ?outcome.ignored_names(), "read-only incident fields ignored");
        }
        Ok(incident)
    }

    /// Soft delete. Only drafts, by the creator or the creator's manager.
    pub fn delete(&self, id: Id, user: &User) -> Result<()> {
        let current = self.load_visible(id, user)?;
        let creator_manager = manager_of(&self.store, current.created_by)?;

        self.store.update::<Incident, _>(id, |incident| {
            if incident.created_by != user.id && creator_manager != Some(user.id) {
                return Err(Error::permission(
                    "Only the creator or the creator's manager can delete an incident.",
                ));
            }
            if incident.status != IncidentStatus::Draft {
                return Err(Error::blocked("Only DRAFT incidents can be deleted."));
            }
            incident.deleted_at = Some(TimeStamp::now());
            incident.deleted_by = Some(user.id);
            Ok(())
        })?;

        info!(id, actor = user.id, "incident deleted");
        Ok(())
    }

    /// DRAFT -> PENDING_REVIEW. Assigns a routed role holder, else the submitter's manager.
    pub fn submit(&self, id: Id, user: &User) -> Result<Incident> {
        self.load_visible(id, user)?;
        let engine = self.rules.engine()?;
        let required = self.rules.required_fields(IncidentStatus::PendingReview)?;
        let routing_rules = self.store.routing_rules()?;
        let users = self.store.all::<User>()?;
        let review_days = sla_days(&self.store, &self.config, SlaStage::Review)?;

        let (incident, from) = self.store.update::<Incident, _>(id, |incident| {
            if incident.created_by != user.id {
                return Err(Error::permission("Only the creator can submit an incident."));
            }
            let from = incident.status;
            engine.validate_transition(from, IncidentStatus::PendingReview, user.role)?;
            incident.check_required(IncidentStatus::PendingReview, &required)?;

            let now = TimeStamp::now();
            let routed = routing::evaluate(incident, &routing_rules)
                .and_then(|hit| routed_holder(&users, &hit));
            incident.assigned_to = routed.or(user.manager_id);
            incident.status = IncidentStatus::PendingReview;
            incident.review_due_at = Some(due_after(now, review_days)?);
            incident.draft_due_at = None;
            incident.updated_at = now;
            Ok(from)
        })?;

        log_transition(Incident::ENTITY, id, from.code(), incident.status.code(), user);
        Ok(incident)
    }

    /// PENDING_REVIEW -> PENDING_VALIDATION, by the creator's manager or the assignee.
    pub fn review(&self, id: Id, user: &User) -> Result<Incident> {
        let current = self.load_visible(id, user)?;
        let creator_manager = manager_of(&self.store, current.created_by)?;
        let engine = self.rules.engine()?;
        let required = self.rules.required_fields(IncidentStatus::PendingValidation)?;
        let officers = self.store.users_with_role(Role::RiskOfficer, None)?;
        let validation_days = sla_days(&self.store, &self.config, SlaStage::Validation)?;

        let (incident, from) = self.store.update::<Incident, _>(id, |incident| {
            if creator_manager != Some(user.id) && incident.assigned_to != Some(user.id) {
                return Err(Error::permission(
                    "Only the creator's manager or the assignee can review this incident.",
                ));
            }
            let from = incident.status;
            engine.validate_transition(from, IncidentStatus::PendingValidation, user.role)?;
            incident.check_required(IncidentStatus::PendingValidation, &required)?;

            let now = TimeStamp::now();
            incident.status = IncidentStatus::PendingValidation;
            incident.reviewed_by = Some(user.id);
            incident.assigned_to = risk_officer_for(&officers, incident.business_unit_id);
            incident.validation_due_at = Some(due_after(now, validation_days)?);
            incident.review_due_at = None;
            incident.updated_at = now;
            Ok(from)
        })?;

        log_transition(Incident::ENTITY, id, from.code(), incident.status.code(), user);
        self.notify_routing(&incident, user);
        Ok(incident)
    }

    /// PENDING_VALIDATION -> VALIDATED.
    pub fn validate(&self, id: Id, user: &User) -> Result<Incident> {
        self.load_visible(id, user)?;
        let engine = self.rules.engine()?;
        let required = self.rules.required_fields(IncidentStatus::Validated)?;

        let (incident, from) = self.store.update::<Incident, _>(id, |incident| {
            let from = incident.status;
            engine.validate_transition(from, IncidentStatus::Validated, user.role)?;
            incident.check_required(IncidentStatus::Validated, &required)?;

            let now = TimeStamp::now();
            incident.status = IncidentStatus::Validated;
            incident.validated_by = Some(user.id);
            incident.validated_at = Some(now);
            incident.assigned_to = None;
            incident.validation_due_at = None;
            incident.updated_at = now;
            Ok(from)
        })?;

        log_transition(Incident::ENTITY, id, from.code(), incident.status.code(), user);
        Ok(incident)
    }

    /// PENDING_REVIEW -> DRAFT with a mandatory reason.
    pub fn return_to_draft(&self, id: Id, user: &User, reason: &str) -> Result<Incident> {
        let reason = payload::INCIDENT_REASON.check(reason)?;
        self.load_visible(id, user)?;
        let engine = self.rules.engine()?;
        let draft_days = sla_days(&self.store, &self.config, SlaStage::Draft)?;

        let (incident, from) = self.store.update::<Incident, _>(id, |incident| {
            let from = incident.status;
            engine.validate_transition(from, IncidentStatus::Draft, user.role)?;

            let now = TimeStamp::now();
            incident.status = IncidentStatus::Draft;
            incident.assigned_to = None;
            let note = Note::new(now, user.email.as_str(), reason.as_str());
            incident.notes.append(note.labelled("RETURNED TO DRAFT"));
            incident.draft_due_at = Some(due_after(now, draft_days)?);
            incident.review_due_at = None;
            incident.updated_at = now;
            Ok(from)
        })?;

        log_transition(Incident::ENTITY, id, from.code(), incident.status.code(), user);
        Ok(incident)
    }

    /// PENDING_VALIDATION -> PENDING_REVIEW, back to the reviewer or the creator's manager.
    pub fn return_to_review(&self, id: Id, user: &User, reason: &str) -> Result<Incident> {
        let reason = payload::INCIDENT_REASON.check(reason)?;
        let current = self.load_visible(id, user)?;
        let creator_manager = manager_of(&self.store, current.created_by)?;
        let engine = self.rules.engine()?;
        let review_days = sla_days(&self.store, &self.config, SlaStage::Review)?;

        let (incident, from) = self.store.update::<Incident, _>(id, |incident| {
            let from = incident.status;
            engine.validate_transition(from, IncidentStatus::PendingReview, user.role)?;

            let now = TimeStamp::now();
            incident.status = IncidentStatus::PendingReview;
            incident.assigned_to = incident.reviewed_by.or(creator_manager);
            let note = Note::new(now, user.email.as_str(), reason.as_str());
            incident.notes.append(note.labelled("RETURNED TO REVIEW"));
            incident.review_due_at = Some(due_after(now, review_days)?);
            incident.validation_due_at = None;
            incident.updated_at = now;
            Ok(from)
        })?;

        log_transition(Incident::ENTITY, id, from.code(), incident.status.code(), user);
        Ok(incident)
    }

    /// VALIDATED -> CLOSED.
    pub fn close(&self, id: Id, user: &User) -> Result<Incident> {
        self.load_visible(id, user)?;
        let engine = self.rules.engine()?;

        let (incident, from) = self.store.update::<Incident, _>(id, |incident| {
            let from = incident.status;
            engine.validate_transition(from, IncidentStatus::Closed, user.role)?;

            let now = TimeStamp::now();
            incident.status = IncidentStatus::Closed;
            incident.closed_by = Some(user.id);
            incident.closed_at = Some(now);
            incident.assigned_to = None;
            incident.updated_at = now;
            Ok(from)
        })?;

        log_transition(Incident::ENTITY, id, from.code(), incident.status.code(), user);
        Ok(incident)
    }

    pub fn context(&self, id: Id, user: &User) -> Result<EntityContext> {
        let incident = self.load_visible(id, user)?;
        let role = ContextualRole::new(user.role);
        let engine = self.rules.engine()?;
        let editable = self.rules.field_rules()?.editable(incident.status, role.role());
        let creator_manager = manager_of(&self.store, incident.created_by)?;
        let can_delete = incident.status == IncidentStatus::Draft
            && (incident.created_by == user.id || creator_manager == Some(user.id));

        Ok(EntityContext::new(
            role,
            engine.available_transitions(incident.status, role.role()),
            editable.names(),
            can_delete,
        ))
    }

    // Routing is advisory: a failed enqueue is logged and never undoes the review.
    fn notify_routing(&self, incident: &Incident, user: &User) {
        let hit = match self.store.route(incident) {
            Ok(Some(hit)) => hit,
            Ok(None) => return,
            Err(e) => {
                warn!(id = incident.id, error = %e, "routing evaluation failed");
                return;
            }
        };

        let mut key =
            NotificationKey::new(EntityType::Incident, incident.id, EventType::RoutingNotify);
        if let Some(role) = hit.route_to_role {
            key = key.for_role(role);
        }
        let mut notification =
            NewNotification::new(key).from_rule(hit.rule_id).triggered_by(user.id);
        notification.payload = Some(
            json!({
                "title": incident.title,
                "message": format!(
                    "Incident '{}' was reviewed and requires awareness.",
                    incident.title
                ),
                "incident_id": incident.id,
            })
            .to_string(),
        );

        match self.sink.enqueue(notification) {
            Ok(Enqueued::Created(nid)) => {
                info!(
                    id = incident.id,
                    notification = nid,
                    rule = hit.rule_id,
                    "routing notification queued"
                )
            }
            Ok(Enqueued::AlreadyExists(nid)) => {
                debug!(id = incident.id, notification = nid, "routing notification already active")
            }
            Err(e) => warn!(id = incident.id, error = %e, "routing notification not queued"),
        }
    }
}

/// First holder of the routed role, inside the routed business unit when one is given.
fn routed_holder(users: &[User], hit: &RoutingMatch) -> Option<Id> {
    let role = hit.route_to_role?;
    users
        .iter()
        .filter(|u| u.role == role)
        .find(|u| hit.route_to_bu.is_none() || u.business_unit_id == hit.route_to_bu)
        .map(|u| u.id)
}

/// A risk officer of `business_unit_id`, else any risk officer.
fn risk_officer_for(officers: &[User], business_unit_id: Option<Id>) -> Option<Id> {
    business_unit_id
        .and_then(|bu| officers.iter().find(|o| o.business_unit_id == Some(bu)))
        .or_else(|| officers.first())
        .map(|o| o.id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routed_holder_prefers_the_routed_unit() {
        let users = vec![
            User::new(1, "ro-a@bank.test", Role::RiskOfficer).in_business_unit(1),
            User::new(2, "ro-b@bank.test", Role::RiskOfficer).in_business_unit(2),
        ];
        let hit = RoutingMatch {
            rule_id: 1,
            route_to_role: Some(Role::RiskOfficer),
            route_to_bu: Some(2),
        };
        assert_eq!(routed_holder(&users, &hit), Some(2));

        let anywhere = RoutingMatch { route_to_bu: None, ..hit };
        assert_eq!(routed_holder(&users, &anywhere), Some(1));

        let nowhere = RoutingMatch { route_to_bu: Some(9), ..hit };
        assert_eq!(routed_holder(&users, &nowhere), None);
    }

    #[test]
    fn officer_fallback_crosses_business_units() {
        let officers = vec![User::new(5, "ro@bank.test", Role::RiskOfficer).in_business_unit(3)];
        assert_eq!(risk_officer_for(&officers, Some(3)), Some(5));
        assert_eq!(risk_officer_for(&officers, Some(4)), Some(5));
        assert_eq!(risk_officer_for(&[], Some(4)), None);
    }
}
