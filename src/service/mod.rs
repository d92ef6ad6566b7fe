//! Application services: permission check, payload validation, transition or
//! field mutation, audit note, persistence and side effects, in that order.
//!
//! Every mutating call runs inside one sled transaction that re-reads the
//! record, so a concurrent change to the same entity either serializes behind
//! it or fails the status check.
use std::sync::Arc;

use chrono::NaiveDate;
use tracing::info;

use crate::access::{ContextualRole, Permissions};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::notification::{NotificationSink, SlaStage};
use crate::store::Store;
use crate::types::{DueDate, Id, Role, TimeStamp, User};
use crate::workflow::Action;

mod control;
mod incident;
mod measure;
mod risk;

pub use control::ControlService;
pub use incident::IncidentService;
pub use measure::MeasureService;
pub use risk::RiskService;

/// What the acting user may do with one entity, computed from a single contextual role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityContext {
    pub role: Role,
    pub acts_for_responsible: bool,
    pub available_transitions: Vec<Action>,
    pub editable_fields: Vec<&'static str>,
    pub permissions: Permissions,
}

impl EntityContext {
    pub(crate) fn new(
        role: ContextualRole,
        available_transitions: Vec<Action>,
        editable_fields: Vec<&'static str>,
        can_delete: bool,
    ) -> Self {
        let permissions = Permissions {
            can_edit: !editable_fields.is_empty(),
            can_delete,
            can_transition: !available_transitions.is_empty(),
        };
        Self {
            role: role.role(),
            acts_for_responsible: role.acts_for_responsible(),
            available_transitions,
            editable_fields,
            permissions,
        }
    }

    pub fn offers(&self, action: &str) -> bool {
        self.available_transitions.iter().any(|a| a.action == action)
    }
}

/// One entry point bundling every service over a shared store.
#[derive(Clone)]
pub struct Services {
    pub incidents: IncidentService,
    pub measures: MeasureService,
    pub risks: RiskService,
    pub controls: ControlService,
}

impl Services {
    pub fn new(store: Store, config: Config) -> Self {
        let sink: Arc<dyn NotificationSink + Send + Sync> = Arc::new(store.clone());
        Self::with_sink(store, config, sink)
    }

    pub fn with_sink(
        store: Store,
        config: Config,
        sink: Arc<dyn NotificationSink + Send + Sync>,
    ) -> Self {
        Self {
            incidents: IncidentService::with_sink(store.clone(), config, sink),
            measures: MeasureService::new(store.clone()),
            risks: RiskService::new(store.clone()),
            controls: ControlService::new(store),
        }
    }
}

pub(crate) fn today() -> NaiveDate {
    TimeStamp::now().date()
}

pub(crate) fn sla_days(store: &Store, config: &Config, stage: SlaStage) -> Result<u32> {
    config.sla_days(store, stage)
}

pub(crate) fn due_after(now: TimeStamp, days: u32) -> Result<DueDate> {
    now.due_in(days).ok_or_else(|| {
        Error::Config(format!("SLA of {days} days runs past the supported calendar"))
    })
}

pub(crate) fn log_transition(entity: &'static str, id: Id, from: &str, to: &str, actor: &User) {
    info!(entity, id, from, to, actor = actor.id, "transition committed");
}

/// The manager of `user`, if `user` exists and has one.
pub(crate) fn manager_of(store: &Store, user_id: Id) -> Result<Option<Id>> {
    Ok(store.get::<User>(user_id)?.and_then(|u| u.manager_id))
}
