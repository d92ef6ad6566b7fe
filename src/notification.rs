//! Queued notification records and the idempotent enqueue path.
//!
//! The core never delivers anything. It writes `queued` records that an
//! outer worker picks up, and guarantees that at most one *active* record
//! exists per [`NotificationKey`].
use sled::Transactional;
use sled::transaction::ConflictableTransactionError;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::store::{self, NOTIFICATION_KEYS, NOTIFICATIONS, Record, Store};
use crate::types::{DueDate, Id, Role, TimeStamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum EntityType {
    #[n(0)]
    Incident,
    #[n(1)]
    Measure,
    #[n(2)]
    Risk,
    #[n(3)]
    Kri,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum EventType {
    #[n(0)]
    RoutingNotify,
    #[n(1)]
    IncidentOverdue,
    #[n(2)]
    MeasureOverdue,
    #[n(3)]
    KriOverdue,
    #[n(4)]
    Custom,
}

impl EventType {
    pub fn code(&self) -> &'static str {
        match self {
            EventType::RoutingNotify => "ROUTING_NOTIFY",
            EventType::IncidentOverdue => "INCIDENT_OVERDUE",
            EventType::MeasureOverdue => "MEASURE_OVERDUE",
            EventType::KriOverdue => "KRI_OVERDUE",
            EventType::Custom => "CUSTOM",
        }
    }
}

/// Workflow stage an SLA window applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum SlaStage {
    #[n(0)]
    Draft,
    #[n(1)]
    Review,
    #[n(2)]
    Validation,
}

impl SlaStage {
    /// Name of the configuration entry holding this stage's window.
    pub fn key(&self) -> &'static str {
        match self {
            SlaStage::Draft => "draft_days",
            SlaStage::Review => "review_days",
            SlaStage::Validation => "validation_days",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum DeliveryStatus {
    #[n(0)]
    Queued,
    #[n(1)]
    Sent,
    #[n(2)]
    Failed,
    #[n(3)]
    Canceled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum Method {
    #[default]
    #[n(0)]
    System,
    #[n(1)]
    Email,
    #[n(2)]
    Slack,
    #[n(3)]
    Webhook,
}

/// The tuple over which active notifications are unique.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct NotificationKey {
    #[n(0)]
    pub entity_type: EntityType,
    #[n(1)]
    pub entity_id: Id,
    #[n(2)]
    pub event_type: EventType,
    #[n(3)]
    pub sla_stage: Option<SlaStage>,
    #[n(4)]
    pub recipient_role: Option<Role>,
    #[n(5)]
    pub recipient_user: Option<Id>,
}

impl NotificationKey {
    pub fn new(entity_type: EntityType, entity_id: Id, event_type: EventType) -> Self {
        Self {
            entity_type,
            entity_id,
            event_type,
            sla_stage: None,
            recipient_role: None,
            recipient_user: None,
        }
    }

    pub fn at_stage(mut self, stage: SlaStage) -> Self {
        self.sla_stage = Some(stage);
        self
    }

    pub fn for_role(mut self, role: Role) -> Self {
        self.recipient_role = Some(role);
        self
    }

    pub fn for_user(mut self, user: Id) -> Self {
        self.recipient_user = Some(user);
        self
    }

    /// Digest of the CBOR encoding, used as the active-index key.
    pub fn digest(&self) -> Result<String> {
        let cbor = minicbor::to_vec(self)?;
        Ok(sha256::digest(&cbor))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Notification {
    #[n(0)]
    pub id: Id,
    #[n(1)]
    pub key: NotificationKey,
    #[n(2)]
    pub routing_rule_id: Option<Id>,
    #[n(3)]
    pub triggered_by: Option<Id>,
    #[n(4)]
    pub method: Method,
    #[n(5)]
    pub payload: Option<String>,
    #[n(6)]
    pub due_at: Option<DueDate>,
    #[n(7)]
    pub status: DeliveryStatus,
    #[n(8)]
    pub attempts: u32,
    #[n(9)]
    pub last_error: Option<String>,
    #[n(10)]
    pub sent_at: Option<TimeStamp>,
    #[n(11)]
    pub created_at: TimeStamp,
    #[n(12)]
    pub active: bool,
}

impl Record for Notification {
    const ENTITY: &'static str = "notification";
    const TREE: &'static str = NOTIFICATIONS;

    fn id(&self) -> Id {
        self.id
    }
}

/// Everything needed to queue one notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNotification {
    pub key: NotificationKey,
    pub routing_rule_id: Option<Id>,
    pub triggered_by: Option<Id>,
    pub method: Method,
    pub payload: Option<String>,
    pub due_at: Option<DueDate>,
}

impl NewNotification {
    pub fn new(key: NotificationKey) -> Self {
        Self {
            key,
            routing_rule_id: None,
            triggered_by: None,
            method: Method::System,
            payload: None,
            due_at: None,
        }
    }

    pub fn from_rule(mut self, rule_id: Id) -> Self {
        self.routing_rule_id = Some(rule_id);
        self
    }

    pub fn triggered_by(mut self, user: Id) -> Self {
        self.triggered_by = Some(user);
        self
    }

    pub fn due(mut self, due_at: DueDate) -> Self {
        self.due_at = Some(due_at);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Created(Id),
    AlreadyExists(Id),
}

impl Enqueued {
    pub fn id(&self) -> Id {
        match self {
            Enqueued::Created(id) | Enqueued::AlreadyExists(id) => *id,
        }
    }
}

/// Where services hand off notifications. Implementations guarantee active uniqueness.
pub trait NotificationSink {
    fn enqueue(&self, notification: NewNotification) -> Result<Enqueued>;
}

impl Store {
    /// Inserts a queued notification; a duplicate active key is an idempotency error.
    pub fn insert_notification(&self, new: NewNotification) -> Result<Notification> {
        let id = self.next_id()?;
        let digest = new.key.digest()?;
        let record = Notification {
            id,
            key: new.key,
            routing_rule_id: new.routing_rule_id,
            triggered_by: new.triggered_by,
            method: new.method,
            payload: new.payload,
            due_at: new.due_at,
            status: DeliveryStatus::Queued,
            attempts: 0,
            last_error: None,
            sent_at: None,
            created_at: TimeStamp::now(),
            active: true,
        };
        let encoded = minicbor::to_vec(&record)?;

        let records = self.tree(NOTIFICATIONS)?;
        let index = self.tree(NOTIFICATION_KEYS)?;
        (&records, &index)
            .transaction(|(records, index)| {
                if let Some(existing) = index.get(digest.as_bytes())? {
                    return Err(ConflictableTransactionError::Abort(Error::idempotency(
                        format!(
                            "an active notification already exists (id {})",
                            id_from(&existing)
                        ),
                    )));
                }
                records.insert(store::key(id).to_vec(), encoded.clone())?;
                index.insert(digest.as_bytes(), store::key(id).to_vec())?;
                Ok(())
            })
            .map_err(Error::from)?;

        Ok(record)
    }

    /// Id of the active notification holding `key`, if any.
    pub fn active_notification(&self, key: &NotificationKey) -> Result<Option<Id>> {
        Ok(self
            .tree(NOTIFICATION_KEYS)?
            .get(key.digest()?.as_bytes())?
            .map(|raw| id_from(&raw)))
    }

    /// Frees the key for a new active notification. The record itself is kept.
    pub fn deactivate_notification(&self, id: Id) -> Result<Notification> {
        self.finish_notification(id, |n| {
            n.active = false;
            if n.status == DeliveryStatus::Queued {
                n.status = DeliveryStatus::Canceled;
            }
        })
    }

    pub fn mark_notification_sent(&self, id: Id) -> Result<Notification> {
        self.finish_notification(id, |n| {
            n.status = DeliveryStatus::Sent;
            n.sent_at = Some(TimeStamp::now());
            n.attempts += 1;
            n.last_error = None;
        })
    }

    /// Records a failed delivery attempt. The notification stays active.
    pub fn mark_notification_failed(&self, id: Id, error: &str) -> Result<Notification> {
        let (record, ()) = self.update::<Notification, _>(id, |n| {
            n.status = DeliveryStatus::Failed;
            n.attempts += 1;
            n.last_error = Some(error.to_string());
            Ok(())
        })?;
        Ok(record)
    }

    // Mutates the record and, when it is no longer active, drops its index entry
    // in the same transaction.
    fn finish_notification(
        &self,
        id: Id,
        apply: impl Fn(&mut Notification),
    ) -> Result<Notification> {
        let records = self.tree(NOTIFICATIONS)?;
        let index = self.tree(NOTIFICATION_KEYS)?;
        let record = (&records, &index)
            .transaction(|(records, index)| {
                let Some(bytes) = records.get(store::key(id))? else {
                    return Err(ConflictableTransactionError::Abort(Error::NotFound {
                        entity: Notification::ENTITY,
                        id,
                    }));
                };
                let mut record: Notification =
                    store::decode(&bytes).map_err(ConflictableTransactionError::Abort)?;
                apply(&mut record);
                if !record.active {
                    let digest = record
                        .key
                        .digest()
                        .map_err(ConflictableTransactionError::Abort)?;
                    // Only drop the index entry if it still points at this record.
                    if let Some(owner) = index.get(digest.as_bytes())? {
                        if id_from(&owner) == id {
                            index.remove(digest.as_bytes())?;
                        }
                    }
                }
                let encoded = minicbor::to_vec(&record)
                    .map_err(|e| ConflictableTransactionError::Abort(Error::from(e)))?;
                records.insert(store::key(id).to_vec(), encoded)?;
                Ok(record)
            })
            .map_err(Error::from)?;
        Ok(record)
    }
}

impl NotificationSink for Store {
    fn enqueue(&self, notification: NewNotification) -> Result<Enqueued> {
        let key = notification.key.clone();
        match self.insert_notification(notification) {
            Ok(record) => {
                debug!(
                    id = record.id,
                    event = key.event_type.code(),
                    entity_id = key.entity_id,
                    "notification queued"
                );
                Ok(Enqueued::Created(record.id))
            }
            Err(Error::Idempotency(message)) => match self.active_notification(&key)? {
                Some(existing) => {
                    warn!(
                        id = existing,
                        event = key.event_type.code(),
                        entity_id = key.entity_id,
                        "notification already active"
                    );
                    Ok(Enqueued::AlreadyExists(existing))
                }
                None => Err(Error::Idempotency(message)),
            },
            Err(e) => Err(e),
        }
    }
}

fn id_from(raw: &[u8]) -> Id {
    raw.try_into().map(Id::from_be_bytes).unwrap_or_default()
}
