//! Workflow core of an operational-risk register.
//!
//! Incidents, measures and risks move through role-gated status workflows
//! driven by one generic [`workflow::WorkflowEngine`]. Field edits are filtered
//! by status and contextual role, incidents are routed by data-driven rules,
//! and notifications are enqueued with at-most-one-active semantics. State
//! lives in an embedded `sled` database.

pub mod access;
pub mod config;
pub mod control;
pub mod error;
pub mod incident;
pub mod measure;
pub mod notes;
pub mod notification;
pub mod payload;
pub mod risk;
pub mod routing;
pub mod service;
pub mod store;
pub mod types;
pub mod workflow;

pub use config::Config;
pub use error::{Error, Result, Treatment};
pub use service::{
    ControlService, EntityContext, IncidentService, MeasureService, RiskService, Services,
};
pub use store::Store;
pub use types::{Id, Role, User};
pub use workflow::{Action, TransitionError, WorkflowEngine};
