use sled::Transactional;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use tracing::{debug, info, warn};

use crate::control::{Control, ControlPatch, NewControl};
use crate::error::{Error, Result};
use crate::payload;
use crate::risk::{Risk, RiskStatus};
use crate::store::{LINK_EPOCHS, Record, Store, decode, epoch_of, key};
use crate::types::{Id, Role, TimeStamp, User};

use super::risk::risks_linked_to_control;

#[derive(Clone)]
pub struct ControlService {
    store: Store,
}

impl ControlService {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Officers see every control of their unit; everyone else only active ones.
    /// Controls linked to a risk the user can reach are visible as well.
    fn is_visible(control: &Control, linked: &[Risk], user: &User) -> bool {
        let same_unit = user.business_unit_id == Some(control.business_unit_id);
        let unit_risk = user.business_unit_id.is_some()
            && linked
                .iter()
                .any(|risk| risk.business_unit_id == user.business_unit_id);

        match user.role {
            Role::GroupOrm => true,
            Role::RiskOfficer => same_unit || unit_risk,
            Role::Manager => {
                let owns_risk = linked.iter().any(|risk| risk.owner_id == user.id);
                control.is_active && (same_unit || owns_risk)
            }
            Role::Employee => control.is_active && (same_unit || unit_risk),
            Role::Unknown => false,
        }
    }

    fn load_visible(&self, id: Id, user: &User) -> Result<Control> {
        let control: Control = self.store.fetch(id)?;
        let linked = risks_linked_to_control(&self.store, id)?;
        if !Self::is_visible(&control, &linked, user) {
            return Err(Error::NotFound {
                entity: Control::ENTITY,
                id,
            });
        }
        Ok(control)
    }

    fn require_officer(user: &User, message: &str) -> Result<()> {
        if !user.has_role(Role::RiskOfficer) {
            warn!(actor = user.id, role = %user.role, "control change denied");
            return Err(Error::permission(message));
        }
        Ok(())
    }

    pub fn create(&self, user: &User, new: NewControl) -> Result<Control> {
        Self::require_officer(user, "Only Risk Officers can create controls.")?;
        payload::TITLE.check(&new.title)?;
        payload::DESCRIPTION.check(&new.description)?;
        if let Some(effectiveness) = new.effectiveness {
            payload::score("effectiveness", effectiveness)?;
        }
        self.store.fetch::<User>(new.owner_id)?;

        let control = new.into_control(self.store.next_id()?, user.id, TimeStamp::now());
        self.store.put(&control)?;

        info!(id = control.id, actor = user.id, "control created");
        Ok(control)
    }

    pub fn get(&self, id: Id, user: &User) -> Result<Control> {
        self.load_visible(id, user)
    }

    /// Visible controls in id order.
    pub fn list(&self, user: &User) -> Result<Vec<Control>> {
        let risks = self.store.all::<Risk>()?;
        Ok(self
            .store
            .all::<Control>()?
            .into_iter()
            .filter(|control| {
                let linked: Vec<Risk> = risks
                    .iter()
                    .filter(|risk| risk.controls.contains_key(&control.id))
                    .cloned()
                    .collect();
                Self::is_visible(control, &linked, user)
            })
            .collect())
    }

    pub fn update(&self, id: Id, user: &User, patch: ControlPatch) -> Result<Control> {
        Self::require_officer(user, "Only Risk Officers can edit controls.")?;
        self.load_visible(id, user)?;
        if let Some(title) = &patch.title {
            payload::TITLE.check(title)?;
        }
        if let Some(description) = &patch.description {
            payload::DESCRIPTION.check(description)?;
        }
        if let Some(Some(effectiveness)) = patch.effectiveness {
            payload::score("effectiveness", effectiveness)?;
        }
        if let Some(owner_id) = patch.owner_id {
            self.store.fetch::<User>(owner_id)?;
        }
        let control = loop {
            let seen = self.store.link_epoch(id)?;
            // Risk links live on the risk records; only the risks linked now are
            // re-read inside the transaction, and a concurrent link moves the epoch.
            let linked: Vec<Id> = if patch.is_active == Some(false) {
                risks_linked_to_control(&self.store, id)?.iter().map(|risk| risk.id).collect()
            } else {
                Vec::new()
            };
            match self.apply_patch(id, &patch, &linked, seen)? {
                Some(control) => break control,
                None => debug!(id, "control links changed during update, retrying"),
            }
        };

        info!(id, actor = user.id, active = control.is_active, "control updated");
        Ok(control)
    }

    fn apply_patch(
        &self,
        id: Id,
        patch: &ControlPatch,
        linked: &[Id],
        seen: u64,
    ) -> Result<Option<Control>> {
        let controls = self.store.tree(Control::TREE)?;
        let risks = self.store.tree(Risk::TREE)?;
        let epochs = self.store.tree(LINK_EPOCHS)?;
        let outcome = (&controls, &risks, &epochs).transaction(|(controls, risks, epochs)| {
            if epoch_of(epochs.get(key(id))?.as_deref()) != seen {
                return Ok(None);
            }
            for risk_id in linked {
                let Some(bytes) = risks.get(key(*risk_id))? else {
                    continue;
                };
                let risk: Risk = decode(&bytes).map_err(ConflictableTransactionError::Abort)?;
                if risk.status == RiskStatus::Active && risk.controls.contains_key(&id) {
                    return Err(ConflictableTransactionError::Abort(Error::validation(
                        "Cannot deactivate control linked to ACTIVE risks.",
                    )));
                }
            }

            let Some(bytes) = controls.get(key(id))? else {
                return Err(ConflictableTransactionError::Abort(Error::NotFound {
                    entity: Control::ENTITY,
                    id,
                }));
            };
            let mut control: Control = decode(&bytes).map_err(ConflictableTransactionError::Abort)?;
            patch.apply(&mut control);
            control.updated_at = TimeStamp::now();
            let encoded = minicbor::to_vec(&control)
                .map_err(|e| ConflictableTransactionError::Abort(Error::from(e)))?;
            controls.insert(key(id).to_vec(), encoded)?;
            epochs.insert(key(id).to_vec(), (seen + 1).to_be_bytes().to_vec())?;
            Ok(Some(control))
        });

        outcome.map_err(|e: TransactionError<Error>| e.into())
    }

    /// Controls are never deleted, only deactivated.
    pub fn delete(&self, id: Id, user: &User) -> Result<()> {
        self.load_visible(id, user)?;
        Err(Error::permission("Controls cannot be deleted. Please deactivate them instead."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlFrequency;
    use crate::risk::NewRisk;

    fn control(active: bool) -> Control {
        let mut control = NewControl::new(
            "Dual approval",
            "Two signatures",
            ControlFrequency::Daily,
            10,
            3,
        )
            .into_control(1, 2, TimeStamp::now());
        control.is_active = active;
        control
    }

    #[test]
    fn inactive_controls_are_for_officers() {
        let employee = User::new(4, "emp@bank.test", Role::Employee).in_business_unit(10);
        let officer = User::new(5, "ro@bank.test", Role::RiskOfficer).in_business_unit(10);

        assert!(ControlService::is_visible(&control(true), &[], &employee));
        assert!(!ControlService::is_visible(&control(false), &[], &employee));
        assert!(ControlService::is_visible(&control(false), &[], &officer));
    }

    #[test]
    fn managers_see_controls_on_risks_they_own() {
        let manager = User::new(6, "mgr@bank.test", Role::Manager).in_business_unit(20);
        let owned = NewRisk::new("Fraud", "Card skimming", 30, 6).into_risk(9, 6, TimeStamp::now());
        let foreign =
            NewRisk::new("Fraud", "Card skimming", 30, 7).into_risk(9, 7, TimeStamp::now());

        assert!(!ControlService::is_visible(&control(true), &[], &manager));
        assert!(ControlService::is_visible(&control(true), &[owned], &manager));
        assert!(!ControlService::is_visible(&control(true), &[foreign], &manager));
    }
}
