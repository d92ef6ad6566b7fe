//! sled-backed persistence: one tree per record family, CBOR values, big-endian id keys.
use std::path::Path;
use std::sync::Arc;

use sled::Transactional;
use sled::transaction::{ConflictableTransactionError, TransactionError};

use crate::error::{Error, Result};
use crate::notification::SlaStage;
use crate::types::{Id, Role, User};

pub(crate) const NOTIFICATIONS: &str = "notifications";
pub(crate) const NOTIFICATION_KEYS: &str = "notification_keys";
pub(crate) const LINK_EPOCHS: &str = "link_epochs";
const SLA_CONFIG: &str = "sla_config";

/// A CBOR-encoded value stored under its id in its own tree.
pub trait Record: minicbor::Encode<()> + for<'b> minicbor::Decode<'b, ()> + Sized {
    const ENTITY: &'static str;
    const TREE: &'static str;

    fn id(&self) -> Id;
}

impl Record for User {
    const ENTITY: &'static str = "user";
    const TREE: &'static str = "users";

    fn id(&self) -> Id {
        self.id
    }
}

pub(crate) fn key(id: Id) -> [u8; 8] {
    id.to_be_bytes()
}

/// A missing epoch counts as zero.
pub(crate) fn epoch_of(raw: Option<&[u8]>) -> u64 {
    raw.and_then(|bytes| <[u8; 8]>::try_from(bytes).ok())
        .map(u64::from_be_bytes)
        .unwrap_or(0)
}

pub(crate) fn decode<R: Record>(bytes: &[u8]) -> Result<R> {
    Ok(minicbor::decode(bytes)?)
}

#[derive(Clone)]
pub struct Store {
    instance: Arc<sled::Db>,
}

impl Store {
    pub fn new(instance: Arc<sled::Db>) -> Self {
        Self { instance }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Arc::new(sled::open(path)?)))
    }

    pub fn db(&self) -> &sled::Db {
        &self.instance
    }

    pub(crate) fn tree(&self, name: &str) -> Result<sled::Tree> {
        Ok(self.instance.open_tree(name)?)
    }

    /// Ids start at 1 and are unique across every record family.
    pub fn next_id(&self) -> Result<Id> {
        Ok(self.instance.generate_id()? + 1)
    }

    pub fn get<R: Record>(&self, id: Id) -> Result<Option<R>> {
        self.tree(R::TREE)?
            .get(key(id))?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    pub fn fetch<R: Record>(&self, id: Id) -> Result<R> {
        self.get(id)?.ok_or(Error::NotFound {
            entity: R::ENTITY,
            id,
        })
    }

    pub fn put<R: Record>(&self, record: &R) -> Result<()> {
        let bytes = minicbor::to_vec(record)?;
        self.tree(R::TREE)?.insert(key(record.id()), bytes)?;
        Ok(())
    }

    /// Every record of one family in id order.
    pub fn all<R: Record>(&self) -> Result<Vec<R>> {
        self.tree(R::TREE)?
            .iter()
            .values()
            .map(|bytes| decode(&bytes?))
            .collect()
    }

    /// Read, mutate and write one record atomically.
    ///
    /// `apply` may run more than once when sled retries a conflicting
    /// transaction, so it must only touch the record it is handed. Any error it
    /// returns aborts the transaction and leaves the stored record unchanged.
    pub fn update<R, T>(&self, id: Id, apply: impl Fn(&mut R) -> Result<T>) -> Result<(R, T)>
    where
        R: Record,
    {
        let tree = self.tree(R::TREE)?;
        let outcome = tree.transaction(|tx| {
            let Some(bytes) = tx.get(key(id))? else {
                return Err(ConflictableTransactionError::Abort(Error::NotFound {
                    entity: R::ENTITY,
                    id,
                }));
            };
            let mut record: R = decode(&bytes).map_err(ConflictableTransactionError::Abort)?;
            let out = apply(&mut record).map_err(ConflictableTransactionError::Abort)?;
            let encoded = minicbor::to_vec(&record)
                .map_err(|e| ConflictableTransactionError::Abort(Error::from(e)))?;
            tx.insert(key(id).to_vec(), encoded)?;
            Ok((record, out))
        });

        outcome.map_err(|e: TransactionError<Error>| e.into())
    }

    /// Deletes a record once `check` accepts its current stored state.
    pub fn remove_if<R: Record>(&self, id: Id, check: impl Fn(&R) -> Result<()>) -> Result<R> {
        let tree = self.tree(R::TREE)?;
        let outcome = tree.transaction(|tx| {
            let Some(bytes) = tx.get(key(id))? else {
                return Err(ConflictableTransactionError::Abort(Error::NotFound {
                    entity: R::ENTITY,
                    id,
                }));
            };
            let record: R = decode(&bytes).map_err(ConflictableTransactionError::Abort)?;
            check(&record).map_err(ConflictableTransactionError::Abort)?;
            tx.remove(key(id).to_vec())?;
            Ok(record)
        });

        outcome.map_err(|e: TransactionError<Error>| e.into())
    }

    /// Counter bumped whenever the links of `guard` may have changed.
    pub(crate) fn link_epoch(&self, guard: Id) -> Result<u64> {
        Ok(epoch_of(self.tree(LINK_EPOCHS)?.get(key(guard))?.as_deref()))
    }

    /// [`Store::update`] that only commits while the link epoch of `guard` is
    /// still `seen`, and bumps it when it does. `Ok(None)` means the epoch moved
    /// and nothing was written; the caller re-reads and tries again.
    pub(crate) fn update_guarded<R, T>(
        &self,
        id: Id,
        guard: Id,
        seen: u64,
        apply: impl Fn(&mut R) -> Result<T>,
    ) -> Result<Option<(R, T)>>
    where
        R: Record,
    {
        let records = self.tree(R::TREE)?;
        let epochs = self.tree(LINK_EPOCHS)?;
        let outcome = (&records, &epochs).transaction(|(tx, epochs)| {
            if epoch_of(epochs.get(key(guard))?.as_deref()) != seen {
                return Ok(None);
            }
            let Some(bytes) = tx.get(key(id))? else {
                return Err(ConflictableTransactionError::Abort(Error::NotFound {
                    entity: R::ENTITY,
                    id,
                }));
            };
            let mut record: R = decode(&bytes).map_err(ConflictableTransactionError::Abort)?;
            let out = apply(&mut record).map_err(ConflictableTransactionError::Abort)?;
            let encoded = minicbor::to_vec(&record)
                .map_err(|e| ConflictableTransactionError::Abort(Error::from(e)))?;
            tx.insert(key(id).to_vec(), encoded)?;
            epochs.insert(key(guard).to_vec(), (seen + 1).to_be_bytes().to_vec())?;
            Ok(Some((record, out)))
        });

        outcome.map_err(|e: TransactionError<Error>| e.into())
    }

    /// Configuration rows whose key is their own encoding.
    pub(crate) fn rows<T>(&self, tree: &str) -> Result<Vec<T>>
    where
        T: for<'b> minicbor::Decode<'b, ()>,
    {
        self.tree(tree)?
            .iter()
            .keys()
            .map(|bytes| -> Result<T> { Ok(minicbor::decode(&bytes?)?) })
            .collect()
    }

    pub(crate) fn insert_row<T: minicbor::Encode<()>>(&self, tree: &str, row: &T) -> Result<()> {
        let bytes = minicbor::to_vec(row)?;
        self.tree(tree)?.insert(bytes, Vec::new())?;
        Ok(())
    }

    pub(crate) fn clear_rows(&self, tree: &str) -> Result<()> {
        self.tree(tree)?.clear()?;
        Ok(())
    }

    pub fn set_sla_days(&self, stage: SlaStage, days: u32) -> Result<()> {
        self.tree(SLA_CONFIG)?
            .insert(stage.key(), days.to_be_bytes().to_vec())?;
        Ok(())
    }

    pub fn sla_days(&self, stage: SlaStage) -> Result<Option<u32>> {
        let Some(raw) = self.tree(SLA_CONFIG)?.get(stage.key())? else {
            return Ok(None);
        };
        let bytes: [u8; 4] = raw
            .as_ref()
            .try_into()
            .map_err(|_| Error::Config(format!("malformed SLA override for {}", stage.key())))?;
        Ok(Some(u32::from_be_bytes(bytes)))
    }

    /// Users holding `role`, optionally restricted to one business unit, in id order.
    pub fn users_with_role(&self, role: Role, business_unit_id: Option<Id>) -> Result<Vec<User>> {
        Ok(self
            .all::<User>()?
            .into_iter()
            .filter(|user| user.role == role)
            .filter(|user| business_unit_id.is_none() || user.business_unit_id == business_unit_id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, Store) {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("store.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn ids_start_at_one_and_increase() {
        let (_dir, store) = store();
        let first = store.next_id().unwrap();
        let second = store.next_id().unwrap();
        assert!(first >= 1);
        assert!(second > first);
    }

    #[test]
    fn failed_update_leaves_record_untouched() {
        let (_dir, store) = store();
        store.put(&User::new(1, "ana@bank.test", Role::Employee)).unwrap();

        let err = store
            .update::<User, ()>(1, |user| {
                user.role = Role::Manager;
                Err(Error::validation("nope"))
            })
            .unwrap_err();

        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(store.fetch::<User>(1).unwrap().role, Role::Employee);
    }

    #[test]
    fn missing_records_are_not_found() {
        let (_dir, store) = store();
        let err = store.update::<User, ()>(9, |_| Ok(())).unwrap_err();
        assert!(matches!(err, Error::NotFound { entity: "user", id: 9 }));
    }

    #[test]
    fn role_lookup_respects_business_unit() {
        let (_dir, store) = store();
        store
            .put(&User::new(1, "ro1@bank.test", Role::RiskOfficer).in_business_unit(10))
            .unwrap();
        store
            .put(&User::new(2, "ro2@bank.test", Role::RiskOfficer).in_business_unit(20))
            .unwrap();

        let in_twenty = store.users_with_role(Role::RiskOfficer, Some(20)).unwrap();
        assert_eq!(in_twenty.len(), 1);
        assert_eq!(in_twenty[0].id, 2);
        assert_eq!(store.users_with_role(Role::RiskOfficer, None).unwrap().len(), 2);
    }

    #[test]
    fn guarded_update_refuses_a_stale_epoch() {
        let (_dir, store) = store();
        store.put(&User::new(1, "ana@bank.test", Role::Employee)).unwrap();
        assert_eq!(store.link_epoch(7).unwrap(), 0);

        let promote = |user: &mut User| {
            user.role = Role::Manager;
            Ok(())
        };
        assert!(store.update_guarded::<User, ()>(1, 7, 0, promote).unwrap().is_some());
        assert_eq!(store.link_epoch(7).unwrap(), 1);

        let demote = |user: &mut User| {
            user.role = Role::Employee;
            Ok(())
        };
        assert!(store.update_guarded::<User, ()>(1, 7, 0, demote).unwrap().is_none());
        assert_eq!(store.fetch::<User>(1).unwrap().role, Role::Manager);
        assert_eq!(store.link_epoch(7).unwrap(), 1);
    }

    #[test]
    fn sla_overrides_are_optional() {
        let (_dir, store) = store();
        assert_eq!(store.sla_days(SlaStage::Review).unwrap(), None);
        store.set_sla_days(SlaStage::Review, 3).unwrap();
        assert_eq!(store.sla_days(SlaStage::Review).unwrap(), Some(3));
    }
}
