use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{Credentials, Identity, IdentityStore, NewIdentity};
use crate::error::{AppError, DatabaseError};

#[derive(Debug, Clone)]
struct Record {
    identity: Identity,
    password_hash: String,
    last_login_at: Option<DateTime<Utc>>,
}

/// Process-local identity store
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    records: RwLock<HashMap<Uuid, Record>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable an account without touching its sessions
    pub fn set_active(&self, id: Uuid, is_active: bool) -> bool {
        let mut records = match self.records.write() {
            Ok(records) => records,
            Err(poisoned) => poisoned.into_inner(),
        };
        match records.get_mut(&id) {
            Some(record) => {
                record.identity.is_active = is_active;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: Uuid) -> bool {
        let mut records = match self.records.write() {
            Ok(records) => records,
            Err(poisoned) => poisoned.into_inner(),
        };
        records.remove(&id).is_some()
    }

    pub fn last_login(&self, id: Uuid) -> Option<DateTime<Utc>> {
        let records = self.records.read().ok()?;
        records.get(&id).and_then(|record| record.last_login_at)
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<Uuid, Record>>, AppError> {
        self.records
            .read()
            .map_err(|_| AppError::Internal("identity store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<Uuid, Record>>, AppError> {
        self.records
            .write()
            .map_err(|_| AppError::Internal("identity store lock poisoned".to_string()))
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Identity>, AppError> {
        Ok(self.read()?.get(&id).map(|record| record.identity.clone()))
    }

    async fn find_credentials(&self, username: &str) -> Result<Option<Credentials>, AppError> {
        Ok(self
            .read()?
            .values()
            .find(|record| record.identity.username == username)
            .map(|record| Credentials {
                identity: record.identity.clone(),
                password_hash: record.password_hash.clone(),
            }))
    }

    async fn create(&self, new: NewIdentity) -> Result<Identity, AppError> {
        let mut records = self.write()?;
        if records
            .values()
            .any(|record| record.identity.username == new.username)
        {
            return Err(AppError::Database(DatabaseError::UniqueConstraintViolation(
                "Username already exists".to_string(),
            )));
        }

        let identity = Identity {
            id: Uuid::new_v4(),
            username: new.username,
            role: new.role,
            is_active: true,
        };
        records.insert(
            identity.id,
            Record {
                identity: identity.clone(),
                password_hash: new.password_hash,
                last_login_at: None,
            },
        );
        Ok(identity)
    }

    async fn update_password(&self, id: Uuid, password_hash: &str) -> Result<(), AppError> {
        let mut records = self.write()?;
        let record = records
            .get_mut(&id)
            .ok_or_else(|| AppError::Database(DatabaseError::NotFound("User account".to_string())))?;
        record.password_hash = password_hash.to_string();
        Ok(())
    }

    async fn touch_last_login(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), AppError> {
        if let Some(record) = self.write()?.get_mut(&id) {
            record.last_login_at = Some(at);
        }
        Ok(())
    }
}
