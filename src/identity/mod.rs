/// Identity module
///
/// The session guard and the auth routes reach user accounts only through the
/// `IdentityStore` trait. Two stores are provided: an in-memory one for tests
/// and local runs, and a Postgres one for deployments.

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::AppError;

pub use memory::MemoryIdentityStore;
pub use postgres::PgIdentityStore;

pub const DEFAULT_ROLE: &str = "User";

/// A resolved user, attached to the request once the session guard admits it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: Uuid,
    pub username: String,
    pub role: String,
    pub is_active: bool,
}

/// An identity together with its stored password hash
#[derive(Debug, Clone)]
pub struct Credentials {
    pub identity: Identity,
    pub password_hash: String,
}

#[derive(Debug, Clone)]
pub struct NewIdentity {
    pub username: String,
    pub password_hash: String,
    pub role: String,
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Look up an account by id, active or not
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Identity>, AppError>;

    async fn find_credentials(&self, username: &str) -> Result<Option<Credentials>, AppError>;

    /// Fails with a unique-constraint error when the username is taken
    async fn create(&self, new: NewIdentity) -> Result<Identity, AppError>;

    async fn update_password(&self, id: Uuid, password_hash: &str) -> Result<(), AppError>;

    async fn touch_last_login(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), AppError>;
}

pub type DynIdentityStore = Arc<dyn IdentityStore>;
