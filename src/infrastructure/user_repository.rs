use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::domain::account::User;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UserRepositoryError {
    #[error("User not found for ID: {0}")]
    NotFoundById(Uuid),
    #[error("Email '{0}' already exists")]
    EmailExists(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserRepositoryTrait: Send + Sync {
    /// Fails with `EmailExists` if an account already uses the email.
    async fn create(&self, user: User) -> Result<User, UserRepositoryError>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, UserRepositoryError>;
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, UserRepositoryError>;
    async fn find_by_google_id(&self, google_id: &str) -> Result<Option<User>, UserRepositoryError>;
    async fn delete(&self, id: Uuid) -> Result<u64, UserRepositoryError>;
}

/// Accounts keyed by id, with a unique email index.
#[derive(Default)]
pub struct InMemoryUserRepository {
    users: DashMap<Uuid, User>,
    emails: DashMap<String, Uuid>,
}

impl InMemoryUserRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

fn email_key(email: &str) -> String {
    email.trim().to_lowercase()
}

#[async_trait]
impl UserRepositoryTrait for InMemoryUserRepository {
    async fn create(&self, user: User) -> Result<User, UserRepositoryError> {
        // The entry guard keeps check-and-insert atomic per email.
        match self.emails.entry(email_key(&user.email)) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(UserRepositoryError::EmailExists(user.email.clone()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(user.id);
                self.users.insert(user.id, user.clone());
                debug!("Stored user {}", user.id);
                Ok(user)
            }
        }
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, UserRepositoryError> {
        Ok(self.users.get(&id).map(|u| u.value().clone()))
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, UserRepositoryError> {
        let id = self.emails.get(&email_key(email)).map(|id| *id.value());
        Ok(id.and_then(|id| self.users.get(&id).map(|u| u.value().clone())))
    }

    async fn find_by_google_id(
        &self,
        google_id: &str,
    ) -> Result<Option<User>, UserRepositoryError> {
        Ok(self
            .users
            .iter()
            .find(|u| u.google_id.as_deref() == Some(google_id))
            .map(|u| u.value().clone()))
    }

    async fn delete(&self, id: Uuid) -> Result<u64, UserRepositoryError> {
        match self.users.remove(&id) {
            Some((_, user)) => {
                self.emails.remove(&email_key(&user.email));
                Ok(1)
            }
            None => Ok(0),
        }
    }
}
