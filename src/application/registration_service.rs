use argon2::{
    password_hash::{rand_core::OsRng, PasswordHasher, SaltString},
    Argon2,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use validator::Validate;

use crate::domain::account::User;
use crate::domain::commands::{FederatedIdentity, RegisterUser};
use crate::domain::events::{FullName, Role};
use crate::infrastructure::publisher::{PublishError, RegistrationPublisher};
use crate::infrastructure::user_repository::{UserRepositoryError, UserRepositoryTrait};

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("An account with email '{0}' already exists")]
    EmailTaken(String),
    #[error("Password processing error: {0}")]
    PasswordHash(String),
    #[error("User data access error: {0}")]
    Repository(#[from] UserRepositoryError),
    #[error("Account could not be announced: {0}")]
    Publish(#[from] PublishError),
}

/// Creates accounts and announces each one on the registration queue.
pub struct RegistrationService {
    users: Arc<dyn UserRepositoryTrait>,
    publisher: Arc<dyn RegistrationPublisher>,
}

impl RegistrationService {
    pub fn new(
        users: Arc<dyn UserRepositoryTrait>,
        publisher: Arc<dyn RegistrationPublisher>,
    ) -> Self {
        Self { users, publisher }
    }

    pub async fn register(&self, command: RegisterUser) -> Result<User, RegistrationError> {
        command
            .validate()
            .map_err(|e| RegistrationError::Validation(e.to_string()))?;

        if self.users.find_by_email(&command.email).await?.is_some() {
            return Err(RegistrationError::EmailTaken(command.email));
        }

        let salt = SaltString::generate(&mut OsRng);
        let password_hash = Argon2::default()
            .hash_password(command.password.as_bytes(), &salt)
            .map_err(|e| RegistrationError::PasswordHash(e.to_string()))?
            .to_string();

        let user = User::new(
            command.email,
            FullName::new(command.fullname.firstname, command.fullname.lastname),
            command.role.unwrap_or_default(),
        )
        .with_password_hash(password_hash);

        self.persist_and_announce(user).await
    }

    /// Signs in an identity verified by an external provider, creating the
    /// account on first sight. Existing accounts are returned as they are
    /// and announce nothing.
    pub async fn register_federated(
        &self,
        identity: FederatedIdentity,
    ) -> Result<User, RegistrationError> {
        identity
            .validate()
            .map_err(|e| RegistrationError::Validation(e.to_string()))?;

        if let Some(user) = self.users.find_by_google_id(&identity.provider_id).await? {
            return Ok(user);
        }
        if let Some(user) = self.users.find_by_email(&identity.email).await? {
            info!(user_id = %user.id, "Federated sign-in matched existing account by email");
            return Ok(user);
        }

        let user = User::new(
            identity.email,
            FullName::new(identity.fullname.firstname, identity.fullname.lastname),
            Role::default(),
        )
        .with_google_id(identity.provider_id);

        self.persist_and_announce(user).await
    }

    async fn persist_and_announce(&self, user: User) -> Result<User, RegistrationError> {
        let user = self.users.create(user).await.map_err(|e| match e {
            UserRepositoryError::EmailExists(email) => RegistrationError::EmailTaken(email),
            other => RegistrationError::Repository(other),
        })?;

        match self.publisher.publish_registration(&user.registration_event()).await {
            Ok(message_id) => {
                info!(
                    account_id = %user.id,
                    correlation_id = %message_id,
                    "Registered account"
                );
                Ok(user)
            }
            Err(e) => {
                // No account may exist without its event; the client can retry.
                error!(account_id = %user.id, "Publishing registration failed: {}", e);
                if let Err(rollback) = self.users.delete(user.id).await {
                    warn!(account_id = %user.id, "Rollback failed: {}", rollback);
                }
                Err(RegistrationError::Publish(e))
            }
        }
    }
}
