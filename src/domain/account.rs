use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::events::{FullName, RegistrationEvent, Role};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub fullname: FullName,
    pub role: Role,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub google_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(email: String, fullname: FullName, role: Role) -> Self {
        User {
            id: Uuid::new_v4(),
            email,
            fullname,
            role,
            password_hash: None,
            google_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_password_hash(mut self, hash: String) -> Self {
        self.password_hash = Some(hash);
        self
    }

    pub fn with_google_id(mut self, google_id: String) -> Self {
        self.google_id = Some(google_id);
        self
    }

    /// The event announcing this account to downstream services.
    pub fn registration_event(&self) -> RegistrationEvent {
        RegistrationEvent::new(
            self.id.to_string(),
            self.email.clone(),
            self.fullname.clone(),
            self.role,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_event_carries_account_fields() {
        let user = User::new(
            "a@b.com".to_string(),
            FullName::new("Ann", "Lee"),
            Role::Artist,
        );
        let event = user.registration_event();

        assert_eq!(event.account_id, user.id.to_string());
        assert_eq!(event.email, "a@b.com");
        assert_eq!(event.role, Role::Artist);
        assert!(event.published_at.is_none());
        assert!(event.ensure_valid().is_ok());
    }

    #[test]
    fn test_password_hash_is_never_serialized() {
        let user = User::new("a@b.com".to_string(), FullName::new("A", "L"), Role::Listener)
            .with_password_hash("secret-hash".to_string());
        let json = serde_json::to_string(&user).unwrap();
        assert!(!json.contains("secret-hash"));
    }
}
