use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use validator::{Validate, ValidationErrors, ValidationErrorsKind};

/// Durable queue carrying one event per successful account creation.
pub const USER_REGISTRATION_QUEUE: &str = "user_registration";

/// Role chosen at sign-up. Absent on the wire means `Listener`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    #[default]
    Listener,
    Artist,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct FullName {
    #[serde(rename = "firstname", alias = "firstName")]
    #[validate(length(min = 1))]
    pub first_name: String,
    #[serde(rename = "lastname", alias = "lastName")]
    #[validate(length(min = 1))]
    pub last_name: String,
}

impl FullName {
    pub fn new(first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        Self {
            first_name: first_name.into(),
            last_name: last_name.into(),
        }
    }

    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// Wire payload published on [`USER_REGISTRATION_QUEUE`].
///
/// ```json
/// { "id": "…", "email": "a@b.com",
///   "fullname": { "firstname": "Ann", "lastname": "Lee" },
///   "role": "artist", "publishedAt": "2024-01-01T00:00:00Z" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct RegistrationEvent {
    #[serde(rename = "id")]
    #[validate(length(min = 1))]
    pub account_id: String,
    #[validate(email)]
    pub email: String,
    #[validate]
    pub fullname: FullName,
    #[serde(default)]
    pub role: Role,
    #[serde(
        rename = "publishedAt",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedEventError {
    #[error("payload is not a registration event: {0}")]
    Undecodable(String),
    #[error("registration event field `{0}` is missing or invalid")]
    InvalidField(String),
}

impl RegistrationEvent {
    pub fn new(
        account_id: impl Into<String>,
        email: impl Into<String>,
        fullname: FullName,
        role: Role,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            email: email.into(),
            fullname,
            role,
            published_at: None,
        }
    }

    pub fn stamped(mut self, at: DateTime<Utc>) -> Self {
        self.published_at = Some(at);
        self
    }

    /// Rejects events with an empty or malformed required field.
    pub fn ensure_valid(&self) -> Result<(), MalformedEventError> {
        self.validate()
            .map_err(|errors| MalformedEventError::InvalidField(first_invalid_field(&errors)))
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decodes and validates a queue payload.
    pub fn from_payload(payload: &[u8]) -> Result<Self, MalformedEventError> {
        let event: RegistrationEvent = serde_json::from_slice(payload)
            .map_err(|e| MalformedEventError::Undecodable(e.to_string()))?;
        event.ensure_valid()?;
        Ok(event)
    }
}

fn first_invalid_field(errors: &ValidationErrors) -> String {
    let mut fields: Vec<_> = errors.errors().iter().collect();
    fields.sort_by_key(|(name, _)| **name);

    match fields.first() {
        Some((name, ValidationErrorsKind::Struct(nested))) => {
            format!("{}.{}", name, first_invalid_field(nested))
        }
        Some((name, _)) => name.to_string(),
        None => "unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::str::FromStr;

    fn ann() -> RegistrationEvent {
        RegistrationEvent::new(
            "65f0c2a1",
            "a@b.com",
            FullName::new("Ann", "Lee"),
            Role::Artist,
        )
    }

    #[test]
    fn test_round_trip_preserves_every_field() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        let event = ann().stamped(at);

        let decoded = RegistrationEvent::from_payload(&event.to_payload().unwrap()).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_wire_shape_uses_lowercase_name_keys() {
        let value: serde_json::Value = serde_json::to_value(ann()).unwrap();
        assert_eq!(value["id"], "65f0c2a1");
        assert_eq!(value["fullname"]["firstname"], "Ann");
        assert_eq!(value["fullname"]["lastname"], "Lee");
        assert_eq!(value["role"], "artist");
        assert!(value.get("publishedAt").is_none());
    }

    #[test]
    fn test_missing_role_defaults_to_listener() {
        let payload = br#"{"id":"1","email":"a@b.com","fullname":{"firstname":"Ann","lastname":"Lee"}}"#;
        let event = RegistrationEvent::from_payload(payload).unwrap();
        assert_eq!(event.role, Role::Listener);
    }

    #[test]
    fn test_camel_case_name_keys_are_accepted() {
        let payload = br#"{"id":"1","email":"a@b.com","fullname":{"firstName":"Ann","lastName":"Lee"},"role":"artist"}"#;
        let event = RegistrationEvent::from_payload(payload).unwrap();
        assert_eq!(event.fullname.display_name(), "Ann Lee");
    }

    #[test]
    fn test_missing_email_is_undecodable() {
        let payload = br#"{"id":"1","fullname":{"firstname":"Ann","lastname":"Lee"}}"#;
        assert!(matches!(
            RegistrationEvent::from_payload(payload),
            Err(MalformedEventError::Undecodable(_))
        ));
    }

    #[test]
    fn test_unknown_role_is_rejected() {
        let payload = br#"{"id":"1","email":"a@b.com","fullname":{"firstname":"A","lastname":"L"},"role":"admin"}"#;
        assert!(RegistrationEvent::from_payload(payload).is_err());
    }

    #[test]
    fn test_empty_last_name_names_the_nested_field() {
        let mut event = ann();
        event.fullname.last_name.clear();
        match event.ensure_valid() {
            Err(MalformedEventError::InvalidField(field)) => {
                assert!(field.starts_with("fullname."), "got {field}")
            }
            other => panic!("expected invalid field, got {other:?}"),
        }
    }

    #[test]
    fn test_bad_email_is_invalid() {
        let mut event = ann();
        event.email = "not-an-address".to_string();
        assert_eq!(
            event.ensure_valid(),
            Err(MalformedEventError::InvalidField("email".to_string()))
        );
    }

    #[test]
    fn test_role_parses_and_displays_lowercase() {
        assert_eq!(Role::from_str("artist").unwrap(), Role::Artist);
        assert_eq!(Role::Listener.to_string(), "listener");
    }
}
