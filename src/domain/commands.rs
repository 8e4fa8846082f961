use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::domain::events::Role;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NameInput {
    #[validate(length(min = 1, message = "First name is required"))]
    pub firstname: String,
    #[validate(length(min = 1, message = "Last name is required"))]
    pub lastname: String,
}

/// Sign-up request as submitted by the registration form.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RegisterUser {
    #[validate(email(message = "Invalid email address"))]
    pub email: String,
    #[validate(length(min = 6, message = "Password must be at least 6 characters long"))]
    pub password: String,
    #[validate]
    pub fullname: NameInput,
    #[serde(default)]
    pub role: Option<Role>,
}

/// Identity already verified by an external provider (e.g. a Google profile).
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct FederatedIdentity {
    #[validate(length(min = 1))]
    pub provider_id: String,
    #[validate(email)]
    pub email: String,
    #[validate]
    pub fullname: NameInput,
}
