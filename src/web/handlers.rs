use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

use crate::application::{RegistrationError, RegistrationService};
use crate::domain::commands::RegisterUser;
use crate::domain::events::{FullName, Role};
use crate::infrastructure::metrics::{MetricsSnapshot, NotificationMetrics};

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub id: Uuid,
    pub email: String,
    pub fullname: FullName,
    pub role: Role,
}

impl IntoResponse for RegistrationError {
    fn into_response(self) -> Response {
        let status = match &self {
            RegistrationError::Validation(_) | RegistrationError::EmailTaken(_) => {
                warn!("Registration rejected: {}", self);
                StatusCode::BAD_REQUEST
            }
            RegistrationError::PasswordHash(_)
            | RegistrationError::Repository(_)
            | RegistrationError::Publish(_) => {
                error!("Registration failed: {}", self);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

pub async fn register(
    State(service): State<Arc<RegistrationService>>,
    payload: Result<Json<RegisterUser>, JsonRejection>,
) -> Result<impl IntoResponse, RegistrationError> {
    let Json(payload) =
        payload.map_err(|rejection| RegistrationError::Validation(rejection.body_text()))?;
    let user = service.register(payload).await?;
    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            id: user.id,
            email: user.email,
            fullname: user.fullname,
            role: user.role,
        }),
    ))
}

pub async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Debug, Serialize)]
pub struct NotificationHealth {
    pub status: &'static str,
    pub metrics: MetricsSnapshot,
}

pub async fn notification_health(
    State(metrics): State<Arc<NotificationMetrics>>,
) -> Json<NotificationHealth> {
    Json(NotificationHealth {
        status: "ok",
        metrics: metrics.snapshot(),
    })
}
