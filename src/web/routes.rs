use crate::{
    application::RegistrationService,
    infrastructure::metrics::NotificationMetrics,
    web::handlers::*,
};
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub fn create_auth_router(service: Arc<RegistrationService>) -> Router {
    Router::new()
        .route("/api/auth/register", post(register))
        .route("/health", get(health_check))
        .with_state(service)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

pub fn create_notification_router(metrics: Arc<NotificationMetrics>) -> Router {
    Router::new()
        .route("/health", get(notification_health))
        .with_state(metrics)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::publisher::MockRegistrationPublisher;
    use crate::infrastructure::user_repository::InMemoryUserRepository;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_auth_health() {
        let service = Arc::new(RegistrationService::new(
            Arc::new(InMemoryUserRepository::new()),
            Arc::new(MockRegistrationPublisher::new()),
        ));
        let response = create_auth_router(service)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_notification_health_reports_metrics() {
        let metrics = Arc::new(NotificationMetrics::default());
        NotificationMetrics::incr(&metrics.emails_sent);

        let response = create_notification_router(metrics)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["metrics"]["emails_sent"], 1);
    }
}
