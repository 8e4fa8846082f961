pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod web;

// Re-export commonly used types
pub use application::{NotificationHandler, RegistrationService};
pub use domain::{RegistrationEvent, Role, USER_REGISTRATION_QUEUE};
pub use infrastructure::{
    BrokerConnection, ConnectionError, Publisher, Subscriber, SubscriberConfig,
};
