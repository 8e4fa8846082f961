pub mod notification_handler;
pub mod registration_service;

pub use notification_handler::{HandlerError, NotificationHandler, WelcomeMessage};
pub use registration_service::{RegistrationError, RegistrationService};
