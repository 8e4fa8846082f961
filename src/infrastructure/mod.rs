pub mod broker_abstraction;
pub mod broker_connection;
pub mod config;
pub mod dead_letter;
pub mod email_dispatcher;
pub mod in_memory_broker;
pub mod kafka_abstraction;
pub mod logging;
pub mod metrics;
pub mod publisher;
pub mod shutdown;
pub mod subscriber;
pub mod user_repository;

pub use broker_abstraction::{BrokerChannel, BrokerError, Delivery, MessageProperties, QueueSpec};
pub use broker_connection::{BrokerConnection, BrokerSettings, ConnectionError, ConnectionState};
pub use dead_letter::{DeadLetterQueue, DeadLetterRecord, RedeliveryPolicy};
pub use email_dispatcher::{DeliveryError, EmailDispatcher, LogEmailDispatcher, SmtpEmailDispatcher};
pub use in_memory_broker::InMemoryBroker;
pub use kafka_abstraction::{KafkaChannel, KafkaConfig};
pub use metrics::NotificationMetrics;
pub use publisher::{PublishError, Publisher, RegistrationPublisher};
pub use subscriber::{SubscribeError, Subscriber, SubscriberConfig, SubscriptionHandle};
pub use user_repository::{InMemoryUserRepository, UserRepositoryTrait};
