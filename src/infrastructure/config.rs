//! Typed configuration read from environment variables (optionally loaded
//! from a `.env` file by the binaries).

use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::infrastructure::broker_connection::BrokerSettings;
use crate::infrastructure::dead_letter::RedeliveryPolicy;
use crate::infrastructure::email_dispatcher::{SmtpAuth, SmtpSettings, GOOGLE_TOKEN_URL};
use crate::infrastructure::logging::LoggingConfig;
use crate::infrastructure::subscriber::SubscriberConfig;

pub const AUTH_SERVICE_PORT: u16 = 3000;
pub const NOTIFICATION_SERVICE_PORT: u16 = 3001;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value '{value}' for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Reads variables through `lookup`, so tests need not touch the process environment.
struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn get(&self, var: &str) -> Option<String> {
        (self.0)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn require(&self, var: &'static str) -> Result<String, ConfigError> {
        self.get(var).ok_or(ConfigError::Missing(var))
    }

    fn parse<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(var) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                var,
                reason: e.to_string(),
                value,
            }),
        }
    }

    fn millis(&self, var: &'static str, default: u64) -> Result<Duration, ConfigError> {
        self.parse(var, default).map(Duration::from_millis)
    }
}

fn process_env(var: &str) -> Option<String> {
    std::env::var(var).ok()
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub uri: String,
    pub settings: BrokerSettings,
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(process_env)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(lookup);
        let uri = env
            .get("BROKER_URI")
            .or_else(|| env.get("RABBITMQ_URI"))
            .ok_or(ConfigError::Missing("BROKER_URI"))?;
        let defaults = BrokerSettings::default();

        Ok(Self {
            uri,
            settings: BrokerSettings {
                connect_timeout: env.millis("BROKER_CONNECT_TIMEOUT_MS", 5000)?,
                group_id: env.get("KAFKA_GROUP_ID").unwrap_or(defaults.group_id),
                client_id: env.get("KAFKA_CLIENT_ID").unwrap_or(defaults.client_id),
                producer_acks: env
                    .get("KAFKA_PRODUCER_ACKS")
                    .unwrap_or(defaults.producer_acks),
            },
        })
    }
}

pub fn subscriber_config_from_env() -> Result<SubscriberConfig, ConfigError> {
    subscriber_config_from_lookup(process_env)
}

pub fn subscriber_config_from_lookup(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<SubscriberConfig, ConfigError> {
    let env = Env(lookup);
    let workers: usize = env.parse("NOTIFICATION_WORKERS", 1)?;
    if workers == 0 {
        return Err(ConfigError::Invalid {
            var: "NOTIFICATION_WORKERS",
            value: "0".to_string(),
            reason: "at least one worker is required".to_string(),
        });
    }

    Ok(SubscriberConfig {
        workers,
        policy: RedeliveryPolicy {
            max_deliveries: env.parse("NOTIFICATION_MAX_DELIVERIES", 5)?,
            backoff_base: env.millis("NOTIFICATION_RETRY_BACKOFF_MS", 500)?,
            backoff_max: env.millis("NOTIFICATION_RETRY_BACKOFF_MAX_MS", 30_000)?,
        },
        ..Default::default()
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailTransport {
    Smtp(SmtpSettings),
    Log,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailConfig {
    pub app_name: String,
    pub transport: MailTransport,
}

impl MailConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(process_env)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(lookup);
        let app_name = env.get("APP_NAME").unwrap_or_else(|| "Sangeet".to_string());

        let transport = match env.get("MAIL_TRANSPORT").as_deref() {
            None | Some("smtp") => {
                let oauth = (
                    env.get("CLIENT_ID"),
                    env.get("CLIENT_SECRET"),
                    env.get("REFRESH_TOKEN"),
                );
                let auth = match oauth {
                    (Some(client_id), Some(client_secret), Some(refresh_token)) => {
                        SmtpAuth::OAuth2 {
                            client_id,
                            client_secret,
                            refresh_token,
                            token_url: env
                                .get("OAUTH_TOKEN_URL")
                                .unwrap_or_else(|| GOOGLE_TOKEN_URL.to_string()),
                        }
                    }
                    _ => SmtpAuth::Password(env.require("EMAIL_PASSWORD")?),
                };
                MailTransport::Smtp(SmtpSettings {
                    host: env
                        .get("SMTP_HOST")
                        .unwrap_or_else(|| "smtp.gmail.com".to_string()),
                    port: env.parse("SMTP_PORT", 587)?,
                    user: env.require("EMAIL_USER")?,
                    sender_name: app_name.clone(),
                    auth,
                })
            }
            Some("log") => MailTransport::Log,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    var: "MAIL_TRANSPORT",
                    value: other.to_string(),
                    reason: "expected 'smtp' or 'log'".to_string(),
                })
            }
        };

        Ok(Self {
            app_name,
            transport,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub port: u16,
    pub logging: LoggingConfig,
}

impl ServiceConfig {
    pub fn from_env(default_port: u16) -> Result<Self, ConfigError> {
        Self::from_lookup(default_port, process_env)
    }

    pub fn from_lookup(
        default_port: u16,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let env = Env(lookup);
        let defaults = LoggingConfig::default();
        Ok(Self {
            port: env.parse("PORT", default_port)?,
            logging: LoggingConfig {
                log_dir: env.get("LOG_DIR").unwrap_or(defaults.log_dir),
                enable_file: env.parse("LOG_TO_FILE", defaults.enable_file)?,
                ..defaults
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_broker_uri_falls_back_to_rabbitmq_variable() {
        let config =
            BrokerConfig::from_lookup(vars(&[("RABBITMQ_URI", "memory://local")])).unwrap();
        assert_eq!(config.uri, "memory://local");
        assert_eq!(config.settings.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.settings.producer_acks, "all");
    }

    #[test]
    fn test_missing_broker_uri_is_an_error() {
        assert_eq!(
            BrokerConfig::from_lookup(vars(&[])).unwrap_err(),
            ConfigError::Missing("BROKER_URI")
        );
    }

    #[test]
    fn test_subscriber_defaults_and_overrides() {
        let defaults = subscriber_config_from_lookup(vars(&[])).unwrap();
        assert_eq!(defaults.workers, 1);
        assert_eq!(defaults.policy, RedeliveryPolicy::default());

        let tuned = subscriber_config_from_lookup(vars(&[
            ("NOTIFICATION_WORKERS", "4"),
            ("NOTIFICATION_MAX_DELIVERIES", "0"),
        ]))
        .unwrap();
        assert_eq!(tuned.workers, 4);
        assert_eq!(tuned.policy.max_deliveries, 0);
    }

    #[test]
    fn test_invalid_number_names_the_variable() {
        let err =
            subscriber_config_from_lookup(vars(&[("NOTIFICATION_WORKERS", "many")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "NOTIFICATION_WORKERS", .. }));
        assert!(subscriber_config_from_lookup(vars(&[("NOTIFICATION_WORKERS", "0")])).is_err());
    }

    #[test]
    fn test_oauth_credentials_select_xoauth2() {
        let config = MailConfig::from_lookup(vars(&[
            ("EMAIL_USER", "noreply@sangeet.app"),
            ("CLIENT_ID", "id"),
            ("CLIENT_SECRET", "secret"),
            ("REFRESH_TOKEN", "refresh"),
        ]))
        .unwrap();
        let MailTransport::Smtp(smtp) = config.transport else {
            panic!("expected smtp transport");
        };
        assert_eq!(smtp.host, "smtp.gmail.com");
        assert_eq!(smtp.port, 587);
        assert_eq!(smtp.sender_name, "Sangeet");
        assert!(matches!(
            smtp.auth,
            SmtpAuth::OAuth2 { ref token_url, .. } if token_url == GOOGLE_TOKEN_URL
        ));
    }

    #[test]
    fn test_password_is_required_without_oauth() {
        assert_eq!(
            MailConfig::from_lookup(vars(&[("EMAIL_USER", "a@b.com")])).unwrap_err(),
            ConfigError::Missing("EMAIL_PASSWORD")
        );
    }

    #[test]
    fn test_log_transport_needs_no_credentials() {
        let config =
            MailConfig::from_lookup(vars(&[("MAIL_TRANSPORT", "log"), ("APP_NAME", "Tunes")]))
                .unwrap();
        assert_eq!(config.transport, MailTransport::Log);
        assert_eq!(config.app_name, "Tunes");
    }

    #[test]
    fn test_service_port_and_logging() {
        let config = ServiceConfig::from_lookup(
            NOTIFICATION_SERVICE_PORT,
            vars(&[("LOG_TO_FILE", "true"), ("LOG_DIR", "/tmp/logs")]),
        )
        .unwrap();
        assert_eq!(config.port, 3001);
        assert!(config.logging.enable_file);
        assert_eq!(config.logging.log_dir, "/tmp/logs");
    }
}
