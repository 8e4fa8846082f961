use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::{Credentials, Mechanism},
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use serde::Deserialize;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

// Refresh this long before the provider's expiry.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("invalid recipient address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("failed to build message: {0}")]
    Message(String),
    #[error("mail authentication failed: {0}")]
    Authentication(String),
    #[error("mail transport unavailable: {0}")]
    Transport(String),
    #[error("mail server rejected message: {0}")]
    Rejected(String),
}

impl DeliveryError {
    /// Only a malformed recipient is known to fail identically on every attempt.
    pub fn is_permanent(&self) -> bool {
        matches!(self, DeliveryError::InvalidAddress { .. })
    }
}

pub fn parse_recipient(address: &str) -> Result<Mailbox, DeliveryError> {
    address
        .parse::<Mailbox>()
        .map_err(|e| DeliveryError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EmailDispatcher: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), DeliveryError>;

    /// Opens and authenticates a session without sending anything.
    async fn verify(&self) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpAuth {
    OAuth2 {
        client_id: String,
        client_secret: String,
        refresh_token: String,
        token_url: String,
    },
    Password(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub sender_name: String,
    pub auth: SmtpAuth,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

/// Exchanges an OAuth refresh token for short-lived access tokens.
pub struct OAuthTokenProvider {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    refresh_token: String,
    cached: Mutex<Option<CachedToken>>,
}

impl OAuthTokenProvider {
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            refresh_token: refresh_token.into(),
            cached: Mutex::new(None),
        }
    }

    pub async fn access_token(&self) -> Result<String, DeliveryError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() + TOKEN_EXPIRY_MARGIN < token.expires_at {
                return Ok(token.access_token.clone());
            }
        }

        debug!("Refreshing mail access token");
        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", self.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(format!("token endpoint: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::Authentication(format!(
                "token refresh returned {}: {}",
                status, body
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| DeliveryError::Authentication(format!("bad token response: {}", e)))?;

        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(3600));
        *cached = Some(CachedToken {
            access_token: token.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }
}

type SmtpTransport = AsyncSmtpTransport<Tokio1Executor>;

/// Sends through an SMTP relay with STARTTLS. The pooled transport is
/// reused until the access token it was built with changes.
pub struct SmtpEmailDispatcher {
    settings: SmtpSettings,
    sender: Mailbox,
    tokens: Option<OAuthTokenProvider>,
    transport: Mutex<Option<(String, SmtpTransport)>>,
}

impl SmtpEmailDispatcher {
    pub fn new(settings: SmtpSettings) -> Result<Self, DeliveryError> {
        let address = settings
            .user
            .parse()
            .map_err(|e: lettre::address::AddressError| {
                DeliveryError::Message(format!("invalid sender '{}': {}", settings.user, e))
            })?;
        let sender = Mailbox::new(Some(settings.sender_name.clone()), address);

        let tokens = match &settings.auth {
            SmtpAuth::OAuth2 {
                client_id,
                client_secret,
                refresh_token,
                token_url,
            } => Some(OAuthTokenProvider::new(
                token_url.as_str(),
                client_id.as_str(),
                client_secret.as_str(),
                refresh_token.as_str(),
            )),
            SmtpAuth::Password(_) => None,
        };

        Ok(Self {
            settings,
            sender,
            tokens,
            transport: Mutex::new(None),
        })
    }

    async fn secret(&self) -> Result<String, DeliveryError> {
        match (&self.tokens, &self.settings.auth) {
            (Some(tokens), _) => tokens.access_token().await,
            (None, SmtpAuth::Password(password)) => Ok(password.clone()),
            (None, SmtpAuth::OAuth2 { .. }) => Err(DeliveryError::Authentication(
                "oauth credentials without token provider".to_string(),
            )),
        }
    }

    fn build_transport(&self, secret: &str) -> Result<SmtpTransport, DeliveryError> {
        let mechanism = match self.settings.auth {
            SmtpAuth::OAuth2 { .. } => Mechanism::Xoauth2,
            SmtpAuth::Password(_) => Mechanism::Login,
        };
        let transport = SmtpTransport::starttls_relay(&self.settings.host)
            .map_err(|e| DeliveryError::Transport(e.to_string()))?
            .port(self.settings.port)
            .credentials(Credentials::new(
                self.settings.user.clone(),
                secret.to_string(),
            ))
            .authentication(vec![mechanism])
            .build();
        Ok(transport)
    }

    async fn transport(&self) -> Result<SmtpTransport, DeliveryError> {
        let secret = self.secret().await?;
        let mut current = self.transport.lock().await;
        if let Some((built_with, transport)) = current.as_ref() {
            if *built_with == secret {
                return Ok(transport.clone());
            }
        }
        let transport = self.build_transport(&secret)?;
        *current = Some((secret, transport.clone()));
        Ok(transport)
    }
}

fn classify(error: lettre::transport::smtp::Error) -> DeliveryError {
    let code = error.status().map(|c| c.to_string());
    match code.as_deref() {
        Some("530" | "534" | "535") => DeliveryError::Authentication(error.to_string()),
        Some(_) => DeliveryError::Rejected(error.to_string()),
        None => DeliveryError::Transport(error.to_string()),
    }
}

#[async_trait]
impl EmailDispatcher for SmtpEmailDispatcher {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), DeliveryError> {
        let recipient = parse_recipient(to)?;
        let message = Message::builder()
            .from(self.sender.clone())
            .to(recipient)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| DeliveryError::Message(e.to_string()))?;

        let transport = self.transport().await?;
        let response = transport.send(message).await.map_err(classify)?;
        debug!("SMTP accepted message for {}: {:?}", to, response.code());
        Ok(())
    }

    async fn verify(&self) -> Result<(), DeliveryError> {
        let transport = self.transport().await?;
        match transport.test_connection().await {
            Ok(true) => {
                info!(
                    "Mail transport ready at {}:{} as {}",
                    self.settings.host, self.settings.port, self.settings.user
                );
                Ok(())
            }
            Ok(false) => Err(DeliveryError::Transport(format!(
                "{}:{} did not accept the connection",
                self.settings.host, self.settings.port
            ))),
            Err(e) => Err(classify(e)),
        }
    }
}

/// Writes messages to the log instead of sending them.
#[derive(Debug, Default)]
pub struct LogEmailDispatcher;

#[async_trait]
impl EmailDispatcher for LogEmailDispatcher {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), DeliveryError> {
        parse_recipient(to)?;
        info!(to = %to, subject = %subject, "📧 {}", body);
        Ok(())
    }

    async fn verify(&self) -> Result<(), DeliveryError> {
        warn!("MAIL_TRANSPORT=log: welcome emails are logged, not sent");
        Ok(())
    }
}
