use std::sync::Arc;

use async_trait::async_trait;
use lettre::{
    message::{Mailbox, MultiPart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use metrics::counter;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use url::Url;

use stockflow_core::notification::NotificationDraft;
use stockflow_util::SmtpConfig;

/// A rendered message ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub to: String,
    pub to_name: Option<String>,
    pub subject: String,
    pub text_body: String,
    pub html_body: Option<String>,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: OutgoingEmail) -> Result<(), MailError>;
}

#[derive(Debug, Error)]
pub enum MailError {
    #[error("invalid address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("failed to build message: {0}")]
    Build(#[from] lettre::error::Error),
    #[error("smtp error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
    #[error("invalid link: {0}")]
    Link(#[from] url::ParseError),
}

/// Sends through an SMTP relay using lettre's tokio transport.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(config: &SmtpConfig) -> Result<Self, MailError> {
        let builder = if config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        };
        let mut builder = builder.port(config.port);
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }
        let from = Mailbox::new(Some(config.from_name.clone()), config.from_email.parse()?);
        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, email: OutgoingEmail) -> Result<(), MailError> {
        let to = Mailbox::new(email.to_name.clone(), email.to.parse()?);
        let builder = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(email.subject.clone());
        let message = match email.html_body {
            Some(html) => builder.multipart(MultiPart::alternative_plain_html(email.text_body, html))?,
            None => builder.body(email.text_body)?,
        };
        self.transport.send(message).await?;
        Ok(())
    }
}

/// Logs messages instead of sending them and keeps them for inspection.
#[derive(Clone, Default)]
pub struct LogMailer {
    outbox: Arc<Mutex<Vec<OutgoingEmail>>>,
}

impl LogMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<OutgoingEmail> {
        self.outbox.lock().await.clone()
    }
}

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: OutgoingEmail) -> Result<(), MailError> {
        info!(
            stage = "notification",
            to = %email.to,
            subject = %email.subject,
            "email captured by log mailer"
        );
        self.outbox.lock().await.push(email);
        Ok(())
    }
}

pub fn build_mailer(config: &SmtpConfig) -> Result<Arc<dyn Mailer>, MailError> {
    if config.enabled {
        Ok(Arc::new(SmtpMailer::new(config)?))
    } else {
        Ok(Arc::new(LogMailer::new()))
    }
}

/// Delivers `email`, logging and counting failures instead of returning them.
pub async fn send_logged(mailer: &dyn Mailer, email: OutgoingEmail, purpose: &'static str) -> bool {
    let to = email.to.clone();
    match mailer.send(email).await {
        Ok(()) => true,
        Err(err) => {
            counter!("mail_send_failures_total", "purpose" => purpose).increment(1);
            warn!(stage = "notification", %purpose, %to, error = %err, "failed to send email");
            false
        }
    }
}

fn link(base: &str, path: &str, params: &[(&str, &str)]) -> Result<Url, MailError> {
    let raw = format!("{}/{}", base.trim_end_matches('/'), path);
    if params.is_empty() {
        return Ok(Url::parse(&raw)?);
    }
    Ok(Url::parse_with_params(&raw, params)?)
}

pub fn verification_email(
    base: &str,
    to: &str,
    name: &str,
    token: &str,
) -> Result<OutgoingEmail, MailError> {
    let url = link(base, "verify-email", &[("token", token), ("email", to)])?;
    Ok(OutgoingEmail {
        to: to.to_string(),
        to_name: Some(name.to_string()),
        subject: "Verify your StockFlow Pro email address".to_string(),
        text_body: format!(
            "Hi {name},\n\nConfirm your email address by opening the link below:\n\n{url}\n\n\
             The link expires in 24 hours. If you did not create an account you can ignore this message.\n"
        ),
        html_body: Some(format!(
            "<p>Hi {name},</p><p>Confirm your email address:</p>\
             <p><a href=\"{url}\">Verify email</a></p>\
             <p>The link expires in 24 hours.</p>"
        )),
    })
}

pub fn password_reset_email(
    base: &str,
    to: &str,
    name: &str,
    token: &str,
) -> Result<OutgoingEmail, MailError> {
    let url = link(base, "reset-password", &[("token", token), ("email", to)])?;
    Ok(OutgoingEmail {
        to: to.to_string(),
        to_name: Some(name.to_string()),
        subject: "Reset your StockFlow Pro password".to_string(),
        text_body: format!(
            "Hi {name},\n\nA password reset was requested for your account. Choose a new password here:\n\n{url}\n\n\
             If you did not request this you can ignore this message.\n"
        ),
        html_body: Some(format!(
            "<p>Hi {name},</p><p>A password reset was requested for your account.</p>\
             <p><a href=\"{url}\">Choose a new password</a></p>"
        )),
    })
}

pub fn notification_email(
    base: &str,
    to: &str,
    name: &str,
    notification: &NotificationDraft,
) -> Result<OutgoingEmail, MailError> {
    let mut text_body = format!("Hi {name},\n\n{}\n", notification.message);
    let mut html_body = format!("<p>Hi {name},</p><p>{}</p>", notification.message);
    if let Some(action) = notification.action_url.as_deref() {
        let url = link(base, action.trim_start_matches('/'), &[])?;
        text_body.push_str(&format!("\n{url}\n"));
        html_body.push_str(&format!("<p><a href=\"{url}\">Open in StockFlow Pro</a></p>"));
    }
    Ok(OutgoingEmail {
        to: to.to_string(),
        to_name: Some(name.to_string()),
        subject: notification.title.clone(),
        text_body,
        html_body: Some(html_body),
    })
}
