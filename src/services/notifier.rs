//! Hold-ready notifications

use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox, Message, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    SmtpTransport, Transport,
};
use std::str::FromStr;

use crate::{
    config::EmailConfig,
    error::{AppError, AppResult},
    services::ledger::HoldPromotion,
};

/// Tells a patron their hold can now be borrowed
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HoldNotifier: Send + Sync {
    async fn hold_ready(&self, promotion: &HoldPromotion) -> AppResult<()>;
}

/// Drops notifications
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl HoldNotifier for NoopNotifier {
    async fn hold_ready(&self, promotion: &HoldPromotion) -> AppResult<()> {
        tracing::debug!("Hold {} ready, notifications disabled", promotion.hold_id);
        Ok(())
    }
}

/// SMTP notifier
#[derive(Clone)]
pub struct EmailNotifier {
    config: EmailConfig,
}

impl EmailNotifier {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }

    fn build_message(&self, to: &str, promotion: &HoldPromotion) -> AppResult<Message> {
        let from_name = self.config.smtp_from_name.as_deref().unwrap_or("Library");
        let from_mailbox = Mailbox::from_str(&format!("{} <{}>", from_name, self.config.smtp_from))
            .map_err(|e| AppError::Internal(format!("Invalid from address: {}", e)))?;
        let to_mailbox = Mailbox::from_str(to)
            .map_err(|e| AppError::Validation(format!("Invalid to address: {}", e)))?;

        let deadline = promotion
            .end
            .map(|end| end.format("%Y-%m-%d %H:%M UTC").to_string())
            .unwrap_or_else(|| "soon".to_string());
        let body = format!(
            r#"
A title you placed on hold is now available: {title}

Borrow it before {deadline}, after which it will go to the next patron in line.
"#,
            title = promotion.pool_identifier,
            deadline = deadline
        );

        Message::builder()
            .from(from_mailbox)
            .to(to_mailbox)
            .subject("Your hold is ready")
            .multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(body.clone()),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(format!(
                                r#"<html><body><pre>{}</pre></body></html>"#,
                                body.replace('\n', "<br>")
                            )),
                    ),
            )
            .map_err(|e| AppError::Internal(format!("Failed to build email: {}", e)))
    }

    fn transport(&self) -> AppResult<SmtpTransport> {
        let builder = if self.config.smtp_use_tls {
            SmtpTransport::starttls_relay(&self.config.smtp_host)
                .map_err(|e| AppError::Internal(format!("Failed to create SMTP transport: {}", e)))?
        } else {
            SmtpTransport::builder_dangerous(&self.config.smtp_host)
        }
        .port(self.config.smtp_port);

        let builder = match (&self.config.smtp_username, &self.config.smtp_password) {
            (Some(username), Some(password)) => {
                builder.credentials(Credentials::new(username.clone(), password.clone()))
            }
            _ => builder,
        };

        Ok(builder.build())
    }
}

#[async_trait]
impl HoldNotifier for EmailNotifier {
    async fn hold_ready(&self, promotion: &HoldPromotion) -> AppResult<()> {
        let Some(to) = promotion.notify_email.as_deref() else {
            return Ok(());
        };
        let message = self.build_message(to, promotion)?;
        let mailer = self.transport()?;

        // SmtpTransport blocks
        tokio::task::spawn_blocking(move || mailer.send(&message))
            .await
            .map_err(|e| AppError::Internal(format!("Email task failed: {}", e)))?
            .map_err(|e| AppError::Internal(format!("Failed to send email: {}", e)))?;

        tracing::info!("Sent hold-ready email for hold {}", promotion.hold_id);
        Ok(())
    }
}
