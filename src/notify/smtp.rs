//! SMTP delivery using lettre.

use async_trait::async_trait;
use chrono::Datelike;
use lettre::message::header::ContentType;
use lettre::message::{Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::info;

use super::{AdminAlerter, Mailer};
use crate::config::model::SmtpConfig;
use crate::error::NotificationError;
use crate::queue::DlqEntry;

const RESET_SUBJECT: &str = "Password Reset Request - FleetFlow";
const ALERT_SUBJECT: &str = "[FleetFlow] Email permanently failed";

/// Sends password reset emails and admin alerts through an SMTP relay.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    frontend_url: String,
    admin_email: Option<String>,
}

impl SmtpMailer {
    /// Creates a mailer for the given relay.
    pub fn new(
        config: &SmtpConfig,
        frontend_url: impl Into<String>,
        admin_email: Option<String>,
    ) -> Result<Self, NotificationError> {
        let credentials = config
            .username
            .as_ref()
            .map(|user| Credentials::new(user.clone(), config.password.clone().unwrap_or_default()));

        let transport = if config.use_tls {
            let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                .map_err(|e| NotificationError::SmtpFailed(e.to_string()))?
                .port(config.port);
            if let Some(credentials) = credentials {
                builder = builder.credentials(credentials);
            }
            builder.build()
        } else {
            // Local relays such as Mailpit
            let mut builder =
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
                    .port(config.port);
            if let Some(credentials) = credentials {
                builder = builder.credentials(credentials);
            }
            builder.build()
        };

        let from = parse_mailbox(&format!("{} <{}>", config.from_name, config.from_email))?;

        Ok(Self {
            transport,
            from,
            frontend_url: frontend_url.into(),
            admin_email,
        })
    }

    async fn send(
        &self,
        to: &str,
        subject: &str,
        text: String,
        html: String,
    ) -> Result<(), NotificationError> {
        let message = Message::builder()
            .from(self.from.clone())
            .to(parse_mailbox(to)?)
            .subject(subject)
            .multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(text),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(html),
                    ),
            )
            .map_err(|e| NotificationError::SmtpFailed(e.to_string()))?;

        self.transport
            .send(message)
            .await
            .map_err(|e| NotificationError::SmtpFailed(e.to_string()))?;

        Ok(())
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, NotificationError> {
    address
        .parse()
        .map_err(|e: lettre::address::AddressError| NotificationError::InvalidAddress {
            address: address.to_string(),
            message: e.to_string(),
        })
}

/// Builds the link embedded in reset emails, with the token query-encoded.
pub fn reset_url(frontend_url: &str, reset_token: &str) -> Result<String, NotificationError> {
    let base = format!("{}/reset-password", frontend_url.trim_end_matches('/'));
    reqwest::Url::parse_with_params(&base, &[("token", reset_token)])
        .map(String::from)
        .map_err(|e| NotificationError::InvalidLink {
            url: base,
            message: e.to_string(),
        })
}

fn reset_text(url: &str) -> String {
    format!(
        "Password Reset Request - FleetFlow\n\n\
         Hello,\n\n\
         We received a request to reset your password. Open the link below to choose a new one:\n\n\
         {url}\n\n\
         This link expires in 1 hour. If you did not request a reset, ignore this email.\n\n\
         FleetFlow Team\n"
    )
}

fn reset_html(url: &str) -> String {
    let url = escape(url);
    let year = chrono::Utc::now().year();
    format!(
        r#"<!DOCTYPE html>
<html>
<body style="font-family: Arial, sans-serif; line-height: 1.6; color: #333;">
  <div style="max-width: 600px; margin: 0 auto; padding: 20px;">
    <h1 style="background-color: #2563eb; color: white; padding: 20px; text-align: center;">FleetFlow</h1>
    <h2>Password Reset Request</h2>
    <p>Hello,</p>
    <p>We received a request to reset the password of your FleetFlow account.</p>
    <p style="text-align: center;">
      <a href="{url}" style="display: inline-block; padding: 12px 24px; background-color: #2563eb; color: white; text-decoration: none; border-radius: 6px;">Reset Password</a>
    </p>
    <p>Or paste this link into your browser:</p>
    <p style="word-break: break-all; color: #2563eb;">{url}</p>
    <p><strong>This link expires in 1 hour.</strong> If you did not request a reset, ignore this email and never share the link.</p>
    <p>Best regards,<br><strong>FleetFlow Team</strong></p>
    <p style="text-align: center; color: #6b7280; font-size: 12px;">&copy; {year} FleetFlow - Fleet &amp; Logistics Management</p>
  </div>
</body>
</html>"#
    )
}

fn alert_text(entry: &DlqEntry) -> String {
    format!(
        "An email exhausted all delivery attempts.\n\n\
         Job ID: {}\n\
         Type: {}\n\
         Recipient: {}\n\
         Attempts: {}\n\
         Failed at: {}\n\
         Error: {}\n\n\
         {}\n",
        entry.job_id.as_deref().unwrap_or("unknown"),
        entry.original_tag().unwrap_or("unknown"),
        entry.recipient().unwrap_or("unknown"),
        entry.attempts_made,
        entry.timestamp.to_rfc3339(),
        entry.error,
        entry.stack.as_deref().unwrap_or(""),
    )
}

fn alert_html(entry: &DlqEntry) -> String {
    format!(
        "<html><body style=\"font-family: Arial, sans-serif;\">\
         <h2 style=\"color: #b91c1c;\">Email permanently failed</h2>\
         <table>\
         <tr><td><strong>Job ID</strong></td><td>{}</td></tr>\
         <tr><td><strong>Type</strong></td><td>{}</td></tr>\
         <tr><td><strong>Recipient</strong></td><td>{}</td></tr>\
         <tr><td><strong>Attempts</strong></td><td>{}</td></tr>\
         <tr><td><strong>Failed at</strong></td><td>{}</td></tr>\
         <tr><td><strong>Error</strong></td><td>{}</td></tr>\
         </table>\
         <pre>{}</pre>\
         </body></html>",
        escape(entry.job_id.as_deref().unwrap_or("unknown")),
        escape(entry.original_tag().unwrap_or("unknown")),
        escape(entry.recipient().unwrap_or("unknown")),
        entry.attempts_made,
        entry.timestamp.to_rfc3339(),
        escape(&entry.error),
        escape(entry.stack.as_deref().unwrap_or("")),
    )
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send_password_reset(
        &self,
        email: &str,
        reset_token: &str,
    ) -> Result<(), NotificationError> {
        let url = reset_url(&self.frontend_url, reset_token)?;
        self.send(email, RESET_SUBJECT, reset_text(&url), reset_html(&url))
            .await?;

        info!(email = %email, "Password reset email delivered");
        Ok(())
    }
}

#[async_trait]
impl AdminAlerter for SmtpMailer {
    async fn send_dead_letter_alert(&self, entry: &DlqEntry) -> Result<(), NotificationError> {
        let admin = self
            .admin_email
            .as_deref()
            .ok_or(NotificationError::NoAdminRecipient)?;

        self.send(admin, ALERT_SUBJECT, alert_text(entry), alert_html(entry))
            .await?;

        info!(admin = %admin, job_id = ?entry.job_id, "Dead-letter alert email delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::EmailPayload;

    fn entry() -> DlqEntry {
        DlqEntry {
            original_job: EmailPayload::forgot_password("alice@example.com", "tok").to_value(),
            error: "550 <mailbox> unavailable".to_string(),
            stack: None,
            timestamp: chrono::Utc::now(),
            attempts_made: 3,
            job_id: Some("7".to_string()),
        }
    }

    fn local_config() -> SmtpConfig {
        SmtpConfig {
            host: "localhost".to_string(),
            port: 1025,
            username: None,
            password: None,
            from_email: "noreply@fleetflow.test".to_string(),
            from_name: "FleetFlow".to_string(),
            use_tls: false,
        }
    }

    #[test]
    fn reset_url_joins_frontend_and_token() {
        assert_eq!(
            reset_url("https://app.fleetflow.io/", "abc123").unwrap(),
            "https://app.fleetflow.io/reset-password?token=abc123"
        );
    }

    #[test]
    fn reset_url_encodes_reserved_token_characters() {
        let url = reset_url("https://app.fleetflow.io", "a+b&c#d e").unwrap();
        assert_eq!(
            url,
            "https://app.fleetflow.io/reset-password?token=a%2Bb%26c%23d+e"
        );
        let parsed = reqwest::Url::parse(&url).unwrap();
        let token: Vec<_> = parsed.query_pairs().collect();
        assert_eq!(token.len(), 1);
        assert_eq!(token[0].1, "a+b&c#d e");
    }

    #[test]
    fn unparsable_frontend_url_is_an_error() {
        let err = reset_url("not a url", "abc").unwrap_err();
        assert!(matches!(err, NotificationError::InvalidLink { .. }));
    }

    #[test]
    fn reset_bodies_contain_the_link() {
        let url = reset_url("http://localhost:5173", "abc").unwrap();
        assert!(reset_text(&url).contains(&url));
        assert!(reset_html(&url).contains(&url));
    }

    #[test]
    fn reset_html_escapes_the_link() {
        let url = reset_url("https://app.fleetflow.io/a&b", "abc").unwrap();
        let html = reset_html(&url);
        assert!(html.contains("href=\"https://app.fleetflow.io/a&amp;b/reset-password?token=abc\""));
        assert!(!html.contains("/a&b/"));
    }

    #[test]
    fn alert_html_escapes_error_text() {
        let html = alert_html(&entry());
        assert!(html.contains("&lt;mailbox&gt;"));
        assert!(html.contains("alice@example.com"));
    }

    #[test]
    fn invalid_sender_is_rejected() {
        let mut config = local_config();
        config.from_email = "not an address".to_string();
        let result = SmtpMailer::new(&config, "http://localhost", None);
        assert!(matches!(result, Err(NotificationError::InvalidAddress { .. })));
    }

    #[tokio::test]
    async fn alert_without_admin_recipient_fails() {
        let mailer = SmtpMailer::new(&local_config(), "http://localhost", None).unwrap();
        let err = mailer.send_dead_letter_alert(&entry()).await.unwrap_err();
        assert!(matches!(err, NotificationError::NoAdminRecipient));
    }
}
