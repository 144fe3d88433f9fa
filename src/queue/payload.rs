//! Payloads carried by email and dead-letter jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::{Failure, Job};
use crate::error::JobError;

/// Job name used for password reset emails.
pub const FORGOT_PASSWORD_JOB: &str = "email:forgot_password";

/// Job name used for dead-letter entries.
pub const DEAD_LETTER_JOB: &str = "dlq:failed_email";

/// Payload of a job on the email queue, discriminated by `tag`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "snake_case")]
pub enum EmailPayload {
    /// Password reset email with a caller-generated token.
    ForgotPassword {
        email: String,
        #[serde(rename = "resetToken")]
        reset_token: String,
        #[serde(rename = "type", default = "password_reset_kind")]
        kind: String,
    },
}

impl EmailPayload {
    /// Builds a password reset payload.
    pub fn forgot_password(email: impl Into<String>, reset_token: impl Into<String>) -> Self {
        Self::ForgotPassword {
            email: email.into(),
            reset_token: reset_token.into(),
            kind: password_reset_kind(),
        }
    }

    /// Returns the `tag` discriminator.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::ForgotPassword { .. } => "forgot_password",
        }
    }

    /// Decodes the payload of a claimed job.
    pub fn from_job(job: &Job) -> Result<Self, JobError> {
        serde_json::from_value(job.payload.clone()).map_err(|e| {
            let tag = job
                .payload
                .get("tag")
                .and_then(|t| t.as_str())
                .unwrap_or("<missing>");
            JobError::UnknownPayload(format!("email job tag '{}': {}", tag, e))
        })
    }

    /// Encodes the payload for storage.
    pub fn to_value(&self) -> serde_json::Value {
        // A struct-like enum with string fields always serializes.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

fn password_reset_kind() -> String {
    "password_reset".to_string()
}

/// Record stored in the dead-letter queue when an email job exhausts its attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqEntry {
    /// Full payload of the original job.
    pub original_job: serde_json::Value,

    /// Message of the last failure.
    pub error: String,

    /// Error source chain of the last failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,

    /// Time of DLQ insertion.
    pub timestamp: DateTime<Utc>,

    /// Attempts consumed by the original job.
    pub attempts_made: u32,

    /// Identifier of the original job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

impl DlqEntry {
    /// Builds the entry for a job that failed its final attempt.
    pub fn from_failed_job(job: &Job, failure: &Failure) -> Self {
        Self {
            original_job: job.payload.clone(),
            error: failure.message.clone(),
            stack: failure.trace.clone(),
            timestamp: Utc::now(),
            attempts_made: job.attempts_made,
            job_id: Some(job.id.clone()),
        }
    }

    /// Decodes the entry carried by a claimed DLQ job.
    pub fn from_job(job: &Job) -> Result<Self, JobError> {
        serde_json::from_value(job.payload.clone())
            .map_err(|e| JobError::UnknownPayload(format!("dead-letter entry: {}", e)))
    }

    /// Returns the recipient of the original email, if present.
    pub fn recipient(&self) -> Option<&str> {
        self.original_job.get("email").and_then(|v| v.as_str())
    }

    /// Returns the tag of the original job, if present.
    pub fn original_tag(&self) -> Option<&str> {
        self.original_job.get("tag").and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::job::{JobOptions, NewJob};
    use serde_json::json;

    fn job_with(payload: serde_json::Value) -> Job {
        Job::from_request(
            NewJob {
                queue: "fleetflow-email".to_string(),
                name: FORGOT_PASSWORD_JOB.to_string(),
                payload,
                options: JobOptions::default(),
            },
            1,
        )
    }

    #[test]
    fn forgot_password_uses_wire_field_names() {
        let value = EmailPayload::forgot_password("alice@example.com", "tok").to_value();
        assert_eq!(
            value,
            json!({
                "tag": "forgot_password",
                "type": "password_reset",
                "email": "alice@example.com",
                "resetToken": "tok"
            })
        );
    }

    #[test]
    fn payload_without_type_still_decodes() {
        let job = job_with(json!({"tag": "forgot_password", "email": "a@b.c", "resetToken": "t"}));
        let payload = EmailPayload::from_job(&job).unwrap();
        assert_eq!(payload, EmailPayload::forgot_password("a@b.c", "t"));
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let job = job_with(json!({"tag": "newsletter", "email": "a@b.c"}));
        let err = EmailPayload::from_job(&job).unwrap_err();
        assert!(matches!(err, JobError::UnknownPayload(ref msg) if msg.contains("newsletter")));
    }

    #[test]
    fn dlq_entry_carries_original_job() {
        let mut job = job_with(EmailPayload::forgot_password("alice@example.com", "t").to_value());
        job.attempts_made = 3;
        let entry = DlqEntry::from_failed_job(&job, &Failure::message("smtp down"));

        assert_eq!(entry.recipient(), Some("alice@example.com"));
        assert_eq!(entry.original_tag(), Some("forgot_password"));
        assert_eq!(entry.attempts_made, 3);
        assert_eq!(entry.job_id.as_deref(), Some(job.id.as_str()));

        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["originalJob"]["email"], "alice@example.com");
        assert_eq!(value["attemptsMade"], 3);
        assert!(value.get("stack").is_none());
    }
}
