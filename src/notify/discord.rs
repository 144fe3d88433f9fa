//! Discord webhook notifications.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, info};

use super::AdminAlerter;
use crate::config::model::DiscordConfig;
use crate::error::NotificationError;
use crate::queue::DlqEntry;

/// Sends dead-letter alerts to Discord via webhook.
pub struct DiscordAlerter {
    /// Webhook URL.
    webhook_url: String,
    /// Optional user ID to mention on alerts.
    mention_on_failure: Option<String>,
    /// HTTP client.
    client: reqwest::Client,
}

impl DiscordAlerter {
    /// Creates a new Discord alerter from config.
    pub fn new(config: &DiscordConfig) -> Self {
        Self {
            webhook_url: config.webhook_url.clone(),
            mention_on_failure: config.mention_on_failure.clone(),
            client: reqwest::Client::new(),
        }
    }

    /// Sends an embed with optional content text.
    async fn send_embed_with_content(
        &self,
        embed: DiscordEmbed,
        content: Option<String>,
    ) -> Result<(), NotificationError> {
        let payload = DiscordPayload {
            content,
            embeds: vec![embed],
        };

        let response = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            error!(status = %status, body = %text, "Discord webhook failed");
            return Err(NotificationError::DiscordFailed(format!(
                "HTTP {}: {}",
                status, text
            )));
        }

        info!("Discord notification sent");
        Ok(())
    }
}

#[async_trait]
impl AdminAlerter for DiscordAlerter {
    async fn send_dead_letter_alert(&self, entry: &DlqEntry) -> Result<(), NotificationError> {
        let content = self.mention_on_failure.as_ref().map(|id| format!("<@{}>", id));
        self.send_embed_with_content(dead_letter_embed(entry), content)
            .await
    }
}

/// Builds the embed describing a dead-letter entry.
fn dead_letter_embed(entry: &DlqEntry) -> DiscordEmbed {
    DiscordEmbed {
        title: "Email Dead Lettered".to_string(),
        color: 0x800000, // Dark red
        fields: vec![
            EmbedField {
                name: "Job ID".to_string(),
                value: entry.job_id.clone().unwrap_or_else(|| "Unknown".to_string()),
                inline: true,
            },
            EmbedField {
                name: "Type".to_string(),
                value: entry.original_tag().unwrap_or("Unknown").to_string(),
                inline: true,
            },
            EmbedField {
                name: "Attempts".to_string(),
                value: entry.attempts_made.to_string(),
                inline: true,
            },
            EmbedField {
                name: "Recipient".to_string(),
                value: entry.recipient().unwrap_or("Unknown").to_string(),
                inline: false,
            },
            EmbedField {
                name: "Error".to_string(),
                value: truncate(&entry.error, 1024),
                inline: false,
            },
            EmbedField {
                name: "Failed At".to_string(),
                value: entry.timestamp.to_rfc3339(),
                inline: false,
            },
        ],
    }
}

/// Discord webhook payload.
#[derive(Serialize)]
struct DiscordPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    embeds: Vec<DiscordEmbed>,
}

/// Discord embed structure.
#[derive(Serialize)]
struct DiscordEmbed {
    title: String,
    color: u32,
    fields: Vec<EmbedField>,
}

/// Discord embed field.
#[derive(Serialize)]
struct EmbedField {
    name: String,
    value: String,
    inline: bool,
}

/// Truncates a string to at most `max_len` bytes, respecting char boundaries.
fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len.saturating_sub(3);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
