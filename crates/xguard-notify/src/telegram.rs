use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tracing::{
    debug,
    warn,
};

const API_BASE: &str = "https://api.telegram.org";
const SEND_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Telegram API error: {0}")]
    Api(String),
}

/// Counts of paired Markdown markers must balance, otherwise Telegram
/// rejects the whole message. Unbalanced input is sent as plain text.
fn needs_plain(text: &str) -> bool {
    let backticks = text.matches('`').count();
    let stars = text.matches('*').count();
    let underscores = text.matches('_').count();
    backticks % 2 != 0 || stars % 2 != 0 || underscores % 2 != 0
}

/// Outbound operator notifier. Sends are best-effort: callers log failures
/// and move on, enforcement never waits on Telegram.
pub struct TelegramNotifier {
    token: String,
    chat_id: String,
    extra_chats: Vec<String>,
    client: reqwest::Client,
}

impl TelegramNotifier {
    pub fn new(token: String, chat_id: String, extra_chats: Vec<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(SEND_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self {
            token,
            chat_id,
            extra_chats,
            client,
        }
    }

    fn url(&self, method: &str) -> String {
        format!("{API_BASE}/bot{}/{method}", self.token)
    }

    /// Drop any pending webhook so long-polling consumers see updates.
    pub async fn delete_webhook(&self) -> Result<(), NotifyError> {
        let resp = self
            .client
            .post(self.url("deleteWebhook"))
            .json(&json!({}))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(NotifyError::Api(format!("deleteWebhook: {}", resp.status())));
        }
        Ok(())
    }

    pub async fn send(&self, text: &str) -> Result<(), NotifyError> {
        self.send_payload(text, None).await
    }

    /// Send with an inline action keyboard. `rows` is a list of button rows,
    /// each button a (label, callback-data) pair.
    pub async fn send_with_inline(
        &self, text: &str, rows: &[Vec<(String, String)>],
    ) -> Result<(), NotifyError> {
        let keyboard = json!({
            "inline_keyboard": rows
                .iter()
                .map(|row| {
                    row.iter()
                        .map(|(label, data)| json!({"text": label, "callback_data": data}))
                        .collect::<Vec<_>>()
                })
                .collect::<Vec<_>>()
        });
        self.send_payload(text, Some(keyboard)).await
    }

    async fn send_payload(
        &self, text: &str, markup: Option<serde_json::Value>,
    ) -> Result<(), NotifyError> {
        let mut last_err = None;
        for chat in std::iter::once(&self.chat_id).chain(self.extra_chats.iter()) {
            if let Err(e) = self.send_to_chat(chat, text, markup.as_ref()).await {
                warn!("telegram send to {chat} failed: {e}");
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn send_to_chat(
        &self, chat: &str, text: &str, markup: Option<&serde_json::Value>,
    ) -> Result<(), NotifyError> {
        let markdown = !needs_plain(text);
        let mut body = json!({ "chat_id": chat, "text": text });
        if markdown {
            body["parse_mode"] = json!("Markdown");
        }
        if let Some(markup) = markup {
            body["reply_markup"] = markup.clone();
        }
        let resp = self
            .client
            .post(self.url("sendMessage"))
            .json(&body)
            .send()
            .await?;
        if resp.status().is_success() {
            return Ok(());
        }
        let status = resp.status();
        let detail = resp.text().await.unwrap_or_default();
        // Telegram rejects the whole message on a Markdown parse error, so
        // retry once as plain text rather than losing the notification.
        if markdown && status.as_u16() == 400 && detail.contains("can't parse") {
            debug!("markdown rejected, downgrading to plain text");
            let mut body = json!({ "chat_id": chat, "text": text });
            if let Some(markup) = markup {
                body["reply_markup"] = markup.clone();
            }
            let resp = self
                .client
                .post(self.url("sendMessage"))
                .json(&body)
                .send()
                .await?;
            if resp.status().is_success() {
                return Ok(());
            }
            return Err(NotifyError::Api(format!("sendMessage: {}", resp.status())));
        }
        Err(NotifyError::Api(format!("sendMessage: {status} {detail}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balanced_markdown_passes() {
        assert!(!needs_plain("ban `1.2.3.4` on *de1*"));
        assert!(!needs_plain("no markup at all"));
    }

    #[test]
    fn unbalanced_markers_force_plain() {
        assert!(needs_plain("stray ` backtick"));
        assert!(needs_plain("odd *stars* *"));
        assert!(needs_plain("user_name without pair"));
    }

    #[test]
    fn url_embeds_token_and_method() {
        let n = TelegramNotifier::new("123:abc".into(), "42".into(), vec![]);
        assert_eq!(n.url("sendMessage"), "https://api.telegram.org/bot123:abc/sendMessage");
    }
}
