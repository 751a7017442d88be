use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;
use teloxide::prelude::*;
use teloxide::types::{Update, UpdateKind};

use crate::config::{AppSettings, TelegramSettings};
use crate::error::{Result, ScrapeError};
use crate::mfa::{MfaChallenge, MfaCodeSource};

static CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{4,8})\b").expect("static pattern"));

const POLL_TIMEOUT_SECS: u32 = 30;

/// Run reports and MFA prompts through a Telegram chat.
#[derive(Clone)]
pub struct TelegramNotifier {
    bot: Bot,
    chat_id: ChatId,
}

impl TelegramNotifier {
    pub fn new(settings: &TelegramSettings) -> Self {
        Self {
            bot: Bot::new(settings.token.clone()),
            chat_id: ChatId(settings.chat_id),
        }
    }

    pub fn from_settings(settings: &AppSettings) -> Option<Self> {
        settings.telegram.as_ref().map(Self::new)
    }

    /// Sends a message; delivery failures are logged and otherwise ignored.
    pub async fn notify(&self, text: &str) {
        if let Err(e) = self.try_notify(text).await {
            tracing::warn!(error = %e, "Could not deliver Telegram notification");
        }
    }

    pub async fn try_notify(&self, text: &str) -> Result<()> {
        self.bot
            .send_message(self.chat_id, text)
            .await
            .map_err(|e| ScrapeError::Notify(e.to_string()))?;
        tracing::debug!(chat_id = %self.chat_id, "Telegram notification sent");
        Ok(())
    }

    /// Confirms whatever the chat posted before now, returning the offset of the next update.
    async fn skip_backlog(&self) -> Option<i32> {
        match self.bot.get_updates().offset(-1).timeout(0).await {
            Ok(updates) => updates.last().map(|u| u.id + 1),
            Err(e) => {
                tracing::warn!(error = %e, "Could not skip Telegram backlog");
                None
            }
        }
    }

    /// Long-polls the bot until the configured chat posts a code dated at or after `not_before`.
    /// The accepted update is confirmed so a later run never sees it again.
    async fn next_code(&self, mut offset: Option<i32>, not_before: DateTime<Utc>) -> Result<String> {
        loop {
            let mut request = self.bot.get_updates().timeout(POLL_TIMEOUT_SECS);
            if let Some(o) = offset {
                request = request.offset(o);
            }
            let updates = match request.await {
                Ok(u) => u,
                Err(e) => {
                    tracing::warn!(error = %e, "Telegram polling failed, retrying");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
            };
            let replies: Vec<Reply> = updates.iter().map(Reply::from_update).collect();
            let scan = scan_replies(&replies, self.chat_id, not_before);
            offset = scan.next_offset.or(offset);
            if let (Some(code), Some(next)) = (scan.code, scan.next_offset) {
                if let Err(e) = self.bot.get_updates().offset(next).timeout(0).await {
                    tracing::warn!(error = %e, "Could not confirm the code update");
                }
                return Ok(code);
            }
        }
    }
}

/// The parts of a Telegram update the code search looks at.
#[derive(Debug, Clone)]
struct Reply {
    update_id: i32,
    chat_id: Option<ChatId>,
    date: Option<DateTime<Utc>>,
    text: Option<String>,
}

impl Reply {
    fn from_update(update: &Update) -> Self {
        match &update.kind {
            UpdateKind::Message(msg) => Self {
                update_id: update.id,
                chat_id: Some(msg.chat.id),
                date: Some(msg.date),
                text: msg.text().map(str::to_string),
            },
            _ => Self {
                update_id: update.id,
                chat_id: None,
                date: None,
                text: None,
            },
        }
    }
}

#[derive(Debug, Default, PartialEq)]
struct Scan {
    next_offset: Option<i32>,
    code: Option<String>,
}

/// Walks updates in order and stops at the first code from `chat` posted at or after
/// `not_before`. The offset points just past the last update consumed.
fn scan_replies(replies: &[Reply], chat: ChatId, not_before: DateTime<Utc>) -> Scan {
    let mut scan = Scan::default();
    for reply in replies {
        scan.next_offset = Some(reply.update_id + 1);
        if reply.chat_id != Some(chat) || reply.date.map_or(true, |d| d < not_before) {
            continue;
        }
        if let Some(code) = reply.text.as_deref().and_then(extract_code) {
            scan.code = Some(code);
            break;
        }
    }
    scan
}

pub fn extract_code(text: &str) -> Option<String> {
    CODE_RE.captures(text).map(|c| c[1].to_string())
}

#[async_trait]
impl MfaCodeSource for TelegramNotifier {
    async fn code(&self, challenge: &MfaChallenge) -> Result<Option<String>> {
        let offset = self.skip_backlog().await;
        let prompt = self
            .bot
            .send_message(
                self.chat_id,
                format!("Verification code requested for {}. Reply with the code.", challenge.email),
            )
            .await
            .map_err(|e| ScrapeError::Notify(e.to_string()))?;
        self.next_code(offset, prompt.date).await.map(Some)
    }
}
