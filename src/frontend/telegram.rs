use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;

use super::{BotFrontend, InboundMessage};
use crate::error::{AppError, Result};

const POLL_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
struct UpdatesResponse {
    result: Vec<Update>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    chat: Chat,
    text: Option<String>,
    from: Option<From>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct From {
    is_bot: bool,
    first_name: String,
    username: Option<String>,
}

/// Long-polls Telegram's `getUpdates`, filtering to private text messages
/// from non-bot senders, and maps `chat.id` to `wxid` (spec §4.F).
pub struct TelegramFrontend {
    token: String,
    client: reqwest::Client,
    offset: Arc<AtomicI64>,
}

impl TelegramFrontend {
    pub fn new(token: String) -> Self {
        Self {
            token,
            client: reqwest::Client::new(),
            offset: Arc::new(AtomicI64::new(0)),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{}", self.token, method)
    }
}

fn to_inbound(update: &Update) -> Option<InboundMessage> {
    let message = update.message.as_ref()?;
    if message.chat.kind != "private" {
        return None;
    }
    let text = message.text.as_ref()?.clone();
    let from = message.from.as_ref()?;
    if from.is_bot {
        return None;
    }

    Some(InboundMessage {
        wxid: message.chat.id.to_string(),
        nickname: from.username.clone().unwrap_or_else(|| from.first_name.clone()),
        remark_name: None,
        text,
    })
}

#[async_trait]
impl BotFrontend for TelegramFrontend {
    async fn start(&self) -> Result<mpsc::Receiver<InboundMessage>> {
        let (tx, rx) = mpsc::channel(32);
        let client = self.client.clone();
        let token = self.token.clone();
        let offset = self.offset.clone();

        tokio::spawn(async move {
            loop {
                let url = format!(
                    "https://api.telegram.org/bot{}/getUpdates?timeout={}&offset={}",
                    token,
                    POLL_TIMEOUT_SECS,
                    offset.load(Ordering::SeqCst)
                );

                let response = client
                    .get(&url)
                    .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 10))
                    .send()
                    .await;

                let updates = match response {
                    Ok(resp) => match resp.json::<UpdatesResponse>().await {
                        Ok(body) => body.result,
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to decode telegram getUpdates response");
                            tokio::time::sleep(Duration::from_secs(5)).await;
                            continue;
                        }
                    },
                    Err(e) => {
                        tracing::warn!(error = %e, "telegram getUpdates request failed");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                };

                for update in &updates {
                    offset.store(update.update_id + 1, Ordering::SeqCst);
                    if let Some(message) = to_inbound(update) {
                        if tx.send(message).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn send(&self, wxid: &str, text: &str) -> Result<()> {
        let body = serde_json::json!({ "chat_id": wxid, "text": text });
        self.client
            .post(self.api_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::ContainerOperationFailed(format!("telegram send failed: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignores_group_chats() {
        let update = Update {
            update_id: 1,
            message: Some(TelegramMessage {
                chat: Chat { id: 1, kind: "group".into() },
                text: Some("hi".into()),
                from: Some(From { is_bot: false, first_name: "A".into(), username: None }),
            }),
        };
        assert!(to_inbound(&update).is_none());
    }

    #[test]
    fn ignores_bot_senders() {
        let update = Update {
            update_id: 1,
            message: Some(TelegramMessage {
                chat: Chat { id: 1, kind: "private".into() },
                text: Some("hi".into()),
                from: Some(From { is_bot: true, first_name: "A".into(), username: None }),
            }),
        };
        assert!(to_inbound(&update).is_none());
    }

    #[test]
    fn ignores_non_text_messages() {
        let update = Update {
            update_id: 1,
            message: Some(TelegramMessage {
                chat: Chat { id: 1, kind: "private".into() },
                text: None,
                from: Some(From { is_bot: false, first_name: "A".into(), username: None }),
            }),
        };
        assert!(to_inbound(&update).is_none());
    }

    #[test]
    fn accepts_private_text_from_human() {
        let update = Update {
            update_id: 1,
            message: Some(TelegramMessage {
                chat: Chat { id: 42, kind: "private".into() },
                text: Some("hello".into()),
                from: Some(From { is_bot: false, first_name: "Alice".into(), username: Some("alice".into()) }),
            }),
        };
        let inbound = to_inbound(&update).unwrap();
        assert_eq!(inbound.wxid, "42");
        assert_eq!(inbound.nickname, "alice");
        assert_eq!(inbound.text, "hello");
    }
}
