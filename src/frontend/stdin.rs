use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use super::{BotFrontend, InboundMessage};
use crate::error::Result;

/// Line-oriented adapter for local testing: each line of stdin is
/// `wxid|nickname|message` (spec §4.F).
pub struct StdinFrontend;

impl StdinFrontend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for StdinFrontend {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_line(line: &str) -> Option<InboundMessage> {
    let mut parts = line.splitn(3, '|');
    let wxid = parts.next()?.trim();
    let nickname = parts.next()?.trim();
    let text = parts.next()?.trim();
    if wxid.is_empty() || text.is_empty() {
        return None;
    }
    Some(InboundMessage {
        wxid: wxid.to_string(),
        nickname: nickname.to_string(),
        remark_name: None,
        text: text.to_string(),
    })
}

#[async_trait]
impl BotFrontend for StdinFrontend {
    async fn start(&self) -> Result<mpsc::Receiver<InboundMessage>> {
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            let stdin = tokio::io::stdin();
            let mut lines = BufReader::new(stdin).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(message) = parse_line(&line) {
                    if tx.send(message).await.is_err() {
                        break;
                    }
                } else {
                    tracing::debug!(line = %line, "ignoring malformed stdin line");
                }
            }
        });

        Ok(rx)
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn send(&self, wxid: &str, text: &str) -> Result<()> {
        println!("[{wxid}] {text}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_line() {
        let message = parse_line("u1|Alice|hello world").unwrap();
        assert_eq!(message.wxid, "u1");
        assert_eq!(message.nickname, "Alice");
        assert_eq!(message.text, "hello world");
    }

    #[test]
    fn message_may_contain_pipes() {
        let message = parse_line("u1|Alice|a|b|c").unwrap();
        assert_eq!(message.text, "a|b|c");
    }

    #[test]
    fn rejects_missing_fields() {
        assert!(parse_line("u1|Alice").is_none());
        assert!(parse_line("just text").is_none());
    }

    #[test]
    fn rejects_empty_wxid_or_text() {
        assert!(parse_line("|Alice|hi").is_none());
        assert!(parse_line("u1|Alice|").is_none());
    }
}
