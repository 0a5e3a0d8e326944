//! Bot Interface (spec §4.F): the capability contract a chat frontend must
//! satisfy, plus the two shipped adapters.

pub mod stdin;
pub mod telegram;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// One inbound private text message, already filtered to exclude groups,
/// non-text content, and self-originated messages.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub wxid: String,
    pub nickname: String,
    pub remark_name: Option<String>,
    pub text: String,
}

#[async_trait]
pub trait BotFrontend: Send + Sync {
    /// Start the frontend, returning a receiver the supervisor polls for
    /// inbound messages. The frontend manages its own background task(s).
    async fn start(&self) -> Result<mpsc::Receiver<InboundMessage>>;

    async fn stop(&self) -> Result<()>;

    async fn send(&self, wxid: &str, text: &str) -> Result<()>;
}
