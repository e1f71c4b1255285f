use async_trait::async_trait;

/// Attachment metadata recorded alongside a message; the bytes themselves live
/// under the group's `attachments/` directory.
#[derive(Debug, Clone)]
pub struct AttachmentMeta {
    pub name: String,
    pub mime_type: String,
    /// Path relative to the group working directory.
    pub rel_path: String,
}

/// An inbound chat event as delivered by a platform client.
#[derive(Debug, Clone)]
pub struct ChannelEvent {
    pub channel_id: String,
    /// Human name of the channel, for discovery metadata.
    pub channel_name: String,
    pub sender: String,
    pub content: String,
    /// Platform timestamp; normalized to store format at intake.
    pub timestamp: String,
    /// The event @-mentions the bot user.
    pub mentioned: bool,
    /// The event is a reply to a message previously authored by the bot.
    pub reply_to_bot: bool,
    pub attachments: Vec<AttachmentMeta>,
}

/// Core chat-platform trait — implement for any messaging platform.
///
/// Mention/reply detection and message chunking for platform limits live on
/// the client side; the supervisor only needs send, typing, and a listen loop.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Human-readable channel backend name.
    fn name(&self) -> &str;

    /// Send a message to the given channel id.
    async fn send(&self, channel_id: &str, message: &str) -> anyhow::Result<()>;

    /// Show a typing indicator; best-effort, expires on its own.
    async fn send_typing(&self, _channel_id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Start listening for incoming events (long-running).
    async fn listen(&self, tx: tokio::sync::mpsc::Sender<ChannelEvent>) -> anyhow::Result<()>;

    /// Platform hard limit on outbound message length, in characters.
    fn max_message_length(&self) -> usize {
        2000
    }
}
