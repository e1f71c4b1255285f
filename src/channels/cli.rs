//! Terminal channel: stdin lines become main-channel messages, replies print
//! to stdout. Lets the daemon be driven end-to-end without a platform client.

use super::traits::{Channel, ChannelEvent};
use crate::store::now_timestamp;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::Sender;

pub struct CliChannel {
    main_channel_id: String,
}

impl CliChannel {
    pub fn new(main_channel_id: impl Into<String>) -> Self {
        Self {
            main_channel_id: main_channel_id.into(),
        }
    }
}

#[async_trait]
impl Channel for CliChannel {
    fn name(&self) -> &str {
        "cli"
    }

    async fn send(&self, channel_id: &str, message: &str) -> anyhow::Result<()> {
        println!("[{channel_id}] {message}");
        Ok(())
    }

    async fn listen(&self, tx: Sender<ChannelEvent>) -> anyhow::Result<()> {
        let stdin = BufReader::new(tokio::io::stdin());
        let mut lines = stdin.lines();

        while let Some(line) = lines.next_line().await? {
            let content = line.trim().to_string();
            if content.is_empty() {
                continue;
            }

            let event = ChannelEvent {
                channel_id: self.main_channel_id.clone(),
                channel_name: "terminal".into(),
                sender: "operator".into(),
                content,
                timestamp: now_timestamp(),
                // A direct terminal line is always addressed to the assistant.
                mentioned: true,
                reply_to_bot: false,
                attachments: Vec::new(),
            };

            if tx.send(event).await.is_err() {
                break;
            }
        }

        Ok(())
    }
}
