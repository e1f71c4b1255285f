//! Prompt assembly for agent turns: XML-escaped message batches and trigger
//! detection for non-main channels.

use crate::store::{RegisteredGroup, StoredMessage};
use regex::Regex;

pub fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Render a batch of pending messages as the agent prompt block.
pub fn format_messages_block(messages: &[StoredMessage]) -> String {
    let mut block = String::from("<messages>\n");
    for message in messages {
        block.push_str(&format!(
            "<message sender=\"{}\" time=\"{}\">{}</message>\n",
            escape_xml(&message.sender_name),
            escape_xml(&message.timestamp),
            escape_xml(&message.content)
        ));
    }
    block.push_str("</messages>");
    block
}

/// Whether the batch authorizes an agent run for this group.
///
/// The main group is always authorized, as is any group registered with
/// `requires_trigger = false`. Everyone else needs a mention, a reply to the
/// bot, or a trigger-regex match in at least one message.
pub fn trigger_matches(
    group: &RegisteredGroup,
    assistant_name: &str,
    messages: &[StoredMessage],
) -> bool {
    if group.is_main() || !group.config.requires_trigger {
        return true;
    }

    if messages.iter().any(|message| message.mentions_bot) {
        return true;
    }

    let regex = trigger_regex(group, assistant_name);
    messages.iter().any(|message| regex.is_match(&message.content))
}

fn trigger_regex(group: &RegisteredGroup, assistant_name: &str) -> Regex {
    if let Some(pattern) = &group.config.trigger {
        match Regex::new(&format!("(?i){pattern}")) {
            Ok(regex) => return regex,
            Err(error) => {
                tracing::warn!(
                    group = %group.config.folder,
                    %error,
                    "invalid trigger pattern, falling back to assistant name"
                );
            }
        }
    }
    default_trigger_regex(assistant_name)
}

/// Word-boundary assistant name, case-insensitive.
pub fn default_trigger_regex(assistant_name: &str) -> Regex {
    Regex::new(&format!(r"(?i)\b{}\b", regex::escape(assistant_name)))
        .expect("escaped assistant name is a valid pattern")
}
