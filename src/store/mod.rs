//! SQLite-backed state store: messages, channel metadata, registered groups,
//! agent sessions, router watermarks, and scheduled tasks. One connection per
//! process behind a mutex; all timestamps are fixed-width UTC RFC-3339 TEXT so
//! lexicographic comparison is chronological.

mod types;

pub use types::{
    ChatInfo, ContainerOverrides, ContextMode, GroupConfig, RegisteredGroup, ScheduleKind,
    StoredMessage, Task, TaskStatus,
};

use crate::channels::traits::AttachmentMeta;
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

pub const LAST_TIMESTAMP_KEY: &str = "last_timestamp";
pub const LAST_AGENT_TIMESTAMP_KEY: &str = "last_agent_timestamp";

pub struct Store {
    conn: Mutex<Connection>,
}

/// Format an instant as fixed-width UTC RFC-3339 with millisecond precision.
///
/// Every timestamp written to the store goes through here; the watermark
/// cursors rely on lexicographic order matching chronological order.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

/// Render message text plus one `[file: ...]` line per attachment.
///
/// With empty text the attachment lines become the entire content.
pub fn build_message_content(text: &str, attachments: &[AttachmentMeta]) -> String {
    let lines: Vec<String> = attachments
        .iter()
        .map(|att| format!("[file: {} | {} | {}]", att.name, att.mime_type, att.rel_path))
        .collect();

    if lines.is_empty() {
        return text.to_string();
    }
    if text.is_empty() {
        return lines.join("\n");
    }
    format!("{}\n{}", text, lines.join("\n"))
}

impl Store {
    /// Open (creating if needed) the database at `path` and initialize the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create store directory: {}", parent.display())
            })?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             CREATE TABLE IF NOT EXISTS messages (
                 id           TEXT PRIMARY KEY,
                 channel_id   TEXT NOT NULL,
                 sender_name  TEXT NOT NULL,
                 content      TEXT NOT NULL,
                 timestamp    TEXT NOT NULL,
                 mentions_bot INTEGER NOT NULL DEFAULT 0
             );
             CREATE INDEX IF NOT EXISTS idx_messages_channel_time
                 ON messages(channel_id, timestamp);

             CREATE TABLE IF NOT EXISTS chats (
                 jid               TEXT PRIMARY KEY,
                 name              TEXT NOT NULL,
                 last_message_time TEXT NOT NULL
             );

             CREATE TABLE IF NOT EXISTS registered_groups (
                 channel_id  TEXT PRIMARY KEY,
                 config_json TEXT NOT NULL
             );

             CREATE TABLE IF NOT EXISTS sessions (
                 group_folder TEXT PRIMARY KEY,
                 session_id   TEXT NOT NULL
             );

             CREATE TABLE IF NOT EXISTS router_state (
                 key   TEXT PRIMARY KEY,
                 value TEXT NOT NULL
             );

             CREATE TABLE IF NOT EXISTS tasks (
                 id             TEXT PRIMARY KEY,
                 group_folder   TEXT NOT NULL,
                 channel_id     TEXT NOT NULL,
                 prompt         TEXT NOT NULL,
                 schedule_type  TEXT NOT NULL,
                 schedule_value TEXT NOT NULL,
                 context_mode   TEXT NOT NULL DEFAULT 'group',
                 status         TEXT NOT NULL DEFAULT 'active',
                 next_run       TEXT,
                 created_at     TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_tasks_next_run ON tasks(status, next_run);",
        )
        .context("Failed to initialize store schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|error| anyhow::anyhow!("Lock error: {error}"))
    }

    // ── Messages ─────────────────────────────────────────────────────────────

    pub fn append_message(
        &self,
        channel_id: &str,
        sender_name: &str,
        content: &str,
        timestamp: &str,
        mentions_bot: bool,
    ) -> Result<StoredMessage> {
        let conn = self.lock()?;
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO messages (id, channel_id, sender_name, content, timestamp, mentions_bot)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                channel_id,
                sender_name,
                content,
                timestamp,
                i32::from(mentions_bot)
            ],
        )
        .context("Failed to insert message")?;

        Ok(StoredMessage {
            id,
            channel_id: channel_id.to_string(),
            sender_name: sender_name.to_string(),
            content: content.to_string(),
            timestamp: timestamp.to_string(),
            mentions_bot,
        })
    }

    /// Messages for `channel_id` strictly after `after`, excluding the bot's own.
    pub fn messages_since(
        &self,
        channel_id: &str,
        after: Option<&str>,
        bot_name: &str,
    ) -> Result<Vec<StoredMessage>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, channel_id, sender_name, content, timestamp, mentions_bot
             FROM messages
             WHERE channel_id = ?1
               AND timestamp > ?2
               AND sender_name != ?3
             ORDER BY timestamp ASC",
        )?;

        let rows = stmt.query_map(
            params![channel_id, after.unwrap_or(""), bot_name],
            |row| {
                Ok(StoredMessage {
                    id: row.get(0)?,
                    channel_id: row.get(1)?,
                    sender_name: row.get(2)?,
                    content: row.get(3)?,
                    timestamp: row.get(4)?,
                    mentions_bot: row.get::<_, i64>(5)? != 0,
                })
            },
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Registered channels holding messages newer than `after`, with each
    /// channel's newest timestamp. Drives the supervisor's dispatch cursor.
    pub fn channels_with_messages_since(
        &self,
        after: Option<&str>,
        bot_name: &str,
    ) -> Result<Vec<(String, String)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT m.channel_id, MAX(m.timestamp)
             FROM messages m
             WHERE m.timestamp > ?1
               AND m.sender_name != ?2
               AND m.channel_id IN (SELECT channel_id FROM registered_groups)
             GROUP BY m.channel_id",
        )?;

        let rows = stmt.query_map(params![after.unwrap_or(""), bot_name], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut channels = Vec::new();
        for row in rows {
            channels.push(row?);
        }
        Ok(channels)
    }

    // ── Chats ────────────────────────────────────────────────────────────────

    pub fn upsert_chat(&self, jid: &str, name: &str, last_message_time: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO chats (jid, name, last_message_time)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(jid) DO UPDATE SET
                 name = excluded.name,
                 last_message_time = excluded.last_message_time",
            params![jid, name, last_message_time],
        )
        .context("Failed to upsert chat")?;
        Ok(())
    }

    pub fn list_chats(&self) -> Result<Vec<ChatInfo>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT jid, name, last_message_time FROM chats ORDER BY last_message_time DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ChatInfo {
                jid: row.get(0)?,
                name: row.get(1)?,
                last_message_time: row.get(2)?,
            })
        })?;

        let mut chats = Vec::new();
        for row in rows {
            chats.push(row?);
        }
        Ok(chats)
    }

    // ── Registered groups ────────────────────────────────────────────────────

    pub fn register_group(&self, group: &RegisteredGroup) -> Result<()> {
        let conn = self.lock()?;
        let config_json =
            serde_json::to_string(&group.config).context("Failed to serialize group config")?;
        conn.execute(
            "INSERT INTO registered_groups (channel_id, config_json)
             VALUES (?1, ?2)
             ON CONFLICT(channel_id) DO UPDATE SET config_json = excluded.config_json",
            params![group.channel_id, config_json],
        )
        .context("Failed to register group")?;
        Ok(())
    }

    pub fn registered_groups(&self) -> Result<Vec<RegisteredGroup>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT channel_id, config_json FROM registered_groups")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut groups = Vec::new();
        for row in rows {
            let (channel_id, config_json) = row?;
            let config: GroupConfig = serde_json::from_str(&config_json)
                .with_context(|| format!("Corrupt group config for {channel_id}"))?;
            groups.push(RegisteredGroup { channel_id, config });
        }
        Ok(groups)
    }

    pub fn get_group(&self, channel_id: &str) -> Result<Option<RegisteredGroup>> {
        let conn = self.lock()?;
        let config_json: Option<String> = conn
            .query_row(
                "SELECT config_json FROM registered_groups WHERE channel_id = ?1",
                params![channel_id],
                |row| row.get(0),
            )
            .optional()?;

        match config_json {
            Some(raw) => {
                let config: GroupConfig = serde_json::from_str(&raw)
                    .with_context(|| format!("Corrupt group config for {channel_id}"))?;
                Ok(Some(RegisteredGroup {
                    channel_id: channel_id.to_string(),
                    config,
                }))
            }
            None => Ok(None),
        }
    }

    // ── Sessions ─────────────────────────────────────────────────────────────

    pub fn get_session(&self, group_folder: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT session_id FROM sessions WHERE group_folder = ?1",
            params![group_folder],
            |row| row.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn set_session(&self, group_folder: &str, session_id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sessions (group_folder, session_id)
             VALUES (?1, ?2)
             ON CONFLICT(group_folder) DO UPDATE SET session_id = excluded.session_id",
            params![group_folder, session_id],
        )
        .context("Failed to persist session")?;
        Ok(())
    }

    // ── Router state ─────────────────────────────────────────────────────────

    pub fn get_state(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT value FROM router_state WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn set_state(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO router_state (key, value)
             VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .context("Failed to persist router state")?;
        Ok(())
    }

    pub fn last_timestamp(&self) -> Result<Option<String>> {
        self.get_state(LAST_TIMESTAMP_KEY)
    }

    pub fn set_last_timestamp(&self, timestamp: &str) -> Result<()> {
        self.set_state(LAST_TIMESTAMP_KEY, timestamp)
    }

    /// Per-channel "last message the agent has consumed" watermark.
    pub fn last_agent_timestamp(&self, channel_id: &str) -> Result<Option<String>> {
        Ok(self.last_agent_map()?.remove(channel_id))
    }

    /// Advance the per-channel agent watermark; never moves backwards.
    pub fn set_last_agent_timestamp(&self, channel_id: &str, timestamp: &str) -> Result<()> {
        let mut map = self.last_agent_map()?;
        if let Some(existing) = map.get(channel_id) {
            if existing.as_str() >= timestamp {
                return Ok(());
            }
        }
        map.insert(channel_id.to_string(), timestamp.to_string());
        let serialized =
            serde_json::to_string(&map).context("Failed to serialize agent watermarks")?;
        self.set_state(LAST_AGENT_TIMESTAMP_KEY, &serialized)
    }

    fn last_agent_map(&self) -> Result<HashMap<String, String>> {
        match self.get_state(LAST_AGENT_TIMESTAMP_KEY)? {
            Some(raw) => {
                serde_json::from_str(&raw).context("Corrupt agent watermark map in router_state")
            }
            None => Ok(HashMap::new()),
        }
    }

    // ── Tasks ────────────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn create_task(
        &self,
        group_folder: &str,
        channel_id: &str,
        prompt: &str,
        schedule_kind: ScheduleKind,
        schedule_value: &str,
        context_mode: ContextMode,
        next_run: &str,
    ) -> Result<Task> {
        let conn = self.lock()?;
        let id = Uuid::new_v4().to_string();
        let created_at = now_timestamp();
        conn.execute(
            "INSERT INTO tasks (
                 id, group_folder, channel_id, prompt, schedule_type, schedule_value,
                 context_mode, status, next_run, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'active', ?8, ?9)",
            params![
                id,
                group_folder,
                channel_id,
                prompt,
                schedule_kind.as_db(),
                schedule_value,
                context_mode.as_db(),
                next_run,
                created_at
            ],
        )
        .context("Failed to insert task")?;

        Ok(Task {
            id,
            group_folder: group_folder.to_string(),
            channel_id: channel_id.to_string(),
            prompt: prompt.to_string(),
            schedule_kind,
            schedule_value: schedule_value.to_string(),
            context_mode,
            status: TaskStatus::Active,
            next_run: Some(next_run.to_string()),
            created_at,
        })
    }

    /// Active tasks whose `next_run` has come due.
    pub fn due_tasks(&self, now: &str) -> Result<Vec<Task>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, group_folder, channel_id, prompt, schedule_type, schedule_value,
                    context_mode, status, next_run, created_at
             FROM tasks
             WHERE status = 'active' AND next_run IS NOT NULL AND next_run <= ?1
             ORDER BY next_run ASC",
        )?;
        let rows = stmt.query_map(params![now], map_task_row)?;

        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(task_from_raw(row?)?);
        }
        Ok(tasks)
    }

    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                "SELECT id, group_folder, channel_id, prompt, schedule_type, schedule_value,
                        context_mode, status, next_run, created_at
                 FROM tasks WHERE id = ?1",
                params![id],
                map_task_row,
            )
            .optional()?;
        raw.map(task_from_raw).transpose()
    }

    pub fn list_tasks(&self, group_folder: Option<&str>) -> Result<Vec<Task>> {
        let conn = self.lock()?;
        let mut tasks = Vec::new();
        if let Some(folder) = group_folder {
            let mut stmt = conn.prepare(
                "SELECT id, group_folder, channel_id, prompt, schedule_type, schedule_value,
                        context_mode, status, next_run, created_at
                 FROM tasks WHERE group_folder = ?1 ORDER BY created_at ASC",
            )?;
            let rows = stmt.query_map(params![folder], map_task_row)?;
            for row in rows {
                tasks.push(task_from_raw(row?)?);
            }
        } else {
            let mut stmt = conn.prepare(
                "SELECT id, group_folder, channel_id, prompt, schedule_type, schedule_value,
                        context_mode, status, next_run, created_at
                 FROM tasks ORDER BY created_at ASC",
            )?;
            let rows = stmt.query_map([], map_task_row)?;
            for row in rows {
                tasks.push(task_from_raw(row?)?);
            }
        }
        Ok(tasks)
    }

    pub fn set_task_next_run(&self, id: &str, next_run: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE tasks SET next_run = ?1 WHERE id = ?2",
            params![next_run, id],
        )
        .context("Failed to update task next_run")?;
        Ok(())
    }

    pub fn set_task_status(&self, id: &str, status: TaskStatus) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE tasks SET status = ?1 WHERE id = ?2",
            params![status.as_db(), id],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_task(&self, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let deleted = conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }
}

type RawTaskRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    String,
);

fn map_task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawTaskRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn task_from_raw(raw: RawTaskRow) -> Result<Task> {
    let (
        id,
        group_folder,
        channel_id,
        prompt,
        schedule_type,
        schedule_value,
        context_mode,
        status,
        next_run,
        created_at,
    ) = raw;

    let schedule_kind = ScheduleKind::parse(&schedule_type)
        .with_context(|| format!("Unknown schedule type in tasks row {id}: {schedule_type}"))?;
    let context_mode = ContextMode::parse(&context_mode)
        .with_context(|| format!("Unknown context mode in tasks row {id}: {context_mode}"))?;

    Ok(Task {
        id,
        group_folder,
        channel_id,
        prompt,
        schedule_kind,
        schedule_value,
        context_mode,
        status: TaskStatus::from_db(&status),
        next_run,
        created_at,
    })
}
