// Durable message log adapter.
//
// The log itself is owned by an external service; the relay only reads the
// backlog for recovery/sync and flips acknowledgment flags. The Postgres
// variant is a thin query layer over the `channel_messages` table; the
// Memory variant backs tests and single-node development.

use anyhow::Context;
use serde_json::Value;
use sqlx::PgPool;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// One message as the log returns it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub id: String,
    pub data: Value,
    pub created_at: i64,
}

#[derive(Debug, Default)]
pub struct MemoryMessageLog {
    by_channel: HashMap<String, Vec<StoredMessage>>,
    known_ids: HashSet<String>,
    acknowledged: HashSet<String>,
}

#[derive(Clone)]
pub enum MessageStore {
    Postgres(PgPool),
    Memory(Arc<RwLock<MemoryMessageLog>>),
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    data: Value,
    created_at: i64,
}

impl MessageStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("failed to connect to the message log database")?;
        Ok(Self::Postgres(pool))
    }

    pub fn in_memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(MemoryMessageLog::default())))
    }

    /// Messages on `channel` created after the message `last_message_id`,
    /// ascending by creation time. An unknown or absent cursor returns the
    /// full backlog.
    pub async fn get_messages_after(
        &self,
        channel: &str,
        last_message_id: Option<&str>,
    ) -> anyhow::Result<Vec<StoredMessage>> {
        match self {
            Self::Postgres(pool) => {
                let rows: Vec<MessageRow> = match last_message_id {
                    Some(message_id) => sqlx::query_as(
                        r#"
                        SELECT id, data, created_at
                        FROM channel_messages
                        WHERE channel = $1
                          AND created_at > COALESCE(
                              (SELECT created_at FROM channel_messages WHERE id = $2),
                              -1
                          )
                        ORDER BY created_at ASC, id ASC
                        "#,
                    )
                    .bind(channel)
                    .bind(message_id)
                    .fetch_all(pool)
                    .await
                    .context("failed to query messages after cursor")?,
                    None => sqlx::query_as(
                        r#"
                        SELECT id, data, created_at
                        FROM channel_messages
                        WHERE channel = $1
                        ORDER BY created_at ASC, id ASC
                        "#,
                    )
                    .bind(channel)
                    .fetch_all(pool)
                    .await
                    .context("failed to query channel backlog")?,
                };

                Ok(rows
                    .into_iter()
                    .map(|row| StoredMessage {
                        id: row.id,
                        data: row.data,
                        created_at: row.created_at,
                    })
                    .collect())
            }
            Self::Memory(log) => {
                let guard = log.read().await;
                let Some(messages) = guard.by_channel.get(channel) else {
                    return Ok(Vec::new());
                };

                let cursor = last_message_id.and_then(|message_id| {
                    messages
                        .iter()
                        .find(|message| message.id == message_id)
                        .map(|message| message.created_at)
                });

                let mut matched: Vec<StoredMessage> = messages
                    .iter()
                    .filter(|message| cursor.map_or(true, |after| message.created_at > after))
                    .cloned()
                    .collect();
                matched.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
                Ok(matched)
            }
        }
    }

    /// Mark a delivered message acknowledged. Returns false when the id is
    /// unknown or was already acknowledged.
    pub async fn acknowledge(&self, ack_id: &str) -> anyhow::Result<bool> {
        match self {
            Self::Postgres(pool) => {
                let result = sqlx::query(
                    r#"
                    UPDATE channel_messages
                    SET acknowledged_at = NOW()
                    WHERE id = $1 AND acknowledged_at IS NULL
                    "#,
                )
                .bind(ack_id)
                .execute(pool)
                .await
                .context("failed to acknowledge message")?;
                Ok(result.rows_affected() == 1)
            }
            Self::Memory(log) => {
                let mut guard = log.write().await;
                if guard.known_ids.contains(ack_id) && !guard.acknowledged.contains(ack_id) {
                    guard.acknowledged.insert(ack_id.to_string());
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    /// Append a message to the log. The external log service owns writes in
    /// production; this path backs development mode and tests.
    pub async fn append(&self, channel: &str, message: StoredMessage) -> anyhow::Result<()> {
        match self {
            Self::Postgres(pool) => {
                sqlx::query(
                    r#"
                    INSERT INTO channel_messages (id, channel, data, created_at)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (id) DO NOTHING
                    "#,
                )
                .bind(&message.id)
                .bind(channel)
                .bind(&message.data)
                .bind(message.created_at)
                .execute(pool)
                .await
                .context("failed to append message")?;
                Ok(())
            }
            Self::Memory(log) => {
                let mut guard = log.write().await;
                if guard.known_ids.insert(message.id.clone()) {
                    guard.by_channel.entry(channel.to_string()).or_default().push(message);
                }
                Ok(())
            }
        }
    }
}
