// Recovery and sync: replay of messages missed during a disconnect.
//
// Recovery ids are HMAC-derived tokens bound to a prior connection id and a
// timestamp. Validation is structural only (64 lowercase hex chars) — the
// original system never re-verifies the HMAC, and that behavior is kept
// deliberately rather than silently strengthened.

use anyhow::Context;
use chrono::Utc;
use fanline_common::protocol::ws::{
    RecoveryCompleteData, ServerFrame, SyncCompleteData,
};
use std::sync::Arc;
use tracing::info;

use crate::channels::ChannelDirectory;
use crate::registry::{ConnectionId, ConnectionRegistry, ConnectionState};
use crate::signing;
use crate::store::{MessageStore, StoredMessage};

/// What a replay pass delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaySummary {
    pub message_count: usize,
    pub last_message_id: Option<String>,
}

pub struct RecoveryEngine {
    store: MessageStore,
    registry: ConnectionRegistry,
    directory: Arc<ChannelDirectory>,
    secret: String,
}

impl RecoveryEngine {
    pub fn new(
        store: MessageStore,
        registry: ConnectionRegistry,
        directory: Arc<ChannelDirectory>,
        secret: impl Into<String>,
    ) -> Self {
        Self { store, registry, directory, secret: secret.into() }
    }

    /// Mint a recovery token for a connection: HMAC-SHA256 of
    /// `"{connection_id}:{unix_millis}"`, hex-encoded.
    pub fn generate_recovery_id(&self, connection_id: ConnectionId) -> String {
        signing::sign(
            &self.secret,
            &format!("{connection_id}:{}", Utc::now().timestamp_millis()),
        )
    }

    /// Structural check only: 64 lowercase hex characters.
    pub fn is_valid_recovery_id(token: &str) -> bool {
        token.len() == 64 && token.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    }

    /// Resume one channel on a subscribe request that carried a recovery id:
    /// replay the backlog, re-attach the membership, and confirm with a
    /// `recovery_complete` summary.
    pub async fn recover_connection(
        &self,
        connection_id: ConnectionId,
        recovery_id: &str,
        channel: &str,
        last_message_id: Option<&str>,
    ) -> anyhow::Result<ReplaySummary> {
        self.registry.set_state(connection_id, ConnectionState::Reconnecting).await;

        let messages = self
            .store
            .get_messages_after(channel, last_message_id)
            .await
            .context("failed to load channel backlog for recovery")?;
        let summary = self.deliver(connection_id, &messages, Some(recovery_id)).await;

        self.directory.restore_subscription(connection_id, channel).await;
        self.registry.set_state(connection_id, ConnectionState::Subscribed).await;

        info!(
            connection_id = %connection_id,
            channel,
            recovered = summary.message_count,
            "connection recovered"
        );
        self.send_recovery_complete(connection_id, recovery_id, &summary).await;
        Ok(summary)
    }

    /// Replay across every channel the connection is subscribed to, merged
    /// and delivered in ascending creation order, then one
    /// `recovery_complete` summary.
    pub async fn process_missed_messages(
        &self,
        connection_id: ConnectionId,
        recovery_id: &str,
        last_message_id: Option<&str>,
    ) -> anyhow::Result<ReplaySummary> {
        self.registry.set_state(connection_id, ConnectionState::Reconnecting).await;

        let channels = self.directory.channels_for(connection_id).await;
        let mut merged: Vec<StoredMessage> = Vec::new();
        for channel in &channels {
            let messages = self
                .store
                .get_messages_after(channel, last_message_id)
                .await
                .with_context(|| format!("failed to load backlog for channel {channel}"))?;
            merged.extend(messages);
        }
        merged.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let summary = self.deliver(connection_id, &merged, Some(recovery_id)).await;
        self.registry.set_state(connection_id, ConnectionState::Subscribed).await;

        info!(
            connection_id = %connection_id,
            channels = channels.len(),
            recovered = summary.message_count,
            "missed messages replayed"
        );
        self.send_recovery_complete(connection_id, recovery_id, &summary).await;
        Ok(summary)
    }

    /// Client-initiated backlog pull for one channel. No state change;
    /// finishes with a `sync_complete` summary.
    pub async fn handle_sync(
        &self,
        connection_id: ConnectionId,
        channel: &str,
        last_message_id: Option<&str>,
        reply_id: Option<String>,
    ) -> anyhow::Result<ReplaySummary> {
        let messages = self
            .store
            .get_messages_after(channel, last_message_id)
            .await
            .context("failed to load channel backlog for sync")?;
        let summary = self.deliver(connection_id, &messages, None).await;

        self.registry
            .send_to(
                connection_id,
                ServerFrame::SyncComplete {
                    data: SyncCompleteData {
                        channel: channel.to_string(),
                        message_count: summary.message_count,
                        last_message_id: summary.last_message_id.clone(),
                    },
                    id: reply_id,
                },
            )
            .await;

        Ok(summary)
    }

    /// Push stored messages to one connection in the order given.
    async fn deliver(
        &self,
        connection_id: ConnectionId,
        messages: &[StoredMessage],
        recovery_id: Option<&str>,
    ) -> ReplaySummary {
        let mut last_message_id = None;
        for message in messages {
            self.registry
                .send_to(
                    connection_id,
                    ServerFrame::Message {
                        data: message.data.clone(),
                        message_id: message.id.clone(),
                        timestamp: message.created_at,
                        recovery_id: recovery_id.map(str::to_string),
                    },
                )
                .await;
            last_message_id = Some(message.id.clone());
        }

        ReplaySummary { message_count: messages.len(), last_message_id }
    }

    async fn send_recovery_complete(
        &self,
        connection_id: ConnectionId,
        recovery_id: &str,
        summary: &ReplaySummary,
    ) {
        self.registry
            .send_to(
                connection_id,
                ServerFrame::RecoveryComplete {
                    data: RecoveryCompleteData {
                        recovery_id: recovery_id.to_string(),
                        message_count: summary.message_count,
                        last_message_id: summary.last_message_id.clone(),
                    },
                },
            )
            .await;
    }
}
