// Channel directory: owns channel existence and subscription membership.
//
// Both directions of the connection<->channel relation (the channel's
// subscriber set and the connection's membership set) live behind one lock,
// so subscribe/unsubscribe update them in a single critical section and the
// two sides can never drift apart.

use fanline_common::channel::{valid_channel_name, ChannelKind};
use fanline_common::protocol::ws::{ErrorCode, ErrorData, MemberData};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::registry::ConnectionId;
use crate::signing;

struct PresenceMember {
    info: Value,
    connections: HashSet<ConnectionId>,
}

struct Channel {
    kind: ChannelKind,
    subscribers: HashSet<ConnectionId>,
    roster: HashMap<String, PresenceMember>,
}

impl Channel {
    fn new(kind: ChannelKind) -> Self {
        Self { kind, subscribers: HashSet::new(), roster: HashMap::new() }
    }
}

#[derive(Default)]
struct DirectoryState {
    channels: HashMap<String, Channel>,
    memberships: HashMap<ConnectionId, HashSet<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeError {
    InvalidChannelName,
    InvalidAuthentication,
    MissingUserId,
}

impl SubscribeError {
    pub fn error_data(&self) -> ErrorData {
        match self {
            Self::InvalidChannelName => {
                ErrorData::new(ErrorCode::MissingField, "Invalid channel name")
            }
            Self::InvalidAuthentication => {
                ErrorData::new(ErrorCode::AuthRequired, "Invalid authentication")
            }
            Self::MissingUserId => ErrorData::new(ErrorCode::MissingField, "User ID is required"),
        }
    }
}

/// Result of a successful subscribe, carrying the presence notifications the
/// caller must deliver.
#[derive(Debug, Clone, Default)]
pub struct Subscribed {
    pub channel: String,
    pub already_subscribed: bool,
    /// `member_added` frames owed to the joiner, one per existing member.
    pub existing_members: Vec<MemberData>,
    /// `member_added` broadcast about the joiner and its recipients. Set
    /// only when this subscribe brought the user online in the channel.
    pub joined: Option<(MemberData, Vec<ConnectionId>)>,
}

#[derive(Debug, Clone, Default)]
pub struct Unsubscribed {
    pub removed: bool,
    pub channel_dropped: bool,
    /// `member_removed` broadcast owed to remaining members. Set only when
    /// the user's last connection left the channel.
    pub member_left: Option<(MemberData, Vec<ConnectionId>)>,
}

pub struct ChannelDirectory {
    state: Arc<RwLock<DirectoryState>>,
    secret: String,
}

impl ChannelDirectory {
    pub fn new(secret: impl Into<String>) -> Self {
        Self { state: Arc::new(RwLock::new(DirectoryState::default())), secret: secret.into() }
    }

    /// The signature a client must present to join `channel` over
    /// `connection_id`: hex HMAC-SHA256 of `"{connection_id}:{channel}"`.
    pub fn sign_subscription(&self, connection_id: ConnectionId, channel: &str) -> String {
        signing::sign(&self.secret, &format!("{connection_id}:{channel}"))
    }

    pub async fn subscribe(
        &self,
        connection_id: ConnectionId,
        request: &SubscribeSpec<'_>,
    ) -> Result<Subscribed, SubscribeError> {
        if !valid_channel_name(request.channel) {
            return Err(SubscribeError::InvalidChannelName);
        }

        let kind = ChannelKind::of(request.channel);
        let presence_user = match kind {
            ChannelKind::Private => {
                let authorized = request.signature.is_some_and(|signature| {
                    signing::verify(
                        &self.secret,
                        &format!("{connection_id}:{}", request.channel),
                        signature,
                    )
                });
                if !authorized {
                    return Err(SubscribeError::InvalidAuthentication);
                }
                None
            }
            ChannelKind::Presence => {
                Some(request.user_id.ok_or(SubscribeError::MissingUserId)?.to_string())
            }
            ChannelKind::Public => None,
        };

        let mut guard = self.state.write().await;
        let channel = guard
            .channels
            .entry(request.channel.to_string())
            .or_insert_with(|| Channel::new(kind));
        let inserted = channel.subscribers.insert(connection_id);

        let mut outcome = Subscribed {
            channel: request.channel.to_string(),
            already_subscribed: !inserted,
            ..Default::default()
        };

        if let Some(user_id) = presence_user {
            if inserted {
                outcome.existing_members = channel
                    .roster
                    .iter()
                    .filter(|(member_id, _)| **member_id != user_id)
                    .map(|(member_id, member)| MemberData {
                        user_id: member_id.clone(),
                        user_info: member.info.clone(),
                    })
                    .collect();

                let member = channel.roster.entry(user_id.clone()).or_insert_with(|| {
                    PresenceMember { info: request.user_info.clone(), connections: HashSet::new() }
                });
                let came_online = member.connections.is_empty();
                member.connections.insert(connection_id);

                if came_online {
                    let recipients: Vec<ConnectionId> = channel
                        .subscribers
                        .iter()
                        .copied()
                        .filter(|subscriber| *subscriber != connection_id)
                        .collect();
                    outcome.joined = Some((
                        MemberData { user_id, user_info: request.user_info.clone() },
                        recipients,
                    ));
                }
            }
        }

        guard.memberships.entry(connection_id).or_default().insert(request.channel.to_string());

        Ok(outcome)
    }

    /// Re-attach a recovered connection to a channel it held before the
    /// disconnect. Skips authorization: the recovery id already vouched for
    /// the prior session. Presence rosters are not touched (the member info
    /// did not survive the disconnect).
    pub async fn restore_subscription(&self, connection_id: ConnectionId, channel_name: &str) {
        if !valid_channel_name(channel_name) {
            return;
        }
        let mut guard = self.state.write().await;
        let channel = guard
            .channels
            .entry(channel_name.to_string())
            .or_insert_with(|| Channel::new(ChannelKind::of(channel_name)));
        channel.subscribers.insert(connection_id);
        guard.memberships.entry(connection_id).or_default().insert(channel_name.to_string());
    }

    pub async fn unsubscribe(
        &self,
        connection_id: ConnectionId,
        channel_name: &str,
    ) -> Unsubscribed {
        let mut guard = self.state.write().await;
        unsubscribe_locked(&mut guard, connection_id, channel_name)
    }

    /// Remove a connection from every channel it belongs to. Returns the
    /// per-channel outcomes so the caller can deliver presence departures.
    pub async fn remove_connection(
        &self,
        connection_id: ConnectionId,
    ) -> Vec<(String, Unsubscribed)> {
        let mut guard = self.state.write().await;
        let channels: Vec<String> = guard
            .memberships
            .get(&connection_id)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default();

        channels
            .into_iter()
            .map(|channel_name| {
                let outcome = unsubscribe_locked(&mut guard, connection_id, &channel_name);
                (channel_name, outcome)
            })
            .collect()
    }

    pub async fn channels_for(&self, connection_id: ConnectionId) -> HashSet<String> {
        self.state
            .read()
            .await
            .memberships
            .get(&connection_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn subscribers_of(&self, channel_name: &str) -> Vec<ConnectionId> {
        self.state
            .read()
            .await
            .channels
            .get(channel_name)
            .map(|channel| channel.subscribers.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn channel_exists(&self, channel_name: &str) -> bool {
        self.state.read().await.channels.contains_key(channel_name)
    }

    /// Subscriber count per channel, for stats.
    pub async fn channel_counts(&self) -> HashMap<String, usize> {
        self.state
            .read()
            .await
            .channels
            .iter()
            .map(|(name, channel)| (name.clone(), channel.subscribers.len()))
            .collect()
    }

    pub async fn presence_roster(&self, channel_name: &str) -> Vec<MemberData> {
        self.state
            .read()
            .await
            .channels
            .get(channel_name)
            .map(|channel| {
                channel
                    .roster
                    .iter()
                    .map(|(user_id, member)| MemberData {
                        user_id: user_id.clone(),
                        user_info: member.info.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// What a subscribe attempt presents for authorization.
#[derive(Debug, Clone, Copy)]
pub struct SubscribeSpec<'a> {
    pub channel: &'a str,
    pub signature: Option<&'a str>,
    pub user_id: Option<&'a str>,
    pub user_info: &'a Value,
}

fn unsubscribe_locked(
    state: &mut DirectoryState,
    connection_id: ConnectionId,
    channel_name: &str,
) -> Unsubscribed {
    let mut outcome = Unsubscribed::default();

    if let Some(channel) = state.channels.get_mut(channel_name) {
        outcome.removed = channel.subscribers.remove(&connection_id);

        if outcome.removed && channel.kind == ChannelKind::Presence {
            let departed_user = channel.roster.iter_mut().find_map(|(user_id, member)| {
                if member.connections.remove(&connection_id) && member.connections.is_empty() {
                    Some(user_id.clone())
                } else {
                    None
                }
            });
            if let Some(user_id) = departed_user {
                let member = channel
                    .roster
                    .remove(&user_id)
                    .map(|member| MemberData { user_id, user_info: member.info });
                if let Some(member) = member {
                    let recipients: Vec<ConnectionId> =
                        channel.subscribers.iter().copied().collect();
                    outcome.member_left = Some((member, recipients));
                }
            }
        }

        if channel.subscribers.is_empty() {
            state.channels.remove(channel_name);
            outcome.channel_dropped = true;
        }
    }

    if let Some(names) = state.memberships.get_mut(&connection_id) {
        names.remove(channel_name);
        if names.is_empty() {
            state.memberships.remove(&connection_id);
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::{ChannelDirectory, SubscribeError, SubscribeSpec};
    use crate::registry::ConnectionId;
    use serde_json::{json, Value};
    use uuid::Uuid;

    const SECRET: &str = "directory_test_secret";

    fn directory() -> ChannelDirectory {
        ChannelDirectory::new(SECRET)
    }

    fn connection(index: u128) -> ConnectionId {
        Uuid::from_u128(index)
    }

    fn public_spec(channel: &str) -> SubscribeSpec<'_> {
        SubscribeSpec { channel, signature: None, user_id: None, user_info: &Value::Null }
    }

    // ── Public channels and mutual membership ──────────────────────

    #[tokio::test]
    async fn subscribe_keeps_both_sides_consistent() {
        let directory = directory();
        let a = connection(1);
        let b = connection(2);

        directory.subscribe(a, &public_spec("orders")).await.expect("subscribe should succeed");
        directory.subscribe(a, &public_spec("blocks")).await.expect("subscribe should succeed");
        directory.subscribe(b, &public_spec("orders")).await.expect("subscribe should succeed");

        let channels_of_a = directory.channels_for(a).await;
        assert_eq!(channels_of_a.len(), 2);
        for channel in &channels_of_a {
            assert!(
                directory.subscribers_of(channel).await.contains(&a),
                "membership of {channel} must be mirrored on the channel side",
            );
        }
        assert_eq!(directory.subscribers_of("orders").await.len(), 2);
    }

    #[tokio::test]
    async fn empty_channels_are_dropped_and_recreated_fresh() {
        let directory = directory();
        let a = connection(1);
        let info = json!({"name": "alice"});
        let spec = SubscribeSpec {
            channel: "presence-lobby",
            signature: None,
            user_id: Some("7"),
            user_info: &info,
        };

        directory.subscribe(a, &spec).await.expect("subscribe should succeed");
        assert!(directory.channel_exists("presence-lobby").await);

        let outcome = directory.unsubscribe(a, "presence-lobby").await;
        assert!(outcome.removed);
        assert!(outcome.channel_dropped);
        assert!(!directory.channel_exists("presence-lobby").await);

        // A later subscribe sees a fresh channel with no residual roster.
        let resubscribed =
            directory.subscribe(connection(2), &public_spec("presence-lobby")).await;
        assert_eq!(
            resubscribed.expect_err("presence channel still requires a user id"),
            SubscribeError::MissingUserId
        );
        let fresh = directory
            .subscribe(connection(2), &spec)
            .await
            .expect("fresh subscribe should succeed");
        assert!(fresh.existing_members.is_empty(), "no roster state may leak across recreation");
    }

    #[tokio::test]
    async fn invalid_channel_names_are_rejected() {
        let directory = directory();
        let result = directory.subscribe(connection(1), &public_spec("has spaces")).await;
        assert_eq!(result.expect_err("invalid name"), SubscribeError::InvalidChannelName);
    }

    // ── Private channels ───────────────────────────────────────────

    #[tokio::test]
    async fn private_channel_requires_matching_signature() {
        let directory = directory();
        let a = connection(1);

        let missing = directory
            .subscribe(
                a,
                &SubscribeSpec {
                    channel: "private-orders",
                    signature: None,
                    user_id: None,
                    user_info: &Value::Null,
                },
            )
            .await;
        assert_eq!(missing.expect_err("no signature"), SubscribeError::InvalidAuthentication);

        let forged = directory
            .subscribe(
                a,
                &SubscribeSpec {
                    channel: "private-orders",
                    signature: Some(&"0".repeat(64)),
                    user_id: None,
                    user_info: &Value::Null,
                },
            )
            .await;
        assert_eq!(forged.expect_err("forged signature"), SubscribeError::InvalidAuthentication);

        let signature = directory.sign_subscription(a, "private-orders");
        directory
            .subscribe(
                a,
                &SubscribeSpec {
                    channel: "private-orders",
                    signature: Some(&signature),
                    user_id: None,
                    user_info: &Value::Null,
                },
            )
            .await
            .expect("valid signature should subscribe");

        // The signature is bound to the connection id.
        let other = connection(2);
        let stolen = directory
            .subscribe(
                other,
                &SubscribeSpec {
                    channel: "private-orders",
                    signature: Some(&signature),
                    user_id: None,
                    user_info: &Value::Null,
                },
            )
            .await;
        assert_eq!(stolen.expect_err("signature replay"), SubscribeError::InvalidAuthentication);
    }

    // ── Presence channels ──────────────────────────────────────────

    #[tokio::test]
    async fn presence_join_reports_existing_members_and_notifies_others() {
        let directory = directory();
        let a = connection(1);
        let b = connection(2);
        let alice = json!({"name": "alice"});
        let bob = json!({"name": "bob"});

        let first = directory
            .subscribe(
                a,
                &SubscribeSpec {
                    channel: "presence-lobby",
                    signature: None,
                    user_id: Some("7"),
                    user_info: &alice,
                },
            )
            .await
            .expect("first join should succeed");
        assert!(first.existing_members.is_empty());
        let (member, recipients) = first.joined.expect("first join brings the user online");
        assert_eq!(member.user_id, "7");
        assert!(recipients.is_empty(), "nobody else to notify yet");

        let second = directory
            .subscribe(
                b,
                &SubscribeSpec {
                    channel: "presence-lobby",
                    signature: None,
                    user_id: Some("8"),
                    user_info: &bob,
                },
            )
            .await
            .expect("second join should succeed");
        assert_eq!(second.existing_members.len(), 1);
        assert_eq!(second.existing_members[0].user_id, "7");
        let (member, recipients) = second.joined.expect("second user also comes online");
        assert_eq!(member.user_id, "8");
        assert_eq!(recipients, vec![a]);
    }

    #[tokio::test]
    async fn member_removed_only_when_last_connection_leaves() {
        let directory = directory();
        let first = connection(1);
        let second = connection(2);
        let observer = connection(3);
        let info = json!({"name": "alice"});
        let spec = SubscribeSpec {
            channel: "presence-lobby",
            signature: None,
            user_id: Some("7"),
            user_info: &info,
        };

        directory.subscribe(first, &spec).await.expect("first connection should join");
        directory.subscribe(second, &spec).await.expect("second connection should join");
        directory
            .subscribe(
                observer,
                &SubscribeSpec {
                    channel: "presence-lobby",
                    signature: None,
                    user_id: Some("9"),
                    user_info: &Value::Null,
                },
            )
            .await
            .expect("observer should join");

        // User 7 still online through the second connection.
        let outcome = directory.unsubscribe(first, "presence-lobby").await;
        assert!(outcome.member_left.is_none());

        let outcome = directory.unsubscribe(second, "presence-lobby").await;
        let (member, recipients) = outcome.member_left.expect("last connection left");
        assert_eq!(member.user_id, "7");
        assert_eq!(recipients, vec![observer]);
    }

    // ── Close-time cleanup ─────────────────────────────────────────

    #[tokio::test]
    async fn remove_connection_clears_every_membership() {
        let directory = directory();
        let a = connection(1);
        let info = json!({"name": "alice"});

        directory.subscribe(a, &public_spec("orders")).await.expect("should subscribe");
        directory
            .subscribe(
                a,
                &SubscribeSpec {
                    channel: "presence-lobby",
                    signature: None,
                    user_id: Some("7"),
                    user_info: &info,
                },
            )
            .await
            .expect("should subscribe");

        let outcomes = directory.remove_connection(a).await;
        assert_eq!(outcomes.len(), 2);
        assert!(directory.channels_for(a).await.is_empty());
        assert!(!directory.channel_exists("orders").await);
        assert!(!directory.channel_exists("presence-lobby").await);

        // Removing again is a no-op.
        assert!(directory.remove_connection(a).await.is_empty());
    }

    #[tokio::test]
    async fn restore_subscription_skips_authorization() {
        let directory = directory();
        let a = connection(1);

        directory.restore_subscription(a, "private-orders").await;
        assert!(directory.subscribers_of("private-orders").await.contains(&a));
        assert!(directory.channels_for(a).await.contains("private-orders"));
    }
}
