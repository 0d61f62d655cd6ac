// Connection protocol handler.
//
// One task per connection drives the lifecycle state machine:
// connecting -> authenticated -> subscribed, with reconnecting as a side
// branch and closed from anywhere. The select loop owns every timer (auth
// deadline, ping schedule), so cancellation on close is structural — the
// timers die with the task.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::Utc;
use fanline_common::protocol::ws::{
    close_code, AckReceivedData, ClientCommand, ClientFrame, ErrorCode, ErrorData, PongData,
    ReconnectAckData, RejectionData, ServerFrame, SubscribeRequest, WelcomeData,
};
use serde::Deserialize;
use serde_json::Value;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::channels::SubscribeSpec;
use crate::metrics;
use crate::recovery::RecoveryEngine;
use crate::registry::{ConnectionId, ConnectionState, ThrottleDecision};
use crate::state::RelayState;
use crate::throttle::ViolationOutcome;

pub fn router(state: RelayState) -> Router {
    Router::new().route("/v1/ws", get(ws_upgrade)).with_state(state)
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    #[serde(default)]
    token: Option<String>,
}

async fn ws_upgrade(
    State(state): State<RelayState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let ip = client_ip(&headers, peer);
    ws.on_upgrade(move |socket| handle_socket(state, socket, ip, params.token))
}

/// What the select loop decided to do after a frame.
enum LoopControl {
    Continue,
    Close(Option<(u16, &'static str)>),
}

async fn handle_socket(state: RelayState, mut socket: WebSocket, ip: IpAddr, token: Option<String>) {
    // Banned IPs are turned away before any registration happens.
    if state.guard.is_banned(ip).await {
        metrics::record_rejection("ip_banned");
        warn!(ip = %ip, "rejected connection from banned IP");
        let _ = send_frame(
            &mut socket,
            &ServerFrame::ConnectionRejected {
                data: RejectionData {
                    reason: "too_many_violations".to_string(),
                    retry_after: state.config.ban_duration_secs,
                },
            },
        )
        .await;
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    // The token (when supplied) is verified before admission so the
    // per-user cap can be enforced.
    let user_id = match token.as_deref() {
        Some(token) => match state.verifier.verify(token) {
            Ok(user_id) => Some(user_id),
            Err(error) => {
                debug!(ip = %ip, error = %error, "token verification failed");
                let _ = send_frame(
                    &mut socket,
                    &ServerFrame::Error {
                        data: ErrorData::new(ErrorCode::AuthRequired, "Invalid token"),
                        id: None,
                    },
                )
                .await;
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::AUTH_TIMEOUT,
                        reason: "Invalid token".into(),
                    })))
                    .await;
                return;
            }
        },
        None => None,
    };

    let connection_id = match state.registry.register(ip, user_id.clone()).await {
        Ok(connection_id) => connection_id,
        Err(rejection) => {
            metrics::record_rejection(rejection.label());
            info!(ip = %ip, rejection = rejection.label(), "connection rejected");
            let _ = send_frame(
                &mut socket,
                &ServerFrame::ConnectionRejected {
                    data: RejectionData {
                        reason: rejection.reason().to_string(),
                        retry_after: state.config.ban_duration_secs,
                    },
                },
            )
            .await;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };
    metrics::connection_opened();
    info!(connection_id = %connection_id, ip = %ip, "connection opened");

    let authenticated = user_id.is_some();
    if authenticated {
        state.registry.set_state(connection_id, ConnectionState::Authenticated).await;
    }

    let welcome = ServerFrame::Welcome {
        data: WelcomeData {
            connection_id: connection_id.to_string(),
            message: "Connected to fanline relay".to_string(),
            server_time: Utc::now().to_rfc3339(),
            requires_auth: true,
            ping_interval: state.config.ping_interval_secs,
        },
    };
    if send_frame(&mut socket, &welcome).await.is_err() {
        cleanup_connection(&state, connection_id).await;
        return;
    }

    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<ServerFrame>();
    state.registry.attach_outbound(connection_id, outbound_sender).await;

    let mut ping_interval =
        tokio::time::interval(Duration::from_secs(state.config.ping_interval_secs.max(1)));
    ping_interval.reset(); // skip immediate first tick
    let mut missed_pings: u32 = 0;
    let auth_deadline = Instant::now() + Duration::from_secs(state.config.auth_timeout_secs);

    let close = loop {
        tokio::select! {
            _ = tokio::time::sleep_until(auth_deadline), if !authenticated => {
                // Still `connecting` past the deadline.
                warn!(connection_id = %connection_id, "authentication timeout");
                break Some((close_code::AUTH_TIMEOUT, "Authentication timeout"));
            }
            _ = ping_interval.tick() => {
                if missed_pings >= state.config.max_missed_pings {
                    warn!(connection_id = %connection_id, missed_pings, "ping liveness lost");
                    break None;
                }
                missed_pings += 1;
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break None;
                }
            }
            maybe_outbound = outbound_receiver.recv() => {
                match maybe_outbound {
                    Some(frame) => {
                        if send_frame(&mut socket, &frame).await.is_err() {
                            break None;
                        }
                    }
                    None => break None,
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break None;
                };

                match message {
                    Ok(Message::Text(raw)) => {
                        match handle_inbound(&state, connection_id, ip, raw.as_str()).await {
                            LoopControl::Continue => {}
                            LoopControl::Close(close) => break close,
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break None;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        missed_pings = 0;
                    }
                    Ok(Message::Close(_)) => break None,
                    Ok(_) => {}
                    Err(_) => break None,
                }
            }
        }
    };

    // Flush frames still queued (rejection notices, presence departures)
    // before the close frame goes out.
    while let Ok(frame) = outbound_receiver.try_recv() {
        if send_frame(&mut socket, &frame).await.is_err() {
            break;
        }
    }
    if let Some((code, reason)) = close {
        let _ = socket
            .send(Message::Close(Some(CloseFrame { code, reason: reason.into() })))
            .await;
    }

    cleanup_connection(&state, connection_id).await;
    info!(connection_id = %connection_id, "connection closed");
}

/// Process one inbound text frame: throttle gate, decode, dispatch, ack.
async fn handle_inbound(
    state: &RelayState,
    connection_id: ConnectionId,
    ip: IpAddr,
    raw: &str,
) -> LoopControl {
    state.registry.note_inbound(connection_id, raw.len() as u64).await;

    // Admission check comes before any parsing work.
    if let ThrottleDecision::Denied(kind) =
        state.registry.admit_frame(connection_id, raw.len() as u64).await
    {
        metrics::record_throttle_violation();
        warn!(connection_id = %connection_id, ip = %ip, kind = kind.as_str(), "throttle violation");
        state
            .registry
            .send_to(
                connection_id,
                ServerFrame::Error {
                    data: ErrorData::new(ErrorCode::RateLimited, kind.as_str())
                        .with_retry_after(state.config.ban_duration_secs),
                    id: None,
                },
            )
            .await;

        if state.guard.record_violation(ip).await == ViolationOutcome::Banned {
            metrics::record_ip_ban();
            warn!(ip = %ip, "IP banned after repeated violations");
            state
                .registry
                .send_to(
                    connection_id,
                    ServerFrame::ConnectionRejected {
                        data: RejectionData {
                            reason: "too_many_violations".to_string(),
                            retry_after: state.config.ban_duration_secs,
                        },
                    },
                )
                .await;
            return LoopControl::Close(Some((
                close_code::POLICY_VIOLATION,
                "too many violations",
            )));
        }
        return LoopControl::Continue;
    }

    let frame: ClientFrame = match serde_json::from_str(raw) {
        Ok(frame) => frame,
        Err(_) => {
            state
                .registry
                .send_to(
                    connection_id,
                    ServerFrame::Error {
                        data: ErrorData::new(ErrorCode::MissingField, "Invalid frame payload"),
                        id: None,
                    },
                )
                .await;
            return LoopControl::Continue;
        }
    };

    let request = match frame.classify() {
        Ok(request) => request,
        Err(frame_error) => {
            state
                .registry
                .send_to(
                    connection_id,
                    ServerFrame::Error {
                        data: ErrorData::new(frame_error.error_code(), frame_error.to_string()),
                        id: None,
                    },
                )
                .await;
            return LoopControl::Continue;
        }
    };

    let command_name = request.command.name();
    let reply_id = request.id.clone();
    let started_at = Instant::now();

    match dispatch_command(state, connection_id, request.command, reply_id.clone()).await {
        Ok(()) => {
            metrics::record_ws_request(
                command_name,
                false,
                started_at.elapsed().as_millis() as u64,
            );
            // Echo the client correlation id once handling succeeded. The
            // acknowledgment path answers with its own frame instead.
            if command_name != "ack" {
                if let Some(id) = reply_id {
                    state
                        .registry
                        .send_to(
                            connection_id,
                            ServerFrame::Ack { ack: id, timestamp: Utc::now().to_rfc3339() },
                        )
                        .await;
                }
            }
        }
        Err(handler_error) => {
            metrics::record_ws_request(
                command_name,
                true,
                started_at.elapsed().as_millis() as u64,
            );
            error!(
                connection_id = %connection_id,
                command = command_name,
                error = ?handler_error,
                "frame handling failed"
            );
            // Internals stay suppressed unless debug passthrough is on.
            let message = if state.config.debug_errors {
                handler_error.to_string()
            } else {
                ErrorCode::Internal.default_message().to_string()
            };
            state
                .registry
                .send_to(
                    connection_id,
                    ServerFrame::Error {
                        data: ErrorData::new(ErrorCode::Internal, message),
                        id: reply_id,
                    },
                )
                .await;
        }
    }

    LoopControl::Continue
}

async fn dispatch_command(
    state: &RelayState,
    connection_id: ConnectionId,
    command: ClientCommand,
    reply_id: Option<String>,
) -> anyhow::Result<()> {
    match command {
        ClientCommand::Subscribe(request) => {
            handle_subscribe(state, connection_id, request).await
        }
        ClientCommand::Unsubscribe { channel } => {
            handle_unsubscribe(state, connection_id, &channel).await
        }
        ClientCommand::Ping { time } => handle_ping(state, connection_id, time, reply_id).await,
        ClientCommand::Reconnect { recovery_id, last_message_id } => {
            handle_reconnect(state, connection_id, recovery_id, last_message_id, reply_id).await
        }
        ClientCommand::Sync { channel, last_message_id } => {
            state
                .recovery
                .handle_sync(connection_id, &channel, last_message_id.as_deref(), reply_id)
                .await?;
            Ok(())
        }
        ClientCommand::Acknowledge { ack_id } => {
            handle_acknowledge(state, connection_id, ack_id, reply_id).await
        }
        ClientCommand::Unknown { event } => {
            debug!(connection_id = %connection_id, event, "unsupported event type");
            state
                .registry
                .send_to(
                    connection_id,
                    ServerFrame::Error {
                        data: ErrorData::from_code(ErrorCode::UnsupportedEvent),
                        id: reply_id,
                    },
                )
                .await;
            Ok(())
        }
    }
}

async fn handle_subscribe(
    state: &RelayState,
    connection_id: ConnectionId,
    request: SubscribeRequest,
) -> anyhow::Result<()> {
    // A structurally valid recovery id routes to the recovery engine
    // instead of a normal subscribe.
    if let Some(recovery_id) = &request.recovery_id {
        if RecoveryEngine::is_valid_recovery_id(recovery_id) {
            state
                .recovery
                .recover_connection(
                    connection_id,
                    recovery_id,
                    &request.channel,
                    request.last_message_id.as_deref(),
                )
                .await?;
            return Ok(());
        }
    }

    let spec = SubscribeSpec {
        channel: &request.channel,
        signature: request.signature.as_deref(),
        user_id: request.user_id.as_deref(),
        user_info: &request.user_info,
    };
    match state.directory.subscribe(connection_id, &spec).await {
        Ok(subscribed) => {
            // The joiner sees the current roster before its own
            // subscription completes.
            for member in &subscribed.existing_members {
                state
                    .registry
                    .send_to(
                        connection_id,
                        ServerFrame::MemberAdded {
                            channel: subscribed.channel.clone(),
                            data: member.clone(),
                        },
                    )
                    .await;
            }
            if let Some((member, recipients)) = &subscribed.joined {
                for recipient in recipients {
                    state
                        .registry
                        .send_to(
                            *recipient,
                            ServerFrame::MemberAdded {
                                channel: subscribed.channel.clone(),
                                data: member.clone(),
                            },
                        )
                        .await;
                }
            }
            state
                .registry
                .send_to(
                    connection_id,
                    ServerFrame::SubscriptionSucceeded {
                        channel: subscribed.channel.clone(),
                        data: Value::Null,
                    },
                )
                .await;
            state.registry.set_state(connection_id, ConnectionState::Subscribed).await;
        }
        Err(subscribe_error) => {
            state
                .registry
                .send_to(
                    connection_id,
                    ServerFrame::SubscriptionError {
                        channel: request.channel.clone(),
                        data: subscribe_error.error_data(),
                    },
                )
                .await;
        }
    }
    Ok(())
}

async fn handle_unsubscribe(
    state: &RelayState,
    connection_id: ConnectionId,
    channel: &str,
) -> anyhow::Result<()> {
    let outcome = state.directory.unsubscribe(connection_id, channel).await;
    if let Some((member, recipients)) = outcome.member_left {
        for recipient in recipients {
            state
                .registry
                .send_to(
                    recipient,
                    ServerFrame::MemberRemoved {
                        channel: channel.to_string(),
                        data: member.clone(),
                    },
                )
                .await;
        }
    }
    Ok(())
}

async fn handle_ping(
    state: &RelayState,
    connection_id: ConnectionId,
    time: Option<i64>,
    reply_id: Option<String>,
) -> anyhow::Result<()> {
    let now = Utc::now();
    state
        .registry
        .send_to(
            connection_id,
            ServerFrame::Pong {
                data: PongData {
                    time: now.timestamp(),
                    server_time: now.to_rfc3339(),
                    latency: time.map(|sent_at| (now.timestamp() - sent_at).max(0)),
                },
                id: reply_id,
            },
        )
        .await;
    Ok(())
}

async fn handle_reconnect(
    state: &RelayState,
    connection_id: ConnectionId,
    recovery_id: String,
    last_message_id: Option<String>,
    reply_id: Option<String>,
) -> anyhow::Result<()> {
    if !RecoveryEngine::is_valid_recovery_id(&recovery_id) {
        state
            .registry
            .send_to(
                connection_id,
                ServerFrame::Error {
                    data: ErrorData::from_code(ErrorCode::InvalidRecoveryId),
                    id: reply_id,
                },
            )
            .await;
        return Ok(());
    }

    state
        .registry
        .send_to(
            connection_id,
            ServerFrame::ReconnectAck {
                data: ReconnectAckData {
                    recovery_id: recovery_id.clone(),
                    recovered: true,
                    last_message_id: last_message_id.clone(),
                },
                id: reply_id,
            },
        )
        .await;

    state
        .recovery
        .process_missed_messages(connection_id, &recovery_id, last_message_id.as_deref())
        .await?;
    Ok(())
}

async fn handle_acknowledge(
    state: &RelayState,
    connection_id: ConnectionId,
    ack_id: String,
    reply_id: Option<String>,
) -> anyhow::Result<()> {
    if state.store.acknowledge(&ack_id).await? {
        state
            .registry
            .send_to(
                connection_id,
                ServerFrame::AckReceived {
                    data: AckReceivedData { ack_id, status: "delivered".to_string() },
                    id: reply_id,
                },
            )
            .await;
    } else {
        state
            .registry
            .send_to(
                connection_id,
                ServerFrame::Error {
                    data: ErrorData::from_code(ErrorCode::InvalidAck),
                    id: reply_id,
                },
            )
            .await;
    }
    Ok(())
}

/// Tear down everything a connection owned: channel memberships first (with
/// presence departures delivered to the remaining members), then the
/// registry record and its cap counters.
async fn cleanup_connection(state: &RelayState, connection_id: ConnectionId) {
    for (channel, outcome) in state.directory.remove_connection(connection_id).await {
        if let Some((member, recipients)) = outcome.member_left {
            for recipient in recipients {
                state
                    .registry
                    .send_to(
                        recipient,
                        ServerFrame::MemberRemoved { channel: channel.clone(), data: member.clone() },
                    )
                    .await;
            }
        }
    }
    if state.registry.remove(connection_id).await.is_some() {
        metrics::connection_closed();
    }
}

fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> IpAddr {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|first| first.trim().parse().ok())
        .unwrap_or_else(|| peer.ip())
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> Result<(), ()> {
    let encoded = serde_json::to_string(frame).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}
