// HTTP surface: broadcast ingress for the chain backend, stats snapshots,
// and the metrics endpoint.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use fanline_common::channel::valid_channel_name;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::require_bearer_auth;
use crate::chain::{self, ChainEvent};
use crate::error::{ErrorCode, RelayError};
use crate::metrics;
use crate::state::RelayState;

pub fn router(state: RelayState) -> Router {
    let auth_layer =
        middleware::from_fn_with_state(state.verifier.clone(), require_bearer_auth);

    Router::new()
        .route("/v1/broadcast", post(broadcast_message).route_layer(auth_layer.clone()))
        .route("/v1/chain/events", post(ingest_chain_event).route_layer(auth_layer.clone()))
        .route("/v1/stats", get(global_stats).route_layer(auth_layer.clone()))
        .route(
            "/v1/connections/{connection_id}/stats",
            get(connection_stats).route_layer(auth_layer),
        )
        .route("/metrics", get(render_metrics))
        .with_state(state)
}

fn default_priority() -> u8 {
    3
}

#[derive(Debug, Deserialize)]
struct BroadcastRequest {
    channel: String,
    event: String,
    #[serde(default)]
    data: Value,
    #[serde(default = "default_priority")]
    priority: u8,
    /// Unix timestamp after which the message must not be delivered.
    #[serde(default)]
    expires_at: Option<i64>,
    #[serde(default)]
    immediate: bool,
}

/// `POST /v1/broadcast` — the generic `(channel, event, payload)` ingress
/// for external backends.
async fn broadcast_message(
    State(state): State<RelayState>,
    Json(request): Json<BroadcastRequest>,
) -> impl IntoResponse {
    if !valid_channel_name(&request.channel) {
        return RelayError::new(ErrorCode::ValidationFailed, "invalid channel name")
            .into_response();
    }
    if !(1..=5).contains(&request.priority) {
        return RelayError::new(ErrorCode::ValidationFailed, "priority must be between 1 and 5")
            .into_response();
    }

    let expires_at = match request.expires_at.map(parse_unix_timestamp).transpose() {
        Ok(expires_at) => expires_at,
        Err(response) => return response,
    };

    let payload = json!({ "event": request.event, "data": request.data });
    match state
        .broadcaster
        .queue_message(
            &request.channel,
            payload,
            request.priority,
            expires_at,
            request.immediate,
        )
        .await
    {
        Some(message_id) => {
            (StatusCode::ACCEPTED, Json(json!({ "message_id": message_id }))).into_response()
        }
        // Expired on arrival: accepted as a no-op, never dispatched.
        None => {
            (StatusCode::OK, Json(json!({ "message_id": null, "expired": true }))).into_response()
        }
    }
}

/// `POST /v1/chain/events` — typed chain ingress; one event fans out to the
/// conventional channel set.
async fn ingest_chain_event(
    State(state): State<RelayState>,
    Json(event): Json<ChainEvent>,
) -> impl IntoResponse {
    let message_ids = chain::publish(&state.broadcaster, &event).await;
    (StatusCode::ACCEPTED, Json(json!({ "message_ids": message_ids }))).into_response()
}

async fn global_stats(State(state): State<RelayState>) -> impl IntoResponse {
    let registry_stats = state.registry.global_stats().await;
    let channels = state.directory.channel_counts().await;

    Json(json!({
        "total_connections": registry_stats.total_connections,
        "connections_by_ip": registry_stats.connections_by_ip,
        "connections_by_user": registry_stats.connections_by_user,
        "channels": channels,
    }))
}

async fn connection_stats(
    State(state): State<RelayState>,
    Path(connection_id): Path<String>,
) -> impl IntoResponse {
    let Ok(connection_id) = Uuid::parse_str(&connection_id) else {
        return RelayError::new(ErrorCode::ValidationFailed, "invalid connection id")
            .into_response();
    };

    let Some(stats) = state.registry.connection_stats(connection_id).await else {
        return RelayError::from_code(ErrorCode::NotFound).into_response();
    };
    let channels: Vec<String> = state.directory.channels_for(connection_id).await.into_iter().collect();

    let mut body = serde_json::to_value(&stats).unwrap_or_else(|_| json!({}));
    if let Some(object) = body.as_object_mut() {
        object.insert("channels".to_string(), json!(channels));
    }
    Json(body).into_response()
}

async fn render_metrics() -> impl IntoResponse {
    ([("content-type", "text/plain; version=0.0.4")], metrics::render_global())
}

fn parse_unix_timestamp(timestamp: i64) -> Result<DateTime<Utc>, axum::response::Response> {
    DateTime::<Utc>::from_timestamp(timestamp, 0).ok_or_else(|| {
        RelayError::new(ErrorCode::ValidationFailed, "expires_at is not a valid unix timestamp")
            .into_response()
    })
}

#[cfg(test)]
mod tests {
    use super::router;
    use crate::config::RelayConfig;
    use crate::state::RelayState;
    use crate::store::MessageStore;
    use axum::{
        body::{to_bytes, Body},
        http::{header::AUTHORIZATION, Method, Request, StatusCode},
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn test_config() -> RelayConfig {
        let mut config = RelayConfig::from_env();
        config.jwt_secret = "fanline_test_secret_that_is_definitely_long_enough".into();
        config
    }

    async fn response_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body should be readable");
        serde_json::from_slice(&bytes).expect("response body should be valid json")
    }

    fn authed_post(uri: &str, token: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request should build")
    }

    #[tokio::test]
    async fn broadcast_requires_bearer_auth() {
        let state = RelayState::build(test_config(), MessageStore::in_memory())
            .expect("state should build");
        let response = router(state)
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/v1/broadcast")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({"channel": "c", "event": "e"}).to_string()))
                    .expect("request should build"),
            )
            .await
            .expect("request should return a response");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn broadcast_accepts_and_returns_message_id() {
        let state = RelayState::build(test_config(), MessageStore::in_memory())
            .expect("state should build");
        let token = state.verifier.issue_token("backend").expect("token should be issued");

        let response = router(state)
            .oneshot(authed_post(
                "/v1/broadcast",
                &token,
                json!({"channel": "chain.blocks", "event": "new_block", "data": {"n": 1}}),
            ))
            .await
            .expect("request should return a response");

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = response_json(response).await;
        assert_eq!(body["message_id"].as_str().map(str::len), Some(32));
    }

    #[tokio::test]
    async fn broadcast_rejects_invalid_channel_and_priority() {
        let state = RelayState::build(test_config(), MessageStore::in_memory())
            .expect("state should build");
        let token = state.verifier.issue_token("backend").expect("token should be issued");
        let app = router(state);

        let response = app
            .clone()
            .oneshot(authed_post(
                "/v1/broadcast",
                &token,
                json!({"channel": "has spaces", "event": "e"}),
            ))
            .await
            .expect("request should return a response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(authed_post(
                "/v1/broadcast",
                &token,
                json!({"channel": "ok", "event": "e", "priority": 9}),
            ))
            .await
            .expect("request should return a response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn expired_broadcast_is_a_no_op() {
        let state = RelayState::build(test_config(), MessageStore::in_memory())
            .expect("state should build");
        let token = state.verifier.issue_token("backend").expect("token should be issued");

        let response = router(state)
            .oneshot(authed_post(
                "/v1/broadcast",
                &token,
                json!({"channel": "c", "event": "e", "expires_at": 1}),
            ))
            .await
            .expect("request should return a response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = response_json(response).await;
        assert!(body["message_id"].is_null());
        assert_eq!(body["expired"], true);
    }

    #[tokio::test]
    async fn chain_event_ingress_fans_out() {
        let state = RelayState::build(test_config(), MessageStore::in_memory())
            .expect("state should build");
        let token = state.verifier.issue_token("backend").expect("token should be issued");

        let response = router(state)
            .oneshot(authed_post(
                "/v1/chain/events",
                &token,
                json!({
                    "kind": "transaction",
                    "hash": "tx1",
                    "block_number": 42,
                    "block_hash": "abc",
                    "from": "EQfrom",
                    "to": "EQto",
                    "value": 1.5,
                }),
            ))
            .await
            .expect("request should return a response");

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = response_json(response).await;
        assert_eq!(body["message_ids"].as_array().map(Vec::len), Some(3));
    }

    #[tokio::test]
    async fn connection_stats_returns_not_found_for_unknown_connection() {
        let state = RelayState::build(test_config(), MessageStore::in_memory())
            .expect("state should build");
        let token = state.verifier.issue_token("ops").expect("token should be issued");

        let response = router(state)
            .oneshot(
                Request::builder()
                    .uri(format!("/v1/connections/{}/stats", uuid::Uuid::new_v4()))
                    .header(AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should return a response");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_endpoint_is_public() {
        let state = RelayState::build(test_config(), MessageStore::in_memory())
            .expect("state should build");
        let response = router(state)
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should return a response");

        assert_eq!(response.status(), StatusCode::OK);
    }
}
