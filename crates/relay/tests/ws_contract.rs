// Contract guards: the documented defaults and wire constants must not
// drift without a deliberate change here.

use fanline_common::protocol::ws::{close_code, ErrorCode};

const RELAY_CONFIG_SOURCE: &str = include_str!("../src/config.rs");

#[test]
fn documented_limit_defaults_match_the_contract() {
    let expected = [
        ("FANLINE_RELAY_MAX_CONNECTIONS", "1000"),
        ("FANLINE_RELAY_MAX_CONNECTIONS_PER_IP", "5"),
        ("FANLINE_RELAY_MAX_CONNECTIONS_PER_USER", "3"),
        ("FANLINE_RELAY_MESSAGES_PER_SECOND", "100"),
        ("FANLINE_RELAY_BYTES_PER_SECOND", "1_048_576"),
        ("FANLINE_RELAY_BAN_DURATION_SECS", "300"),
        ("FANLINE_RELAY_MAX_VIOLATIONS", "5"),
        ("FANLINE_RELAY_BATCH_SIZE", "10"),
        ("FANLINE_RELAY_BATCH_MAX_DELAY_MS", "1000"),
        ("FANLINE_RELAY_PING_INTERVAL_SECS", "30"),
        ("FANLINE_RELAY_AUTH_TIMEOUT_SECS", "30"),
        ("FANLINE_RELAY_MAX_DELIVERY_ATTEMPTS", "3"),
        ("FANLINE_RELAY_RETRY_BACKOFF_CAP_SECS", "30"),
    ];

    for (variable, default) in expected {
        let needle = format!("\"{variable}\", {default})");
        assert!(
            RELAY_CONFIG_SOURCE.contains(&needle),
            "config.rs must default {variable} to {default}",
        );
    }
}

#[test]
fn protocol_error_codes_match_the_contract() {
    assert_eq!(ErrorCode::AuthTimeout.code(), 4001);
    assert_eq!(ErrorCode::UnsupportedEvent.code(), 4001);
    assert_eq!(ErrorCode::MissingField.code(), 4002);
    assert_eq!(ErrorCode::InvalidAck.code(), 4004);
    assert_eq!(ErrorCode::RateLimited.code(), 429);
    assert_eq!(ErrorCode::Internal.code(), 5000);
}

#[test]
fn close_codes_match_the_contract() {
    assert_eq!(close_code::AUTH_TIMEOUT, 4001);
    assert_eq!(close_code::POLICY_VIOLATION, 1008);
}
