// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. Every throttle, batching, and admission knob the server
// recognizes lives here.

use std::net::SocketAddr;
use std::str::FromStr;

use crate::registry::{ConnectionLimits, RateLimits};

const DEV_JWT_SECRET: &str = "fanline_local_development_jwt_secret_must_be_32_chars";
const DEV_CHANNEL_SECRET: &str = "fanline_local_development_channel_secret";

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to sensible development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// JWT signing secret for access tokens.
    pub jwt_secret: String,
    /// Shared secret for private-channel signatures and recovery ids.
    pub channel_secret: String,
    /// PostgreSQL connection string for the durable message log.
    pub database_url: Option<String>,
    /// Log filter directive (e.g. `info`, `fanline_relay=debug`).
    pub log_filter: String,
    /// Pass internal error messages through to clients.
    pub debug_errors: bool,
    /// Global / per-IP / per-user connection caps.
    pub limits: ConnectionLimits,
    /// Per-connection message and byte rates.
    pub rate: RateLimits,
    /// How long violations are remembered and bans last, in seconds.
    pub ban_duration_secs: u64,
    /// Violations within the window before an IP is banned.
    pub max_violations: usize,
    /// Messages per work-queue chunk.
    pub batch_size: usize,
    /// Upper bound on how long a queued message may sit unflushed.
    pub batch_max_delay_ms: u64,
    pub ping_interval_secs: u64,
    pub max_missed_pings: u32,
    pub auth_timeout_secs: u64,
    pub max_delivery_attempts: u32,
    pub retry_backoff_cap_secs: u64,
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `FANLINE_RELAY_HOST` | `0.0.0.0` |
    /// | `FANLINE_RELAY_PORT` | `8080` |
    /// | `FANLINE_RELAY_JWT_SECRET` | dev-only placeholder |
    /// | `FANLINE_RELAY_CHANNEL_SECRET` | dev-only placeholder |
    /// | `FANLINE_RELAY_DATABASE_URL` | *(none — in-memory message log)* |
    /// | `FANLINE_RELAY_LOG_FILTER` | `info` |
    /// | `FANLINE_RELAY_DEBUG_ERRORS` | `false` |
    /// | `FANLINE_RELAY_MAX_CONNECTIONS` | `1000` |
    /// | `FANLINE_RELAY_MAX_CONNECTIONS_PER_IP` | `5` |
    /// | `FANLINE_RELAY_MAX_CONNECTIONS_PER_USER` | `3` |
    /// | `FANLINE_RELAY_MESSAGES_PER_SECOND` | `100` |
    /// | `FANLINE_RELAY_BYTES_PER_SECOND` | `1048576` |
    /// | `FANLINE_RELAY_BAN_DURATION_SECS` | `300` |
    /// | `FANLINE_RELAY_MAX_VIOLATIONS` | `5` |
    /// | `FANLINE_RELAY_BATCH_SIZE` | `10` |
    /// | `FANLINE_RELAY_BATCH_MAX_DELAY_MS` | `1000` |
    /// | `FANLINE_RELAY_PING_INTERVAL_SECS` | `30` |
    /// | `FANLINE_RELAY_MAX_MISSED_PINGS` | `3` |
    /// | `FANLINE_RELAY_AUTH_TIMEOUT_SECS` | `30` |
    /// | `FANLINE_RELAY_MAX_DELIVERY_ATTEMPTS` | `3` |
    /// | `FANLINE_RELAY_RETRY_BACKOFF_CAP_SECS` | `30` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("FANLINE_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = parse_or(&env, "FANLINE_RELAY_PORT", 8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret =
            env("FANLINE_RELAY_JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.into());
        let channel_secret =
            env("FANLINE_RELAY_CHANNEL_SECRET").unwrap_or_else(|_| DEV_CHANNEL_SECRET.into());

        let database_url = env("FANLINE_RELAY_DATABASE_URL").ok();
        let log_filter = env("FANLINE_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let debug_errors = env("FANLINE_RELAY_DEBUG_ERRORS")
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Self {
            listen_addr,
            jwt_secret,
            channel_secret,
            database_url,
            log_filter,
            debug_errors,
            limits: ConnectionLimits {
                global: parse_or(&env, "FANLINE_RELAY_MAX_CONNECTIONS", 1000),
                per_ip: parse_or(&env, "FANLINE_RELAY_MAX_CONNECTIONS_PER_IP", 5),
                per_user: parse_or(&env, "FANLINE_RELAY_MAX_CONNECTIONS_PER_USER", 3),
            },
            rate: RateLimits {
                messages_per_second: parse_or(&env, "FANLINE_RELAY_MESSAGES_PER_SECOND", 100),
                bytes_per_second: parse_or(&env, "FANLINE_RELAY_BYTES_PER_SECOND", 1_048_576),
            },
            ban_duration_secs: parse_or(&env, "FANLINE_RELAY_BAN_DURATION_SECS", 300),
            max_violations: parse_or(&env, "FANLINE_RELAY_MAX_VIOLATIONS", 5),
            batch_size: parse_or(&env, "FANLINE_RELAY_BATCH_SIZE", 10),
            batch_max_delay_ms: parse_or(&env, "FANLINE_RELAY_BATCH_MAX_DELAY_MS", 1000),
            ping_interval_secs: parse_or(&env, "FANLINE_RELAY_PING_INTERVAL_SECS", 30),
            max_missed_pings: parse_or(&env, "FANLINE_RELAY_MAX_MISSED_PINGS", 3),
            auth_timeout_secs: parse_or(&env, "FANLINE_RELAY_AUTH_TIMEOUT_SECS", 30),
            max_delivery_attempts: parse_or(&env, "FANLINE_RELAY_MAX_DELIVERY_ATTEMPTS", 3),
            retry_backoff_cap_secs: parse_or(&env, "FANLINE_RELAY_RETRY_BACKOFF_CAP_SECS", 30),
        }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }

    /// Returns true when using the development-only channel secret.
    pub fn is_dev_channel_secret(&self) -> bool {
        self.channel_secret == DEV_CHANNEL_SECRET
    }
}

fn parse_or<F, T>(env: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
    T: FromStr,
{
    env(key).ok().and_then(|value| value.parse().ok()).unwrap_or(default)
}
