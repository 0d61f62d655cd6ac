// Shared handles wired once at startup and cloned into every router.

use std::sync::Arc;

use anyhow::Context;

use crate::auth::AccessTokenVerifier;
use crate::broadcast::{BroadcastConfig, Broadcaster};
use crate::channels::ChannelDirectory;
use crate::config::RelayConfig;
use crate::recovery::RecoveryEngine;
use crate::registry::ConnectionRegistry;
use crate::store::MessageStore;
use crate::throttle::ThrottleGuard;

#[derive(Clone)]
pub struct RelayState {
    pub config: Arc<RelayConfig>,
    pub verifier: Arc<AccessTokenVerifier>,
    pub registry: ConnectionRegistry,
    pub directory: Arc<ChannelDirectory>,
    pub broadcaster: Broadcaster,
    pub recovery: Arc<RecoveryEngine>,
    pub guard: ThrottleGuard,
    pub store: MessageStore,
}

impl RelayState {
    /// Wire every component from the configuration. Must run inside a tokio
    /// runtime (the broadcaster spawns its queue worker).
    pub fn build(config: RelayConfig, store: MessageStore) -> anyhow::Result<Self> {
        let verifier = Arc::new(
            AccessTokenVerifier::new(&config.jwt_secret).context("invalid relay JWT secret")?,
        );
        let registry = ConnectionRegistry::new(config.limits, config.rate);
        let directory = Arc::new(ChannelDirectory::new(config.channel_secret.clone()));
        let broadcaster = Broadcaster::spawn(
            Arc::clone(&directory),
            registry.clone(),
            BroadcastConfig {
                batch_size: config.batch_size.max(1),
                batch_max_delay: std::time::Duration::from_millis(config.batch_max_delay_ms),
                max_attempts: config.max_delivery_attempts,
                backoff_cap: std::time::Duration::from_secs(config.retry_backoff_cap_secs),
            },
        );
        let recovery = Arc::new(RecoveryEngine::new(
            store.clone(),
            registry.clone(),
            Arc::clone(&directory),
            config.channel_secret.clone(),
        ));
        let guard = ThrottleGuard::new(config.ban_duration_secs, config.max_violations);

        Ok(Self {
            config: Arc::new(config),
            verifier,
            registry,
            directory,
            broadcaster,
            recovery,
            guard,
            store,
        })
    }
}
