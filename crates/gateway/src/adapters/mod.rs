//! Frontend adapters. Non-WebSocket channels translate at the edge:
//! inbound native messages become `agent` requests, outbound events render
//! to the adapter's message format.

pub mod telegram;

use crate::state::AppState;

/// Spawn every adapter that is enabled and has its secret configured.
pub fn spawn_enabled(state: &AppState) {
    let cfg = &state.config.adapters.telegram;
    if !cfg.enabled {
        return;
    }
    match std::env::var(&cfg.token_env) {
        Ok(token) if !token.is_empty() => {
            telegram::spawn(state.clone(), token);
            tracing::info!("telegram adapter started");
        }
        _ => {
            tracing::warn!(
                env = %cfg.token_env,
                "telegram adapter enabled but bot token env var is not set"
            );
        }
    }
}
