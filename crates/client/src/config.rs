// Client connection and sync tuning.

use std::time::Duration;

use trellis_common::types::ClientId;

/// Default typing debounce window.
const DEFAULT_DEBOUNCE_MS: u64 = 500;
/// Minimum allowed debounce window.
const MIN_DEBOUNCE_MS: u64 = 100;
/// Maximum allowed debounce window.
const MAX_DEBOUNCE_MS: u64 = 5_000;

/// Echo suppression window: one write round trip plus fan-out margin.
const DEFAULT_ECHO_WINDOW_MS: u64 = 2_000;
/// Heartbeat ping interval.
const DEFAULT_HEARTBEAT_MS: u64 = 15_000;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Full sync endpoint, e.g. `ws://127.0.0.1:7341/sync`.
    pub url: String,
    /// Opaque bearer token handed over during `hello`. The client never
    /// interprets or refreshes it.
    pub token: Option<String>,
    /// Identity to resume with; a fresh one is assigned when unset.
    pub client_id: Option<ClientId>,
    /// Delay before a content-only edit is sent.
    pub debounce: Duration,
    /// How long a local write suppresses its own echo.
    pub echo_window: Duration,
    pub heartbeat: Duration,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            client_id: None,
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            echo_window: Duration::from_millis(DEFAULT_ECHO_WINDOW_MS),
            heartbeat: Duration::from_millis(DEFAULT_HEARTBEAT_MS),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_client_id(mut self, client_id: ClientId) -> Self {
        self.client_id = Some(client_id);
        self
    }

    /// Debounce window in milliseconds, clamped to [100, 5000].
    pub fn with_debounce_millis(mut self, ms: u64) -> Self {
        self.debounce = Duration::from_millis(ms.clamp(MIN_DEBOUNCE_MS, MAX_DEBOUNCE_MS));
        self
    }

    pub fn with_echo_window(mut self, window: Duration) -> Self {
        self.echo_window = window;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }
}
