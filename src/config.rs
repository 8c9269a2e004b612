use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_API_BASE: &str = "http://127.0.0.1:8787";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_base: String,
    pub token: Option<String>,
    pub request_timeout: Duration,
}

impl ClientConfig {
    pub fn new(api_base: &str) -> Self {
        Self {
            api_base: normalize_base_url(api_base),
            token: None,
            request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn websocket_url(&self, session_id: &str) -> String {
        websocket_url(&self.api_base, session_id)
    }
}

/// Streaming endpoint for a session: the api base with its scheme swapped
/// for the WebSocket equivalent, plus `/ws/optimize/{session_id}`.
pub fn websocket_url(api_base: &str, session_id: &str) -> String {
    let base = normalize_base_url(api_base);
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base
    };

    format!("{}/ws/optimize/{}", base, session_id)
}

pub fn normalize_base_url(value: &str) -> String {
    value.trim().trim_end_matches('/').to_string()
}

/// An explicit token wins; otherwise fall back to the token file, if any.
pub fn resolve_token(explicit: Option<String>) -> Option<String> {
    if let Some(token) = explicit.filter(|token| !token.trim().is_empty()) {
        return Some(token);
    }

    read_token_file()
}

fn read_token_file() -> Option<String> {
    let token = std::fs::read_to_string(token_path()).ok()?;
    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

pub fn token_path() -> PathBuf {
    if let Some(home) = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")) {
        return PathBuf::from(home).join(".promptwire").join("token");
    }

    PathBuf::from("promptwire.token")
}
