//! Service configuration.
//!
//! DESIGN
//! ======
//! All configuration is read from the environment exactly once at startup
//! and handed down through `AppState` — no ambient globals. The non-secret
//! subset (service endpoints a client needs) is pushed to every connection
//! as a one-shot SERVICE_CONFIG frame right after authentication.

use serde_json::{Value, json};

const DEFAULT_TCP_PORT: u16 = 4000;
const DEFAULT_WS_PORT: u16 = 4001;

/// Process-wide configuration, constructed once in `main`.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Port for the line-delimited TCP transport.
    pub tcp_port: u16,
    /// Port for the WebSocket transport (adjacent by convention).
    pub ws_port: u16,
    /// Endpoint of the external file/image upload service, if configured.
    pub file_service_url: Option<String>,
}

impl ServiceConfig {
    /// Load from `TCP_PORT`, `WS_PORT`, and `FILE_SERVICE_URL`.
    /// Missing ports fall back to defaults; the file service is optional.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            tcp_port: env_port("TCP_PORT", DEFAULT_TCP_PORT),
            ws_port: env_port("WS_PORT", DEFAULT_WS_PORT),
            file_service_url: std::env::var("FILE_SERVICE_URL").ok(),
        }
    }

    /// Non-secret payload pushed to a freshly authenticated connection.
    #[must_use]
    pub fn client_payload(&self) -> Value {
        json!({
            "tcp_port": self.tcp_port,
            "ws_port": self.ws_port,
            "file_service_url": self.file_service_url,
        })
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            tcp_port: DEFAULT_TCP_PORT,
            ws_port: DEFAULT_WS_PORT,
            file_service_url: None,
        }
    }
}

fn env_port(var: &str, default: u16) -> u16 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
