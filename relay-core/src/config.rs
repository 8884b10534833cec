use crate::error::RelayError;

/// All runtime configuration, parsed once at startup from the environment.
///
/// Mirrors the enumerated configuration surface: a missing required variable
/// or an unparsable value is a fatal `ConfigError` before any service starts.
#[derive(Debug, Clone)]
pub struct Config {
    pub direct_host: String,
    pub direct_port: u16,
    pub max_payload_bytes: usize,

    pub hub_url: Option<String>,
    pub hub_host: String,
    pub hub_port: u16,
    pub hub_path: String,
    pub hub_use_tls: bool,

    pub reconnect_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    pub ping_interval_ms: u64,
    pub connection_timeout_ms: u64,

    pub default_throttle_ms: u64,
    pub signalk_refresh_ms: u64,

    pub boat_id: Option<String>,
    pub insecure_legacy_identity: bool,

    pub keys_dir: String,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T, RelayError> {
    match env_var(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| RelayError::Config(format!("{name} is not a valid value: {raw:?}"))),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, RelayError> {
        let direct_host = env_var("DIRECT_HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let direct_port = env_parse("DIRECT_PORT", 3001u16)?;
        let max_payload_bytes = env_parse("MAX_PAYLOAD_BYTES", 262_144usize)?;

        let hub_url = env_var("HUB_URL");
        let hub_host = env_var("HUB_HOST").unwrap_or_else(|| "localhost".to_string());
        let hub_port = env_parse("HUB_PORT", 8080u16)?;
        let hub_path = env_var("HUB_PATH").unwrap_or_else(|| "/boat".to_string());
        let hub_use_tls = env_var("HUB_USE_TLS").map(|v| v == "1" || v == "true").unwrap_or(false);

        let reconnect_interval_ms = env_parse("RECONNECT_INTERVAL_MS", 5_000u64)?;
        let max_reconnect_attempts = env_parse("MAX_RECONNECT_ATTEMPTS", 10u32)?;
        let ping_interval_ms = env_parse("PING_INTERVAL_MS", 25_000u64)?;
        let connection_timeout_ms = env_parse("CONNECTION_TIMEOUT_MS", 30_000u64)?;

        let default_throttle_ms = env_parse("DEFAULT_THROTTLE_MS", 1_000u64)?;
        let signalk_refresh_ms = env_parse("SIGNALK_REFRESH_MS", 1_000u64)?;

        let boat_id = env_var("BOAT_ID");
        let insecure_legacy_identity = env_var("INSECURE_LEGACY_IDENTITY")
            .map(|v| v == "1" || v == "true")
            .unwrap_or(false);

        let keys_dir = env_var("RELAY_KEYS_DIR").unwrap_or_else(|| "./data".to_string());

        if direct_port == 0 {
            return Err(RelayError::Config("DIRECT_PORT must be nonzero".into()));
        }

        Ok(Self {
            direct_host,
            direct_port,
            max_payload_bytes,
            hub_url,
            hub_host,
            hub_port,
            hub_path,
            hub_use_tls,
            reconnect_interval_ms,
            max_reconnect_attempts,
            ping_interval_ms,
            connection_timeout_ms,
            default_throttle_ms,
            signalk_refresh_ms,
            boat_id,
            insecure_legacy_identity,
            keys_dir,
        })
    }

    /// Compose the hub WebSocket URL from `HUB_URL` or the host/port/path parts.
    pub fn hub_ws_url(&self) -> String {
        if let Some(url) = &self.hub_url {
            return url.clone();
        }
        let scheme = if self.hub_use_tls { "wss" } else { "ws" };
        format!("{scheme}://{}:{}{}", self.hub_host, self.hub_port, self.hub_path)
    }

    pub fn direct_bind_addr(&self) -> String {
        format!("{}:{}", self.direct_host, self.direct_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hub_ws_url_prefers_explicit_url() {
        let mut cfg = Config::from_env().unwrap();
        cfg.hub_url = Some("wss://hub.example.com/boat".into());
        assert_eq!(cfg.hub_ws_url(), "wss://hub.example.com/boat");
    }

    #[test]
    fn hub_ws_url_composes_from_parts() {
        let mut cfg = Config::from_env().unwrap();
        cfg.hub_url = None;
        cfg.hub_host = "hub.local".into();
        cfg.hub_port = 9000;
        cfg.hub_path = "/relay".into();
        cfg.hub_use_tls = false;
        assert_eq!(cfg.hub_ws_url(), "ws://hub.local:9000/relay");
    }
}
