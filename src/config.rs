//! Client configuration.
//!
//! Resolution order: built-in defaults, then an optional TOML file, then
//! `PROMPT_STREAM_*` environment variables, then CLI flags.

use std::path::Path;
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::backoff::ReconnectPolicy;
use crate::error::{Result, StreamError};

pub const ENV_API_URL: &str = "PROMPT_STREAM_API_URL";
pub const ENV_WS_URL: &str = "PROMPT_STREAM_WS_URL";
pub const ENV_TOKEN: &str = "PROMPT_STREAM_TOKEN";
pub const ENV_MODEL: &str = "PROMPT_STREAM_MODEL";

/// Path of the SSE completion endpoint, relative to `api_base_url`.
pub const COMPLETIONS_PATH: &str = "/api/v2/chat/completions/";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the HTTP API (e.g. `https://api.example.com`).
    pub api_base_url: String,
    /// Base URL of the WebSocket server (e.g. `wss://api.example.com`).
    pub ws_base_url: String,
    /// Bearer token attached to every request.
    pub token: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub heartbeat_interval_ms: u64,
    /// Upper bound on a single transport `open`; a timeout counts as a failed attempt.
    pub connect_timeout_ms: u64,
    /// Number of latency samples kept for p50/p95.
    pub latency_window: usize,
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000".to_string(),
            ws_base_url: "ws://localhost:8000".to_string(),
            token: None,
            model: "gpt-4o-mini".to_string(),
            temperature: 0.7,
            max_tokens: 2048,
            heartbeat_interval_ms: 30_000,
            connect_timeout_ms: 10_000,
            latency_window: crate::latency::DEFAULT_WINDOW,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Read a TOML config file. Missing keys take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Overlay values from the process environment.
    pub fn apply_env(self) -> Self {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Overlay values from `lookup`; empty values are ignored.
    pub fn apply_env_with(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = get(ENV_API_URL) {
            self.api_base_url = v;
        }
        if let Some(v) = get(ENV_WS_URL) {
            self.ws_base_url = v;
        }
        if let Some(v) = get(ENV_TOKEN) {
            self.token = Some(v);
        }
        if let Some(v) = get(ENV_MODEL) {
            self.model = v;
        }
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }

    /// `{ws_base_url}/ws/chat/{session_id}/?token=<bearer>`
    pub fn ws_url(&self, session_id: &str) -> Result<Url> {
        let raw = format!(
            "{}/ws/chat/{}/",
            self.ws_base_url.trim_end_matches('/'),
            session_id
        );
        let mut url = parse_url(&raw)?;
        if let Some(token) = &self.token {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url)
    }

    /// `{api_base_url}/api/v2/chat/completions/`
    pub fn completions_url(&self) -> Result<Url> {
        parse_url(&format!(
            "{}{}",
            self.api_base_url.trim_end_matches('/'),
            COMPLETIONS_PATH
        ))
    }
}

fn parse_url(raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|e| StreamError::InvalidUrl {
        url: raw.to_string(),
        detail: e.to_string(),
    })
}

/// Render `url` for logs with any `token` query value masked.
pub fn redact_url(url: &Url) -> String {
    let mut shown = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let v = if k == "token" { "***".to_string() } else { v.into_owned() };
            (k.into_owned(), v)
        })
        .collect();
    if pairs.is_empty() {
        return shown.to_string();
    }
    shown.query_pairs_mut().clear().extend_pairs(pairs);
    shown.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let c = ClientConfig::default();
        assert_eq!(c.reconnect.max_attempts, 5);
        assert_eq!(c.latency_window, 100);
        assert_eq!(c.heartbeat_interval(), Duration::from_secs(30));
        assert!(c.token.is_none());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let c = ClientConfig::from_toml_str(
            r#"
            ws_base_url = "wss://chat.example.com"
            [reconnect]
            max_attempts = 3
            "#,
        )
        .unwrap();
        assert_eq!(c.ws_base_url, "wss://chat.example.com");
        assert_eq!(c.reconnect.max_attempts, 3);
        assert_eq!(c.reconnect.base_delay_ms, 1_000);
        assert_eq!(c.model, ClientConfig::default().model);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = ClientConfig::from_toml_str("max_tokens = \"lots\"").unwrap_err();
        assert!(matches!(err, StreamError::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "api_base_url = \"https://api.example.com\"\nmax_tokens = 512").unwrap();
        let c = ClientConfig::load(f.path()).unwrap();
        assert_eq!(c.api_base_url, "https://api.example.com");
        assert_eq!(c.max_tokens, 512);
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let err = ClientConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, StreamError::Io(_)));
    }

    #[test]
    fn test_env_overlay() {
        let env: HashMap<&str, &str> = [
            (ENV_WS_URL, "wss://ws.example.com"),
            (ENV_TOKEN, "abc"),
            (ENV_MODEL, "  "),
        ]
        .into_iter()
        .collect();
        let c = ClientConfig::default().apply_env_with(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.ws_base_url, "wss://ws.example.com");
        assert_eq!(c.token.as_deref(), Some("abc"));
        // blank values are ignored
        assert_eq!(c.model, ClientConfig::default().model);
    }

    #[test]
    fn test_connect_timeout_from_toml() {
        let c = ClientConfig::from_toml_str("connect_timeout_ms = 2500\n").unwrap();
        assert_eq!(c.connect_timeout(), Duration::from_millis(2500));
        assert_eq!(ClientConfig::default().connect_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_ws_url_includes_session_and_token() {
        let c = ClientConfig {
            ws_base_url: "wss://chat.example.com/".into(),
            token: Some("t o+k".into()),
            ..Default::default()
        };
        let url = c.ws_url("sess-1").unwrap();
        assert_eq!(url.path(), "/ws/chat/sess-1/");
        let token: Vec<_> = url.query_pairs().filter(|(k, _)| k == "token").collect();
        assert_eq!(token[0].1, "t o+k");
    }

    #[test]
    fn test_ws_url_without_token_has_no_query() {
        let url = ClientConfig::default().ws_url("s").unwrap();
        assert!(url.query().is_none());
    }

    #[test]
    fn test_completions_url() {
        let c = ClientConfig { api_base_url: "https://api.example.com/".into(), ..Default::default() };
        assert_eq!(
            c.completions_url().unwrap().as_str(),
            "https://api.example.com/api/v2/chat/completions/"
        );
    }

    #[test]
    fn test_bad_base_url_is_reported() {
        let c = ClientConfig { ws_base_url: "not a url".into(), ..Default::default() };
        assert!(matches!(c.ws_url("s"), Err(StreamError::InvalidUrl { .. })));
    }

    #[test]
    fn test_redact_url_masks_token() {
        let c = ClientConfig { token: Some("secret".into()), ..Default::default() };
        let shown = redact_url(&c.ws_url("s").unwrap());
        assert!(!shown.contains("secret"));
        assert!(shown.contains("token=***") || shown.contains("token=%2A%2A%2A"));
    }
}
