use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use clap_complete::Shell;

use crate::config::ClientConfig;
use crate::error::Result;

/// Which transport carries the session.
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum TransportKind {
    /// Full-duplex WebSocket at `/ws/chat/{session}/`
    Ws,
    /// One HTTP POST per turn with a `text/event-stream` response
    Sse,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Ws => write!(f, "ws"),
            TransportKind::Sse => write!(f, "sse"),
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "prompt-stream")]
#[command(version)]
#[command(about = "Streaming chat client with token assembly, latency tracking and automatic reconnects")]
pub struct Args {
    /// Prompt to send. Omit to read one prompt per line from stdin.
    pub prompt: Option<String>,

    /// TOML config file
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Transport strategy
    #[arg(long, value_enum, default_value = "ws")]
    pub transport: TransportKind,

    /// Session id (a fresh UUID when omitted)
    #[arg(long)]
    pub session: Option<String>,

    /// Base URL of the HTTP API
    #[arg(long)]
    pub api_url: Option<String>,

    /// Base URL of the WebSocket server
    #[arg(long)]
    pub ws_url: Option<String>,

    /// Bearer token
    #[arg(long)]
    pub token: Option<String>,

    /// Model name for SSE completions
    #[arg(long)]
    pub model: Option<String>,

    /// Print p50/p95 latency after each turn
    #[arg(long)]
    pub latency: bool,

    /// Print a shell completion script and exit
    #[arg(long, value_enum)]
    pub completions: Option<Shell>,
}

impl Args {
    /// Defaults, then the config file, then environment, then flags.
    pub fn resolve_config(&self) -> Result<ClientConfig> {
        let base = match &self.config {
            Some(path) => ClientConfig::load(path)?,
            None => ClientConfig::default(),
        };
        Ok(self.apply_overrides(base.apply_env()))
    }

    /// Layer explicit flags over `config`.
    pub fn apply_overrides(&self, mut config: ClientConfig) -> ClientConfig {
        if let Some(url) = &self.api_url {
            config.api_base_url = url.clone();
        }
        if let Some(url) = &self.ws_url {
            config.ws_base_url = url.clone();
        }
        if let Some(token) = &self.token {
            config.token = Some(token.clone());
        }
        if let Some(model) = &self.model {
            config.model = model.clone();
        }
        config
    }

    pub fn session_id(&self) -> String {
        self.session
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }
}
