use std::env;
use std::time::Duration;

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use url::Url;

use crate::llm::{LlmSettings, Provider};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<String>,

    /// Port to listen on
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Tool backend endpoint URL
    #[arg(long, env = "MCP_UPSTREAM_URL")]
    pub upstream_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub completion: CompletionConfig,
    pub chat: ChatConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    /// Tool backend endpoint accepting JSON-RPC envelopes.
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompletionConfig {
    /// Bounded timeout for completion-API calls, in seconds.
    pub request_timeout_secs: u64,
    /// Token budget per completion request.
    pub max_tokens: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    /// Account identity the tool backend acts on behalf of; mentioned in
    /// the system prompt so the model passes it to tools that need it.
    #[serde(default)]
    pub target_account: Option<String>,
    /// Completion/tool-dispatch cycle bound per turn.
    pub max_tool_iterations: usize,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from_args(std::env::args())
    }

    pub fn load_from_args<I, T>(args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;

        let mut builder = Config::builder();

        // 1. Defaults
        builder = builder
            .set_default("server.port", 8081)?
            .set_default("server.host", "127.0.0.1")?
            .set_default("upstream.url", "http://127.0.0.1:8000/mcp")?
            .set_default("completion.request_timeout_secs", 60)?
            .set_default("completion.max_tokens", 1000)?
            .set_default("chat.max_tool_iterations", 10)?;

        // 2. Optional config file (explicit path, or ./config.yaml if present)
        if let Some(path) = &cli.config {
            builder = builder.add_source(File::with_name(path));
        } else if std::path::Path::new("config.yaml").exists() {
            builder = builder.add_source(File::with_name("config"));
        }

        // 3. Environment variables prefixed with BRIDGE_
        // E.g. BRIDGE_SERVER__PORT=8000
        builder = builder.add_source(
            Environment::with_prefix("BRIDGE")
                .separator("__")
                .try_parsing(true),
        );

        // 4. CLI overrides (clap also resolves their env fallbacks)
        if let Some(port) = cli.port {
            builder = builder.set_override("server.port", i64::from(port))?;
        }
        if let Some(url) = cli.upstream_url {
            builder = builder.set_override("upstream.url", url)?;
        }

        let cfg = builder.build()?;
        let cfg: Self = cfg.try_deserialize()?;

        Url::parse(&cfg.upstream.url).map_err(|e| {
            config::ConfigError::Message(format!("invalid upstream.url '{}': {e}", cfg.upstream.url))
        })?;

        Ok(cfg)
    }
}

pub fn load_llm_settings(completion: &CompletionConfig) -> Result<LlmSettings, String> {
    let base_url = std::env::var("LLM_BASE_URL")
        .map_err(|_| "Missing required env var: LLM_BASE_URL".to_string())?;
    if base_url.trim().is_empty() {
        return Err("LLM_BASE_URL cannot be empty".to_string());
    }

    let model = std::env::var("LLM_MODEL")
        .map_err(|_| "Missing required env var: LLM_MODEL".to_string())?;
    if model.trim().is_empty() {
        return Err("LLM_MODEL cannot be empty".to_string());
    }

    let api_key = std::env::var("LLM_API_KEY")
        .ok()
        .filter(|s| !s.trim().is_empty());

    // Auto-detect provider from base URL
    let provider = Provider::detect_from_url(&base_url);

    Ok(LlmSettings {
        base_url,
        api_key,
        model,
        provider,
        max_tokens: completion.max_tokens,
        request_timeout: Duration::from_secs(completion.request_timeout_secs),
    })
}

/// Account identity from config, with the legacy env var as a fallback.
#[must_use]
pub fn resolve_target_account(config: &AppConfig) -> Option<String> {
    config
        .chat
        .target_account
        .clone()
        .or_else(|| env::var("TARGET_ACCOUNT").ok().filter(|s| !s.is_empty()))
}
