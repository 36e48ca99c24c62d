use serde::Deserialize;
use anyhow::Result;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_MODEL: &str = "gpt-4.1-mini";

fn default_max_file_size() -> usize {
    // 10 MB in bytes
    10 * 1024 * 1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub max_file_size: usize,
    pub openai_key: String,
    pub llm_base_url: String,
    pub default_model: String,
    pub bind_addr: SocketAddr,
    pub session_ttl: Duration,
}

impl Config {
    pub fn new() -> Result<Self> {
        // Load .env file first
        dotenv().ok();

        let openai_key = std::env::var("OPENAI_API_KEY")
            .map_err(|e| anyhow::anyhow!("Failed to load OPENAI_API_KEY: {}", e))?;

        let llm_base_url = std::env::var("LLM_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string())
            .trim_end_matches('/')
            .to_string();

        let default_model = std::env::var("LLM_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());

        let bind_addr = std::env::var("BIND_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:3000".to_string())
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid BIND_ADDR: {}", e))?;

        let max_file_size = match std::env::var("MAX_FILE_SIZE") {
            Ok(raw) => raw
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid MAX_FILE_SIZE '{}': {}", raw, e))?,
            Err(_) => default_max_file_size(),
        };

        let session_ttl = match std::env::var("SESSION_TTL_SECS") {
            Ok(raw) => Duration::from_secs(
                raw.parse()
                    .map_err(|e| anyhow::anyhow!("Invalid SESSION_TTL_SECS '{}': {}", raw, e))?,
            ),
            Err(_) => Duration::from_secs(3600),
        };

        Ok(Config {
            max_file_size,
            openai_key,
            llm_base_url,
            default_model,
            bind_addr,
            session_ttl,
        })
    }
}

pub fn load_config() -> Result<Config> {
    let config = Config::new()?;
    tracing::info!(
        "Configuration loaded: base_url={}, model={}, max_file_size={}KB",
        config.llm_base_url,
        config.default_model,
        config.max_file_size / 1024
    );
    Ok(config)
}
