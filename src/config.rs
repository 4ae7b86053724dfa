use serde::Deserialize;
use std::fmt::Display;
use std::str::FromStr;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    /// "postgres" (default) or "memory" (dev only, loses dedup state)
    pub store_backend: String,
    pub broker_url: String,
    pub ledger_url: String,
    pub bridge_poll_secs: u64,
    pub indexer_poll_secs: u64,
    pub recon_poll_secs: u64,
    pub max_retries: i32,
    pub retry_base_secs: u64,
    pub retry_cap_secs: u64,
    pub break_threshold_secs: i64,
    pub index_chunk_size: i64,
    pub asset_scale: u32,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let cfg = Self {
            database_url: env_or("DATABASE_URL", "postgresql://localhost/settlement"),
            bind_address: env_or("BIND_ADDRESS", "0.0.0.0:8080"),
            store_backend: env_or("STORE_BACKEND", "postgres"),
            broker_url: env_or("BROKER_FEED_URL", "http://localhost:9100"),
            ledger_url: env_or("LEDGER_RPC_URL", "http://localhost:9200"),
            bridge_poll_secs: env_parse("BRIDGE_POLL_SECS", 10)?,
            indexer_poll_secs: env_parse("INDEXER_POLL_SECS", 5)?,
            recon_poll_secs: env_parse("RECON_POLL_SECS", 30)?,
            max_retries: env_parse("MAX_RETRIES", 5)?,
            retry_base_secs: env_parse("RETRY_BASE_SECS", 5)?,
            retry_cap_secs: env_parse("RETRY_CAP_SECS", 300)?,
            break_threshold_secs: env_parse("BREAK_THRESHOLD_SECS", 300)?,
            index_chunk_size: env_parse("INDEX_CHUNK_SIZE", 512)?,
            asset_scale: env_parse("ASSET_SCALE", 6)?,
        };

        if cfg.asset_scale > 18 {
            return Err(config::ConfigError::Message(format!(
                "ASSET_SCALE {} too large (max 18)",
                cfg.asset_scale
            )));
        }
        if cfg.max_retries < 1 {
            return Err(config::ConfigError::Message(
                "MAX_RETRIES must be at least 1".to_string(),
            ));
        }
        if cfg.index_chunk_size < 1 {
            return Err(config::ConfigError::Message(
                "INDEX_CHUNK_SIZE must be at least 1".to_string(),
            ));
        }

        Ok(cfg)
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> Result<T, config::ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| config::ConfigError::Message(format!("{}: {}", key, e))),
        Err(_) => Ok(default),
    }
}
