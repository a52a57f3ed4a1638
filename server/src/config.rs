//! Environment-driven configuration.
//!
//! Every value has a default; numeric values that fail to parse fall back to
//! the default rather than aborting startup.

use std::{env, path::PathBuf, str::FromStr};

use anyhow::{bail, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    File { path: PathBuf },
    Postgres { url: String },
}

impl StoreBackend {
    pub fn name(&self) -> &'static str {
        match self {
            StoreBackend::Memory => "memory",
            StoreBackend::File { .. } => "file",
            StoreBackend::Postgres { .. } => "postgres",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MessengerConfig {
    /// Page access token for the send API. `None` disables the outbound relay.
    pub page_access_token: Option<String>,
    pub verify_token: String,
    /// When set, webhook bodies must carry a matching `x-hub-signature-256`.
    pub app_secret: Option<String>,
    pub graph_url: String,
}

#[derive(Debug, Clone)]
pub struct DedupConfig {
    pub token_capacity: usize,
    /// Trailing window for identical-text suppression. Zero disables it.
    pub text_window_ms: i64,
    pub recent_scan: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            token_capacity: 1000,
            text_window_ms: 5_000,
            recent_scan: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub capacity: usize,
    pub idle_ms: i64,
    pub sweep_probability: f64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            idle_ms: 30 * 60 * 1000,
            sweep_probability: 0.01,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub backend: StoreBackend,
    pub messenger: MessengerConfig,
    pub dedup: DedupConfig,
    pub delivery: DeliveryConfig,
    pub sentinel_names: Vec<String>,
    pub poll_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 4000,
            backend: StoreBackend::Memory,
            messenger: MessengerConfig {
                page_access_token: None,
                verify_token: String::new(),
                app_secret: None,
                graph_url: DEFAULT_GRAPH_URL.to_string(),
            },
            dedup: DedupConfig::default(),
            delivery: DeliveryConfig::default(),
            sentinel_names: default_sentinel_names(),
            poll_interval_ms: 15_000,
        }
    }
}

const DEFAULT_GRAPH_URL: &str = "https://graph.facebook.com/v22.0";

fn default_sentinel_names() -> Vec<String> {
    vec!["Guest".to_string(), "სტუმარი".to_string()]
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Config::default();

        let backend = match text("STORE_BACKEND")
            .unwrap_or_else(|| "memory".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "memory" => StoreBackend::Memory,
            "file" => StoreBackend::File {
                path: text("STORE_FILE")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("./relay-data.jsonl")),
            },
            "postgres" => StoreBackend::Postgres {
                url: resolve_database_url(&text),
            },
            other => bail!("unknown STORE_BACKEND '{other}' (expected memory, file or postgres)"),
        };

        let sentinel_names = text("GUEST_SENTINEL_NAMES")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|names| !names.is_empty())
            .unwrap_or(defaults.sentinel_names);

        Ok(Self {
            port: parsed(&text, "PORT", defaults.port),
            backend,
            messenger: MessengerConfig {
                page_access_token: text("MESSENGER_PAGE_ACCESS_TOKEN"),
                verify_token: text("MESSENGER_VERIFY_TOKEN").unwrap_or_default(),
                app_secret: text("MESSENGER_APP_SECRET"),
                graph_url: text("MESSENGER_GRAPH_URL")
                    .map(|url| url.trim_end_matches('/').to_string())
                    .unwrap_or(defaults.messenger.graph_url),
            },
            dedup: DedupConfig {
                token_capacity: parsed(&text, "DEDUP_TOKEN_CAPACITY", defaults.dedup.token_capacity)
                    .max(1),
                text_window_ms: parsed(&text, "DEDUP_TEXT_WINDOW_MS", defaults.dedup.text_window_ms)
                    .max(0),
                recent_scan: parsed(&text, "DEDUP_RECENT_SCAN", defaults.dedup.recent_scan),
            },
            delivery: DeliveryConfig {
                capacity: parsed(&text, "DELIVERY_CAPACITY", defaults.delivery.capacity).max(1),
                idle_ms: parsed(&text, "DELIVERY_IDLE_SECS", defaults.delivery.idle_ms / 1000)
                    .max(1)
                    * 1000,
                sweep_probability: parsed(
                    &text,
                    "DELIVERY_SWEEP_PROBABILITY",
                    defaults.delivery.sweep_probability,
                )
                .clamp(0.0, 1.0),
            },
            sentinel_names,
            poll_interval_ms: parsed(&text, "POLL_INTERVAL_MS", defaults.poll_interval_ms).max(1),
        })
    }
}

fn parsed<T, F>(text: &F, key: &str, default: T) -> T
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    text(key)
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn resolve_database_url<F>(text: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = text("DATABASE_URL") {
        return url;
    }
    let host = text("POSTGRES_HOST")
        .or_else(|| text("PGHOST"))
        .unwrap_or_else(|| "localhost".to_string());
    let port = text("POSTGRES_PORT")
        .or_else(|| text("PGPORT"))
        .unwrap_or_else(|| "5432".to_string());
    let user = text("POSTGRES_USER")
        .or_else(|| text("PGUSER"))
        .unwrap_or_else(|| "postgres".to_string());
    let password = text("POSTGRES_PASSWORD")
        .or_else(|| text("PGPASSWORD"))
        .unwrap_or_default();
    let db = text("POSTGRES_DB")
        .or_else(|| text("PGDATABASE"))
        .unwrap_or_else(|| "chat_relay".to_string());
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}
