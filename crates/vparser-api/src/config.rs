//! API configuration.

use std::path::PathBuf;
use std::time::Duration;

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// CORS origins
    pub cors_origins: Vec<String>,
    /// Rate limit requests per second, per client IP
    pub rate_limit_rps: u32,
    /// Take the client IP from `X-Forwarded-For`/`X-Real-IP`
    pub trust_proxy_headers: bool,
    /// Request timeout
    pub request_timeout: Duration,
    /// Max request body size
    pub max_body_size: usize,
    /// Grace period for in-flight requests on shutdown
    pub shutdown_grace: Duration,
    /// Inline `client_id:sha256hex` pairs, comma separated
    pub api_keys: Option<String>,
    /// File with one `client_id:sha256hex` pair per line
    pub api_keys_file: Option<PathBuf>,
    /// How often the key file is re-read
    pub api_keys_refresh: Duration,
    /// Outbox relay tick
    pub outbox_relay_interval: Duration,
    /// Entries younger than this are left to the inline publish
    pub outbox_grace: Duration,
    /// Max outbox entries claimed per tick
    pub outbox_batch_size: i64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            cors_origins: vec!["*".to_string()],
            rate_limit_rps: 50,
            trust_proxy_headers: false,
            request_timeout: Duration::from_secs(30),
            max_body_size: 1024 * 1024, // 1MB
            shutdown_grace: Duration::from_secs(30),
            api_keys: None,
            api_keys_file: None,
            api_keys_refresh: Duration::from_secs(60),
            outbox_relay_interval: Duration::from_secs(15),
            outbox_grace: Duration::from_secs(10),
            outbox_batch_size: 100,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

/// `LISTEN` may be `:8080`, `8080` or `host:port`.
fn parse_listen(listen: &str) -> Option<(Option<String>, u16)> {
    let listen = listen.trim();
    match listen.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().ok()?;
            let host = (!host.is_empty()).then(|| host.to_string());
            Some((host, port))
        }
        None => listen.parse().ok().map(|port| (None, port)),
    }
}

impl ApiConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let listen = std::env::var("LISTEN").ok().and_then(|l| parse_listen(&l));
        let (listen_host, listen_port) = match listen {
            Some((host, port)) => (host, Some(port)),
            None => (None, None),
        };

        Self {
            host: std::env::var("API_HOST")
                .ok()
                .or(listen_host)
                .unwrap_or(defaults.host),
            port: env_parse("API_PORT")
                .or(listen_port)
                .unwrap_or(defaults.port),
            cors_origins: std::env::var("CORS_ORIGINS")
                .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or(defaults.cors_origins),
            rate_limit_rps: env_parse("RATE_LIMIT_RPS").unwrap_or(defaults.rate_limit_rps),
            trust_proxy_headers: env_parse("TRUST_PROXY_HEADERS")
                .unwrap_or(defaults.trust_proxy_headers),
            request_timeout: env_parse("REQUEST_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
            max_body_size: env_parse("MAX_BODY_SIZE").unwrap_or(defaults.max_body_size),
            shutdown_grace: env_parse("SHUTDOWN_GRACE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_grace),
            api_keys: std::env::var("API_KEYS").ok().filter(|s| !s.trim().is_empty()),
            api_keys_file: std::env::var("API_KEYS_FILE").ok().map(PathBuf::from),
            api_keys_refresh: env_parse("API_KEYS_REFRESH_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.api_keys_refresh),
            outbox_relay_interval: env_parse("OUTBOX_RELAY_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.outbox_relay_interval),
            outbox_grace: env_parse("OUTBOX_GRACE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.outbox_grace),
            outbox_batch_size: env_parse("OUTBOX_BATCH_SIZE").unwrap_or(defaults.outbox_batch_size),
        }
    }
}
