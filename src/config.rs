use ipnet::IpNet;
use serde::Deserialize;
use std::net::IpAddr;
use std::str::FromStr;

/// 500 KB, the largest ADF document accepted.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 500 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub max_payload_bytes: usize,
    pub rate_limit_requests: usize,
    pub rate_limit_window_secs: u64,
    pub parse_timeout_ms: u64,
    pub request_timeout_secs: u64,
    pub trust_proxy_headers: bool,
    pub default_phone_region: String,
    /// Shared secret for `X-Vendor-Signature`; unset disables the check.
    pub vendor_hmac_secret: Option<String>,
    pub signature_max_age_secs: u64,
    /// Networks allowed to submit leads; empty allows every address.
    pub ip_allowlist: Vec<IpNet>,
    /// HS256 secret for bearer tokens on the read endpoint; unset leaves it open.
    pub internal_jwt_secret: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DB_URL")
                .or_else(|_| std::env::var("DATABASE_URL"))
                .map_err(|_| {
                    anyhow::anyhow!("DB_URL or DATABASE_URL environment variable required")
                })
                .and_then(|url| {
                    if url.trim().is_empty() {
                        anyhow::bail!("DB_URL cannot be empty");
                    }
                    if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
                        anyhow::bail!("DB_URL must start with postgresql:// or postgres://");
                    }
                    Ok(url)
                })?,
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?,
            max_payload_bytes: env_or("ADF_MAX_PAYLOAD_BYTES", DEFAULT_MAX_PAYLOAD_BYTES)
                .and_then(|limit| {
                    if limit == 0 {
                        anyhow::bail!("ADF_MAX_PAYLOAD_BYTES must be greater than zero");
                    }
                    Ok(limit)
                })?,
            rate_limit_requests: env_or("ADF_RATE_LIMIT_REQUESTS", 30usize).and_then(|n| {
                if n == 0 {
                    anyhow::bail!("ADF_RATE_LIMIT_REQUESTS must be greater than zero");
                }
                Ok(n)
            })?,
            rate_limit_window_secs: env_or("ADF_RATE_LIMIT_WINDOW_SECS", 60u64).and_then(
                |secs| {
                    if secs == 0 {
                        anyhow::bail!("ADF_RATE_LIMIT_WINDOW_SECS must be greater than zero");
                    }
                    Ok(secs)
                },
            )?,
            parse_timeout_ms: env_or("ADF_PARSE_TIMEOUT_MS", 3000u64)?,
            request_timeout_secs: env_or("REQUEST_TIMEOUT_SECS", 30u64)?,
            trust_proxy_headers: env_or("TRUST_PROXY_HEADERS", false)?,
            default_phone_region: std::env::var("DEFAULT_PHONE_REGION")
                .unwrap_or_else(|_| "US".to_string())
                .trim()
                .to_uppercase(),
            vendor_hmac_secret: optional_secret("ADF_VENDOR_HMAC_SECRET"),
            signature_max_age_secs: env_or("ADF_SIGNATURE_MAX_AGE_SECS", 300u64)?,
            ip_allowlist: parse_allowlist(
                &std::env::var("ADF_IP_ALLOWLIST").unwrap_or_default(),
            )?,
            internal_jwt_secret: optional_secret("INTERNAL_JWT_SECRET"),
        };

        if config
            .default_phone_region
            .parse::<phonenumber::country::Id>()
            .is_err()
        {
            anyhow::bail!(
                "DEFAULT_PHONE_REGION '{}' is not a known ISO 3166 region",
                config.default_phone_region
            );
        }

        // Log successful configuration load (without sensitive values)
        tracing::debug!("Database URL: {}...", url_prefix(&config.database_url));
        tracing::debug!("Server Port: {}", config.port);
        tracing::debug!(
            "ADF limits: {} bytes, {} req / {}s, parse timeout {}ms",
            config.max_payload_bytes,
            config.rate_limit_requests,
            config.rate_limit_window_secs,
            config.parse_timeout_ms
        );
        tracing::debug!(
            "Vendor signatures {}, {} allowlisted network(s), read tokens {}",
            if config.vendor_hmac_secret.is_some() { "required" } else { "off" },
            config.ip_allowlist.len(),
            if config.internal_jwt_secret.is_some() { "required" } else { "off" }
        );
        if config.trust_proxy_headers {
            tracing::info!("Trusting X-Forwarded-For / X-Real-IP for client addresses");
        }

        Ok(config)
    }
}

impl Default for Config {
    /// Local defaults; `database_url` is left empty and must be supplied.
    fn default() -> Self {
        Self {
            database_url: String::new(),
            port: 3000,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            rate_limit_requests: 30,
            rate_limit_window_secs: 60,
            parse_timeout_ms: 3000,
            request_timeout_secs: 30,
            trust_proxy_headers: false,
            default_phone_region: "US".to_string(),
            vendor_hmac_secret: None,
            signature_max_age_secs: 300,
            ip_allowlist: Vec::new(),
            internal_jwt_secret: None,
        }
    }
}

/// Parses a comma-separated list of CIDR blocks or bare addresses.
pub fn parse_allowlist(raw: &str) -> anyhow::Result<Vec<IpNet>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .parse::<IpNet>()
                .or_else(|_| entry.parse::<IpAddr>().map(IpNet::from))
                .map_err(|_| anyhow::anyhow!("ADF_IP_ALLOWLIST has an invalid entry: '{}'", entry))
        })
        .collect()
}

fn optional_secret(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// First 20 characters of a connection string, for logging.
fn url_prefix(url: &str) -> String {
    url.chars().take(20).collect()
}

fn env_or<T: FromStr>(key: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} has an invalid value: '{}'", key, raw)),
        _ => Ok(default),
    }
}
