//! Environment helpers: centralized dotenv loading and ergonomic getters.
//! Call `init_env()` once early in each binary (or rely on lazy Once).
use std::str::FromStr;
use std::sync::Once;
use tracing::info;

static INIT: Once = Once::new();

/// Fallback store used when neither the CLI nor the environment names one.
pub const DEFAULT_DATABASE_URL: &str = "sqlite://feed_normalizer.db";

/// Load .env exactly once. Safe to call many times.
pub fn init_env() {
    INIT.call_once(|| {
        let _ = dotenv::dotenv();
    });
}

/// Common bootstrap for CLI binaries: load .env and note where the store lives.
pub fn bootstrap_cli(bin_name: &str) {
    init_env();
    match env_opt("DATABASE_URL") {
        Some(url) => info!(
            target = "bootstrap",
            bin = bin_name,
            url = %redact_db_url(&url),
            "DATABASE_URL detected"
        ),
        None => info!(
            target = "bootstrap",
            bin = bin_name,
            url = DEFAULT_DATABASE_URL,
            "DATABASE_URL not set; using default"
        ),
    }
}

/// Get optional env var (None if unset or empty).
pub fn env_opt(key: &str) -> Option<String> {
    init_env();
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// Get parsed value with default fallback.
pub fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr + Clone,
{
    init_env();
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Resolve the database URL: explicit override, then `DATABASE_URL`, then the default file.
pub fn db_url(override_url: Option<&str>) -> String {
    if let Some(url) = override_url.map(str::trim).filter(|u| !u.is_empty()) {
        return url.to_string();
    }
    env_opt("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string())
}

/// Strip userinfo and query parameters so URLs are safe to log.
pub fn redact_db_url(url: &str) -> String {
    let without_query = url.split('?').next().unwrap_or(url);
    match without_query.split_once("://") {
        Some((scheme, rest)) => match rest.rsplit_once('@') {
            Some((_, host)) => format!("{scheme}://***@{host}"),
            None => format!("{scheme}://{rest}"),
        },
        None => without_query.to_string(),
    }
}
