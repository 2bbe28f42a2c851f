use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;

/// Deployment environment. Reported in health checks, metric labels and
/// broadcast events, and decides the defaults for everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Production => "production",
        }
    }

    pub fn is_production(self) -> bool {
        self == Environment::Production
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" | "local" | "test" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            other => bail!("Unknown environment '{other}' (expected development or production)"),
        }
    }
}

/// Application configuration loaded from environment variables.
/// Read once per process; the supervisor and every worker load it independently.
#[derive(Debug, Clone)]
pub struct Config {
    pub environment: Environment,
    /// Offline/local mode: one worker, in-process cache fallback, no real-time channel.
    pub local_fallback: bool,
    pub port: u16,
    pub redis_url: String,
    pub allowed_origins: Vec<String>,
    pub rate_limit_window: Duration,
    pub rate_limit_max: u32,
    pub websocket_port: u16,
    /// Dedicated metrics listener. `/metrics` is always served on `port` as well.
    pub metrics_port: Option<u16>,
    pub cache_ttl: Duration,
    pub scorer_program: String,
    pub scorer_args: Vec<String>,
    pub scorer_timeout: Duration,
    pub scorer_max_concurrency: usize,
    pub workers: Option<usize>,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let environment = match lookup("APP_ENV").or_else(|| lookup("NODE_ENV")) {
            Some(raw) => raw.parse::<Environment>()?,
            None => Environment::Development,
        };
        let production = environment.is_production();

        let local_fallback = match lookup("LOCAL_FALLBACK") {
            Some(raw) => parse_bool(&raw).context("LOCAL_FALLBACK must be true or false")?,
            None => !production,
        };

        let port = match lookup("PORT").or_else(|| lookup("BACKEND_PORT")) {
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .context("PORT must be a valid port number")?,
            None if production => 8080,
            None => 3000,
        };

        let allowed_origins = lookup("ALLOWED_ORIGINS")
            .unwrap_or_else(|| "http://localhost:3000".to_string())
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(str::to_string)
            .collect();

        let rate_limit_window_ms: u64 = parse_or(&lookup, "RATE_LIMIT_WINDOW_MS", 15 * 60 * 1000)?;
        let rate_limit_max: u32 =
            parse_or(&lookup, "RATE_LIMIT_MAX", if production { 5000 } else { 100 })?;

        let metrics_port = lookup("PROMETHEUS_PORT")
            .map(|raw| raw.trim().parse::<u16>())
            .transpose()
            .context("PROMETHEUS_PORT must be a valid port number")?;

        let cache_ttl_secs: u64 = parse_or(&lookup, "CACHE_TTL_SECONDS", 24 * 60 * 60)?;
        if cache_ttl_secs == 0 {
            bail!("CACHE_TTL_SECONDS must be greater than zero");
        }

        let scorer_args = lookup("SCORER_ARGS")
            .unwrap_or_else(|| "backend/services/atsOptimizer.py".to_string())
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let scorer_timeout_secs: u64 = parse_or(&lookup, "SCORER_TIMEOUT_SECS", 60)?;
        let scorer_max_concurrency: usize = parse_or(&lookup, "SCORER_MAX_CONCURRENCY", 4)?;
        if scorer_max_concurrency == 0 {
            bail!("SCORER_MAX_CONCURRENCY must be at least 1");
        }

        let workers = lookup("WORKERS")
            .map(|raw| raw.trim().parse::<usize>())
            .transpose()
            .context("WORKERS must be a positive integer")?
            .filter(|&n| n > 0);

        Ok(Config {
            environment,
            local_fallback,
            port,
            redis_url: lookup("REDIS_URL").unwrap_or_else(|| "redis://localhost:6379".to_string()),
            allowed_origins,
            rate_limit_window: Duration::from_millis(rate_limit_window_ms),
            rate_limit_max,
            websocket_port: parse_or(&lookup, "WEBSOCKET_PORT", 3002)?,
            metrics_port,
            cache_ttl: Duration::from_secs(cache_ttl_secs),
            scorer_program: lookup("SCORER_PROGRAM").unwrap_or_else(|| "python3".to_string()),
            scorer_args,
            scorer_timeout: Duration::from_secs(scorer_timeout_secs),
            scorer_max_concurrency,
            workers,
            rust_log: lookup("RUST_LOG").unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Worker count, decided once at boot: 1 in local mode, one per core otherwise.
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            if self.local_fallback {
                1
            } else {
                num_cpus::get().max(1)
            }
        })
    }

    /// The real-time channel only exists outside local mode.
    pub fn broadcast_enabled(&self) -> bool {
        !self.local_fallback
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("Environment variable '{key}' has an invalid value '{raw}'")),
        None => Ok(default),
    }
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("'{other}' is not a boolean"),
    }
}

#[cfg(test)]
impl Config {
    /// Local-mode configuration used by unit tests.
    pub fn for_tests() -> Self {
        Self::from_lookup(|_| None).expect("defaults are valid")
    }
}
