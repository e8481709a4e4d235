use tokio::time::Duration;

use crate::retry::RetryConfig;

#[derive(Clone, Debug)]
pub struct Config {
    pub api_base: String,
    pub api_token: Option<String>,
    /// Where the bearer token is persisted between runs, if anywhere.
    pub token_file: Option<String>,
    pub http_timeout_secs: u64,
    pub health_poll_secs: u64,
    pub metrics_poll_secs: u64,
    pub stale_secs: u64,
    pub fetch_retries: u32,
    pub retry_base_ms: u64,
    pub leads_page_size: usize,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Stop after this many seconds; 0 runs until interrupted.
    pub run_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:8000".to_string(),
            api_token: None,
            token_file: None,
            http_timeout_secs: 10,
            health_poll_secs: 15,
            metrics_poll_secs: 30,
            stale_secs: 0,
            fetch_retries: 3,
            retry_base_ms: 100,
            leads_page_size: 10,
            username: None,
            password: None,
            run_secs: 0,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            api_base: std::env::var("API_BASE").unwrap_or(d.api_base),
            api_token: std::env::var("API_TOKEN").ok().filter(|t| !t.is_empty()),
            token_file: std::env::var("TOKEN_FILE").ok().filter(|p| !p.is_empty()),
            http_timeout_secs: env_parse("HTTP_TIMEOUT_SECS").unwrap_or(d.http_timeout_secs),
            health_poll_secs: env_parse("HEALTH_POLL_SECS").unwrap_or(d.health_poll_secs),
            metrics_poll_secs: env_parse("METRICS_POLL_SECS").unwrap_or(d.metrics_poll_secs),
            stale_secs: env_parse("STALE_SECS").unwrap_or(d.stale_secs),
            fetch_retries: env_parse("FETCH_RETRIES").unwrap_or(d.fetch_retries),
            retry_base_ms: env_parse("RETRY_BASE_MS").unwrap_or(d.retry_base_ms),
            leads_page_size: env_parse("LEADS_PAGE_SIZE").filter(|n| *n > 0).unwrap_or(d.leads_page_size),
            username: std::env::var("DASH_USER").ok(),
            password: std::env::var("DASH_PASSWORD").ok(),
            run_secs: env_parse("RUN_SECS").unwrap_or(d.run_secs),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn health_poll(&self) -> Duration {
        Duration::from_secs(self.health_poll_secs)
    }

    pub fn metrics_poll(&self) -> Duration {
        Duration::from_secs(self.metrics_poll_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_secs)
    }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.fetch_retries,
            base_delay_ms: self.retry_base_ms,
            ..Default::default()
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_dashboard_cadence() {
        let cfg = Config::default();
        assert_eq!(cfg.health_poll(), Duration::from_secs(15));
        assert_eq!(cfg.metrics_poll(), Duration::from_secs(30));
        assert_eq!(cfg.leads_page_size, 10);
        assert_eq!(cfg.stale_after(), Duration::ZERO);
    }

    #[test]
    fn test_retry_config_from_settings() {
        let cfg = Config {
            fetch_retries: 1,
            retry_base_ms: 50,
            ..Default::default()
        };
        let retry = cfg.retry();
        assert_eq!(retry.max_retries, 1);
        assert_eq!(retry.base_delay_ms, 50);
    }
}
