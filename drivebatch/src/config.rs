use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::engine::executor::ExecutorConfig;
use crate::engine::planner::DEFAULT_DESTINATION;
use crate::engine::retry::RetryPolicy;

const DEFAULT_PAGE_SIZE: u64 = 100;
const DEFAULT_MAX_RETRIES: u64 = 5;
const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;
const DEFAULT_MAX_DELAY_MS: u64 = 60_000;
const DEFAULT_CONCURRENCY: u64 = 2;
const MAX_PAGE_SIZE: u64 = 1_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no API token: set DRIVEBATCH_TOKEN or pass --token")]
    MissingToken,
    #[error("no report directory: set DRIVEBATCH_REPORT_DIR or pass --report-dir")]
    NoReportDir,
}

/// Knobs of one engine run. Passed by value, never read from globals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub page_size: u32,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub max_delay: Duration,
    pub max_concurrency: usize,
    pub jitter: bool,
    pub verify_before_copy: bool,
    pub default_destination: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE as u32,
            max_retries: DEFAULT_MAX_RETRIES as u32,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            max_concurrency: DEFAULT_CONCURRENCY as usize,
            jitter: false,
            verify_before_copy: true,
            default_destination: DEFAULT_DESTINATION.to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            page_size: read_u64_env("DRIVEBATCH_PAGE_SIZE", DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE)
                as u32,
            max_retries: clamp_u32(read_u64_env("DRIVEBATCH_MAX_RETRIES", DEFAULT_MAX_RETRIES)),
            retry_delay: Duration::from_millis(read_u64_env(
                "DRIVEBATCH_RETRY_DELAY_MS",
                DEFAULT_RETRY_DELAY_MS,
            )),
            max_delay: Duration::from_millis(read_u64_env(
                "DRIVEBATCH_MAX_DELAY_MS",
                DEFAULT_MAX_DELAY_MS,
            )),
            max_concurrency: read_u64_env("DRIVEBATCH_CONCURRENCY", DEFAULT_CONCURRENCY) as usize,
            jitter: read_bool_env("DRIVEBATCH_JITTER", defaults.jitter),
            verify_before_copy: read_bool_env(
                "DRIVEBATCH_VERIFY_BEFORE_COPY",
                defaults.verify_before_copy,
            ),
            default_destination: std::env::var("DRIVEBATCH_DEFAULT_DESTINATION")
                .ok()
                .filter(|value| !value.trim().is_empty())
                .unwrap_or(defaults.default_destination),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_delay, self.max_delay, self.max_retries).with_jitter(self.jitter)
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            retry: self.retry_policy(),
            max_concurrency: self.max_concurrency.max(1),
            verify_before_copy: self.verify_before_copy,
            page_size: self.page_size,
        }
    }
}

/// Everything the binary needs besides the command itself.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub token: Option<String>,
    pub api_url: Option<String>,
    pub report_dir: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            engine: EngineConfig::from_env(),
            token: non_empty_env("DRIVEBATCH_TOKEN"),
            api_url: non_empty_env("DRIVEBATCH_API_URL"),
            report_dir: non_empty_env("DRIVEBATCH_REPORT_DIR")
                .map(PathBuf::from)
                .or_else(default_report_dir),
        }
    }

    pub fn token(&self) -> Result<&str, ConfigError> {
        self.token.as_deref().ok_or(ConfigError::MissingToken)
    }

    pub fn report_dir(&self) -> Result<&PathBuf, ConfigError> {
        self.report_dir.as_ref().ok_or(ConfigError::NoReportDir)
    }
}

fn default_report_dir() -> Option<PathBuf> {
    dirs::data_local_dir().map(|dir| dir.join("drivebatch").join("reports"))
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn clamp_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool_env(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|value| match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        })
        .unwrap_or(default)
}
