//! Configuration management for the OTA agent
//!
//! Loads configuration from environment variables with sensible defaults.

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Agent configuration
///
/// Built once at startup and shared read-only with the controller.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Platform access address
    pub iot_address: String,

    /// Platform port (1883 plain MQTT, 8883 MQTTS)
    pub iot_port: u16,

    /// Device id, also the MQTT user name
    pub device_id: String,

    /// Shared secret for secret authentication
    pub device_secret: String,

    /// Module whose version this agent reports
    pub module: String,

    /// Currently installed version of `module`
    pub module_version: String,

    /// Directory downloaded packages are written to
    pub download_dir: PathBuf,

    /// Per-download timeout in milliseconds
    pub download_timeout_ms: u64,

    /// How long a cycle may wait for the platform's package offer
    pub offer_timeout_secs: u64,

    /// Settle delay between download and verification
    pub verify_delay_ms: u64,

    /// Allowance for hashing the package, on top of the download timeout
    pub verify_timeout_ms: u64,

    /// Watchdog tick interval
    pub watchdog_interval_ms: u64,

    /// Request a package as soon as the subscription is up
    pub check_on_subscribe: bool,

    /// Number of finished cycles kept for the status API
    pub history_capacity: usize,

    /// Status API host
    pub api_host: String,

    /// Status API port
    pub api_port: u16,

    /// Package the mock platform offers (none means it answers 404)
    pub mock_package_url: Option<String>,

    pub mock_package_sign: Option<String>,

    pub mock_package_version: Option<String>,
}

impl AgentConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists (for local development)
        dotenvy::dotenv().ok();

        let config = AgentConfig {
            iot_address: env::var("IOT_ADDRESS").unwrap_or_else(|_| "localhost".to_string()),

            iot_port: env::var("IOT_PORT")
                .unwrap_or_else(|_| "8883".to_string())
                .parse()
                .context("Invalid IOT_PORT")?,

            device_id: env::var("DEVICE_ID").unwrap_or_else(|_| "mock-device".to_string()),

            device_secret: env::var("DEVICE_SECRET").unwrap_or_else(|_| "mock-secret".to_string()),

            module: env::var("OTA_MODULE").unwrap_or_else(|_| "mcu".to_string()),

            module_version: env::var("OTA_MODULE_VERSION")
                .unwrap_or_else(|_| "v1.2.3".to_string()),

            download_dir: env::var("DOWNLOAD_DIR")
                .unwrap_or_else(|_| ".".to_string())
                .into(),

            download_timeout_ms: env::var("DOWNLOAD_TIMEOUT_MS")
                .unwrap_or_else(|_| "30000".to_string())
                .parse()
                .context("Invalid DOWNLOAD_TIMEOUT_MS")?,

            offer_timeout_secs: env::var("OFFER_TIMEOUT_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .context("Invalid OFFER_TIMEOUT_SECS")?,

            verify_delay_ms: env::var("VERIFY_DELAY_MS")
                .unwrap_or_else(|_| "0".to_string())
                .parse()
                .context("Invalid VERIFY_DELAY_MS")?,

            verify_timeout_ms: env::var("VERIFY_TIMEOUT_MS")
                .unwrap_or_else(|_| "30000".to_string())
                .parse()
                .context("Invalid VERIFY_TIMEOUT_MS")?,

            watchdog_interval_ms: env::var("WATCHDOG_INTERVAL_MS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .context("Invalid WATCHDOG_INTERVAL_MS")?,

            check_on_subscribe: env::var("CHECK_ON_SUBSCRIBE")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .context("Invalid CHECK_ON_SUBSCRIBE (expected true/false)")?,

            history_capacity: env::var("HISTORY_CAPACITY")
                .unwrap_or_else(|_| "64".to_string())
                .parse()
                .context("Invalid HISTORY_CAPACITY")?,

            api_host: env::var("API_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),

            api_port: env::var("API_PORT")
                .unwrap_or_else(|_| "8090".to_string())
                .parse()
                .context("Invalid API_PORT")?,

            mock_package_url: env::var("MOCK_PACKAGE_URL").ok(),
            mock_package_sign: env::var("MOCK_PACKAGE_SIGN").ok(),
            mock_package_version: env::var("MOCK_PACKAGE_VERSION").ok(),
        };

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.iot_port == 0 {
            anyhow::bail!("IOT_PORT must be greater than 0");
        }

        if self.api_port == 0 {
            anyhow::bail!("API_PORT must be greater than 0");
        }

        if self.module.trim().is_empty() {
            anyhow::bail!("OTA_MODULE must not be empty");
        }

        if self.device_id.trim().is_empty() {
            anyhow::bail!("DEVICE_ID must not be empty");
        }

        if self.download_timeout_ms == 0 {
            anyhow::bail!("DOWNLOAD_TIMEOUT_MS must be greater than 0");
        }

        if self.offer_timeout_secs == 0 {
            anyhow::bail!("OFFER_TIMEOUT_SECS must be greater than 0");
        }

        if self.verify_timeout_ms == 0 {
            anyhow::bail!("VERIFY_TIMEOUT_MS must be greater than 0");
        }

        if self.watchdog_interval_ms == 0 {
            anyhow::bail!("WATCHDOG_INTERVAL_MS must be greater than 0");
        }

        Ok(())
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_millis(self.download_timeout_ms)
    }

    pub fn offer_timeout(&self) -> Duration {
        Duration::from_secs(self.offer_timeout_secs)
    }

    pub fn verify_delay(&self) -> Duration {
        Duration::from_millis(self.verify_delay_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    /// Deadline for a cycle in `Downloading` or `Verifying`
    ///
    /// Counted from the moment the fetch task holds the download directory.
    pub fn transfer_deadline(&self) -> Duration {
        self.download_timeout()
            + self.verify_delay()
            + Duration::from_millis(self.verify_timeout_ms)
    }

    /// Get the status API address
    pub fn api_address(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }

    /// Ensure the download directory exists
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.download_dir).with_context(|| {
            format!(
                "Failed to create download directory: {}",
                self.download_dir.display()
            )
        })
    }

    /// Configuration for tests: short timeouts, no env access
    pub fn for_tests(download_dir: PathBuf) -> Self {
        Self {
            iot_address: "localhost".to_string(),
            iot_port: 8883,
            device_id: "test-device".to_string(),
            device_secret: "test-secret".to_string(),
            module: "mcu".to_string(),
            module_version: "v1.2.3".to_string(),
            download_dir,
            download_timeout_ms: 2000,
            offer_timeout_secs: 5,
            verify_delay_ms: 0,
            verify_timeout_ms: 1000,
            watchdog_interval_ms: 50,
            check_on_subscribe: false,
            history_capacity: 16,
            api_host: "127.0.0.1".to_string(),
            api_port: 8090,
            mock_package_url: None,
            mock_package_sign: None,
            mock_package_version: None,
        }
    }
}
