use serde::{Deserialize, Serialize};
use std::path::Path;
use std::fs;
use std::time::Duration;
use anyhow::{Context, Result};

pub const DEFAULT_URL: &str = "ldap://127.0.0.1:389";
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_PAGE_SIZE: i32 = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// `ldap://host[:port]` or `ldaps://host[:port]`.
    #[serde(default = "default_url")]
    pub url: String,
    /// TCP connect (and ldaps handshake) timeout in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Per-operation timeout in milliseconds. Unset means wait indefinitely.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub bind: Option<BindConfig>,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    /// Page size used by paged searches when the caller does not pick one.
    #[serde(default = "default_page_size")]
    pub page_size: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindConfig {
    pub dn: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Extra PEM bundle trusted next to the native roots.
    pub ca_file: Option<String>,
    /// Accept any server certificate (tests and internal networks only).
    #[serde(default)]
    pub skip_verify: bool,
    /// Name checked against the certificate. Defaults to the URL host.
    pub server_name: Option<String>,
    /// Upgrade an `ldap://` connection with StartTLS right after connect.
    #[serde(default)]
    pub starttls: bool,
}

fn default_url() -> String {
    DEFAULT_URL.to_string()
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_page_size() -> i32 {
    DEFAULT_PAGE_SIZE
}

impl ClientConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_str(&content)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: ClientConfig =
            serde_yaml::from_str(content).context("Failed to parse client config")?;
        if config.page_size <= 0 {
            anyhow::bail!("page_size must be positive, got {}", config.page_size);
        }
        Ok(config)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn starttls(&self) -> bool {
        self.tls.as_ref().map(|t| t.starttls).unwrap_or(false)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            timeout_ms: None,
            bind: None,
            tls: None,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}
