//! Shared reqwest setup for the model, memory and Telegram clients.

use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::parse_flag;

const USER_AGENT: &str = concat!("kurisu/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SYSTEM_PROXY_ENV: &str = "KURISU_ENABLE_SYSTEM_PROXY";

/// Whether requests honour the platform proxy settings. Discovery can panic on
/// some platforms, so it is opt-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    System,
    Direct,
}

impl ProxyMode {
    pub fn from_env() -> Self {
        Self::from_flag(std::env::var(SYSTEM_PROXY_ENV).ok().as_deref())
    }

    fn from_flag(flag: Option<&str>) -> Self {
        match flag {
            Some(value) if parse_flag(value) => ProxyMode::System,
            _ => ProxyMode::Direct,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientSettings {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub proxy: ProxyMode,
}

impl HttpClientSettings {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            connect_timeout: CONNECT_TIMEOUT.min(timeout),
            proxy: ProxyMode::from_env(),
        }
    }

    /// Build the client, falling back to direct connections when proxy
    /// discovery fails.
    pub fn build(&self) -> Result<reqwest::Client> {
        if self.proxy == ProxyMode::System {
            match std::panic::catch_unwind(|| self.builder(ProxyMode::System).build()) {
                Ok(Ok(client)) => return Ok(client),
                Ok(Err(e)) => tracing::warn!("System proxy setup failed, going direct: {}", e),
                Err(_) => tracing::warn!("System proxy discovery panicked, going direct"),
            }
        }

        match std::panic::catch_unwind(|| self.builder(ProxyMode::Direct).build()) {
            Ok(result) => result.context("Failed to initialize HTTP client"),
            Err(_) => anyhow::bail!("HTTP client initialization panicked"),
        }
    }

    fn builder(&self, proxy: ProxyMode) -> reqwest::ClientBuilder {
        let builder = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(self.timeout)
            .connect_timeout(self.connect_timeout);
        match proxy {
            ProxyMode::System => builder,
            ProxyMode::Direct => builder.no_proxy(),
        }
    }
}

pub fn build_http_client(timeout: Duration) -> Result<reqwest::Client> {
    HttpClientSettings::new(timeout).build()
}
