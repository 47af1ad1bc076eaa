//! Simulation settings, from a TOML file with command-line overrides

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use bpmp_mailbox::MailboxConfig;
use bpmp_mock::TransportKind;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimConfig {
    /// `raw` or `ivc`
    pub transport: String,
    pub cpus: usize,
    pub thread_channels: usize,
    pub timeout_ms: u64,
    pub remote_latency_us: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        let mailbox = MailboxConfig::default();
        Self {
            transport: TransportKind::Ivc.to_string(),
            cpus: mailbox.cpu_count,
            thread_channels: mailbox.thread_channels,
            timeout_ms: mailbox.timeouts.channel.as_millis() as u64,
            remote_latency_us: 0,
        }
    }
}

impl SimConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn transport(&self) -> Result<TransportKind> {
        self.transport.parse().map_err(anyhow::Error::msg)
    }

    pub fn remote_latency(&self) -> Duration {
        Duration::from_micros(self.remote_latency_us)
    }

    pub fn mailbox(&self) -> Result<MailboxConfig> {
        let config = MailboxConfig {
            cpu_count: self.cpus,
            thread_channels: self.thread_channels,
            ..MailboxConfig::default()
        }
        .with_channel_timeout(Duration::from_millis(self.timeout_ms));
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = SimConfig::parse("transport = \"raw\"\nremote_latency_us = 250\n").unwrap();
        assert_eq!(config.transport().unwrap(), TransportKind::Raw);
        assert_eq!(config.remote_latency(), Duration::from_micros(250));
        assert_eq!(config.cpus, SimConfig::default().cpus);
    }

    #[test]
    fn test_rejects_unknown_keys_and_transports() {
        assert!(SimConfig::parse("channels = 3").is_err());
        let config = SimConfig::parse("transport = \"pcie\"").unwrap();
        assert!(config.transport().is_err());
    }

    #[test]
    fn test_mailbox_config_validated() {
        let config = SimConfig {
            thread_channels: 0,
            ..SimConfig::default()
        };
        assert!(config.mailbox().is_err());

        let config = SimConfig {
            timeout_ms: 250,
            ..SimConfig::default()
        };
        assert_eq!(
            config.mailbox().unwrap().timeouts.channel,
            Duration::from_millis(250)
        );
    }
}
