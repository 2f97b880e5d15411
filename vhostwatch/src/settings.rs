use std::{path::PathBuf, time::Duration};

use anyhow::{Result, bail};
use config::{Config, ConfigError, Environment};
use serde::Deserialize;

use crate::pinning::{PinAction, PinMode};
use crate::probes::ChannelSizing;

/// Delay between `VHOST_SET_OWNER` and the worker scan. The worker is
/// usually visible well before this.
const DEFAULT_SCAN_DELAY_MS: u64 = 2_000;

/// Records buffered per CPU between a perf reader and the consumer.
const DEFAULT_QUEUE_DEPTH: usize = 1024;

const PROC_ROOT: &str = "/proc";
const HOST_PROC_ROOT: &str = "/host/proc";

/// Kernel and host channel sizing.
#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct ChannelSettings {
    /// Fixed perf array size. Unset sizes the arrays to the CPU count.
    pub capacity: Option<u32>,
    pub queue_depth: Option<usize>,
}

/// Worker discovery and pinning.
#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct PinSettings {
    pub mode: Option<String>,
    pub discovery: Option<bool>,
    pub scan_delay_ms: Option<u64>,
    pub proc_root: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct Settings {
    pub otel_exporter_otlp_endpoint: Option<String>,
    #[serde(default)]
    pub channel: ChannelSettings,
    #[serde(default)]
    pub pin: PinSettings,
    pub json: Option<bool>,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let s = Config::builder()
            .add_source(
                Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        s.try_deserialize()
    }

    pub fn channel_sizing(&self) -> ChannelSizing {
        match self.channel.capacity {
            Some(capacity) => ChannelSizing::Fixed(capacity),
            None => ChannelSizing::PerCpu,
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.channel
            .queue_depth
            .filter(|depth| *depth > 0)
            .unwrap_or(DEFAULT_QUEUE_DEPTH)
    }

    pub fn scan_delay(&self) -> Duration {
        Duration::from_millis(self.pin.scan_delay_ms.unwrap_or(DEFAULT_SCAN_DELAY_MS))
    }

    /// Configured proc root, else `/host/proc` when running in a container
    /// with the host's proc mounted there, else `/proc`.
    pub fn proc_root(&self) -> PathBuf {
        if let Some(root) = &self.pin.proc_root {
            return PathBuf::from(root);
        }
        let host_proc = PathBuf::from(HOST_PROC_ROOT);
        if host_proc.exists() {
            host_proc
        } else {
            PathBuf::from(PROC_ROOT)
        }
    }

    /// Discovery mode and a pin mode are mutually exclusive, and one of
    /// them is required.
    pub fn pin_action(&self) -> Result<PinAction> {
        let discovery = self.pin.discovery.unwrap_or(false);
        let mode = self.pin.mode.as_deref().filter(|m| !m.is_empty());

        match (discovery, mode) {
            (true, Some(_)) => bail!("Cannot provide a pin mode in discovery mode"),
            (true, None) => Ok(PinAction::Discover),
            (false, Some(mode)) => Ok(PinAction::Pin(PinMode::parse(mode)?)),
            (false, None) => bail!("Must provide a valid pin mode when discovery mode is off"),
        }
    }
}
