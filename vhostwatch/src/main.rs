use anyhow::{Context, Result};
use aya::include_bytes_aligned;
use clap::Parser;
use log::warn;

use vhostwatch::Session;
use vhostwatch::settings::Settings;
use vhostwatch::telemetry;

#[derive(Debug, Parser)]
struct Opt {
    /// Verbose output
    #[clap(short, long)]
    verbose: bool,

    /// Print one JSON object per record
    #[clap(long)]
    json: bool,

    /// Pin discovered vhost workers: 'first', 'last' or a cpu list such as 0-3,8
    #[clap(long)]
    pin_mode: Option<String>,

    /// Only list vhost workers, never change their affinity
    #[clap(long)]
    discovery_mode: bool,

    /// Fixed number of perf array slots instead of one per CPU
    #[clap(long)]
    channel_capacity: Option<u32>,

    /// Delay between VHOST_SET_OWNER and the worker scan
    #[clap(long)]
    scan_delay_ms: Option<u64>,
}

impl Opt {
    /// Flags win over the environment.
    fn apply(&self, settings: &mut Settings) {
        if self.json {
            settings.json = Some(true);
        }
        if self.pin_mode.is_some() {
            settings.pin.mode = self.pin_mode.clone();
        }
        if self.discovery_mode {
            settings.pin.discovery = Some(true);
        }
        if self.channel_capacity.is_some() {
            settings.channel.capacity = self.channel_capacity;
        }
        if self.scan_delay_ms.is_some() {
            settings.pin.scan_delay_ms = self.scan_delay_ms;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if opt.verbose { "info" } else { "warn" }),
    )
    .init();

    let mut settings = Settings::new().context("Failed to load settings")?;
    opt.apply(&mut settings);
    // Reject bad pin options before touching the kernel.
    settings.pin_action()?;

    if let Err(e) = telemetry::init_metrics(settings.otel_exporter_otlp_endpoint.as_deref()) {
        warn!("Failed to initialize metrics: {:#}", e);
    }

    let session = Session::new(
        settings,
        include_bytes_aligned!(concat!(env!("OUT_DIR"), "/vhostwatch")),
    )?;
    let result = session.run().await;

    telemetry::shutdown_metrics();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_settings() {
        let opt = Opt::parse_from([
            "vhostwatch",
            "--json",
            "--pin-mode",
            "0-1,4",
            "--channel-capacity",
            "2",
            "--scan-delay-ms",
            "10",
        ]);
        let mut settings = Settings::default();
        settings.pin.mode = Some("first".to_string());
        opt.apply(&mut settings);

        assert_eq!(settings.json, Some(true));
        assert_eq!(settings.pin.mode.as_deref(), Some("0-1,4"));
        assert_eq!(settings.channel.capacity, Some(2));
        assert_eq!(settings.pin.scan_delay_ms, Some(10));
        assert!(settings.pin_action().is_ok());
    }

    #[test]
    fn test_unset_flags_keep_settings() {
        let opt = Opt::parse_from(["vhostwatch"]);
        let mut settings = Settings::default();
        settings.pin.mode = Some("last".to_string());
        opt.apply(&mut settings);

        assert_eq!(settings.pin.mode.as_deref(), Some("last"));
        assert_eq!(settings.json, None);
    }

    #[test]
    fn test_discovery_flag_conflicts_with_pin_mode() {
        let opt = Opt::parse_from(["vhostwatch", "--discovery-mode", "--pin-mode", "last"]);
        let mut settings = Settings::default();
        opt.apply(&mut settings);
        assert!(settings.pin_action().is_err());
    }
}
