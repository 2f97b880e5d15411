use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use vhostwatch::harness::{DEFAULT_DEVICE, VhostDevice};

/// Opens a vhost-net device and issues VHOST_SET_OWNER so the watcher has
/// something to observe.
#[derive(Debug, Parser)]
struct Opt {
    /// Device node to open
    #[clap(long, default_value = DEFAULT_DEVICE)]
    device: String,

    /// Seconds to keep the device open after setup
    #[clap(long, default_value_t = 120)]
    hold_secs: u64,

    /// Verbose output
    #[clap(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let opt = Opt::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if opt.verbose { "info" } else { "warn" }),
    )
    .init();

    let device = VhostDevice::open(&opt.device)?;
    device.set_owner()?;
    println!("VHOST_SET_OWNER done on {}", opt.device);
    device.hold(Duration::from_secs(opt.hold_secs));

    Ok(())
}
