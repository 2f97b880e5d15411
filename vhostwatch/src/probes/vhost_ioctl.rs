use anyhow::{Context, Result, bail};
use aya::Ebpf;
use aya::programs::KProbe;
use log::info;

use crate::probes::{Probe, ProbeHandle, ProbeLink, symbol_exists};
use crate::telemetry;

/// Kernel function hooked on entry. Lives in the `vhost_net` module.
pub const VHOST_NET_IOCTL: &str = "vhost_net_ioctl";

/// Perf array the kprobe writes `IoctlEvent`s to.
pub const IOCTL_EVENTS: &str = "IOCTL_EVENTS";

#[derive(Debug, Default)]
pub struct VhostIoctlProbe;

impl Probe for VhostIoctlProbe {
    fn program(&self) -> &'static str {
        "vhost_net_ioctl_entry"
    }

    fn attach(&self, bpf: &mut Ebpf) -> Result<ProbeHandle> {
        if !symbol_exists(VHOST_NET_IOCTL) {
            bail!(
                "{} not found in kallsyms; is the vhost_net module loaded?",
                VHOST_NET_IOCTL
            );
        }

        let program: &mut KProbe = bpf
            .program_mut(self.program())
            .with_context(|| format!("Failed to find {} program", self.program()))?
            .try_into()
            .context("Program is not a KProbe")?;

        program.load()?;
        let link = program
            .attach(VHOST_NET_IOCTL, 0)
            .with_context(|| format!("Failed to attach {}", self.program()))?;

        info!("Attached kprobe: {}", VHOST_NET_IOCTL);
        telemetry::record_active_probe(self.program(), 1);

        Ok(ProbeHandle {
            program: self.program(),
            link: ProbeLink::KProbe(link),
        })
    }
}
