use anyhow::{Context, Result};
use aya::programs::FExit;
use aya::{Btf, Ebpf};
use log::info;

use crate::probes::{Probe, ProbeHandle, ProbeLink};
use crate::telemetry;

pub const KTHREAD_CREATE_ON_NODE: &str = "__kthread_create_on_node";

/// Perf array the fexit program writes `ThreadCreateEvent`s to.
pub const KTHREAD_EVENTS: &str = "KTHREAD_EVENTS";

/// Observes the return of `__kthread_create_on_node` and reports new
/// `vhost-*` kthreads. Needs the `TASK_LAYOUT` global patched at load time.
#[derive(Debug, Default)]
pub struct KthreadCreateProbe;

impl Probe for KthreadCreateProbe {
    fn program(&self) -> &'static str {
        "kthread_create_on_node_exit"
    }

    fn attach(&self, bpf: &mut Ebpf) -> Result<ProbeHandle> {
        let btf = Btf::from_sys_fs().context("Failed to load kernel BTF")?;

        let program: &mut FExit = bpf
            .program_mut(self.program())
            .with_context(|| format!("Failed to find {} program", self.program()))?
            .try_into()
            .context("Program is not an FExit")?;

        program
            .load(KTHREAD_CREATE_ON_NODE, &btf)
            .with_context(|| format!("Failed to load {}", self.program()))?;
        let link = program
            .attach()
            .with_context(|| format!("Failed to attach {}", self.program()))?;

        info!("Attached fexit: {}", KTHREAD_CREATE_ON_NODE);
        telemetry::record_active_probe(self.program(), 1);

        Ok(ProbeHandle {
            program: self.program(),
            link: ProbeLink::FExit(link),
        })
    }
}
