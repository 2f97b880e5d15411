//! Entry kprobe on the vhost-net ioctl handler.

use aya_ebpf::{
    macros::{kprobe, map},
    maps::PerfEventArray,
    programs::ProbeContext,
};
use vhostwatch_common::IoctlEvent;

use crate::probes::{ProbeEvent, current_cpu, emit_event};

/// Second argument of `vhost_net_ioctl`.
const IOCTL_ARG_INDEX: usize = 1;

/// Sized to the CPU count by the loader (`max_entries = 0`).
#[map]
pub static IOCTL_EVENTS: PerfEventArray<IoctlEvent> = PerfEventArray::new(0);

/// long vhost_net_ioctl(struct file *f, unsigned int ioctl, unsigned long arg)
#[kprobe]
pub fn vhost_net_ioctl_entry(ctx: ProbeContext) -> u32 {
    emit_event::<ProbeContext, IoctlEvent>(&IOCTL_EVENTS, &ctx);
    0
}

impl ProbeEvent<ProbeContext> for IoctlEvent {
    fn capture(ctx: &ProbeContext) -> Option<Self> {
        let ioctl_command: u32 = ctx.arg(IOCTL_ARG_INDEX)?;
        Some(IoctlEvent {
            cpu: current_cpu(),
            ioctl_command,
        })
    }
}
