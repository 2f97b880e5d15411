pub mod kthread_create;
pub mod vhost_ioctl;

use aya_ebpf::{EbpfContext, helpers::bpf_get_smp_processor_id, maps::PerfEventArray};

/// A fixed-size record built from a probe context.
pub trait ProbeEvent<C: EbpfContext>: Sized {
    /// Returns `None` when this invocation must not be reported.
    fn capture(ctx: &C) -> Option<Self>;
}

/// Captures one record and writes it to the current CPU's slot of `channel`.
///
/// A full perf buffer drops the record; the probed kernel path is never
/// delayed or failed because of it.
#[inline(always)]
pub fn emit_event<C, T>(channel: &PerfEventArray<T>, ctx: &C)
where
    C: EbpfContext,
    T: ProbeEvent<C>,
{
    if let Some(event) = T::capture(ctx) {
        channel.output(ctx, &event, 0);
    }
}

#[inline(always)]
pub fn current_cpu() -> u32 {
    unsafe { bpf_get_smp_processor_id() }
}
