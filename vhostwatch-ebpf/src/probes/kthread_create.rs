//! fexit probe on the generic kernel thread creation primitive.
//!
//! Runs for every kthread created on the system. Anything that is not a
//! `vhost-` worker returns before touching the channel.

use aya_ebpf::{
    helpers::bpf_probe_read_kernel,
    macros::{fexit, map},
    maps::PerfEventArray,
    programs::FExitContext,
};
use aya_log_ebpf::debug;
use vhostwatch_common::{TASK_COMM_LEN, TaskLayout, ThreadCreateEvent, is_vhost_thread};

use crate::probes::{ProbeEvent, current_cpu, emit_event};

/// fexit places the return value after the five arguments of
/// struct task_struct *__kthread_create_on_node(int (*threadfn)(void *data),
///     void *data, int node, const char namefmt[], va_list args)
const RET_ARG_INDEX: usize = 5;

/// Largest errno an `ERR_PTR` can encode.
const MAX_ERRNO: usize = 4095;

#[map]
pub static KTHREAD_EVENTS: PerfEventArray<ThreadCreateEvent> = PerfEventArray::new(0);

/// Patched by the loader with offsets read from kernel BTF.
#[unsafe(no_mangle)]
static TASK_LAYOUT: TaskLayout = TaskLayout::UNRESOLVED;

#[fexit(function = "__kthread_create_on_node")]
pub fn kthread_create_on_node_exit(ctx: FExitContext) -> i32 {
    emit_event::<FExitContext, ThreadCreateEvent>(&KTHREAD_EVENTS, &ctx);
    0
}

#[inline(always)]
fn is_err_or_null(task: *const u8) -> bool {
    task.is_null() || task as usize >= MAX_ERRNO.wrapping_neg()
}

impl ProbeEvent<FExitContext> for ThreadCreateEvent {
    fn capture(ctx: &FExitContext) -> Option<Self> {
        let layout = unsafe { core::ptr::read_volatile(&TASK_LAYOUT) };
        if !layout.is_resolved() {
            return None;
        }

        let task: *const u8 = unsafe { ctx.arg(RET_ARG_INDEX) };
        if is_err_or_null(task) {
            return None;
        }

        let comm: [u8; TASK_COMM_LEN] = unsafe {
            bpf_probe_read_kernel(
                task.add(layout.comm_offset as usize) as *const [u8; TASK_COMM_LEN],
            )
            .ok()?
        };
        if !is_vhost_thread(&comm) {
            return None;
        }

        let pid: i32 = unsafe {
            bpf_probe_read_kernel(task.add(layout.pid_offset as usize) as *const i32).ok()?
        };
        let cpu = current_cpu();

        debug!(ctx, "vhost worker created: pid={} cpu={}", pid, cpu);

        Some(ThreadCreateEvent {
            cpu,
            pid: pid as u32,
        })
    }
}
