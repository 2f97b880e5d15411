use std::{
    fs::File,
    io::{BufRead, BufReader},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use aya::{
    Ebpf, Pod,
    maps::perf::PerfEventArray,
    programs::{FExit, KProbe, fexit::FExitLinkId, kprobe::KProbeLinkId},
};
use bytes::BytesMut;
use log::{info, warn};

use crate::channel::{Delivery, ShardSender};
use crate::telemetry;

pub mod kthread_create;
pub mod task_layout;
pub mod vhost_ioctl;

pub use kthread_create::KthreadCreateProbe;
pub use vhost_ioctl::VhostIoctlProbe;

pub const POLL_INTERVAL_MS: u64 = 10;

/// Records fetched from a perf buffer per read.
const READ_BATCH: usize = 16;

const KALLSYMS: &str = "/proc/kallsyms";

/// How many slots the kernel perf arrays get.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelSizing {
    /// `max_entries = 0` in the object; the loader sizes the array to the
    /// number of possible CPUs.
    PerCpu,
    /// Fixed slot count. CPUs at or above it can't deliver events.
    Fixed(u32),
}

/// An attached link, kept so it can be detached individually.
#[derive(Debug)]
pub enum ProbeLink {
    KProbe(KProbeLinkId),
    FExit(FExitLinkId),
}

#[derive(Debug)]
pub struct ProbeHandle {
    pub program: &'static str,
    pub link: ProbeLink,
}

pub trait Probe {
    /// Program name in the eBPF object.
    fn program(&self) -> &'static str;

    /// Loads the program and attaches it to its kernel symbol.
    fn attach(&self, bpf: &mut Ebpf) -> Result<ProbeHandle>;
}

/// Removes the link behind `handle`. The program itself stays loaded until
/// the `Ebpf` object is dropped.
pub fn detach(bpf: &mut Ebpf, handle: ProbeHandle) -> Result<()> {
    let program = bpf
        .program_mut(handle.program)
        .with_context(|| format!("Failed to find {} program", handle.program))?;

    match handle.link {
        ProbeLink::KProbe(link) => {
            let program: &mut KProbe = program.try_into()?;
            program.detach(link)?;
        }
        ProbeLink::FExit(link) => {
            let program: &mut FExit = program.try_into()?;
            program.detach(link)?;
        }
    }

    telemetry::record_active_probe(handle.program, 0);
    info!("Detached {}", handle.program);
    Ok(())
}

fn kallsyms_contains<R: BufRead>(reader: R, symbol: &str) -> bool {
    reader.lines().map_while(Result::ok).any(|line| {
        // <address> <type> <name> [module]
        line.split_whitespace().nth(2) == Some(symbol)
    })
}

/// Whether `symbol` is currently known to the kernel. Module symbols only
/// show up once the module is loaded.
pub fn symbol_exists(symbol: &str) -> bool {
    match File::open(KALLSYMS) {
        Ok(file) => kallsyms_contains(BufReader::new(file), symbol),
        Err(e) => {
            warn!("Could not read {}: {}", KALLSYMS, e);
            false
        }
    }
}

/// Decodes one raw perf record. Short records are rejected.
pub fn decode<T: Pod>(raw: &[u8]) -> Option<T> {
    if raw.len() < std::mem::size_of::<T>() {
        return None;
    }
    Some(unsafe { (raw.as_ptr() as *const T).read_unaligned() })
}

/// Opens the perf buffer of every sender's CPU in `map_name` and forwards
/// decoded records to the sender until `shutdown` is raised.
pub fn spawn_perf_readers<T>(
    bpf: &mut Ebpf,
    map_name: &'static str,
    senders: Vec<ShardSender<T>>,
    shutdown: Arc<AtomicBool>,
) -> Result<()>
where
    T: Pod + Send + 'static,
{
    let mut perf_array = PerfEventArray::try_from(
        bpf.take_map(map_name)
            .with_context(|| format!("Failed to find {} map", map_name))?,
    )?;

    for sender in senders {
        let cpu = sender.cpu();
        let mut buf = perf_array
            .open(cpu, None)
            .with_context(|| format!("Failed to open {} buffer for cpu {}", map_name, cpu))?;
        let shutdown = shutdown.clone();

        tokio::task::spawn_blocking(move || {
            let mut buffers = (0..READ_BATCH)
                .map(|_| BytesMut::with_capacity(std::mem::size_of::<T>()))
                .collect::<Vec<_>>();

            'read: while !shutdown.load(Ordering::Relaxed) && !sender.is_closed() {
                let events = match buf.read_events(&mut buffers) {
                    Ok(events) => events,
                    Err(e) => {
                        warn!("{} cpu {}: read failed: {}", map_name, cpu, e);
                        break;
                    }
                };

                if events.lost > 0 {
                    warn!("{} cpu {}: {} records lost", map_name, cpu, events.lost);
                    telemetry::record_dropped(map_name, "perf", events.lost as u64);
                }

                for raw in &buffers[..events.read] {
                    let Some(event) = decode::<T>(raw) else {
                        warn!("{} cpu {}: short record ({} bytes)", map_name, cpu, raw.len());
                        continue;
                    };
                    match sender.try_send(event) {
                        Delivery::Queued => {}
                        Delivery::Dropped => telemetry::record_dropped(map_name, "queue", 1),
                        Delivery::Closed => break 'read,
                    }
                }

                if events.read == 0 {
                    std::thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
                }
            }
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vhostwatch_common::{IoctlEvent, ThreadCreateEvent, VHOST_SET_OWNER};

    const KALLSYMS_SAMPLE: &[u8] = b"\
ffffffff810c4f20 T __kthread_create_on_node
ffffffff810c5100 T kthread_create_on_node
ffffffffc0b3a2c0 t vhost_net_ioctl\t[vhost_net]
ffffffffc0b3a400 t vhost_net_open\t[vhost_net]
";

    #[test]
    fn test_kallsyms_lookup() {
        assert!(kallsyms_contains(KALLSYMS_SAMPLE, "vhost_net_ioctl"));
        assert!(kallsyms_contains(KALLSYMS_SAMPLE, "__kthread_create_on_node"));
        assert!(!kallsyms_contains(KALLSYMS_SAMPLE, "vhost_net"));
        assert!(!kallsyms_contains(KALLSYMS_SAMPLE, "vhost_net_ioct"));
        assert!(!kallsyms_contains(&b""[..], "vhost_net_ioctl"));
    }

    #[test]
    fn test_decode_ioctl_record() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&5u32.to_ne_bytes());
        raw.extend_from_slice(&VHOST_SET_OWNER.to_ne_bytes());

        let event: IoctlEvent = decode(&raw).unwrap();
        assert_eq!(event.cpu, 5);
        assert_eq!(event.ioctl_command, 0xAF01);
    }

    #[test]
    fn test_decode_ignores_perf_padding() {
        // perf pads samples to 8 bytes plus the size header, so trailing
        // bytes after the record are normal.
        let mut raw = Vec::new();
        raw.extend_from_slice(&2u32.to_ne_bytes());
        raw.extend_from_slice(&4242u32.to_ne_bytes());
        raw.extend_from_slice(&[0u8; 4]);

        let event: ThreadCreateEvent = decode(&raw).unwrap();
        assert_eq!(event, ThreadCreateEvent { cpu: 2, pid: 4242 });
    }

    #[test]
    fn test_decode_rejects_short_record() {
        assert!(decode::<IoctlEvent>(&[1, 2, 3]).is_none());
        assert!(decode::<IoctlEvent>(&[]).is_none());
    }
}
