//! Discovery and CPU pinning of vhost worker threads.
//!
//! After `VHOST_SET_OWNER` the consumer scans the proc root for tasks named
//! `vhost-*` and either lists them or restricts their affinity according
//! to the configured [`PinMode`].

use std::{fmt, path::Path};

use anyhow::{Context, Result, bail};
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use procfs::process::Status;
use regex::Regex;
use vhostwatch_common::{TASK_COMM_LEN, is_vhost_thread};

static CPU_LIST_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]+(-[0-9]+)?(,[0-9]+(-[0-9]+)?)*$").unwrap());

/// A Linux cpu-list such as `0-3,8,10-11`, kept as inclusive ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuList {
    ranges: Vec<(u32, u32)>,
}

impl CpuList {
    pub fn parse(list: &str) -> Result<Self> {
        let list = list.trim();
        if !CPU_LIST_RE.is_match(list) {
            bail!("invalid cpu list {:?}", list);
        }

        let mut ranges = Vec::new();
        for part in list.split(',') {
            let (start, end) = match part.split_once('-') {
                Some((start, end)) => (start.parse::<u32>()?, end.parse::<u32>()?),
                None => {
                    let cpu = part.parse::<u32>()?;
                    (cpu, cpu)
                }
            };
            if start > end {
                bail!("invalid cpu range {}-{} in {:?}", start, end, list);
            }
            ranges.push((start, end));
        }
        Ok(Self { ranges })
    }

    pub fn from_ranges(ranges: Vec<(u32, u32)>) -> Result<Self> {
        if ranges.is_empty() {
            bail!("empty cpu list");
        }
        if let Some((start, end)) = ranges.iter().find(|(start, end)| start > end) {
            bail!("invalid cpu range {}-{}", start, end);
        }
        Ok(Self { ranges })
    }

    pub fn single(cpu: u32) -> Self {
        Self {
            ranges: vec![(cpu, cpu)],
        }
    }

    pub fn first(&self) -> u32 {
        self.ranges[0].0
    }

    pub fn last(&self) -> u32 {
        self.ranges[self.ranges.len() - 1].1
    }

    pub fn is_single(&self) -> bool {
        self.ranges.len() == 1 && self.ranges[0].0 == self.ranges[0].1
    }

    pub fn cpus(&self) -> impl Iterator<Item = u32> + '_ {
        self.ranges.iter().flat_map(|&(start, end)| start..=end)
    }
}

impl fmt::Display for CpuList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (start, end)) in self.ranges.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            if start == end {
                write!(f, "{}", start)?;
            } else {
                write!(f, "{}-{}", start, end)?;
            }
        }
        Ok(())
    }
}

/// How a discovered worker is pinned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinMode {
    /// First CPU of the worker's current allowed list.
    First,
    /// Last CPU of the worker's current allowed list.
    Last,
    /// An explicit list, applied as is.
    Cpus(CpuList),
}

impl PinMode {
    pub fn parse(mode: &str) -> Result<Self> {
        match mode.trim() {
            "first" => Ok(PinMode::First),
            "last" => Ok(PinMode::Last),
            other => CpuList::parse(other)
                .map(PinMode::Cpus)
                .with_context(|| {
                    format!(
                        "invalid pin mode {:?} (accepted values: 'first', 'last', [0-9]+,)",
                        other
                    )
                }),
        }
    }
}

impl fmt::Display for PinMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinMode::First => f.write_str("first"),
            PinMode::Last => f.write_str("last"),
            PinMode::Cpus(list) => list.fmt(f),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinAction {
    /// Only list the workers.
    Discover,
    Pin(PinMode),
}

/// Computes the new allowed list for a worker. `None` means the current
/// list is kept.
pub fn pin_set(current: &CpuList, mode: &PinMode) -> Option<CpuList> {
    match mode {
        PinMode::Cpus(list) => Some(list.clone()),
        _ if current.is_single() => None,
        PinMode::First => Some(CpuList::single(current.first())),
        PinMode::Last => Some(CpuList::single(current.last())),
    }
}

/// A `vhost-*` task found under the proc root. Pre-6.4 kernels run the
/// worker as a kthread (`tid == tgid`); newer ones run it as a thread of the
/// owning process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VhostWorker {
    pub tid: i32,
    pub tgid: i32,
    pub name: String,
    pub cpus_allowed: CpuList,
}

/// Fixed-size, NUL padded copy of a task name, as the kernel stores it.
pub fn comm_bytes(name: &str) -> [u8; TASK_COMM_LEN] {
    let mut comm = [0u8; TASK_COMM_LEN];
    let len = name.len().min(TASK_COMM_LEN - 1);
    comm[..len].copy_from_slice(&name.as_bytes()[..len]);
    comm
}

pub fn is_vhost_name(name: &str) -> bool {
    is_vhost_thread(&comm_bytes(name))
}

fn worker_from_status(tid: i32, tgid: i32, status: Status) -> Option<VhostWorker> {
    if !is_vhost_name(&status.name) {
        return None;
    }
    let Some(ranges) = status.cpus_allowed_list else {
        debug!("tid {} has no Cpus_allowed_list; skipped", tid);
        return None;
    };
    let cpus_allowed = CpuList::from_ranges(ranges).ok()?;
    Some(VhostWorker {
        tid,
        tgid,
        name: status.name,
        cpus_allowed,
    })
}

/// Lists every `vhost-*` task under `proc_root`, looking at each thread of
/// each process. Tasks that vanish or can't be read mid-scan are skipped.
pub fn scan_workers(proc_root: &Path) -> Result<Vec<VhostWorker>> {
    let processes = procfs::process::all_processes_with_root(proc_root)
        .with_context(|| format!("Could not read proc directory {}", proc_root.display()))?;

    let mut workers = Vec::new();
    for process in processes {
        let Ok(process) = process else { continue };
        let tgid = process.pid;

        let Ok(tasks) = process.tasks() else {
            // No task directory; the leader is all there is.
            if let Ok(status) = process.status() {
                workers.extend(worker_from_status(tgid, tgid, status));
            }
            continue;
        };
        for task in tasks {
            let Ok(task) = task else { continue };
            let Ok(status) = task.status() else { continue };
            workers.extend(worker_from_status(task.tid, tgid, status));
        }
    }
    workers.sort_by_key(|worker| worker.tid);
    Ok(workers)
}

/// Restricts the task `tid` to `cpus` with `sched_setaffinity`.
pub fn pin_task(tid: i32, cpus: &CpuList) -> Result<()> {
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    for cpu in cpus.cpus() {
        if cpu as usize >= libc::CPU_SETSIZE as usize {
            bail!("cpu {} exceeds CPU_SETSIZE", cpu);
        }
        unsafe { libc::CPU_SET(cpu as usize, &mut set) };
    }

    let ret = unsafe {
        libc::sched_setaffinity(
            tid as libc::pid_t,
            std::mem::size_of::<libc::cpu_set_t>(),
            &set,
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("sched_setaffinity({}, {}) failed", tid, cpus));
    }
    Ok(())
}

/// Scans for workers and applies `action` to each. Returns the number of
/// workers pinned.
pub fn apply(action: &PinAction, proc_root: &Path) -> Result<usize> {
    info!("Scanning {} for vhost workers", proc_root.display());
    let workers = scan_workers(proc_root)?;

    let mut pinned = 0;
    for worker in workers {
        let mode = match action {
            PinAction::Discover => {
                info!(
                    "PID: {}, TID: {}, Name: {}, cpus_allowed_list: {}",
                    worker.tgid, worker.tid, worker.name, worker.cpus_allowed
                );
                continue;
            }
            PinAction::Pin(mode) => mode,
        };

        let Some(target) = pin_set(&worker.cpus_allowed, mode) else {
            debug!(
                "tid {} already runs on a single cpu ({}); left alone",
                worker.tid, worker.cpus_allowed
            );
            continue;
        };

        info!(
            "Pinning tid {} ({}) with pin mode {} from {} to {}",
            worker.tid, worker.name, mode, worker.cpus_allowed, target
        );
        match pin_task(worker.tid, &target) {
            Ok(()) => pinned += 1,
            Err(e) => warn!(
                "Could not pin process; PID: {}, TID: {}, Name: {}, PinMode: {}, err: {:#}",
                worker.tgid, worker.tid, worker.name, mode, e
            ),
        }
    }
    Ok(pinned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_list() {
        let list = CpuList::parse("0-3,5,7-8").unwrap();
        assert_eq!(list.cpus().collect::<Vec<_>>(), vec![0, 1, 2, 3, 5, 7, 8]);
        assert_eq!(list.first(), 0);
        assert_eq!(list.last(), 8);
        assert_eq!(list.to_string(), "0-3,5,7-8");
        assert!(!list.is_single());
    }

    #[test]
    fn test_parse_single_cpu() {
        let list = CpuList::parse("4").unwrap();
        assert!(list.is_single());
        assert_eq!(list.to_string(), "4");
    }

    #[test]
    fn test_reject_bad_cpu_lists() {
        for bad in ["", "a", "1-", "-1", "1,,2", "1-2-3", "3-1", "first"] {
            assert!(CpuList::parse(bad).is_err(), "{:?} should be rejected", bad);
        }
    }

    #[test]
    fn test_from_ranges() {
        let list = CpuList::from_ranges(vec![(0, 1), (4, 4)]).unwrap();
        assert_eq!(list.to_string(), "0-1,4");
        assert!(CpuList::from_ranges(vec![]).is_err());
        assert!(CpuList::from_ranges(vec![(3, 2)]).is_err());
    }

    #[test]
    fn test_parse_pin_mode() {
        assert_eq!(PinMode::parse("first").unwrap(), PinMode::First);
        assert_eq!(PinMode::parse("last").unwrap(), PinMode::Last);
        assert_eq!(
            PinMode::parse("2,4-5").unwrap(),
            PinMode::Cpus(CpuList::parse("2,4-5").unwrap())
        );
        assert!(PinMode::parse("middle").is_err());
        assert!(PinMode::parse("First").is_err());
    }

    #[test]
    fn test_explicit_list_always_applies() {
        let current = CpuList::single(3);
        let mode = PinMode::Cpus(CpuList::parse("3").unwrap());
        assert_eq!(pin_set(&current, &mode), Some(CpuList::single(3)));
    }

    #[test]
    fn test_single_cpu_left_alone() {
        let current = CpuList::single(7);
        assert_eq!(pin_set(&current, &PinMode::First), None);
        assert_eq!(pin_set(&current, &PinMode::Last), None);
    }

    #[test]
    fn test_first_and_last() {
        let current = CpuList::parse("2-5,9-11").unwrap();
        assert_eq!(pin_set(&current, &PinMode::First), Some(CpuList::single(2)));
        assert_eq!(pin_set(&current, &PinMode::Last), Some(CpuList::single(11)));
    }

    #[test]
    fn test_vhost_name_filter() {
        assert!(is_vhost_name("vhost-1234"));
        assert!(is_vhost_name("vhost-net-worker-long-name"));
        assert!(!is_vhost_name("vhost"));
        assert!(!is_vhost_name("qemu-system-x86"));
    }

    #[test]
    fn test_scan_finds_kthread_and_thread_workers() {
        // 77 is a kthread worker; 4250 is a worker thread inside qemu 4242.
        let proc_root = Path::new(env!("CARGO_MANIFEST_DIR")).join("test_data/proc");
        let workers = scan_workers(&proc_root).unwrap();

        assert_eq!(
            workers,
            vec![
                VhostWorker {
                    tid: 77,
                    tgid: 77,
                    name: "vhost-3000".to_string(),
                    cpus_allowed: CpuList::parse("2-3").unwrap(),
                },
                VhostWorker {
                    tid: 4250,
                    tgid: 4242,
                    name: "vhost-4242".to_string(),
                    cpus_allowed: CpuList::parse("0-3").unwrap(),
                },
            ]
        );
    }

    #[test]
    fn test_discover_leaves_workers_alone() {
        let proc_root = Path::new(env!("CARGO_MANIFEST_DIR")).join("test_data/proc");
        assert_eq!(apply(&PinAction::Discover, &proc_root).unwrap(), 0);
    }

    #[test]
    fn test_scan_missing_root() {
        assert!(scan_workers(Path::new("/nonexistent/proc")).is_err());
    }

    #[test]
    fn test_comm_bytes_truncates() {
        let comm = comm_bytes("abcdefghijklmnopqrstuvwxyz");
        assert_eq!(&comm[..15], b"abcdefghijklmno");
        assert_eq!(comm[15], 0);
    }
}
