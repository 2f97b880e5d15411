//! Drains the host-side channels, renders records and drives the worker
//! scan after `VHOST_SET_OWNER`.

use std::{collections::VecDeque, path::PathBuf, time::Duration};

use chrono::{DateTime, Utc};
use log::{info, warn};
use procfs::process::Process;
use serde_json::json;
use vhostwatch_common::{IoctlEvent, ThreadCreateEvent, VhostIoctl};

use crate::channel::{EventReceiver, Record};
use crate::pinning::{self, PinAction};
use crate::probes::POLL_INTERVAL_MS;
use crate::settings::Settings;
use crate::telemetry;

/// Largest receive-time gap, either way, between a `VHOST_SET_OWNER` and
/// the worker it created. The two channels are read by separate readers
/// that each sleep for a poll interval when idle.
pub const ATTRIBUTION_WINDOW_MS: i64 = 2 * POLL_INTERVAL_MS as i64;

#[derive(Debug, Clone, Copy)]
pub enum WatchEvent {
    Ioctl(Record<IoctlEvent>),
    ThreadCreate(Record<ThreadCreateEvent>),
}

/// Links a worker creation to the `VHOST_SET_OWNER` that most likely
/// caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attribution {
    pub owner_cpu: u32,
    pub worker_cpu: u32,
    /// Worker receive time minus owner receive time. Negative when the
    /// worker record was read first.
    pub delay: chrono::Duration,
}

fn distance(a: DateTime<Utc>, b: DateTime<Utc>) -> chrono::Duration {
    if a >= b { a - b } else { b - a }
}

/// Pairs worker creations with `VHOST_SET_OWNER` records.
///
/// Records from the two channels arrive in no particular order, so worker
/// records are held in `pending` until every owner that could still match
/// them has had time to arrive. Owners on the worker's CPU win over owners
/// on other CPUs, since the worker is created inside the ioctl; ties go to
/// the nearest receive time.
#[derive(Debug)]
pub struct Correlator {
    window: chrono::Duration,
    owners: VecDeque<Record<IoctlEvent>>,
    pending: VecDeque<Record<ThreadCreateEvent>>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new(chrono::Duration::milliseconds(ATTRIBUTION_WINDOW_MS))
    }
}

impl Correlator {
    pub fn new(window: chrono::Duration) -> Self {
        Self {
            window,
            owners: VecDeque::new(),
            pending: VecDeque::new(),
        }
    }

    /// Returns `true` when `record` is a `VHOST_SET_OWNER`.
    pub fn observe_ioctl(&mut self, record: &Record<IoctlEvent>) -> bool {
        if VhostIoctl::from_command(record.event.ioctl_command) != Some(VhostIoctl::SetOwner) {
            return false;
        }
        self.owners.push_back(*record);
        true
    }

    pub fn push_thread(&mut self, record: Record<ThreadCreateEvent>) {
        self.pending.push_back(record);
    }

    pub fn attribute(&self, record: &Record<ThreadCreateEvent>) -> Option<Attribution> {
        self.owners
            .iter()
            .filter(|owner| distance(record.received_at, owner.received_at) <= self.window)
            .min_by_key(|owner| {
                (
                    owner.event.cpu != record.event.cpu,
                    distance(record.received_at, owner.received_at),
                )
            })
            .map(|owner| Attribution {
                owner_cpu: owner.event.cpu,
                worker_cpu: record.event.cpu,
                delay: record.received_at - owner.received_at,
            })
    }

    /// A same-CPU owner read at or after the worker can't be beaten by an
    /// owner that arrives later.
    fn is_settled(&self, record: &Record<ThreadCreateEvent>) -> bool {
        self.owners.iter().any(|owner| {
            owner.event.cpu == record.event.cpu
                && owner.received_at >= record.received_at
                && owner.received_at - record.received_at <= self.window
        })
    }

    /// Takes the held worker records whose attribution is final at `now`,
    /// in arrival order.
    pub fn release(
        &mut self,
        now: DateTime<Utc>,
    ) -> Vec<(Record<ThreadCreateEvent>, Option<Attribution>)> {
        let mut ready = Vec::new();
        let mut waiting = VecDeque::with_capacity(self.pending.len());
        while let Some(record) = self.pending.pop_front() {
            if now - record.received_at >= self.window || self.is_settled(&record) {
                ready.push((record, self.attribute(&record)));
            } else {
                waiting.push_back(record);
            }
        }
        self.pending = waiting;

        // Held workers are younger than one window; owners older than two
        // can't match them or anything still to come.
        let horizon = now - self.window - self.window;
        self.owners.retain(|owner| owner.received_at >= horizon);
        ready
    }

    /// Releases everything still held.
    pub fn flush(&mut self) -> Vec<(Record<ThreadCreateEvent>, Option<Attribution>)> {
        let pending = std::mem::take(&mut self.pending);
        pending
            .into_iter()
            .map(|record| (record, self.attribute(&record)))
            .collect()
    }
}

fn command_name(command: u32) -> &'static str {
    VhostIoctl::from_command(command).map_or("UNKNOWN", VhostIoctl::name)
}

/// One output line for `event`, either human readable or a JSON object.
pub fn render(event: &WatchEvent, attribution: Option<&Attribution>, as_json: bool) -> String {
    match (event, as_json) {
        (WatchEvent::Ioctl(record), false) => format!(
            "[CPU {}] vhost_net_ioctl {} ({:#x})",
            record.event.cpu,
            command_name(record.event.ioctl_command),
            record.event.ioctl_command
        ),
        (WatchEvent::Ioctl(record), true) => json!({
            "type": "ioctl",
            "received_at": record.received_at.to_rfc3339(),
            "cpu": record.event.cpu,
            "command": record.event.ioctl_command,
            "name": command_name(record.event.ioctl_command),
        })
        .to_string(),
        (WatchEvent::ThreadCreate(record), false) => {
            let mut line = format!(
                "[CPU {}] vhost worker created: pid {}",
                record.event.cpu, record.event.pid
            );
            if let Some(a) = attribution {
                line.push_str(&format!(
                    " (VHOST_SET_OWNER on CPU {}, {:+} ms)",
                    a.owner_cpu,
                    a.delay.num_milliseconds()
                ));
            }
            line
        }
        (WatchEvent::ThreadCreate(record), true) => {
            let mut value = json!({
                "type": "thread_create",
                "received_at": record.received_at.to_rfc3339(),
                "cpu": record.event.cpu,
                "pid": record.event.pid,
            });
            if let Some(a) = attribution {
                value["set_owner_cpu"] = json!(a.owner_cpu);
                value["delay_ms"] = json!(a.delay.num_milliseconds());
            }
            value.to_string()
        }
    }
}

pub struct Consumer {
    json: bool,
    action: PinAction,
    proc_root: PathBuf,
    scan_delay: Duration,
    correlator: Correlator,
}

impl Consumer {
    pub fn new(settings: &Settings, action: PinAction) -> Self {
        Self {
            json: settings.json.unwrap_or(false),
            action,
            proc_root: settings.proc_root(),
            scan_delay: settings.scan_delay(),
            correlator: Correlator::default(),
        }
    }

    /// Runs until both receivers are closed and drained.
    pub async fn run(
        mut self,
        mut ioctls: EventReceiver<IoctlEvent>,
        mut threads: EventReceiver<ThreadCreateEvent>,
    ) {
        // Wakes the loop so held worker records go out once their window
        // has passed, even when nothing else arrives.
        let mut tick = tokio::time::interval(Duration::from_millis(POLL_INTERVAL_MS));
        let mut ioctls_open = true;
        let mut threads_open = true;

        while ioctls_open || threads_open {
            tokio::select! {
                record = ioctls.recv(), if ioctls_open => match record {
                    Some(record) => self.on_ioctl(record),
                    None => ioctls_open = false,
                },
                record = threads.recv(), if threads_open => match record {
                    Some(record) => {
                        telemetry::record_thread_create_event(record.cpu);
                        self.correlator.push_thread(record);
                    }
                    None => threads_open = false,
                },
                _ = tick.tick() => {}
            }

            for (record, attribution) in self.correlator.release(Utc::now()) {
                self.on_thread_create(record, attribution);
            }
        }
        for (record, attribution) in self.correlator.flush() {
            self.on_thread_create(record, attribution);
        }

        let dropped = ioctls.dropped() + threads.dropped();
        if dropped > 0 {
            warn!("{} records dropped by full host queues", dropped);
        }
        info!("Consumer stopped");
    }

    fn on_ioctl(&mut self, record: Record<IoctlEvent>) {
        telemetry::record_ioctl_event(command_name(record.event.ioctl_command), record.cpu);
        println!("{}", render(&WatchEvent::Ioctl(record), None, self.json));

        if self.correlator.observe_ioctl(&record) {
            self.schedule_scan();
        }
    }

    fn on_thread_create(&self, record: Record<ThreadCreateEvent>, attribution: Option<Attribution>) {
        println!(
            "{}",
            render(&WatchEvent::ThreadCreate(record), attribution.as_ref(), self.json)
        );
        self.check_name(record.event.pid);
    }

    /// The task may already have been renamed or have exited by the time
    /// the record is read.
    fn check_name(&self, pid: u32) {
        let task_dir = self.proc_root.join(pid.to_string());
        tokio::task::spawn_blocking(move || {
            match Process::new_with_root(task_dir).and_then(|process| process.status()) {
                Ok(status) if pinning::is_vhost_name(&status.name) => {}
                Ok(status) => warn!("pid {} is now named {:?}, not vhost-*", pid, status.name),
                Err(e) => warn!("pid {} could not be inspected: {}", pid, e),
            }
        });
    }

    fn schedule_scan(&self) {
        let action = self.action.clone();
        let proc_root = self.proc_root.clone();
        let delay = self.scan_delay;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let result =
                tokio::task::spawn_blocking(move || pinning::apply(&action, &proc_root)).await;
            match result {
                Ok(Ok(0)) => {}
                Ok(Ok(pinned)) => telemetry::record_pinned_workers(pinned as u64),
                Ok(Err(e)) => warn!("Worker scan failed: {:#}", e),
                Err(e) => warn!("Worker scan task failed: {}", e),
            }
        });
    }
}
