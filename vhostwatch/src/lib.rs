pub mod channel;
pub mod consumer;
pub mod harness;
pub mod pinning;
pub mod probes;
pub mod settings;
pub mod telemetry;

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use anyhow::{Context, Result, bail};
use aya::{Ebpf, EbpfLoader, util::online_cpus};
use aya_log::EbpfLogger;
use log::{info, warn};
use tokio::signal;
use vhostwatch_common::{IoctlEvent, ThreadCreateEvent};

use crate::channel::EventReceiver;
use crate::consumer::Consumer;
use crate::probes::{
    ChannelSizing, KthreadCreateProbe, Probe, ProbeHandle, VhostIoctlProbe, kthread_create,
    task_layout, vhost_ioctl,
};
use crate::settings::Settings;

/// Receivers for the two kernel channels, one shard per online CPU.
pub struct Streams {
    pub ioctls: EventReceiver<IoctlEvent>,
    pub threads: EventReceiver<ThreadCreateEvent>,
}

/// Loaded eBPF object plus the links attached to it. Dropping the session
/// detaches whatever is still attached.
pub struct Session {
    pub settings: Settings,
    bpf: Ebpf,
    handles: Vec<ProbeHandle>,
    shutdown: Arc<AtomicBool>,
}

impl Session {
    pub fn new(settings: Settings, bytecode: &[u8]) -> Result<Self> {
        bump_memlock_rlimit()?;

        let layout = task_layout::resolve().context("Failed to resolve task_struct layout")?;

        let mut loader = EbpfLoader::new();
        loader.set_global("TASK_LAYOUT", &layout, true);

        match settings.channel_sizing() {
            ChannelSizing::PerCpu => {}
            ChannelSizing::Fixed(0) => bail!("channel capacity must be at least 1"),
            ChannelSizing::Fixed(capacity) => {
                let online = online_cpus().map_err(|(_, e)| e)?.len();
                if (capacity as usize) < online {
                    warn!(
                        "Channel capacity {} is below the {} online CPUs; events from higher CPUs will be lost",
                        capacity, online
                    );
                }
                loader.set_max_entries(vhost_ioctl::IOCTL_EVENTS, capacity);
                loader.set_max_entries(kthread_create::KTHREAD_EVENTS, capacity);
            }
        }

        let mut bpf = loader.load(bytecode).context("Failed to load eBPF object")?;
        if let Err(e) = EbpfLogger::init(&mut bpf) {
            warn!("Failed to initialize eBPF logger: {}", e);
        }

        Ok(Self {
            settings,
            bpf,
            handles: Vec::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Attaches both probes and starts a reader per CPU and channel.
    pub fn start(&mut self) -> Result<Streams> {
        let probes: [&dyn Probe; 2] = [&VhostIoctlProbe, &KthreadCreateProbe];
        for probe in probes {
            let handle = probe.attach(&mut self.bpf)?;
            self.handles.push(handle);
        }

        let mut cpus = online_cpus().map_err(|(_, e)| e)?;
        if let ChannelSizing::Fixed(capacity) = self.settings.channel_sizing() {
            // No perf buffer exists beyond the array's last slot.
            cpus.retain(|cpu| *cpu < capacity);
        }
        let depth = self.settings.queue_depth();

        let (senders, ioctls) = channel::channel(&cpus, depth);
        probes::spawn_perf_readers(
            &mut self.bpf,
            vhost_ioctl::IOCTL_EVENTS,
            senders,
            self.shutdown.clone(),
        )?;

        let (senders, threads) = channel::channel(&cpus, depth);
        probes::spawn_perf_readers(
            &mut self.bpf,
            kthread_create::KTHREAD_EVENTS,
            senders,
            self.shutdown.clone(),
        )?;

        info!("Reading events from {} CPUs", cpus.len());
        Ok(Streams { ioctls, threads })
    }

    /// Stops the readers and detaches every probe. Records still in flight
    /// are not drained.
    pub fn shutdown(&mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::Relaxed);
        for handle in self.handles.drain(..) {
            probes::detach(&mut self.bpf, handle)?;
        }
        Ok(())
    }

    pub async fn run(mut self) -> Result<()> {
        let action = self.settings.pin_action()?;
        let streams = self.start()?;
        let consumer = Consumer::new(&self.settings, action);
        let consumer = tokio::spawn(consumer.run(streams.ioctls, streams.threads));

        info!("Monitoring active. Press Ctrl-C to exit.");
        signal::ctrl_c().await?;
        info!("Exiting...");

        self.shutdown()?;
        // Readers notice the flag within one poll interval and drop their
        // senders, which ends the consumer.
        if let Err(e) = consumer.await {
            warn!("Consumer task failed: {}", e);
        }
        Ok(())
    }
}

fn bump_memlock_rlimit() -> Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        warn!("Failed to increase rlimit");
    }
    Ok(())
}
