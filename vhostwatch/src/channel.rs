//! Host side of the per-CPU transport.
//!
//! Each CPU gets its own bounded queue with exactly one producer: the perf
//! reader for that CPU. Producers never wait. A full queue drops the record
//! and bumps that shard's drop counter, so a stalled consumer can't back up
//! into the perf buffers. Order is FIFO per shard; nothing orders records
//! across shards.

use std::{
    future::poll_fn,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{self, error::TrySendError};

/// A decoded record, tagged with the CPU buffer it came from.
#[derive(Debug, Clone, Copy)]
pub struct Record<T> {
    pub cpu: u32,
    pub received_at: DateTime<Utc>,
    pub event: T,
}

/// Outcome of [`ShardSender::try_send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// The shard was full; the record is gone and counted.
    Dropped,
    /// The receiver is gone.
    Closed,
}

pub struct ShardSender<T> {
    cpu: u32,
    tx: mpsc::Sender<Record<T>>,
    dropped: Arc<AtomicU64>,
}

impl<T> ShardSender<T> {
    pub fn cpu(&self) -> u32 {
        self.cpu
    }

    /// Queues `event` without waiting.
    pub fn try_send(&self, event: T) -> Delivery {
        let record = Record {
            cpu: self.cpu,
            received_at: Utc::now(),
            event,
        };
        match self.tx.try_send(record) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Delivery::Dropped
            }
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct Shard<T> {
    cpu: u32,
    rx: mpsc::Receiver<Record<T>>,
    dropped: Arc<AtomicU64>,
}

pub struct EventReceiver<T> {
    shards: Vec<Shard<T>>,
    // Shard polled first on the next receive, so one busy CPU can't starve
    // the others.
    next: usize,
}

impl<T> EventReceiver<T> {
    /// Next record from any shard. `None` once every sender is gone and all
    /// shards are drained.
    pub async fn recv(&mut self) -> Option<Record<T>> {
        poll_fn(|cx| self.poll_recv(cx)).await
    }

    fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<Record<T>>> {
        let count = self.shards.len();
        let mut closed = 0;
        for i in 0..count {
            let idx = (self.next + i) % count;
            match self.shards[idx].rx.poll_recv(cx) {
                Poll::Ready(Some(record)) => {
                    self.next = (idx + 1) % count;
                    return Poll::Ready(Some(record));
                }
                Poll::Ready(None) => closed += 1,
                Poll::Pending => {}
            }
        }
        if closed == count {
            Poll::Ready(None)
        } else {
            Poll::Pending
        }
    }

    /// Takes the oldest queued record of one CPU, if any.
    pub fn try_recv_from(&mut self, cpu: u32) -> Option<Record<T>> {
        self.shards
            .iter_mut()
            .find(|shard| shard.cpu == cpu)?
            .rx
            .try_recv()
            .ok()
    }

    pub fn dropped_on(&self, cpu: u32) -> u64 {
        self.shards
            .iter()
            .find(|shard| shard.cpu == cpu)
            .map_or(0, |shard| shard.dropped.load(Ordering::Relaxed))
    }

    pub fn dropped(&self) -> u64 {
        self.shards
            .iter()
            .map(|shard| shard.dropped.load(Ordering::Relaxed))
            .sum()
    }
}

/// One bounded shard of `capacity` records per entry of `cpus`.
pub fn channel<T>(cpus: &[u32], capacity: usize) -> (Vec<ShardSender<T>>, EventReceiver<T>) {
    let mut senders = Vec::with_capacity(cpus.len());
    let mut shards = Vec::with_capacity(cpus.len());

    for &cpu in cpus {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        senders.push(ShardSender {
            cpu,
            tx,
            dropped: dropped.clone(),
        });
        shards.push(Shard { cpu, rx, dropped });
    }

    (senders, EventReceiver { shards, next: 0 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_shard_drops_excess() {
        let (senders, mut rx) = channel::<u32>(&[0, 1], 2);

        assert_eq!(senders[0].try_send(10), Delivery::Queued);
        assert_eq!(senders[0].try_send(11), Delivery::Queued);
        assert_eq!(senders[0].try_send(12), Delivery::Dropped);
        assert_eq!(senders[0].try_send(13), Delivery::Dropped);

        assert_eq!(rx.dropped_on(0), 2);
        assert_eq!(rx.dropped_on(1), 0);

        // Records queued before the overflow are intact and in order.
        assert_eq!(rx.try_recv_from(0).map(|r| r.event), Some(10));
        assert_eq!(rx.try_recv_from(0).map(|r| r.event), Some(11));
        assert!(rx.try_recv_from(0).is_none());

        // Space freed by the consumer is usable again.
        assert_eq!(senders[0].try_send(14), Delivery::Queued);
        assert_eq!(rx.try_recv_from(0).map(|r| r.event), Some(14));
    }

    #[test]
    fn test_shards_are_isolated() {
        let (senders, mut rx) = channel::<u32>(&[0, 3], 4);

        senders[1].try_send(30);
        senders[0].try_send(0);

        let record = rx.try_recv_from(3).unwrap();
        assert_eq!(record.cpu, 3);
        assert_eq!(record.event, 30);
        assert!(rx.try_recv_from(3).is_none());
        assert_eq!(rx.try_recv_from(0).map(|r| r.cpu), Some(0));
        assert!(rx.try_recv_from(7).is_none());
    }

    #[test]
    fn test_concurrent_producers_keep_per_cpu_order() {
        const PER_CPU: u32 = 500;
        let cpus = [0, 1, 2, 3];
        let (senders, mut rx) = channel::<(u32, u32)>(&cpus, PER_CPU as usize);

        let handles: Vec<_> = senders
            .into_iter()
            .map(|sender| {
                std::thread::spawn(move || {
                    for seq in 0..PER_CPU {
                        assert_eq!(sender.try_send((sender.cpu(), seq)), Delivery::Queued);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for cpu in cpus {
            let mut expected = 0;
            while let Some(record) = rx.try_recv_from(cpu) {
                assert_eq!(record.cpu, cpu);
                assert_eq!(record.event, (cpu, expected));
                expected += 1;
            }
            assert_eq!(expected, PER_CPU);
        }
        assert_eq!(rx.dropped(), 0);
    }

    #[tokio::test]
    async fn test_recv_round_robins_and_ends() {
        let (senders, mut rx) = channel::<u32>(&[0, 1], 8);

        senders[0].try_send(1);
        senders[0].try_send(2);
        senders[1].try_send(100);
        drop(senders);

        let mut seen = Vec::new();
        while let Some(record) = rx.recv().await {
            seen.push((record.cpu, record.event));
        }

        assert_eq!(seen, vec![(0, 1), (1, 100), (0, 2)]);
    }

    #[tokio::test]
    async fn test_send_after_receiver_gone() {
        let (senders, rx) = channel::<u32>(&[0], 1);
        drop(rx);
        assert!(senders[0].is_closed());
        assert_eq!(senders[0].try_send(1), Delivery::Closed);
        // A closed shard is not a full one.
        assert_eq!(senders[0].dropped.load(Ordering::Relaxed), 0);
    }
}
