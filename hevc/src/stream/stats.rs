//! Per sub-stream transfer statistics.
//!
//! Every figure is a min/avg/max triple in nanoseconds (bytes for sizes).
//! The average is an exponential moving average with a 1/128 weight.
//! Nothing is recorded while the device is not alive, so post-failure
//! garbage never reaches the averages.

use std::sync::Arc;
use std::time::{Duration, Instant};

use spin::Mutex;

use crate::register::Liveness;
use crate::regs::STREAM_MAX;

const AVERAGE_WEIGHT: i128 = 128;

/// Running min/avg/max.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatValue {
    pub min: u64,
    pub avg: u64,
    pub max: u64,
}

impl StatValue {
    pub fn record(&mut self, value: u64) {
        if self.min == 0 || value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
        if self.avg == 0 {
            self.avg = value;
        } else {
            let delta = (value as i128 - self.avg as i128) / AVERAGE_WEIGHT;
            self.avg = (self.avg as i128 + delta) as u64;
        }
        self.avg = self.avg.clamp(self.min, self.max);
    }
}

/// Lifecycle stamps of one stream task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskTimes {
    pub enqueue: Option<Instant>,
    pub send: Option<Instant>,
    pub ack: Option<Instant>,
    pub msg: Option<Instant>,
    pub dequeue: Option<Instant>,
}

fn span(from: Option<Instant>, to: Option<Instant>) -> Option<u64> {
    match (from, to) {
        (Some(a), Some(b)) => Some(b.saturating_duration_since(a).as_nanos() as u64),
        _ => None,
    }
}

/// Statistics of one (direction, sub-stream).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferStats {
    pub count: u64,
    pub interval: StatValue,
    pub size: StatValue,
    pub copy: StatValue,
    /// Send minus enqueue.
    pub enqueue: StatValue,
    /// Ack minus send.
    pub send: StatValue,
    /// Completion minus ack.
    pub dma: StatValue,
    /// Dequeue minus enqueue.
    pub dequeue: StatValue,
    last_transfer: Option<Instant>,
}

impl TransferStats {
    fn record_transfer(&mut self, size: usize, now: Instant) {
        self.count += 1;
        match self.last_transfer {
            Some(last) if self.count > 2 => {
                self.interval
                    .record(now.saturating_duration_since(last).as_nanos() as u64);
            }
            _ => self.interval = StatValue::default(),
        }
        self.last_transfer = Some(now);
        self.size.record(size as u64);
    }

    fn record_times(&mut self, times: &TaskTimes) {
        if let Some(v) = span(times.enqueue, times.send) {
            self.enqueue.record(v);
        }
        if let Some(v) = span(times.send, times.ack) {
            self.send.record(v);
        }
        if let Some(v) = span(times.ack, times.msg) {
            self.dma.record(v);
        }
        if let Some(v) = span(times.enqueue, times.dequeue) {
            self.dequeue.record(v);
        }
    }
}

/// Statistics of every sub-stream in one direction.
pub struct StatsTable {
    live: Arc<dyn Liveness>,
    streams: Mutex<[TransferStats; STREAM_MAX]>,
}

impl StatsTable {
    pub fn new(live: Arc<dyn Liveness>) -> Self {
        Self {
            live,
            streams: Mutex::new([TransferStats::default(); STREAM_MAX]),
        }
    }

    fn with<F: FnOnce(&mut TransferStats)>(&self, stream_id: usize, f: F) {
        if stream_id >= STREAM_MAX || !self.live.is_alive() {
            return;
        }
        f(&mut self.streams.lock()[stream_id]);
    }

    /// Count one transfer of `size` bytes.
    pub fn record_transfer(&self, stream_id: usize, size: usize) {
        let now = Instant::now();
        self.with(stream_id, |s| s.record_transfer(size, now));
    }

    pub fn record_copy(&self, stream_id: usize, elapsed: Duration) {
        self.with(stream_id, |s| s.copy.record(elapsed.as_nanos() as u64));
    }

    /// Record queue and DMA latencies of a finished task.
    pub fn record_times(&self, stream_id: usize, times: &TaskTimes) {
        self.with(stream_id, |s| s.record_times(times));
    }

    pub fn get(&self, stream_id: usize) -> TransferStats {
        self.streams
            .lock()
            .get(stream_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> [TransferStats; STREAM_MAX] {
        *self.streams.lock()
    }

    /// Zero every sub-stream whose bit is set.
    pub fn clear(&self, stream_bits: u32) {
        let mut streams = self.streams.lock();
        for (i, s) in streams.iter_mut().enumerate() {
            if stream_bits & (1 << i) != 0 {
                *s = TransferStats::default();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn table() -> (Arc<AtomicBool>, StatsTable) {
        let live = Arc::new(AtomicBool::new(true));
        (live.clone(), StatsTable::new(live))
    }

    #[test]
    fn test_stat_value_min_avg_max() {
        let mut v = StatValue::default();
        v.record(100);
        assert_eq!(v, StatValue { min: 100, avg: 100, max: 100 });
        v.record(228);
        assert_eq!(v.min, 100);
        assert_eq!(v.max, 228);
        assert_eq!(v.avg, 101);
        v.record(50);
        assert_eq!(v.min, 50);
        assert!(v.avg >= v.min && v.avg <= v.max);
    }

    #[test]
    fn test_zero_sample_replaces_min_once() {
        let mut v = StatValue::default();
        v.record(0);
        v.record(10);
        // a zero min is treated as unset
        assert_eq!(v.min, 10);
        assert_eq!(v.avg, 10);
    }

    #[test]
    fn test_interval_waits_for_third_transfer() {
        let (_, t) = table();
        t.record_transfer(0, 10);
        t.record_transfer(0, 20);
        assert_eq!(t.get(0).interval, StatValue::default());
        std::thread::sleep(Duration::from_millis(1));
        t.record_transfer(0, 30);
        let s = t.get(0);
        assert_eq!(s.count, 3);
        assert!(s.interval.min >= 1_000_000);
        assert_eq!(s.size.min, 10);
        assert_eq!(s.size.max, 30);
    }

    #[test]
    fn test_nothing_recorded_when_dead() {
        let (live, t) = table();
        live.store(false, Ordering::SeqCst);
        t.record_transfer(1, 10);
        t.record_copy(1, Duration::from_micros(5));
        assert_eq!(t.get(1), TransferStats::default());
    }

    #[test]
    fn test_record_times() {
        let (_, t) = table();
        let base = Instant::now();
        let times = TaskTimes {
            enqueue: Some(base),
            send: Some(base + Duration::from_nanos(100)),
            ack: Some(base + Duration::from_nanos(300)),
            msg: Some(base + Duration::from_nanos(600)),
            dequeue: None,
        };
        t.record_times(2, &times);
        let s = t.get(2);
        assert_eq!(s.enqueue.max, 100);
        assert_eq!(s.send.max, 200);
        assert_eq!(s.dma.max, 300);
        assert_eq!(s.dequeue, StatValue::default());
    }

    #[test]
    fn test_clear_by_bits() {
        let (_, t) = table();
        t.record_transfer(0, 1);
        t.record_transfer(3, 1);
        t.clear(0b1000);
        assert_eq!(t.get(0).count, 1);
        assert_eq!(t.get(3).count, 0);
    }
}
