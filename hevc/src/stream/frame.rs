//! Frame/Timing Queue.
//!
//! Capture events arrive from the message handler long before the
//! encoded picture they describe leaves the encoder. Each sub-stream
//! keeps a 128-entry FIFO bridging the two.

use spin::Mutex;
use tracing::{error, trace};

use crate::regs::STREAM_MAX;
use crate::types::FrameData;

/// Entries per sub-stream ring. One slot is kept open to tell full from
/// empty.
pub const FRAME_SLOTS: usize = 128;

struct FrameRing {
    entries: [FrameData; FRAME_SLOTS],
    ready: usize,
    done: usize,
}

impl FrameRing {
    const fn new() -> Self {
        Self {
            entries: [FrameData {
                stream_id: 0,
                sync_count: 0,
                itc_low: 0,
                itc_high: 0,
                itc_ext: 0,
                encode_time: 0,
            }; FRAME_SLOTS],
            ready: 0,
            done: 0,
        }
    }

    fn level(&self) -> usize {
        (self.ready + FRAME_SLOTS - self.done) % FRAME_SLOTS
    }
}

/// Per sub-stream capture FIFOs.
pub struct FrameQueues {
    rings: [Mutex<FrameRing>; STREAM_MAX],
}

impl Default for FrameQueues {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameQueues {
    pub fn new() -> Self {
        Self {
            rings: core::array::from_fn(|_| Mutex::new(FrameRing::new())),
        }
    }

    /// Append a capture record to its sub-stream.
    ///
    /// # Returns
    /// `false` if the stream id is out of range or the ring is full.
    pub fn push(&self, frame: FrameData) -> bool {
        let Some(ring) = self.rings.get(frame.stream_id) else {
            error!(stream_id = frame.stream_id, "frame for unknown stream");
            return false;
        };
        let mut ring = ring.lock();
        let next = (ring.ready + 1) % FRAME_SLOTS;
        if next == ring.done {
            error!(stream_id = frame.stream_id, "frame queue overflow");
            return false;
        }
        let slot = ring.ready;
        ring.entries[slot] = frame;
        ring.ready = next;
        trace!(stream_id = frame.stream_id, sync = frame.sync_count, "frame queued");
        true
    }

    /// Oldest capture record of a sub-stream.
    pub fn pop(&self, stream_id: usize) -> Option<FrameData> {
        let mut ring = self.rings.get(stream_id)?.lock();
        if ring.done == ring.ready {
            return None;
        }
        let frame = ring.entries[ring.done];
        ring.done = (ring.done + 1) % FRAME_SLOTS;
        Some(frame)
    }

    pub fn level(&self, stream_id: usize) -> usize {
        self.rings.get(stream_id).map_or(0, |r| r.lock().level())
    }

    pub fn levels(&self) -> [usize; STREAM_MAX] {
        core::array::from_fn(|i| self.level(i))
    }

    /// Empty the rings of every sub-stream whose bit is set.
    pub fn reset(&self, stream_bits: u32) {
        for (i, ring) in self.rings.iter().enumerate() {
            if stream_bits & (1 << i) != 0 {
                let mut ring = ring.lock();
                ring.ready = 0;
                ring.done = 0;
            }
        }
    }

    pub fn reset_all(&self) {
        self.reset((1 << STREAM_MAX) - 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(stream_id: usize, sync_count: u32) -> FrameData {
        FrameData {
            stream_id,
            sync_count,
            ..Default::default()
        }
    }

    #[test]
    fn test_fifo_order() {
        let q = FrameQueues::new();
        assert!(q.push(frame(1, 10)));
        assert!(q.push(frame(1, 11)));
        assert_eq!(q.level(1), 2);
        assert_eq!(q.pop(1).unwrap().sync_count, 10);
        assert_eq!(q.pop(1).unwrap().sync_count, 11);
        assert!(q.pop(1).is_none());
    }

    #[test]
    fn test_streams_are_independent() {
        let q = FrameQueues::new();
        q.push(frame(0, 1));
        assert!(q.pop(2).is_none());
        assert_eq!(q.levels(), [1, 0, 0, 0]);
    }

    #[test]
    fn test_full_ring_rejects_push() {
        let q = FrameQueues::new();
        for i in 0..FRAME_SLOTS - 1 {
            assert!(q.push(frame(3, i as u32)));
        }
        assert!(!q.push(frame(3, 999)));
        assert_eq!(q.level(3), FRAME_SLOTS - 1);
        q.pop(3);
        assert!(q.push(frame(3, 999)));
    }

    #[test]
    fn test_reset_by_bits() {
        let q = FrameQueues::new();
        q.push(frame(0, 1));
        q.push(frame(1, 1));
        q.reset(0b10);
        assert_eq!(q.levels(), [1, 0, 0, 0]);
        q.reset_all();
        assert_eq!(q.levels(), [0; STREAM_MAX]);
    }

    #[test]
    fn test_unknown_stream_rejected() {
        let q = FrameQueues::new();
        assert!(!q.push(frame(STREAM_MAX, 0)));
        assert!(q.pop(STREAM_MAX).is_none());
    }
}
