//! Stream Transfer Queue.
//!
//! One instance per DMA direction: a 32-slot ring of transfer tasks, each
//! bound to a sub-stream and carrying one bounce-buffer group. A single
//! sender pass submits at most one transfer per direction at a time,
//! round-robin across sub-streams with ready work and oldest first within
//! a sub-stream.
//!
//! # Slot lifecycle
//! ```text
//! Free -> Ready -> Sent -> Acked -> Completed -> (api done) -> Free
//! ```
//! The caller marks "api done" with `dequeue`; whichever of dequeue and
//! completion comes last frees the slot.

pub mod buffer;
pub mod frame;
pub mod segment;
pub mod stats;

use std::sync::Arc;
use std::time::{Duration, Instant};

use spin::Mutex;
use tracing::{debug, error, trace, warn};

use crate::config::HevcConfig;
use crate::error::{HevcError, Result};
use crate::register::Liveness;
use crate::regs::{self, STREAM_MAX};
use crate::sync::Event;
use crate::types::{Direction, QueueStatus};

use buffer::{BufferGroup, BufferPool, DmaAllocator, TransferSetup};
use stats::{StatsTable, TaskTimes};

/// Transfer ring capacity per direction.
pub const STREAM_SLOTS: usize = 32;

/// Submission seam between the queue and the register layer.
pub trait StreamPort {
    /// Program the descriptor table and take a continuity count.
    fn setup_transfer(&self, direction: Direction, setup: &TransferSetup) -> Result<u32>;
    /// Ring the direction's DMA doorbell.
    fn submit_transfer(&self, direction: Direction);
}

/// Reference to an enqueued transfer.
///
/// The epoch ties a handle to one lifetime of the ring: a `reset` makes
/// every earlier handle stale, even once its slot and sequence number
/// come round again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHandle {
    slot: usize,
    seq: u32,
    epoch: u32,
}

impl StreamHandle {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

/// DMA ack block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DmaAck {
    pub count: u32,
    pub stream_id: u32,
    pub result: u32,
}

/// DMA completion block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DmaCompletion {
    pub count: u32,
    pub stream_id: u32,
    pub result: u32,
    pub video_size: u32,
    pub info_size: u32,
    pub last_frame: bool,
}

struct StreamTask {
    ready: bool,
    sent: bool,
    acked: bool,
    completed: bool,
    api_done: bool,
    stream_id: usize,
    seq: u32,
    count: u32,
    last_frame: bool,
    group: Option<BufferGroup>,
    ack: Option<DmaAck>,
    completion: Option<DmaCompletion>,
    error: Option<HevcError>,
    times: TaskTimes,
}

impl StreamTask {
    fn free() -> Self {
        Self {
            ready: false,
            sent: true,
            acked: true,
            completed: true,
            api_done: true,
            stream_id: 0,
            seq: 0,
            count: 0,
            last_frame: false,
            group: None,
            ack: None,
            completion: None,
            error: None,
            times: TaskTimes::default(),
        }
    }

    fn release(&mut self) -> Option<BufferGroup> {
        self.ready = false;
        self.sent = true;
        self.acked = true;
        self.completed = true;
        self.api_done = true;
        self.group.take()
    }

    fn in_flight(&self) -> bool {
        self.ready && self.sent && !self.acked
    }
}

struct StreamRing {
    tasks: Vec<StreamTask>,
    ready_cursor: usize,
    send_cursor: usize,
    last_id: usize,
    count: u32,
    level: usize,
    /// Bumped by every reset.
    epoch: u32,
}

impl StreamRing {
    fn new() -> Self {
        Self {
            tasks: (0..STREAM_SLOTS).map(|_| StreamTask::free()).collect(),
            ready_cursor: 0,
            send_cursor: 0,
            last_id: STREAM_MAX - 1,
            count: 0,
            level: 0,
            epoch: 0,
        }
    }

    fn handle(&self, slot: usize) -> StreamHandle {
        StreamHandle {
            slot,
            seq: self.tasks[slot].seq,
            epoch: self.epoch,
        }
    }

    /// The live task `handle` refers to.
    fn task_mut(&mut self, handle: &StreamHandle) -> Option<&mut StreamTask> {
        if handle.epoch != self.epoch {
            return None;
        }
        self.tasks
            .get_mut(handle.slot)
            .filter(|t| t.ready && t.seq == handle.seq)
    }

    fn update_level(&mut self) {
        self.level = self.tasks.iter().filter(|t| t.ready).count();
    }

    /// Enqueues since `seq`; larger is older.
    fn age(&self, seq: u32) -> u32 {
        self.count.wrapping_sub(seq)
    }

    /// Oldest slot matching `pred`.
    fn oldest<F: Fn(&StreamTask) -> bool>(&self, pred: F) -> Option<usize> {
        self.tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| pred(t))
            .max_by_key(|(_, t)| self.age(t.seq))
            .map(|(i, _)| i)
    }
}

struct SlotEvents {
    ack: Event,
    result: Event,
}

enum SendOutcome {
    Sent,
    Idle,
    Failed,
}

pub struct StreamQueue {
    direction: Direction,
    ring: Mutex<StreamRing>,
    events: Vec<SlotEvents>,
    pools: Vec<BufferPool>,
    stats: StatsTable,
    timeout: Duration,
    buffer_timeout: Duration,
    orphan_distance: u32,
}

impl StreamQueue {
    /// Build the ring and allocate every bounce-buffer group.
    ///
    /// # Returns
    /// `NoDevice` if DMA memory cannot be allocated.
    pub fn new(
        direction: Direction,
        config: &HevcConfig,
        allocator: &dyn DmaAllocator,
        live: Arc<dyn Liveness>,
    ) -> Result<Self> {
        let transfer = config.transfer(direction);
        let pools = (0..STREAM_MAX)
            .map(|id| BufferPool::allocate(direction, id, transfer, allocator))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            direction,
            ring: Mutex::new(StreamRing::new()),
            events: (0..STREAM_SLOTS)
                .map(|_| SlotEvents {
                    ack: Event::new(),
                    result: Event::new(),
                })
                .collect(),
            pools,
            stats: StatsTable::new(live),
            timeout: config.stream_timeout,
            buffer_timeout: config.buffer_timeout,
            orphan_distance: config.orphan_distance,
        })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn stats(&self) -> &StatsTable {
        &self.stats
    }

    // ═══════════════════════════════════════════════════════════════════════
    // BUFFERS
    // ═══════════════════════════════════════════════════════════════════════

    /// Take a bounce-buffer group for a sub-stream, waiting for one to
    /// come free.
    pub fn acquire(&self, stream_id: usize) -> Result<BufferGroup> {
        let pool = self.pools.get(stream_id).ok_or(HevcError::BadParameter)?;
        pool.acquire(self.buffer_timeout)
    }

    pub fn release(&self, group: BufferGroup) {
        match self.pools.get(group.stream_id()) {
            Some(pool) => pool.release(group),
            None => error!(stream_id = group.stream_id(), "group from unknown stream"),
        }
    }

    /// Groups currently out of a sub-stream's pool.
    pub fn active_buffers(&self, stream_id: usize) -> usize {
        self.pools.get(stream_id).map_or(0, BufferPool::active)
    }

    pub fn pool_size(&self, stream_id: usize) -> usize {
        self.pools.get(stream_id).map_or(0, BufferPool::size)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // QUEUE
    // ═══════════════════════════════════════════════════════════════════════

    /// Queue a filled (VEI) or empty (SEO) group for transfer.
    ///
    /// The group belongs to the task from here on; on failure it goes
    /// straight back to its pool. The caller schedules the sender.
    ///
    /// # Returns
    /// `Busy` if every slot holds a task.
    pub fn enqueue(
        &self,
        stream_id: usize,
        group: BufferGroup,
        last_frame: bool,
    ) -> Result<StreamHandle> {
        if stream_id >= STREAM_MAX || group.stream_id() != stream_id {
            self.release(group);
            return Err(HevcError::BadParameter);
        }
        let mut ring = self.ring.lock();
        let start = ring.ready_cursor;
        let Some(slot) = (0..STREAM_SLOTS)
            .map(|i| (start + i) % STREAM_SLOTS)
            .find(|&i| !ring.tasks[i].ready)
        else {
            drop(ring);
            debug!(direction = self.direction.name(), stream_id, "stream ring full");
            self.release(group);
            return Err(HevcError::Busy);
        };

        let seq = ring.count;
        ring.tasks[slot] = StreamTask {
            ready: true,
            sent: false,
            acked: false,
            completed: false,
            api_done: false,
            stream_id,
            seq,
            last_frame,
            group: Some(group),
            times: TaskTimes {
                enqueue: Some(Instant::now()),
                ..TaskTimes::default()
            },
            ..StreamTask::free()
        };
        self.events[slot].ack.clear();
        self.events[slot].result.clear();
        ring.ready_cursor = (slot + 1) % STREAM_SLOTS;
        ring.count = ring.count.wrapping_add(1);
        ring.update_level();
        trace!(direction = self.direction.name(), stream_id, slot, seq, "transfer enqueued");
        Ok(ring.handle(slot))
    }

    /// Submit the next transfer unless one is still awaiting its ack.
    ///
    /// # Returns
    /// `true` if a transfer went to the hardware.
    pub fn send(&self, port: &dyn StreamPort) -> bool {
        loop {
            match self.send_one(port) {
                SendOutcome::Sent => return true,
                SendOutcome::Idle => return false,
                SendOutcome::Failed => continue,
            }
        }
    }

    fn send_one(&self, port: &dyn StreamPort) -> SendOutcome {
        let (handle, stream_id, setup) = {
            let mut ring = self.ring.lock();
            if ring.tasks.iter().any(StreamTask::in_flight) {
                return SendOutcome::Idle;
            }

            let mut candidates = [None; STREAM_MAX];
            for (id, candidate) in candidates.iter_mut().enumerate() {
                *candidate = ring.oldest(|t| t.ready && !t.sent && t.stream_id == id);
            }
            let last_id = ring.last_id;
            let Some((stream_id, slot)) = (1..=STREAM_MAX)
                .map(|k| (last_id + k) % STREAM_MAX)
                .find_map(|id| candidates[id].map(|slot| (id, slot)))
            else {
                return SendOutcome::Idle;
            };

            let task = &mut ring.tasks[slot];
            task.sent = true;
            task.times.send = Some(Instant::now());
            let setup = task.group.as_ref().map(|g| g.transfer_setup(task.last_frame));
            ring.send_cursor = slot;
            ring.last_id = stream_id;
            (ring.handle(slot), stream_id, setup)
        };
        let slot = handle.slot;

        let result = match setup {
            Some(setup) => port.setup_transfer(self.direction, &setup),
            None => Err(HevcError::DmaFailed),
        };
        match result {
            Ok(count) => {
                if let Some(task) = self.ring.lock().task_mut(&handle) {
                    task.count = count;
                    task.times.send = Some(Instant::now());
                }
                port.submit_transfer(self.direction);
                debug!(direction = self.direction.name(), stream_id, slot, count, "transfer sent");
                SendOutcome::Sent
            }
            Err(e) => {
                error!(direction = self.direction.name(), stream_id, slot, error = %e, "transfer setup failed");
                if let Some(task) = self.ring.lock().task_mut(&handle) {
                    task.acked = true;
                    task.completed = true;
                    task.error = Some(HevcError::DmaFailed);
                }
                self.events[slot].ack.signal();
                self.events[slot].result.signal();
                SendOutcome::Failed
            }
        }
    }

    /// Match a DMA ack to the oldest sent task of its sub-stream with the
    /// same count.
    ///
    /// # Returns
    /// `false` if nothing matched; the ack is logged and dropped.
    pub fn record_ack(&self, ack: DmaAck) -> bool {
        let stream_id = ack.stream_id as usize;
        if stream_id >= STREAM_MAX {
            error!(direction = self.direction.name(), stream_id, "ack for unknown stream");
            return false;
        }
        let matched = {
            let mut ring = self.ring.lock();
            let in_flight = ring
                .tasks
                .iter()
                .filter(|t| t.in_flight() && t.stream_id == stream_id)
                .count();
            if in_flight > 1 {
                error!(direction = self.direction.name(), stream_id, in_flight, "duplicate sent task");
            }
            let found = ring.oldest(|t| t.in_flight() && t.stream_id == stream_id && t.count == ack.count);
            found.map(|slot| {
                let handle = ring.handle(slot);
                let task = &mut ring.tasks[slot];
                task.ack = Some(ack);
                task.acked = true;
                task.times.ack = Some(Instant::now());
                let failed = ack.result != regs::dma::RESULT_OK;
                if failed {
                    task.error = Some(HevcError::DmaFailed);
                    task.completed = true;
                    task.completion = Some(DmaCompletion {
                        count: ack.count,
                        stream_id: ack.stream_id,
                        result: ack.result,
                        ..DmaCompletion::default()
                    });
                }
                (handle, failed)
            })
        };
        let Some((handle, failed)) = matched else {
            error!(
                direction = self.direction.name(),
                stream_id,
                count = ack.count,
                "ack matches no sent transfer"
            );
            return false;
        };
        let slot = handle.slot;
        if failed {
            warn!(direction = self.direction.name(), stream_id, result = ack.result, "transfer failed at ack");
            self.events[slot].result.signal();
        }
        trace!(direction = self.direction.name(), stream_id, slot, count = ack.count, "transfer ack");
        self.events[slot].ack.signal();
        if let Some(group) = self.done(&handle, false) {
            self.release(group);
        }
        true
    }

    /// Match a DMA completion to the oldest uncompleted task of its
    /// sub-stream with the same count.
    ///
    /// # Returns
    /// `false` if nothing matched; the completion is logged and dropped.
    pub fn record_result(&self, completion: DmaCompletion) -> bool {
        let stream_id = completion.stream_id as usize;
        if stream_id >= STREAM_MAX {
            error!(direction = self.direction.name(), stream_id, "completion for unknown stream");
            return false;
        }
        let direction = self.direction;
        let matched = {
            let mut ring = self.ring.lock();
            let found = ring.oldest(|t| {
                t.ready && t.sent && !t.completed && t.stream_id == stream_id && t.count == completion.count
            });
            found.map(|slot| {
                let handle = ring.handle(slot);
                let task = &mut ring.tasks[slot];
                let lost_ack = !task.acked;
                if lost_ack {
                    task.ack = Some(DmaAck {
                        count: completion.count,
                        stream_id: completion.stream_id,
                        result: completion.result,
                    });
                }
                task.acked = true;
                task.completed = true;
                task.completion = Some(completion);
                task.times.msg = Some(Instant::now());
                if completion.result != regs::dma::RESULT_OK {
                    task.error = Some(HevcError::DmaFailed);
                }
                if direction == Direction::Seo {
                    if let Some(group) = task.group.as_mut() {
                        group.video_size = completion.video_size as usize;
                        group.info_size = completion.info_size as usize;
                        group.last_frame = completion.last_frame;
                    }
                }
                (handle, lost_ack)
            })
        };
        let Some((handle, lost_ack)) = matched else {
            error!(
                direction = self.direction.name(),
                stream_id,
                count = completion.count,
                "completion matches no sent transfer"
            );
            return false;
        };
        let slot = handle.slot;
        if lost_ack {
            warn!(direction = self.direction.name(), stream_id, slot, "completion before ack");
            self.events[slot].ack.signal();
        }
        trace!(
            direction = self.direction.name(),
            stream_id,
            slot,
            count = completion.count,
            size = completion.video_size,
            "transfer complete"
        );
        self.events[slot].result.signal();
        if let Some(group) = self.done(&handle, false) {
            self.release(group);
        }
        true
    }

    /// Free a slot once every party is through with it, or unconditionally
    /// when `force` is set.
    ///
    /// # Returns
    /// The task's group, for the caller to copy out or release.
    fn done(&self, handle: &StreamHandle, force: bool) -> Option<BufferGroup> {
        let slot = handle.slot;
        let (group, stream_id, times, ok) = {
            let mut ring = self.ring.lock();
            let task = ring.task_mut(handle)?;
            let finished = task.api_done && task.sent && task.acked && task.completed;
            if !finished && !force {
                return None;
            }
            let ok = task.error.is_none()
                && task
                    .completion
                    .is_some_and(|c| c.result == regs::dma::RESULT_OK);
            let stream_id = task.stream_id;
            let times = task.times;
            let group = task.release();
            ring.update_level();
            (group, stream_id, times, ok)
        };
        if ok {
            self.stats.record_times(stream_id, &times);
        }
        trace!(direction = self.direction.name(), stream_id, slot, force, "transfer done");
        group
    }

    /// Caller is finished with a task.
    ///
    /// A task never sent is cancelled on the spot. A task in flight keeps
    /// its group until completion, orphan sweep or reset.
    ///
    /// # Returns
    /// The group if the task finished here; the caller copies out of it
    /// and releases it.
    pub fn dequeue(&self, handle: &StreamHandle) -> Option<BufferGroup> {
        {
            let mut ring = self.ring.lock();
            let task = ring.task_mut(handle)?;
            task.api_done = true;
            task.times.dequeue = Some(Instant::now());
            if !task.sent {
                let stream_id = task.stream_id;
                let group = task.release();
                ring.update_level();
                debug!(direction = self.direction.name(), stream_id, slot = handle.slot, "unsent transfer cancelled");
                return group;
            }
        }
        self.done(handle, false)
    }

    fn check(&self, handle: &StreamHandle) -> Result<()> {
        let ring = self.ring.lock();
        let task = ring.tasks.get(handle.slot).ok_or(HevcError::BadParameter)?;
        if handle.epoch != ring.epoch || task.seq != handle.seq {
            return Err(HevcError::BadState);
        }
        if let Some(e) = task.error {
            return Err(e);
        }
        if !task.ready {
            return Err(HevcError::BadState);
        }
        Ok(())
    }

    /// Block until the transfer is acked.
    ///
    /// # Returns
    /// `DmaFailed` for a failed transfer, `Timeout` after the wait
    /// window, `OrphanedTask` or `BadState` if the task was torn down.
    pub fn wait_ack(&self, handle: &StreamHandle) -> Result<DmaAck> {
        let event = &self.events.get(handle.slot).ok_or(HevcError::BadParameter)?.ack;
        self.check(handle)?;
        let signaled = event.wait(self.timeout);
        self.check(handle)?;
        if !signaled {
            return Err(HevcError::Timeout);
        }
        let ring = self.ring.lock();
        ring.tasks[handle.slot].ack.ok_or(HevcError::Timeout)
    }

    /// Block until the transfer completes.
    pub fn wait_result(&self, handle: &StreamHandle) -> Result<DmaCompletion> {
        let event = &self.events.get(handle.slot).ok_or(HevcError::BadParameter)?.result;
        self.check(handle)?;
        let signaled = event.wait(self.timeout);
        self.check(handle)?;
        if !signaled {
            return Err(HevcError::Timeout);
        }
        let ring = self.ring.lock();
        ring.tasks[handle.slot].completion.ok_or(HevcError::Timeout)
    }

    /// Force-complete tasks that fell `orphan_distance` enqueues behind.
    ///
    /// # Returns
    /// Number of tasks reclaimed.
    pub fn orphan_sweep(&self) -> usize {
        let orphans: Vec<StreamHandle> = {
            let mut ring = self.ring.lock();
            let count = ring.count;
            let epoch = ring.epoch;
            let distance = self.orphan_distance;
            ring.tasks
                .iter_mut()
                .enumerate()
                .filter(|(_, t)| t.ready && count.wrapping_sub(t.seq) > distance)
                .map(|(slot, t)| {
                    t.error = Some(HevcError::OrphanedTask);
                    StreamHandle { slot, seq: t.seq, epoch }
                })
                .collect()
        };
        for handle in &orphans {
            let slot = handle.slot;
            error!(direction = self.direction.name(), slot, seq = handle.seq, "orphaned transfer reclaimed");
            if let Some(group) = self.done(handle, true) {
                self.release(group);
            }
            self.events[slot].ack.signal();
            self.events[slot].result.signal();
        }
        orphans.len()
    }

    /// Free every task, return every group and wake every waiter.
    pub fn reset(&self) {
        let groups: Vec<BufferGroup> = {
            let mut ring = self.ring.lock();
            let groups = ring
                .tasks
                .iter_mut()
                .filter(|t| t.ready)
                .filter_map(|t| {
                    t.error = Some(HevcError::BadState);
                    t.release()
                })
                .collect();
            ring.ready_cursor = 0;
            ring.send_cursor = 0;
            ring.last_id = STREAM_MAX - 1;
            ring.count = 0;
            ring.level = 0;
            ring.epoch = ring.epoch.wrapping_add(1);
            groups
        };
        for group in groups {
            self.release(group);
        }
        for events in &self.events {
            events.ack.signal();
            events.result.signal();
        }
        debug!(direction = self.direction.name(), "stream queue reset");
    }

    pub fn status(&self) -> QueueStatus {
        let ring = self.ring.lock();
        QueueStatus {
            count: ring.count,
            level: ring.level,
        }
    }

    /// Tasks submitted but not yet acked.
    pub fn in_flight(&self) -> usize {
        self.ring.lock().tasks.iter().filter(|t| t.in_flight()).count()
    }
}
