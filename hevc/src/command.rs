//! Command Queue.
//!
//! A 16-slot ring of firmware commands with exactly one command in
//! flight. Acks and results are matched back to their slot by the
//! command continuity count.
//!
//! # Slot lifecycle
//! ```text
//! Free -> Ready -> Sent -> Acked -> Completed -> Free
//! ```
//! A free slot carries `sent`, `acked` and `completed` set, so the
//! sender skips it exactly like a finished command.

use std::time::Duration;

use spin::Mutex;
use tracing::{debug, error, trace};

use crate::error::{HevcError, Result};
use crate::sync::Event;
use crate::types::{CommandAck, CommandRequest, CommandResult, QueueStatus};

/// Command ring capacity.
pub const COMMAND_SLOTS: usize = 16;

/// Submission seam between the queue and the register layer.
pub trait CommandPort {
    /// Write the command slot and take a continuity count.
    fn setup_command(&self, request: &CommandRequest) -> Result<u32>;
    /// Ring the command doorbell.
    fn submit_command(&self);
}

/// Reference to an enqueued command.
///
/// Handles taken before a `reset` never match a later command, even one
/// placed in the same slot with the same sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHandle {
    slot: usize,
    seq: u32,
    epoch: u32,
}

impl CommandHandle {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

#[derive(Debug, Clone, Copy)]
struct CommandTask {
    ready: bool,
    sent: bool,
    acked: bool,
    completed: bool,
    seq: u32,
    count: u32,
    request: CommandRequest,
    ack: CommandAck,
    result: CommandResult,
    error: Option<HevcError>,
}

impl CommandTask {
    const FREE: Self = Self {
        ready: false,
        sent: true,
        acked: true,
        completed: true,
        seq: 0,
        count: 0,
        request: CommandRequest::new(0, 0, [0; 6]),
        ack: CommandAck { count: 0, target: 0, id: 0, result: 0 },
        result: CommandResult { count: 0, target: 0, id: 0, result: [0; 8] },
        error: None,
    };

    fn release(&mut self) {
        self.ready = false;
        self.sent = true;
        self.acked = true;
        self.completed = true;
    }
}

struct CommandRing {
    tasks: [CommandTask; COMMAND_SLOTS],
    ready_cursor: usize,
    send_cursor: usize,
    count: u32,
    level: usize,
    /// Bumped by every reset.
    epoch: u32,
}

impl CommandRing {
    fn update_level(&mut self) {
        self.level = self.tasks.iter().filter(|t| t.ready).count();
    }

    fn task(&self, handle: &CommandHandle) -> Option<&CommandTask> {
        if handle.epoch != self.epoch {
            return None;
        }
        self.tasks
            .get(handle.slot)
            .filter(|t| t.seq == handle.seq && t.ready)
    }
}

struct SlotEvents {
    ack: Event,
    result: Event,
}

pub struct CommandQueue {
    ring: Mutex<CommandRing>,
    events: [SlotEvents; COMMAND_SLOTS],
    timeout: Duration,
}

impl CommandQueue {
    pub fn new(timeout: Duration) -> Self {
        Self {
            ring: Mutex::new(CommandRing {
                tasks: [CommandTask::FREE; COMMAND_SLOTS],
                ready_cursor: 0,
                send_cursor: 0,
                count: 0,
                level: 0,
                epoch: 0,
            }),
            events: core::array::from_fn(|_| SlotEvents {
                ack: Event::new(),
                result: Event::new(),
            }),
            timeout,
        }
    }

    /// Place a command at the ready cursor.
    ///
    /// The caller schedules the sender afterwards.
    ///
    /// # Returns
    /// `Busy` if the slot under the ready cursor is still in use.
    pub fn enqueue(&self, request: CommandRequest) -> Result<CommandHandle> {
        let mut ring = self.ring.lock();
        let slot = ring.ready_cursor;
        if ring.tasks[slot].ready {
            debug!(slot, "command ring full");
            return Err(HevcError::Busy);
        }
        let seq = ring.count;
        ring.tasks[slot] = CommandTask {
            ready: true,
            sent: false,
            acked: false,
            completed: false,
            seq,
            request,
            ..CommandTask::FREE
        };
        self.events[slot].ack.clear();
        self.events[slot].result.clear();
        ring.ready_cursor = (slot + 1) % COMMAND_SLOTS;
        ring.count = ring.count.wrapping_add(1);
        ring.update_level();
        trace!(slot, cmd_target = request.target, id = request.id, "command enqueued");
        Ok(CommandHandle {
            slot,
            seq,
            epoch: ring.epoch,
        })
    }

    /// One sender pass: submit the next ready command unless one is
    /// still in flight.
    ///
    /// # Returns
    /// `true` if a command went to the hardware.
    pub fn send(&self, port: &dyn CommandPort) -> bool {
        let (slot, seq, epoch, request) = {
            let mut ring = self.ring.lock();
            let mut slot = ring.send_cursor;
            while slot != ring.ready_cursor {
                let t = &ring.tasks[slot];
                if !(t.sent && t.completed) {
                    break;
                }
                slot = (slot + 1) % COMMAND_SLOTS;
            }
            let task = &mut ring.tasks[slot];
            if !task.ready || task.sent {
                return false;
            }
            task.sent = true;
            let seq = task.seq;
            let request = task.request;
            ring.send_cursor = slot;
            (slot, seq, ring.epoch, request)
        };

        match port.setup_command(&request) {
            Ok(count) => {
                {
                    let mut ring = self.ring.lock();
                    let current = ring.epoch == epoch;
                    let task = &mut ring.tasks[slot];
                    if current && task.seq == seq && task.ready {
                        task.count = count;
                    }
                }
                port.submit_command();
                debug!(slot, count, cmd_target = request.target, id = request.id, "command sent");
                true
            }
            Err(e) => {
                error!(slot, error = %e, "command setup failed");
                {
                    let mut ring = self.ring.lock();
                    let current = ring.epoch == epoch;
                    let task = &mut ring.tasks[slot];
                    if current && task.seq == seq && task.ready {
                        task.acked = true;
                        task.completed = true;
                        task.error = Some(HevcError::IoError);
                    }
                }
                self.events[slot].ack.signal();
                self.events[slot].result.signal();
                // the failed slot counts as completed; try the next one
                self.send(port)
            }
        }
    }

    /// Match a command ack to the sent slot with the same count.
    ///
    /// # Returns
    /// `false` if no slot matched; the ack is logged and dropped.
    pub fn record_ack(&self, ack: CommandAck) -> bool {
        let slot = {
            let mut ring = self.ring.lock();
            let found = ring
                .tasks
                .iter()
                .position(|t| t.ready && t.sent && !t.acked && t.count == ack.count);
            if let Some(slot) = found {
                let task = &mut ring.tasks[slot];
                task.ack = ack;
                task.acked = true;
            }
            found
        };
        match slot {
            Some(slot) => {
                trace!(slot, count = ack.count, result = ack.result, "command ack");
                self.events[slot].ack.signal();
                true
            }
            None => {
                error!(count = ack.count, cmd_target = ack.target, id = ack.id, "command ack matches no sent command");
                false
            }
        }
    }

    /// Match a command result to the sent slot with the same count.
    ///
    /// # Returns
    /// `false` if no slot matched; the result is logged and dropped.
    pub fn record_result(&self, result: CommandResult) -> bool {
        let slot = {
            let mut ring = self.ring.lock();
            let found = ring
                .tasks
                .iter()
                .position(|t| t.ready && t.sent && !t.completed && t.count == result.count);
            if let Some(slot) = found {
                let task = &mut ring.tasks[slot];
                task.result = result;
                task.completed = true;
                // a result implies the ack, even if the ack interrupt was lost
                if !task.acked {
                    task.acked = true;
                    task.ack = CommandAck {
                        count: result.count,
                        target: result.target,
                        id: result.id,
                        result: result.result[0],
                    };
                    self.events[slot].ack.signal();
                }
            }
            found
        };
        match slot {
            Some(slot) => {
                trace!(slot, count = result.count, result = result.result[0], "command result");
                self.events[slot].result.signal();
                true
            }
            None => {
                error!(
                    count = result.count,
                    cmd_target = result.target,
                    id = result.id,
                    "command result matches no sent command"
                );
                false
            }
        }
    }

    fn check(&self, handle: &CommandHandle) -> Result<()> {
        let ring = self.ring.lock();
        match ring.task(handle) {
            None => Err(HevcError::BadState),
            Some(t) => t.error.map_or(Ok(()), Err),
        }
    }

    /// Block until the command is acked.
    ///
    /// # Returns
    /// `Timeout` after the wait window, `BadState` if the queue was reset
    /// underneath the caller.
    pub fn wait_ack(&self, handle: &CommandHandle) -> Result<CommandAck> {
        self.check(handle)?;
        let signaled = self.events[handle.slot].ack.wait(self.timeout);
        self.check(handle)?;
        if !signaled {
            return Err(HevcError::Timeout);
        }
        let ring = self.ring.lock();
        ring.task(handle).map(|t| t.ack).ok_or(HevcError::BadState)
    }

    /// Block until the command result arrives.
    pub fn wait_result(&self, handle: &CommandHandle) -> Result<CommandResult> {
        self.check(handle)?;
        let signaled = self.events[handle.slot].result.wait(self.timeout);
        self.check(handle)?;
        if !signaled {
            return Err(HevcError::Timeout);
        }
        let ring = self.ring.lock();
        ring.task(handle).map(|t| t.result).ok_or(HevcError::BadState)
    }

    /// Release a slot. A stale handle is ignored.
    pub fn dequeue(&self, handle: &CommandHandle) {
        let mut ring = self.ring.lock();
        if ring.task(handle).is_some() {
            ring.tasks[handle.slot].release();
        }
        ring.update_level();
    }

    /// Free every slot and wake every waiter with a failure.
    pub fn reset(&self) {
        {
            let mut ring = self.ring.lock();
            for task in ring.tasks.iter_mut() {
                task.release();
            }
            ring.ready_cursor = 0;
            ring.send_cursor = 0;
            ring.count = 0;
            ring.level = 0;
            ring.epoch = ring.epoch.wrapping_add(1);
        }
        for events in &self.events {
            events.ack.signal();
            events.result.signal();
        }
        debug!("command queue reset");
    }

    pub fn status(&self) -> QueueStatus {
        let ring = self.ring.lock();
        QueueStatus {
            count: ring.count,
            level: ring.level,
        }
    }

    /// Slots submitted but not yet completed.
    pub fn in_flight(&self) -> usize {
        let ring = self.ring.lock();
        ring.tasks
            .iter()
            .filter(|t| t.ready && t.sent && !t.completed)
            .count()
    }
}
