//! Controller configuration.
//!
//! Every tunable the controller uses lives here: wait windows, poll
//! bounds, bounce-buffer pool geometry and the BAR window layout handed
//! over by the bootstrap collaborator.

use core::time::Duration;

use crate::error::{HevcError, Result};
use crate::regs::{self, DESCRIPTOR_MAX, STREAM_MAX};
use crate::types::Direction;

/// Bounce-buffer groups allowed per (direction, sub-stream).
pub const BUFFER_GROUP_MAX: usize = 4;

/// Granularity of a bounce-buffer chunk.
pub const CHUNK_ALIGN: usize = 4096;

// ═══════════════════════════════════════════════════════════════════════════
// WINDOW LAYOUT
// ═══════════════════════════════════════════════════════════════════════════

/// One BAR aperture in the flat register space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowRange {
    /// First register address covered by the window.
    pub base: u32,
    /// Aperture size in bytes (power of two).
    pub size: u32,
}

impl WindowRange {
    pub const fn new(base: u32, size: u32) -> Self {
        Self { base, size }
    }

    /// Whether `addr` falls inside `[base, base + size)`.
    pub const fn contains(&self, addr: u32) -> bool {
        addr >= self.base && (addr - self.base) < self.size
    }

    /// Offset of `addr` inside the aperture.
    pub const fn offset(&self, addr: u32) -> u32 {
        addr & (self.size - 1)
    }
}

/// Register windows mapped by the bootstrap collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowLayout {
    pub bar0: WindowRange,
    pub bar2: WindowRange,
    /// Remap window: `base` is the default block, `size` the aperture.
    pub bar4: WindowRange,
    /// Absent on some board revisions; the remap register moves to BAR0.
    pub bar5: Option<WindowRange>,
}

impl Default for WindowLayout {
    fn default() -> Self {
        Self {
            bar0: WindowRange::new(regs::window::BAR0_BASE, regs::window::BAR0_SIZE),
            bar2: WindowRange::new(regs::window::BAR2_BASE, regs::window::BAR2_SIZE),
            bar4: WindowRange::new(regs::window::BAR4_BASE, regs::window::BAR4_SIZE),
            bar5: Some(WindowRange::new(
                regs::window::BAR5_BASE,
                regs::window::BAR5_SIZE,
            )),
        }
    }
}

impl WindowLayout {
    /// Layout without BAR5.
    pub fn without_bar5(mut self) -> Self {
        self.bar5 = None;
        self
    }

    fn validate(&self) -> Result<()> {
        let windows = [Some(self.bar0), Some(self.bar2), Some(self.bar4), self.bar5];
        for w in windows.iter().flatten() {
            if w.size == 0 || !w.size.is_power_of_two() {
                return Err(HevcError::BadParameter);
            }
        }
        if self.bar4.base & (self.bar4.size - 1) != 0 {
            return Err(HevcError::BadParameter);
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TRANSFER POOLS
// ═══════════════════════════════════════════════════════════════════════════

/// Bounce-buffer geometry for one transfer direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferConfig {
    /// Video buffer capacity per sub-stream.
    pub buffer_size: [usize; STREAM_MAX],
    /// Picture info (VEI) or ES info (SEO) buffer capacity. Zero disables it.
    pub info_size: usize,
    /// Descriptors a full buffer is split into (at most 512).
    pub descriptor_count: usize,
    /// Groups per sub-stream.
    pub buffers_per_stream: usize,
}

impl TransferConfig {
    /// Chunk size for a sub-stream: `buffer_size / descriptor_count`,
    /// rounded up to `CHUNK_ALIGN`.
    pub fn chunk_size(&self, stream_id: usize) -> usize {
        let per = self.buffer_size[stream_id].div_ceil(self.descriptor_count.max(1));
        per.div_ceil(CHUNK_ALIGN).max(1) * CHUNK_ALIGN
    }

    /// Number of chunks needed to cover a sub-stream's buffer.
    pub fn chunk_count(&self, stream_id: usize) -> usize {
        self.buffer_size[stream_id].div_ceil(self.chunk_size(stream_id))
    }

    fn validate(&self) -> Result<()> {
        if self.buffer_size.iter().any(|&s| s == 0) {
            return Err(HevcError::BadParameter);
        }
        if self.descriptor_count == 0 || self.descriptor_count > DESCRIPTOR_MAX {
            return Err(HevcError::BadParameter);
        }
        if self.buffers_per_stream == 0 || self.buffers_per_stream > BUFFER_GROUP_MAX {
            return Err(HevcError::BadParameter);
        }
        if self.info_size > u32::MAX as usize
            || self.buffer_size.iter().any(|&s| s > u32::MAX as usize)
        {
            return Err(HevcError::BadParameter);
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// CONFIGURATION
// ═══════════════════════════════════════════════════════════════════════════

/// Controller configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HevcConfig {
    /// Wait window for command ack and result.
    pub command_timeout: Duration,
    /// Wait window for stream ack and completion.
    pub stream_timeout: Duration,
    /// Wait window for a free bounce-buffer group.
    pub buffer_timeout: Duration,
    /// Read-back polls after a remap or continuity write.
    pub write_poll_count: u32,
    /// Polls while clearing the interrupt status.
    pub interrupt_poll_count: u32,
    /// Polls while waiting for a main state during restart.
    pub reset_poll_count: u32,
    /// Sleep between restart polls.
    pub reset_poll_interval: Duration,
    /// Settle time after the firmware reports boot.
    pub restart_settle: Duration,
    /// Raw video in pools.
    pub vei: TransferConfig,
    /// Encoded stream out pools.
    pub seo: TransferConfig,
    /// Enqueues a slot may fall behind before the sweep reclaims it.
    pub orphan_distance: u32,
    pub layout: WindowLayout,
}

impl Default for HevcConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(2),
            stream_timeout: Duration::from_secs(3),
            buffer_timeout: Duration::from_secs(3),
            write_poll_count: 1000,
            interrupt_poll_count: 1000,
            reset_poll_count: 500,
            reset_poll_interval: Duration::from_millis(10),
            restart_settle: Duration::from_millis(100),
            vei: TransferConfig {
                // 4K 4:2:2 10-bit on stream 0, HD on the rest
                buffer_size: [0x0140_0000, 0x0060_0000, 0x0060_0000, 0x0060_0000],
                info_size: 0x1000,
                descriptor_count: DESCRIPTOR_MAX,
                buffers_per_stream: 2,
            },
            seo: TransferConfig {
                buffer_size: [0x0040_0000; STREAM_MAX],
                info_size: 0x1000,
                descriptor_count: DESCRIPTOR_MAX,
                buffers_per_stream: 1,
            },
            orphan_distance: 2 * crate::stream::STREAM_SLOTS as u32,
            layout: WindowLayout::default(),
        }
    }
}

impl HevcConfig {
    /// Small pools and short waits for an in-memory device model.
    pub fn for_simulation() -> Self {
        Self {
            command_timeout: Duration::from_secs(2),
            stream_timeout: Duration::from_secs(2),
            buffer_timeout: Duration::from_secs(2),
            write_poll_count: 16,
            interrupt_poll_count: 16,
            reset_poll_count: 200,
            reset_poll_interval: Duration::from_millis(1),
            restart_settle: Duration::ZERO,
            vei: TransferConfig {
                buffer_size: [0x0001_0000; STREAM_MAX],
                info_size: 256,
                descriptor_count: 16,
                buffers_per_stream: 2,
            },
            seo: TransferConfig {
                buffer_size: [0x0001_0000; STREAM_MAX],
                info_size: 256,
                descriptor_count: 16,
                buffers_per_stream: 1,
            },
            ..Self::default()
        }
    }

    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = timeout;
        self
    }

    pub fn buffer_timeout(mut self, timeout: Duration) -> Self {
        self.buffer_timeout = timeout;
        self
    }

    pub fn restart_settle(mut self, settle: Duration) -> Self {
        self.restart_settle = settle;
        self
    }

    pub fn orphan_distance(mut self, distance: u32) -> Self {
        self.orphan_distance = distance;
        self
    }

    pub fn layout(mut self, layout: WindowLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Replace the pool geometry for one direction.
    pub fn transfer_config(mut self, direction: Direction, transfer: TransferConfig) -> Self {
        match direction {
            Direction::Vei => self.vei = transfer,
            Direction::Seo => self.seo = transfer,
        }
        self
    }

    pub fn transfer(&self, direction: Direction) -> &TransferConfig {
        match direction {
            Direction::Vei => &self.vei,
            Direction::Seo => &self.seo,
        }
    }

    /// Reject configurations the controller cannot run with.
    ///
    /// # Returns
    /// `BadParameter` for zero sizes, non power-of-two windows, pools
    /// above `BUFFER_GROUP_MAX` or descriptor counts above 512.
    pub fn validate(&self) -> Result<()> {
        self.layout.validate()?;
        self.vei.validate()?;
        self.seo.validate()?;
        if self.write_poll_count == 0 || self.reset_poll_count == 0 {
            return Err(HevcError::BadParameter);
        }
        if self.orphan_distance == 0 {
            return Err(HevcError::BadParameter);
        }
        Ok(())
    }
}
