//! Bounce-buffer groups and pools.
//!
//! A group is a chain of equally sized DMA chunks plus an optional info
//! buffer, owned by exactly one holder at a time: its pool, a caller or
//! a stream task. Ownership moves by value, so a group can never be
//! referenced by two tasks at once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use spin::Mutex;
use tracing::{error, trace};

use super::segment::Segment;
use crate::config::TransferConfig;
use crate::error::{HevcError, Result};
use crate::sync::Event;
use crate::types::{Direction, SegmentLayout};

// ═══════════════════════════════════════════════════════════════════════════
// DMA MEMORY
// ═══════════════════════════════════════════════════════════════════════════

/// Host memory made visible to the device at `bus_addr`.
pub struct DmaBuffer {
    memory: Box<[u8]>,
    bus_addr: u64,
}

impl DmaBuffer {
    pub fn new(memory: Box<[u8]>, bus_addr: u64) -> Self {
        Self { memory, bus_addr }
    }

    pub fn bus_addr(&self) -> u64 {
        self.bus_addr
    }

    pub fn capacity(&self) -> usize {
        self.memory.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.memory
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.memory
    }
}

/// Maps host memory for device access. Supplied by the bootstrap
/// collaborator (IOMMU mapping, pinned pages, ...).
pub trait DmaAllocator: Send + Sync {
    /// # Returns
    /// `None` if the memory could not be mapped.
    fn allocate(&self, size: usize) -> Option<DmaBuffer>;
}

/// Allocator handing out page-aligned synthetic bus addresses.
pub struct HostDmaAllocator {
    next_bus: AtomicU64,
}

impl HostDmaAllocator {
    const PAGE: u64 = 4096;

    pub fn new(bus_base: u64) -> Self {
        Self {
            next_bus: AtomicU64::new(bus_base),
        }
    }
}

impl Default for HostDmaAllocator {
    fn default() -> Self {
        Self::new(0x1_0000_0000)
    }
}

impl DmaAllocator for HostDmaAllocator {
    fn allocate(&self, size: usize) -> Option<DmaBuffer> {
        let span = (size as u64).div_ceil(Self::PAGE).max(1) * Self::PAGE;
        let bus_addr = self.next_bus.fetch_add(span, Ordering::Relaxed);
        Some(DmaBuffer::new(vec![0u8; size].into_boxed_slice(), bus_addr))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TRANSFER SETUP
// ═══════════════════════════════════════════════════════════════════════════

/// One (address, length) descriptor triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub bus_addr: u64,
    pub size: u32,
}

/// Info buffer offered alongside the video chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InfoDescriptor {
    pub bus_addr: u64,
    pub size: u32,
    pub capacity: u32,
}

/// Everything the register layer needs to program one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSetup {
    pub stream_id: usize,
    pub descriptors: Vec<Descriptor>,
    pub total_size: u32,
    pub info: Option<InfoDescriptor>,
    pub last_frame: bool,
}

// ═══════════════════════════════════════════════════════════════════════════
// BUFFER GROUP
// ═══════════════════════════════════════════════════════════════════════════

/// Bounce-buffer set of one (direction, sub-stream).
pub struct BufferGroup {
    direction: Direction,
    stream_id: usize,
    index: usize,
    chunk_size: usize,
    capacity: usize,
    chunks: Vec<DmaBuffer>,
    info: Option<DmaBuffer>,
    /// Valid video bytes in the chain.
    pub video_size: usize,
    /// Valid info bytes.
    pub info_size: usize,
    /// Set when the encoder marked this access unit as the last one.
    pub last_frame: bool,
}

impl BufferGroup {
    /// Allocate a group for `stream_id`.
    ///
    /// # Returns
    /// `NoDevice` if the allocator cannot map the memory.
    pub fn allocate(
        direction: Direction,
        stream_id: usize,
        index: usize,
        config: &TransferConfig,
        allocator: &dyn DmaAllocator,
    ) -> Result<Self> {
        let capacity = config.buffer_size[stream_id];
        let chunk_size = config.chunk_size(stream_id);
        let mut chunks = Vec::with_capacity(config.chunk_count(stream_id));
        let mut remain = capacity;
        while remain > 0 {
            let size = remain.min(chunk_size);
            chunks.push(allocator.allocate(size).ok_or(HevcError::NoDevice)?);
            remain -= size;
        }
        let info = match config.info_size {
            0 => None,
            size => Some(allocator.allocate(size).ok_or(HevcError::NoDevice)?),
        };
        Ok(Self {
            direction,
            stream_id,
            index,
            chunk_size,
            capacity,
            chunks,
            info,
            video_size: 0,
            info_size: 0,
            last_frame: false,
        })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn stream_id(&self) -> usize {
        self.stream_id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn info_capacity(&self) -> usize {
        self.info.as_ref().map_or(0, DmaBuffer::capacity)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    fn reset_sizes(&mut self) {
        self.video_size = 0;
        self.info_size = 0;
        self.last_frame = false;
    }

    /// Descriptor list for the next transfer.
    ///
    /// Raw video offers the filled bytes; encoded output offers the whole
    /// chain and info buffer for the encoder to fill.
    pub fn transfer_setup(&self, last_frame: bool) -> TransferSetup {
        let total = match self.direction {
            Direction::Vei => self.video_size,
            Direction::Seo => self.capacity,
        };
        let mut descriptors = Vec::new();
        let mut remain = total;
        for chunk in &self.chunks {
            if remain == 0 {
                break;
            }
            let size = remain.min(chunk.capacity());
            descriptors.push(Descriptor {
                bus_addr: chunk.bus_addr(),
                size: size as u32,
            });
            remain -= size;
        }
        let info = self.info.as_ref().map(|b| InfoDescriptor {
            bus_addr: b.bus_addr(),
            size: match self.direction {
                Direction::Vei => self.info_size as u32,
                Direction::Seo => b.capacity() as u32,
            },
            capacity: b.capacity() as u32,
        });
        TransferSetup {
            stream_id: self.stream_id,
            descriptors,
            total_size: total as u32,
            info,
            last_frame,
        }
    }

    /// Copy a caller picture into the chain.
    ///
    /// # Arguments
    /// - `video`: caller picture, laid out per `layout` if given
    /// - `info`: picture info, copied verbatim
    /// - `layout`: row layout; `None` for a contiguous picture
    ///
    /// # Returns
    /// `BadParameter` if either part exceeds the group's capacity or the
    /// layout does not fit `video`.
    pub fn copy_in(
        &mut self,
        video: &[u8],
        info: &[u8],
        layout: Option<SegmentLayout>,
    ) -> Result<()> {
        let layout = layout.filter(SegmentLayout::is_set);
        let size = packed_size(layout, video.len())?;
        if size > self.capacity || info.len() > self.info_capacity() {
            return Err(HevcError::BadParameter);
        }
        if user_size(layout, size)? > video.len() {
            return Err(HevcError::BadParameter);
        }
        let mut seg = Segment::inbound(layout, size);
        seg.set_src(0, video.len());
        let mut valid = 0;
        for chunk in self.chunks.iter_mut() {
            if valid >= size {
                break;
            }
            let copy = (size - valid).min(chunk.capacity());
            seg.set_dst(valid, copy);
            let mem = chunk.as_mut_slice();
            while let Some(piece) = seg.next_chunk() {
                mem[piece.dst..piece.dst + piece.len]
                    .copy_from_slice(&video[piece.src..piece.src + piece.len]);
            }
            valid += copy;
        }
        if let Some(buf) = self.info.as_mut() {
            buf.as_mut_slice()[..info.len()].copy_from_slice(info);
        }
        self.video_size = size;
        self.info_size = info.len();
        trace!(stream_id = self.stream_id, size, info = info.len(), "copied in");
        Ok(())
    }

    /// Copy the encoder output to caller buffers.
    ///
    /// # Returns
    /// `BadParameter` if a caller buffer is smaller than the data laid
    /// out per `layout`.
    pub fn copy_out(
        &self,
        video: &mut [u8],
        info: &mut [u8],
        layout: Option<SegmentLayout>,
    ) -> Result<()> {
        let layout = layout.filter(SegmentLayout::is_set);
        let size = self.video_size.min(self.capacity);
        if video.len() < user_size(layout, size)? || info.len() < self.info_size {
            return Err(HevcError::BadParameter);
        }
        let mut seg = Segment::outbound(layout, size);
        seg.set_dst(0, video.len());
        let mut valid = 0;
        for chunk in &self.chunks {
            if valid >= size {
                break;
            }
            let copy = (size - valid).min(chunk.capacity());
            seg.set_src(valid, copy);
            let mem = chunk.as_slice();
            while let Some(piece) = seg.next_chunk() {
                video[piece.dst..piece.dst + piece.len]
                    .copy_from_slice(&mem[piece.src..piece.src + piece.len]);
            }
            valid += copy;
        }
        if let Some(buf) = self.info.as_ref() {
            let n = self.info_size.min(buf.capacity());
            info[..n].copy_from_slice(&buf.as_slice()[..n]);
        }
        Ok(())
    }
}

/// Bytes a picture occupies in the chain.
fn packed_size(layout: Option<SegmentLayout>, len: usize) -> Result<usize> {
    match layout {
        Some(l) => l.span(l.codec_pitch).ok_or(HevcError::BadParameter),
        None => Ok(len),
    }
}

/// Bytes the caller buffer must hold for `size` bytes in the chain.
fn user_size(layout: Option<SegmentLayout>, size: usize) -> Result<usize> {
    match layout {
        Some(l) => l.span(l.user_pitch).ok_or(HevcError::BadParameter),
        None => Ok(size),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// POOL
// ═══════════════════════════════════════════════════════════════════════════

/// Small fixed pool of groups for one (direction, sub-stream).
///
/// A `None` slot is an active group, out with a caller or a task.
pub struct BufferPool {
    direction: Direction,
    stream_id: usize,
    slots: Mutex<Vec<Option<BufferGroup>>>,
    freed: Event,
}

impl BufferPool {
    pub fn new(direction: Direction, stream_id: usize, groups: Vec<BufferGroup>) -> Self {
        Self {
            direction,
            stream_id,
            slots: Mutex::new(groups.into_iter().map(Some).collect()),
            freed: Event::new(),
        }
    }

    /// Allocate `config.buffers_per_stream` groups.
    pub fn allocate(
        direction: Direction,
        stream_id: usize,
        config: &TransferConfig,
        allocator: &dyn DmaAllocator,
    ) -> Result<Self> {
        let groups = (0..config.buffers_per_stream)
            .map(|i| BufferGroup::allocate(direction, stream_id, i, config, allocator))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(direction, stream_id, groups))
    }

    fn take_free(&self) -> Option<BufferGroup> {
        self.slots.lock().iter_mut().find_map(Option::take)
    }

    /// Take a free group, waiting up to `timeout` for one to be released.
    ///
    /// # Returns
    /// `Busy` if no group came free in time.
    pub fn acquire(&self, timeout: Duration) -> Result<BufferGroup> {
        let deadline = Instant::now() + timeout;
        loop {
            self.freed.clear();
            if let Some(group) = self.take_free() {
                trace!(direction = self.direction.name(), stream_id = self.stream_id, "group acquired");
                return Ok(group);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || !self.freed.wait(remaining) {
                if let Some(group) = self.take_free() {
                    return Ok(group);
                }
                return Err(HevcError::Busy);
            }
        }
    }

    /// Return a group and wake one waiter.
    pub fn release(&self, mut group: BufferGroup) {
        group.reset_sizes();
        {
            let mut slots = self.slots.lock();
            match slots.get_mut(group.index).filter(|s| s.is_none()) {
                Some(slot) => *slot = Some(group),
                None => {
                    error!(
                        direction = self.direction.name(),
                        stream_id = self.stream_id,
                        index = group.index,
                        "released group that was not active"
                    );
                    return;
                }
            }
        }
        self.freed.signal();
    }

    /// Groups currently out of the pool.
    pub fn active(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_none()).count()
    }

    pub fn size(&self) -> usize {
        self.slots.lock().len()
    }
}
