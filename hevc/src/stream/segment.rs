//! Segmented Copy Engine.
//!
//! Source and destination are two sequences of `seg_count` segments of
//! `seg_size` bytes, segment `i` starting at `i * pitch` on each side.
//! Given a source sub-range and a destination sub-range, `next_chunk` yields
//! every overlapping piece in increasing segment order as
//! `(src_offset, dst_offset, len)`, offsets relative to the range starts.

use crate::types::SegmentLayout;

/// One piece of a segmented copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub src: usize,
    pub dst: usize,
    pub len: usize,
}

/// Copy plan between two pitched address spaces.
#[derive(Debug, Clone)]
pub struct Segment {
    src_pitch: usize,
    dst_pitch: usize,
    seg_size: usize,
    seg_count: usize,
    src_addr: usize,
    src_size: usize,
    dst_addr: usize,
    dst_size: usize,
    index: Option<usize>,
}

impl Segment {
    pub fn new(src_pitch: usize, dst_pitch: usize, seg_size: usize, seg_count: usize) -> Self {
        Self {
            src_pitch,
            dst_pitch,
            seg_size,
            seg_count,
            src_addr: 0,
            src_size: 0,
            dst_addr: 0,
            dst_size: 0,
            index: None,
        }
    }

    /// Single segment covering `size` bytes: a plain contiguous copy.
    pub fn linear(size: usize) -> Self {
        Self::new(0, 0, size, 1)
    }

    /// Plan for copying a caller buffer into the bounce chain.
    ///
    /// A layout with no segments falls back to a linear copy of `size`.
    pub fn inbound(layout: Option<SegmentLayout>, size: usize) -> Self {
        match layout.filter(SegmentLayout::is_set) {
            Some(l) => Self::new(l.user_pitch, l.codec_pitch, l.seg_size, l.seg_count),
            None => Self::linear(size),
        }
    }

    /// Plan for copying the bounce chain out to a caller buffer.
    pub fn outbound(layout: Option<SegmentLayout>, size: usize) -> Self {
        match layout.filter(SegmentLayout::is_set) {
            Some(l) => Self::new(l.codec_pitch, l.user_pitch, l.seg_size, l.seg_count),
            None => Self::linear(size),
        }
    }

    /// Restrict the source side to `[addr, addr + size)` and restart.
    pub fn set_src(&mut self, addr: usize, size: usize) {
        self.src_addr = addr;
        self.src_size = size;
        self.index = None;
    }

    /// Restrict the destination side to `[addr, addr + size)` and restart.
    pub fn set_dst(&mut self, addr: usize, size: usize) {
        self.dst_addr = addr;
        self.dst_size = size;
        self.index = None;
    }

    fn first_index(addr: usize, pitch: usize) -> usize {
        if pitch == 0 {
            0
        } else {
            addr / pitch
        }
    }

    /// Next overlapping piece, or `None` when the ranges are exhausted.
    pub fn next_chunk(&mut self) -> Option<Chunk> {
        if self.seg_size == 0 || self.seg_count == 0 || self.src_size == 0 || self.dst_size == 0 {
            return None;
        }
        let start = match self.index {
            Some(i) => i,
            None => Self::first_index(self.src_addr, self.src_pitch)
                .max(Self::first_index(self.dst_addr, self.dst_pitch)),
        };
        let src_end = self.src_addr + self.src_size;
        let dst_end = self.dst_addr + self.dst_size;

        for i in start..self.seg_count {
            let src = i * self.src_pitch;
            if src >= src_end {
                break;
            }
            if src + self.seg_size <= self.src_addr {
                continue;
            }
            let dst = i * self.dst_pitch;
            if dst >= dst_end {
                break;
            }
            if dst + self.seg_size <= self.dst_addr {
                continue;
            }

            let off = self
                .src_addr
                .saturating_sub(src)
                .max(self.dst_addr.saturating_sub(dst));
            let size = self
                .seg_size
                .min(src_end - src)
                .min(dst_end - dst);
            if size == 0 || off >= size {
                continue;
            }
            self.index = Some(i + 1);
            return Some(Chunk {
                src: src + off - self.src_addr,
                dst: dst + off - self.dst_addr,
                len: size - off,
            });
        }
        self.index = Some(self.seg_count);
        None
    }
}

impl Iterator for Segment {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        self.next_chunk()
    }
}
