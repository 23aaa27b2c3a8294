//! Volatile MMIO backend over mapped BAR windows.

use core::ptr::{self, NonNull};

use super::{Bar, RegisterIo};

/// One mapped aperture.
#[derive(Debug, Clone, Copy)]
struct Mapping {
    base: NonNull<u8>,
    size: u32,
}

/// BAR windows mapped by the bootstrap collaborator.
pub struct MmioWindows {
    bar0: Mapping,
    bar2: Mapping,
    bar4: Mapping,
    bar5: Option<Mapping>,
}

// SAFETY: the mappings are device registers; every access is a single
// volatile dword and the controller serialises remap-sensitive access.
unsafe impl Send for MmioWindows {}
unsafe impl Sync for MmioWindows {}

impl MmioWindows {
    /// Wrap mapped windows.
    ///
    /// # Arguments
    /// - `bar0`, `bar2`, `bar4`: base pointer and length of each mapping
    /// - `bar5`: optional fifth window holding the remap register
    ///
    /// # Safety
    /// - Every pointer must map device memory of at least the given length
    /// - The mappings must stay valid for the lifetime of this value
    pub unsafe fn new(
        bar0: (NonNull<u8>, u32),
        bar2: (NonNull<u8>, u32),
        bar4: (NonNull<u8>, u32),
        bar5: Option<(NonNull<u8>, u32)>,
    ) -> Self {
        let map = |(base, size): (NonNull<u8>, u32)| Mapping { base, size };
        Self {
            bar0: map(bar0),
            bar2: map(bar2),
            bar4: map(bar4),
            bar5: bar5.map(map),
        }
    }

    fn mapping(&self, bar: Bar) -> Option<Mapping> {
        match bar {
            Bar::Bar0 => Some(self.bar0),
            Bar::Bar2 => Some(self.bar2),
            Bar::Bar4 => Some(self.bar4),
            Bar::Bar5 => self.bar5,
        }
    }

    fn register(&self, bar: Bar, offset: u32) -> Option<*mut u32> {
        let m = self.mapping(bar)?;
        if offset & 3 != 0 || offset.checked_add(4)? > m.size {
            return None;
        }
        // SAFETY: offset + 4 <= mapping length
        Some(unsafe { m.base.as_ptr().add(offset as usize) } as *mut u32)
    }
}

impl RegisterIo for MmioWindows {
    fn read(&self, bar: Bar, offset: u32) -> u32 {
        match self.register(bar, offset) {
            // SAFETY: aligned and inside a live mapping
            Some(reg) => unsafe { ptr::read_volatile(reg) },
            None => u32::MAX,
        }
    }

    fn write(&self, bar: Bar, offset: u32, value: u32) {
        if let Some(reg) = self.register(bar, offset) {
            // SAFETY: aligned and inside a live mapping
            unsafe { ptr::write_volatile(reg, value) }
        }
    }
}
