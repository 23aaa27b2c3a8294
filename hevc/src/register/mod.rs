//! Register Access Layer.
//!
//! Word-aligned access to the encoder's flat register space across up to
//! four BAR windows. BAR0, BAR2 and BAR5 map their range directly; every
//! other address goes through BAR4, whose aperture is smaller than the
//! space it serves and is moved with the remap register before access.
//!
//! # Locking
//! One access lock covers remap plus access, so a concurrent caller can
//! never move the window between the two. It also holds the block BAR4
//! is known to map, so the remap register is only touched on a move.
//! Continuity locks are taken before the access lock, never after.

pub mod mmio;
pub mod version;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use spin::Mutex;
use tracing::{debug, error, trace, warn};

use crate::command::CommandPort;
use crate::config::{HevcConfig, WindowLayout};
use crate::error::{HevcError, Result};
use crate::regs::{self, DESCRIPTOR_MAX, STREAM_MAX};
use crate::stream::buffer::TransferSetup;
use crate::stream::StreamPort;
use crate::types::{CommandRequest, Direction, MainState};

pub use mmio::MmioWindows;
pub use version::{DeviceInfo, FirmwareVersions, PciId};

// ═══════════════════════════════════════════════════════════════════════════
// BACKEND SEAM
// ═══════════════════════════════════════════════════════════════════════════

/// BAR window selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bar {
    Bar0,
    Bar2,
    Bar4,
    Bar5,
}

/// Raw 32-bit window access, provided by the bootstrap collaborator.
///
/// `offset` is always dword aligned and inside the window.
pub trait RegisterIo: Send + Sync {
    fn read(&self, bar: Bar, offset: u32) -> u32;
    fn write(&self, bar: Bar, offset: u32, value: u32);
}

/// Gate for statistics: nothing is recorded once the device is dead.
pub trait Liveness: Send + Sync {
    fn is_alive(&self) -> bool;
}

impl Liveness for AtomicBool {
    fn is_alive(&self) -> bool {
        self.load(Ordering::Acquire)
    }
}

/// Continuity counter category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuity {
    Command,
    Vei,
    Seo,
}

impl Continuity {
    pub const fn register(&self) -> u32 {
        match self {
            Self::Command => regs::command::CONTINUITY,
            Self::Vei => regs::vei::CONTINUITY,
            Self::Seo => regs::seo::CONTINUITY,
        }
    }

    const fn index(&self) -> usize {
        match self {
            Self::Command => 0,
            Self::Vei => 1,
            Self::Seo => 2,
        }
    }
}

impl From<Direction> for Continuity {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Vei => Self::Vei,
            Direction::Seo => Self::Seo,
        }
    }
}

const ALIGN_MASK: u32 = 0xffff_fffc;

// ═══════════════════════════════════════════════════════════════════════════
// REGISTER ACCESS
// ═══════════════════════════════════════════════════════════════════════════

pub struct Registers {
    io: Arc<dyn RegisterIo>,
    layout: WindowLayout,
    /// Access lock over the block BAR4 maps; `None` until a remap write
    /// has been observed.
    access: Mutex<Option<u32>>,
    continuity: [Mutex<()>; 3],
    write_poll_count: u32,
    interrupt_poll_count: u32,
    reset_poll_count: u32,
    reset_poll_interval: Duration,
    restart_settle: Duration,
}

impl Registers {
    pub fn new(io: Arc<dyn RegisterIo>, config: &HevcConfig) -> Self {
        Self {
            io,
            layout: config.layout,
            access: Mutex::new(None),
            continuity: [Mutex::new(()), Mutex::new(()), Mutex::new(())],
            write_poll_count: config.write_poll_count,
            interrupt_poll_count: config.interrupt_poll_count,
            reset_poll_count: config.reset_poll_count,
            reset_poll_interval: config.reset_poll_interval,
            restart_settle: config.restart_settle,
        }
    }

    pub fn layout(&self) -> &WindowLayout {
        &self.layout
    }

    /// Window and offset for an aligned address.
    pub fn resolve(&self, addr: u32) -> (Bar, u32) {
        let addr = addr & ALIGN_MASK;
        if self.layout.bar0.contains(addr) {
            return (Bar::Bar0, self.layout.bar0.offset(addr));
        }
        if self.layout.bar2.contains(addr) {
            return (Bar::Bar2, self.layout.bar2.offset(addr));
        }
        if let Some(bar5) = self.layout.bar5 {
            if bar5.contains(addr) {
                return (Bar::Bar5, bar5.offset(addr));
            }
        }
        (Bar::Bar4, self.layout.bar4.offset(addr))
    }

    fn remap_register(&self) -> Bar {
        if self.layout.bar5.is_some() {
            Bar::Bar5
        } else {
            Bar::Bar0
        }
    }

    fn remap_block(&self, addr: u32) -> u32 {
        addr & !(self.layout.bar4.size - 1)
    }

    /// Point BAR4 at `block` unless `mapped` already says it is there.
    /// `mapped` is the access lock's content.
    fn set_remap(&self, mapped: &mut Option<u32>, block: u32) {
        if *mapped == Some(block) {
            return;
        }
        let bar = self.remap_register();
        let offset = regs::pcie::AXI_MASTER_REMAP_OFFSET;
        self.io.write(bar, offset, block);
        for _ in 0..self.write_poll_count {
            if self.io.read(bar, offset) == block {
                trace!(block, "remap moved");
                *mapped = Some(block);
                return;
            }
        }
        // unknown mapping; the next access writes again
        *mapped = None;
        error!(block, "remap write not observed, proceeding");
    }

    /// Move BAR4 back to its default block.
    ///
    /// Always writes the remap register, since a firmware restart may
    /// have moved the window behind the controller's back.
    pub fn reset_remap(&self) {
        let mut mapped = self.access.lock();
        *mapped = None;
        self.set_remap(&mut mapped, self.remap_block(self.layout.bar4.base));
    }

    fn access_read(&self, addr: u32, force_remap: bool) -> u32 {
        let addr = addr & ALIGN_MASK;
        let (bar, offset) = if force_remap {
            (Bar::Bar4, self.layout.bar4.offset(addr))
        } else {
            self.resolve(addr)
        };
        let mut mapped = self.access.lock();
        if bar == Bar::Bar4 {
            self.set_remap(&mut mapped, self.remap_block(addr));
        }
        self.io.read(bar, offset)
    }

    fn access_write(&self, addr: u32, value: u32, force_remap: bool) {
        let addr = addr & ALIGN_MASK;
        let (bar, offset) = if force_remap {
            (Bar::Bar4, self.layout.bar4.offset(addr))
        } else {
            self.resolve(addr)
        };
        let mut mapped = self.access.lock();
        if bar == Bar::Bar4 {
            self.set_remap(&mut mapped, self.remap_block(addr));
        }
        self.io.write(bar, offset, value);
    }

    pub fn read32(&self, addr: u32) -> u32 {
        self.access_read(addr, false)
    }

    pub fn write32(&self, addr: u32, value: u32) {
        self.access_write(addr, value, false);
    }

    /// Read through BAR4 whatever window the address resolves to.
    pub fn read_remapped(&self, addr: u32) -> u32 {
        self.access_read(addr, true)
    }

    /// Write through BAR4 whatever window the address resolves to.
    pub fn write_remapped(&self, addr: u32, value: u32) {
        self.access_write(addr, value, true);
    }

    /// Replace the `mask << shift` field of a register with `val`.
    ///
    /// A shift of 32 or more leaves the register untouched.
    pub fn read_modify_write(&self, addr: u32, mask: u32, shift: u32, val: u32) {
        if shift >= 32 {
            return;
        }
        let field = mask << shift;
        let old = self.read32(addr);
        self.write32(addr, (old & !field) | ((val << shift) & field));
    }

    /// Read consecutive dwords starting at `addr`.
    pub fn read_many(&self, addr: u32, out: &mut [u32]) {
        for (i, word) in out.iter_mut().enumerate() {
            *word = self.read32(addr.wrapping_add((i as u32) * 4));
        }
    }

    /// Write consecutive dwords starting at `addr`.
    pub fn write_many(&self, addr: u32, values: &[u32]) {
        for (i, &word) in values.iter().enumerate() {
            self.write32(addr.wrapping_add((i as u32) * 4), word);
        }
    }

    /// Poll `addr` until it reads `val`.
    ///
    /// # Returns
    /// `false` if `count` polls, `interval` apart, never saw the value.
    pub fn wait_until(&self, addr: u32, val: u32, count: u32, interval: Duration) -> bool {
        for _ in 0..count {
            if self.read32(addr) == val {
                return true;
            }
            if !interval.is_zero() {
                thread::sleep(interval);
            }
        }
        false
    }

    // ═══════════════════════════════════════════════════════════════════════
    // CONTINUITY
    // ═══════════════════════════════════════════════════════════════════════

    /// Bump a category's send counter.
    ///
    /// # Returns
    /// The value written, which the response will echo.
    pub fn next_continuity(&self, category: Continuity) -> u32 {
        let addr = category.register();
        let observed = {
            let _guard = self.continuity[category.index()].lock();
            let count = self.read32(addr).wrapping_add(1);
            self.write32(addr, count);
            let seen = (0..self.write_poll_count).any(|_| self.read32(addr) == count);
            (count, seen)
        };
        let (count, seen) = observed;
        if !seen {
            error!(?category, count, "continuity write not observed");
        }
        count
    }

    /// Zero every send, ack and complete counter.
    pub fn reset_continuity(&self) {
        for addr in regs::CONTINUITY_REGISTERS {
            self.write32(addr, 0);
        }
    }

    /// Current value of every continuity register.
    pub fn read_continuity(&self) -> [u32; 9] {
        regs::CONTINUITY_REGISTERS.map(|addr| self.read32(addr))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // DEVICE STATE
    // ═══════════════════════════════════════════════════════════════════════

    pub fn main_state(&self) -> MainState {
        MainState::from_raw(self.read32(regs::main::MAIN_STATE))
    }

    /// Force the firmware through error and back to boot.
    ///
    /// # Returns
    /// `false` if the boot state never appeared.
    pub fn restart(&self) -> bool {
        let count = self.reset_poll_count;
        let interval = self.reset_poll_interval;

        self.write32(regs::main::MAIN_STATE, regs::main_state::ERROR);
        if !self.wait_until(regs::main::MAIN_STATE, regs::main_state::ERROR, count, interval) {
            warn!("main state did not enter error before restart");
        }

        self.reset_remap();
        self.write32(
            regs::main::MCPU_FIRMWARE_RESTART_REQUEST,
            regs::main::MCPU_FIRMWARE_RESTART,
        );
        let booted = self.wait_until(regs::main::MAIN_STATE, regs::main_state::BOOT, count, interval);
        if !booted {
            error!("firmware did not report boot after restart");
        }

        if !self.restart_settle.is_zero() {
            thread::sleep(self.restart_settle);
        }
        self.reset_remap();
        self.reset_continuity();
        for stream in 0..STREAM_MAX {
            self.write32(regs::main::vin_state(stream), 0);
            self.write32(regs::main::eh_state(stream), 0);
        }
        debug!(booted, "restart finished");
        booted
    }

    // ═══════════════════════════════════════════════════════════════════════
    // INTERRUPTS
    // ═══════════════════════════════════════════════════════════════════════

    /// Latch and clear the interrupt status.
    ///
    /// # Returns
    /// The raw factor bits, zero if nothing was pending.
    pub fn take_interrupt_status(&self) -> u32 {
        let status = self.read32(regs::pcie::INT_STATUS);
        if status == 0 {
            return 0;
        }
        self.write32(regs::pcie::INT_CLEAR, status);
        let cleared = (0..self.interrupt_poll_count)
            .any(|_| self.read32(regs::pcie::INT_STATUS) & status == 0);
        if !cleared {
            error!(status, "interrupt clear not observed");
        }
        status
    }

    /// Ring the host to device doorbell.
    pub fn doorbell(&self, bits: u32) {
        self.write32(regs::pcie::INT_REG_SET, bits);
    }
}

impl Liveness for Registers {
    fn is_alive(&self) -> bool {
        self.main_state().is_alive()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SUBMISSION
// ═══════════════════════════════════════════════════════════════════════════

impl CommandPort for Registers {
    fn setup_command(&self, request: &CommandRequest) -> Result<u32> {
        self.write32(regs::command::TARGET, request.target);
        self.write32(regs::command::ID, request.id);
        self.write_many(regs::command::PARAM_BASE, &request.params);
        Ok(self.next_continuity(Continuity::Command))
    }

    fn submit_command(&self) {
        self.doorbell(regs::doorbell::CMD);
    }
}

impl StreamPort for Registers {
    fn setup_transfer(&self, direction: Direction, setup: &TransferSetup) -> Result<u32> {
        if setup.descriptors.len() > DESCRIPTOR_MAX {
            error!(
                direction = direction.name(),
                count = setup.descriptors.len(),
                "descriptor table overflow"
            );
            return Err(HevcError::DmaFailed);
        }
        let info = setup.info.filter(|i| i.size > 0);
        if setup.descriptors.is_empty() && info.is_none() {
            error!(direction = direction.name(), "nothing to transfer");
            return Err(HevcError::DmaFailed);
        }

        let (addr_l, addr_h, size): (fn(usize) -> u32, fn(usize) -> u32, fn(usize) -> u32) =
            match direction {
                Direction::Vei => (
                    regs::vei::descriptor_address_l,
                    regs::vei::descriptor_address_h,
                    regs::vei::descriptor_size,
                ),
                Direction::Seo => (
                    regs::seo::descriptor_address_l,
                    regs::seo::descriptor_address_h,
                    regs::seo::descriptor_size,
                ),
            };
        for (i, desc) in setup.descriptors.iter().enumerate() {
            self.write32(addr_l(i), desc.bus_addr as u32);
            self.write32(addr_h(i), (desc.bus_addr >> 32) as u32);
            self.write32(size(i), desc.size);
        }
        trace!(
            direction = direction.name(),
            stream_id = setup.stream_id,
            count = setup.descriptors.len(),
            "descriptors written"
        );

        let count = setup.descriptors.len() as u32;
        match direction {
            Direction::Vei => {
                self.write32(regs::vei::DATA_ID, setup.stream_id as u32);
                self.write32(regs::vei::NUMBER_OF_DESCRIPTORS, count);
                self.write32(regs::vei::TOTAL_SIZE, setup.total_size);
                self.write32(
                    regs::vei::LAST_FRAME_MARKER,
                    if setup.last_frame {
                        regs::vei::LAST_FRAME
                    } else {
                        regs::vei::NOT_LAST_FRAME
                    },
                );
                let pic = info.filter(|i| {
                    i.size as usize >= regs::vei::PIC_INFO_MIN_SIZE && i.size <= i.capacity
                });
                if let (Some(i), None) = (info, pic) {
                    error!(size = i.size, "picture info size out of range, not sent");
                }
                let (bus, len) = pic.map_or((0, 0), |i| (i.bus_addr, i.size));
                self.write32(regs::vei::PICTURE_INFO_ADDRESS_L, bus as u32);
                self.write32(regs::vei::PICTURE_INFO_ADDRESS_H, (bus >> 32) as u32);
                self.write32(regs::vei::PICTURE_INFO_SIZE, len);
                if setup.descriptors.is_empty() && pic.is_none() {
                    return Err(HevcError::DmaFailed);
                }
            }
            Direction::Seo => {
                self.write32(regs::seo::DATA_ID, setup.stream_id as u32);
                self.write32(regs::seo::NUMBER_OF_DESCRIPTORS, count);
                self.write32(regs::seo::TOTAL_SIZE, setup.total_size);
                let (bus, len) = info.map_or((0, 0), |i| (i.bus_addr, i.capacity));
                self.write32(regs::seo::ES_INFO_ADDRESS_L, bus as u32);
                self.write32(regs::seo::ES_INFO_ADDRESS_H, (bus >> 32) as u32);
                self.write32(regs::seo::ES_INFO_SIZE, len);
            }
        }
        Ok(self.next_continuity(direction.into()))
    }

    fn submit_transfer(&self, direction: Direction) {
        self.doorbell(match direction {
            Direction::Vei => regs::doorbell::DMA_VEI_REQ,
            Direction::Seo => regs::doorbell::DMA_SEO_REQ,
        });
    }
}
