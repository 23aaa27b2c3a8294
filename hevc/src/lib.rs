//! Host-side controller for PCIe HEVC encoder boards.
//!
//! The controller runs three transactional queues against the board: a
//! command channel and two DMA streams (raw video in, encoded stream out).
//! Callers block on per-request events while deferred workers submit work
//! and match acknowledgements and completions by continuity count.
//!
//! ```text
//!            HevcDevice
//!      ┌─────────┼──────────┐
//!  CommandQueue  VEI queue  SEO queue ── bounce pools, stats
//!      └─────────┼──────────┘
//!            Registers ── RegisterIo (BAR0/2/4/5)
//!                ▲
//!   handle_interrupt ── deferred workers
//! ```
//!
//! Mapping the BARs, routing the interrupt line and pinning DMA memory
//! belong to the bootstrap collaborator; it hands the controller a
//! [`RegisterIo`] and a [`DmaAllocator`].

pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod interrupt;
pub mod register;
pub mod regs;
pub mod stream;
pub mod sync;
pub mod types;

pub use config::{HevcConfig, TransferConfig, WindowLayout, WindowRange};
pub use device::{DebugInfo, HevcDevice, ALL_STREAMS};
pub use error::{HevcError, Result};
pub use interrupt::{CodecMessage, InterruptFactor};
pub use register::{Bar, DeviceInfo, FirmwareVersions, MmioWindows, PciId, RegisterIo};
pub use stream::buffer::{DmaAllocator, DmaBuffer, HostDmaAllocator};
pub use stream::stats::{StatValue, TransferStats};
pub use types::*;
