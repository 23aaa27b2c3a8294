//! Public request, response and state types.

use crate::regs::{self, COMMAND_PARAM_MAX, COMMAND_RESULT_PARAM_MAX, GPIO_MAX, STREAM_MAX};

// ═══════════════════════════════════════════════════════════════════════════
// DIRECTIONS AND STATES
// ═══════════════════════════════════════════════════════════════════════════

/// DMA transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Raw video into the encoder.
    Vei,
    /// Encoded stream out of the encoder.
    Seo,
}

impl Direction {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Vei => "vei",
            Self::Seo => "seo",
        }
    }
}

/// Firmware main state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MainState {
    Boot,
    Init,
    Encode,
    Error,
    Unknown(u32),
}

impl MainState {
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            regs::main_state::BOOT => Self::Boot,
            regs::main_state::INIT => Self::Init,
            regs::main_state::ENCODE => Self::Encode,
            regs::main_state::ERROR => Self::Error,
            other => Self::Unknown(other),
        }
    }

    /// Boot, init and encode are the live states.
    pub const fn is_alive(&self) -> bool {
        matches!(self, Self::Boot | Self::Init | Self::Encode)
    }
}

/// Per-stream interface state.
///
/// The video interface state is cached by the controller; video input
/// and encoder states are decoded from the firmware registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterfaceState {
    #[default]
    Unknown,
    Stop,
    Start,
    ReadyToStop,
}

impl InterfaceState {
    pub const fn from_vin(raw: u32) -> Self {
        match raw {
            regs::vin_state::STOP => Self::Stop,
            regs::vin_state::START => Self::Start,
            _ => Self::Unknown,
        }
    }

    pub const fn from_eh(raw: u32) -> Self {
        match raw {
            regs::eh_state::STOP => Self::Stop,
            regs::eh_state::START => Self::Start,
            regs::eh_state::READY_TO_STOP => Self::ReadyToStop,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncodeMode {
    #[default]
    SingleChannel,
    MultiChannel,
}

impl EncodeMode {
    pub const fn raw(&self) -> u32 {
        match self {
            Self::SingleChannel => regs::param::ENCODE_MODE_SINGLE_CH,
            Self::MultiChannel => regs::param::ENCODE_MODE_MULTI_CH,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FirmwareType {
    #[default]
    Standard,
    User,
}

impl FirmwareType {
    pub const fn raw(&self) -> u32 {
        match self {
            Self::Standard => regs::param::FIRM_STD,
            Self::User => regs::param::FIRM_USER,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// COMMANDS
// ═══════════════════════════════════════════════════════════════════════════

/// Raw command as written to the command slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandRequest {
    pub target: u32,
    pub id: u32,
    pub params: [u32; COMMAND_PARAM_MAX],
}

impl CommandRequest {
    pub const fn new(target: u32, id: u32, params: [u32; COMMAND_PARAM_MAX]) -> Self {
        Self { target, id, params }
    }
}

/// Command ack block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandAck {
    pub count: u32,
    pub target: u32,
    pub id: u32,
    pub result: u32,
}

/// Command result block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandResult {
    pub count: u32,
    pub target: u32,
    pub id: u32,
    pub result: [u32; COMMAND_RESULT_PARAM_MAX],
}

impl CommandResult {
    pub const fn is_ok(&self) -> bool {
        self.result[0] == regs::command::RESULT_0_OK
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MainStateCommand {
    Init,
    Encode {
        mode: EncodeMode,
        firmware: FirmwareType,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VinCommand {
    Stop,
    Start,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EhCommand {
    Stop,
    Start,
    ReadyToStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpioFunction {
    Gpio,
    Peripheral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpioDirection {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpioValue {
    Low,
    High,
}

/// GPIO command; the port is checked against `GPIO_PORT_MAX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpioCommand {
    Function(u32, GpioFunction),
    Direction(u32, GpioDirection),
    Set(u32, GpioValue),
    Get(u32),
}

impl GpioCommand {
    pub const fn port(&self) -> u32 {
        match *self {
            Self::Function(p, _) | Self::Direction(p, _) | Self::Set(p, _) | Self::Get(p) => p,
        }
    }
}

/// Last known configuration of a GPIO port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GpioPort {
    pub function: Option<GpioFunction>,
    pub direction: Option<GpioDirection>,
    pub value: Option<GpioValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceContinuity {
    Continuous,
    Discontinuous,
}

/// Rate control change for one sub-stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateControl {
    Cbr {
        average: u32,
    },
    Vbr {
        max: u32,
        average: u32,
        min: u32,
        sequence: SequenceContinuity,
    },
}

/// Picture type change for one sub-stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PictureChange {
    pub picture_type: u32,
    pub stream_id: usize,
    pub gop_end: u32,
}

// ═══════════════════════════════════════════════════════════════════════════
// TRANSFERS
// ═══════════════════════════════════════════════════════════════════════════

/// Row layout of a caller video buffer.
///
/// `user_pitch` strides the caller buffer, `codec_pitch` the linear bounce
/// chain; each of the `seg_count` segments is `seg_size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentLayout {
    pub user_pitch: usize,
    pub codec_pitch: usize,
    pub seg_size: usize,
    pub seg_count: usize,
}

impl SegmentLayout {
    /// A layout without segments means a contiguous picture.
    pub const fn is_set(&self) -> bool {
        self.seg_size != 0 && self.seg_count != 0
    }

    /// Bytes from the first segment to the end of the last at `pitch`.
    ///
    /// # Returns
    /// `None` for an unset layout or if the span overflows.
    pub fn span(&self, pitch: usize) -> Option<usize> {
        if !self.is_set() {
            return None;
        }
        (self.seg_count - 1)
            .checked_mul(pitch)?
            .checked_add(self.seg_size)
    }
}

/// Caller side of one transfer.
pub enum TransferPayload<'a> {
    /// Raw picture and optional picture info for the encoder.
    Raw {
        video: &'a [u8],
        info: &'a [u8],
        last_frame: bool,
        segment: Option<SegmentLayout>,
    },
    /// Destination for one encoded access unit and its ES info.
    Encoded {
        video: &'a mut [u8],
        info: &'a mut [u8],
        segment: Option<SegmentLayout>,
    },
}

impl TransferPayload<'_> {
    pub const fn direction(&self) -> Direction {
        match self {
            Self::Raw { .. } => Direction::Vei,
            Self::Encoded { .. } => Direction::Seo,
        }
    }
}

/// Outcome of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferResult {
    pub video_size: usize,
    pub info_size: usize,
    pub last_frame: bool,
    /// Host time of the matching capture, in 100 ns units.
    pub encode_time: u64,
}

/// Capture timing record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameData {
    pub stream_id: usize,
    pub sync_count: u32,
    pub itc_low: u32,
    pub itc_high: u32,
    pub itc_ext: u32,
    /// Host time in 100 ns units.
    pub encode_time: u64,
}

// ═══════════════════════════════════════════════════════════════════════════
// STATUS
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamStatus {
    /// Cached video interface state.
    pub vif: InterfaceState,
    pub vin: InterfaceState,
    pub eh: InterfaceState,
}

/// Occupancy of one task ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStatus {
    /// Enqueues since the last reset.
    pub count: u32,
    /// Slots currently holding a task.
    pub level: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStatus {
    pub main_state: MainState,
    /// Cached from the last successful encode command; `None` until then
    /// and after a reset.
    pub encode_mode: Option<EncodeMode>,
    pub firmware: Option<FirmwareType>,
    pub streams: [StreamStatus; STREAM_MAX],
    pub gpio: [GpioPort; GPIO_MAX],
    pub command: QueueStatus,
    pub vei: QueueStatus,
    pub seo: QueueStatus,
}

/// Masked register access for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOp {
    Read {
        address: u32,
        mask: u32,
        shift: u32,
        remap: bool,
    },
    Write {
        address: u32,
        mask: u32,
        shift: u32,
        value: u32,
        remap: bool,
    },
}

impl RegisterOp {
    pub const fn address(&self) -> u32 {
        match *self {
            Self::Read { address, .. } | Self::Write { address, .. } => address,
        }
    }
}
