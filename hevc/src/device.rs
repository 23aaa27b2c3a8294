//! Device context and public API.
//!
//! `HevcDevice` owns everything one encoder needs: register access, the
//! command queue, both stream queues with their bounce pools, the frame
//! queues, the cached interface state and the deferred workers. There is
//! no process-wide state; open one context per board.
//!
//! Every blocking call waits on a per-request event with the configured
//! window, so a stalled board costs a caller at most one timeout. A
//! sustained failure is expected to be answered with `reset_device` by
//! the layer above; the controller never resets itself.

use std::sync::Arc;
use std::time::Instant;

use spin::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::command::CommandQueue;
use crate::config::HevcConfig;
use crate::error::{HevcError, Result};
use crate::interrupt::{self, host_time_100ns, Dpcs};
use crate::register::version::DRIVER_VERSION;
use crate::register::{DeviceInfo, FirmwareVersions, Liveness, PciId, RegisterIo, Registers};
use crate::regs::{self, GPIO_MAX, GPIO_PORT_MAX, STREAM_MAX};
use crate::stream::buffer::{BufferGroup, DmaAllocator};
use crate::stream::frame::FrameQueues;
use crate::stream::stats::TransferStats;
use crate::stream::StreamQueue;
use crate::types::{
    CommandRequest, CommandResult, DeviceStatus, Direction, EhCommand, EncodeMode, FirmwareType,
    FrameData, GpioCommand, GpioDirection, GpioFunction, GpioPort, GpioValue, InterfaceState,
    MainState, MainStateCommand, PictureChange, RateControl, RegisterOp, SegmentLayout,
    SequenceContinuity, StreamStatus, TransferPayload, TransferResult, VinCommand,
};

/// Sub-stream bits covering every stream.
pub const ALL_STREAMS: u32 = (1 << STREAM_MAX) - 1;

/// Controller-side view of state the firmware does not report back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CachedState {
    pub vif: [InterfaceState; STREAM_MAX],
    pub encode_mode: Option<EncodeMode>,
    pub firmware: Option<FirmwareType>,
    pub gpio: [GpioPort; GPIO_MAX],
}

impl Default for CachedState {
    fn default() -> Self {
        Self {
            vif: [InterfaceState::Unknown; STREAM_MAX],
            encode_mode: None,
            firmware: None,
            gpio: [GpioPort::default(); GPIO_MAX],
        }
    }
}

/// State shared between callers and the deferred workers.
pub(crate) struct Shared {
    pub config: HevcConfig,
    pub regs: Arc<Registers>,
    pub commands: CommandQueue,
    pub vei: StreamQueue,
    pub seo: StreamQueue,
    pub frames: FrameQueues,
    pub state: Mutex<CachedState>,
    pub dpcs: Dpcs,
    pub pci_id: PciId,
}

/// Debug snapshot: status plus statistics and raw continuity counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugInfo {
    pub status: DeviceStatus,
    pub raw_stats: [TransferStats; STREAM_MAX],
    pub enc_stats: [TransferStats; STREAM_MAX],
    /// Capture records waiting per sub-stream.
    pub frame_levels: [usize; STREAM_MAX],
    /// Command, VEI and SEO counters, each as send, ack, complete.
    pub continuity: [u32; 9],
}

/// Whether `[address, address + size)` overlaps the encoder work area.
fn touches_encode_work(address: u32, size: u32) -> bool {
    let end = address.saturating_add(size.saturating_sub(1));
    address <= regs::encode_work::END && end >= regs::encode_work::BASE
}

fn check_stream_bits(stream_bits: u32) -> Result<()> {
    if stream_bits & !ALL_STREAMS != 0 {
        return Err(HevcError::BadParameter);
    }
    Ok(())
}

/// One encoder board.
pub struct HevcDevice {
    shared: Arc<Shared>,
}

impl HevcDevice {
    /// Bring up the controller for a mapped board.
    ///
    /// # Arguments
    /// - `io`: register windows from the bootstrap collaborator
    /// - `dma`: maps the bounce pools for device access
    /// - `config`: validated before anything is allocated
    /// - `pci_id`: identity read during enumeration
    ///
    /// # Returns
    /// `BadParameter` for an invalid configuration, `NoDevice` if DMA
    /// memory or the deferred workers could not be set up.
    pub fn open(
        io: Arc<dyn RegisterIo>,
        dma: &dyn DmaAllocator,
        config: HevcConfig,
        pci_id: PciId,
    ) -> Result<Self> {
        config.validate()?;
        if !pci_id.is_supported() {
            warn!(
                vendor = pci_id.vendor,
                device = pci_id.device,
                "unqualified pci id"
            );
        }

        let regs = Arc::new(Registers::new(io, &config));
        let live: Arc<dyn Liveness> = regs.clone();
        let vei = StreamQueue::new(Direction::Vei, &config, dma, Arc::clone(&live))?;
        let seo = StreamQueue::new(Direction::Seo, &config, dma, live)?;
        let firmware = FirmwareVersions::read(&regs);

        let shared = Arc::new(Shared {
            commands: CommandQueue::new(config.command_timeout),
            config,
            regs,
            vei,
            seo,
            frames: FrameQueues::new(),
            state: Mutex::new(CachedState::default()),
            dpcs: Dpcs::new(),
            pci_id,
        });
        if let Err(e) = interrupt::start(&shared) {
            error!(error = %e, "deferred workers failed to start");
            shared.dpcs.shutdown();
            return Err(HevcError::NoDevice);
        }

        info!(
            mcpu = %firmware.mcpu_string(),
            system = %firmware.system,
            encoder = %firmware.encoder_std_single,
            "encoder opened"
        );
        if !firmware.is_expected() {
            warn!("firmware differs from the qualified build");
        }
        Ok(Self { shared })
    }

    pub fn config(&self) -> &HevcConfig {
        &self.shared.config
    }

    pub fn is_alive(&self) -> bool {
        self.shared.regs.is_alive()
    }

    pub fn main_state(&self) -> MainState {
        self.shared.regs.main_state()
    }

    /// Entry point for the interrupt line.
    ///
    /// # Returns
    /// `false` if the board raised nothing.
    pub fn handle_interrupt(&self) -> bool {
        self.shared.dispatch_interrupt()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // COMMANDS
    // ═══════════════════════════════════════════════════════════════════════

    /// Run one raw command to completion.
    ///
    /// Blocks for the ack, then for the result.
    ///
    /// # Returns
    /// - `BadState` if the device is not alive
    /// - `Busy` if the command ring is full
    /// - `Timeout` if the ack or result did not arrive
    /// - `IoError` if the firmware rejected the command
    pub fn submit_command(&self, request: CommandRequest) -> Result<CommandResult> {
        let s = &self.shared;
        if !self.is_alive() {
            return Err(HevcError::BadState);
        }
        let handle = s.commands.enqueue(request)?;
        s.dpcs.command_send.schedule();

        let outcome = s
            .commands
            .wait_ack(&handle)
            .and_then(|_| s.commands.wait_result(&handle));
        s.commands.dequeue(&handle);

        let result = outcome.map_err(|e| {
            warn!(cmd_target = request.target, id = request.id, error = %e, "command not completed");
            e
        })?;
        if !result.is_ok() {
            error!(
                cmd_target = request.target,
                id = request.id,
                result = result.result[0],
                "command failed"
            );
            return Err(HevcError::IoError);
        }
        debug!(cmd_target = request.target, id = request.id, "command complete");
        Ok(result)
    }

    pub fn set_main_state(&self, command: MainStateCommand) -> Result<()> {
        let params = match command {
            MainStateCommand::Init => [regs::main_state::INIT, 0, 0, 0, 0, 0],
            MainStateCommand::Encode { mode, firmware } => {
                [regs::main_state::ENCODE, mode.raw(), firmware.raw(), 0, 0, 0]
            }
        };
        self.submit_command(CommandRequest::new(
            regs::target::MAIN,
            regs::command_id::STATE_CHANGE,
            params,
        ))?;
        if let MainStateCommand::Encode { mode, firmware } = command {
            let mut state = self.shared.state.lock();
            state.encode_mode = Some(mode);
            state.firmware = Some(firmware);
            state.vif = [InterfaceState::Stop; STREAM_MAX];
        }
        Ok(())
    }

    /// Start or stop video input on every sub-stream in `stream_bits`.
    ///
    /// Starting empties those frame queues and their raw statistics.
    pub fn set_vin_state(&self, command: VinCommand, stream_bits: u32) -> Result<()> {
        check_stream_bits(stream_bits)?;
        let state = match command {
            VinCommand::Stop => regs::vin_state::STOP,
            VinCommand::Start => {
                self.shared.frames.reset(stream_bits);
                self.shared.vei.stats().clear(stream_bits);
                regs::vin_state::START
            }
        };
        self.submit_command(CommandRequest::new(
            regs::target::VIN_ID,
            regs::command_id::STATE_CHANGE,
            [state, stream_bits, 0, 0, 0, 0],
        ))?;
        if command == VinCommand::Stop {
            let mut cached = self.shared.state.lock();
            for (i, vif) in cached.vif.iter_mut().enumerate() {
                if stream_bits & (1 << i) != 0 {
                    *vif = InterfaceState::Stop;
                }
            }
        }
        Ok(())
    }

    /// Change the encoder state of every sub-stream in `stream_bits`.
    ///
    /// Starting clears their encoded statistics.
    pub fn set_eh_state(&self, command: EhCommand, stream_bits: u32) -> Result<()> {
        check_stream_bits(stream_bits)?;
        let state = match command {
            EhCommand::Stop => regs::eh_state::STOP,
            EhCommand::Start => {
                self.shared.seo.stats().clear(stream_bits);
                regs::eh_state::START
            }
            EhCommand::ReadyToStop => regs::eh_state::READY_TO_STOP,
        };
        self.submit_command(CommandRequest::new(
            regs::target::EH_ID,
            regs::command_id::STATE_CHANGE,
            [state, stream_bits, 0, 0, 0, 0],
        ))?;
        Ok(())
    }

    /// Configure or sample one GPIO port.
    ///
    /// # Returns
    /// The sampled level for `Get`, `None` otherwise. `BadParameter` for
    /// a port above `GPIO_PORT_MAX` or an undecodable sample.
    pub fn gpio(&self, command: GpioCommand) -> Result<Option<GpioValue>> {
        let port = command.port();
        if port > GPIO_PORT_MAX {
            return Err(HevcError::BadParameter);
        }
        let (id, value) = match command {
            GpioCommand::Function(_, f) => (
                regs::command_id::GPIO_FUNCTION,
                match f {
                    GpioFunction::Gpio => regs::param::GPIO_FUNCTION_GPIO,
                    GpioFunction::Peripheral => regs::param::GPIO_FUNCTION_PERIPHERAL,
                },
            ),
            GpioCommand::Direction(_, d) => (
                regs::command_id::GPIO_DIRECTION,
                match d {
                    GpioDirection::In => regs::param::GPIO_DIRECTION_IN,
                    GpioDirection::Out => regs::param::GPIO_DIRECTION_OUT,
                },
            ),
            GpioCommand::Set(_, v) => (
                regs::command_id::GPIO_SET_VALUE,
                match v {
                    GpioValue::Low => regs::param::GPIO_VALUE_LOW,
                    GpioValue::High => regs::param::GPIO_VALUE_HIGH,
                },
            ),
            GpioCommand::Get(_) => (regs::command_id::GPIO_GET_VALUE, 0),
        };
        let result = self.submit_command(CommandRequest::new(
            regs::target::GPIO,
            id,
            [value, port, 0, 0, 0, 0],
        ))?;

        let sampled = match command {
            GpioCommand::Get(_) => Some(match result.result[1] {
                regs::param::GPIO_VALUE_LOW => GpioValue::Low,
                regs::param::GPIO_VALUE_HIGH => GpioValue::High,
                other => {
                    error!(port, value = other, "undecodable gpio sample");
                    return Err(HevcError::BadParameter);
                }
            }),
            _ => None,
        };

        let mut state = self.shared.state.lock();
        let entry = &mut state.gpio[port as usize];
        match command {
            GpioCommand::Function(_, f) => entry.function = Some(f),
            GpioCommand::Direction(_, d) => entry.direction = Some(d),
            GpioCommand::Set(_, v) => entry.value = Some(v),
            GpioCommand::Get(_) => entry.value = sampled,
        }
        Ok(sampled)
    }

    /// Change the rate control of one sub-stream while encoding.
    pub fn change_param(&self, stream_id: usize, rate: RateControl) -> Result<()> {
        if stream_id >= STREAM_MAX {
            return Err(HevcError::BadParameter);
        }
        let bit = 1u32 << stream_id;
        let params = match rate {
            RateControl::Cbr { average } => [regs::param::CHANGE_CBR, bit, average, 0, 0, 0],
            RateControl::Vbr {
                max,
                average,
                min,
                sequence,
            } => [
                regs::param::CHANGE_VBR,
                bit,
                max,
                average,
                min,
                match sequence {
                    SequenceContinuity::Continuous => regs::param::CONTINUOUS_SEQUENCE,
                    SequenceContinuity::Discontinuous => regs::param::DISCONTINUOUS_SEQUENCE,
                },
            ],
        };
        self.submit_command(CommandRequest::new(
            regs::target::EH_ID,
            regs::command_id::EH_ENCODE_PARAM_CHANGE,
            params,
        ))?;
        Ok(())
    }

    /// Force the picture type of an upcoming picture.
    pub fn change_picture(&self, change: PictureChange) -> Result<()> {
        if change.stream_id >= STREAM_MAX {
            return Err(HevcError::BadParameter);
        }
        self.submit_command(CommandRequest::new(
            regs::target::EH_ID,
            regs::command_id::EH_PICTURE_TYPE_CHANGE,
            [
                change.picture_type,
                1 << change.stream_id,
                change.gop_end,
                0,
                0,
                0,
            ],
        ))?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // TRANSFERS
    // ═══════════════════════════════════════════════════════════════════════

    /// Move one picture in or one access unit out.
    ///
    /// The payload variant selects the direction. Raw input returns once
    /// the DMA is acked; the bounce group goes back to its pool when the
    /// completion arrives. Encoded output returns once the data has been
    /// copied into the caller's buffers.
    ///
    /// # Returns
    /// - `BadState` if the device is not alive
    /// - `BadParameter` for a bad sub-stream id or oversize payload
    /// - `Busy` if no bounce group or ring slot came free
    /// - `Timeout` or `DmaFailed` from the transfer itself
    pub fn submit_transfer(
        &self,
        stream_id: usize,
        payload: TransferPayload<'_>,
    ) -> Result<TransferResult> {
        if !self.is_alive() {
            return Err(HevcError::BadState);
        }
        if stream_id >= STREAM_MAX {
            error!(stream_id, "transfer for unknown stream");
            return Err(HevcError::BadParameter);
        }
        match payload {
            TransferPayload::Raw {
                video,
                info,
                last_frame,
                segment,
            } => self.transfer_raw(stream_id, video, info, last_frame, segment),
            TransferPayload::Encoded {
                video,
                info,
                segment,
            } => self.transfer_encoded(stream_id, video, info, segment),
        }
    }

    fn transfer_raw(
        &self,
        stream_id: usize,
        video: &[u8],
        info: &[u8],
        last_frame: bool,
        segment: Option<SegmentLayout>,
    ) -> Result<TransferResult> {
        let s = &self.shared;
        let queue = &s.vei;
        trace!(stream_id, size = video.len(), info = info.len(), "raw transfer");

        let mut group = queue.acquire(stream_id).map_err(|e| {
            error!(stream_id, "no raw bounce buffer available");
            queue.orphan_sweep();
            e
        })?;
        let copy_start = Instant::now();
        if let Err(e) = group.copy_in(video, info, segment) {
            queue.release(group);
            return Err(e);
        }
        queue.stats().record_copy(stream_id, copy_start.elapsed());

        let mut result = TransferResult {
            video_size: group.video_size,
            info_size: group.info_size,
            last_frame,
            encode_time: 0,
        };
        let handle = queue.enqueue(stream_id, group, last_frame).map_err(|e| {
            queue.orphan_sweep();
            e
        })?;
        s.dpcs.vei_send.schedule();

        let outcome = queue.wait_ack(&handle);
        if outcome.is_ok() {
            if result.video_size > 0 {
                let frame = FrameData {
                    stream_id,
                    encode_time: host_time_100ns(),
                    ..FrameData::default()
                };
                s.frames.push(frame);
                result.encode_time = frame.encode_time;
            }
            queue.stats().record_transfer(stream_id, result.video_size);
        }

        // an acked transfer keeps its group until the completion
        if let Some(group) = queue.dequeue(&handle) {
            queue.release(group);
        }
        queue.orphan_sweep();

        outcome.map(|_| result).map_err(|e| {
            warn!(stream_id, error = %e, "raw transfer failed");
            e
        })
    }

    fn transfer_encoded(
        &self,
        stream_id: usize,
        video: &mut [u8],
        info: &mut [u8],
        segment: Option<SegmentLayout>,
    ) -> Result<TransferResult> {
        let s = &self.shared;
        let queue = &s.seo;

        let group = queue.acquire(stream_id).map_err(|e| {
            error!(stream_id, "no encoded bounce buffer available");
            queue.orphan_sweep();
            e
        })?;
        let handle = queue.enqueue(stream_id, group, false).map_err(|e| {
            queue.orphan_sweep();
            e
        })?;
        s.dpcs.seo_send.schedule();

        let outcome = queue.wait_result(&handle);
        let group = queue.dequeue(&handle);
        let result = match (outcome, group) {
            (Ok(_), Some(group)) => {
                let copied = self.copy_encoded(stream_id, &group, video, info, segment);
                queue.release(group);
                copied
            }
            (Ok(_), None) => Err(HevcError::BadState),
            (Err(e), group) => {
                if let Some(group) = group {
                    queue.release(group);
                }
                warn!(stream_id, error = %e, "encoded transfer failed");
                Err(e)
            }
        };
        queue.orphan_sweep();
        result
    }

    fn copy_encoded(
        &self,
        stream_id: usize,
        group: &BufferGroup,
        video: &mut [u8],
        info: &mut [u8],
        segment: Option<SegmentLayout>,
    ) -> Result<TransferResult> {
        let s = &self.shared;
        s.seo.stats().record_transfer(stream_id, group.video_size);

        let copy_start = Instant::now();
        group.copy_out(video, info, segment)?;
        s.seo.stats().record_copy(stream_id, copy_start.elapsed());

        let encode_time = match s.frames.pop(stream_id) {
            Some(frame) => frame.encode_time,
            None => {
                debug!(stream_id, "no capture record for encoded frame");
                0
            }
        };
        trace!(stream_id, size = group.video_size, last = group.last_frame, "encoded transfer");
        Ok(TransferResult {
            video_size: group.video_size,
            info_size: group.info_size,
            last_frame: group.last_frame,
            encode_time,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // STATUS AND MAINTENANCE
    // ═══════════════════════════════════════════════════════════════════════

    /// Cached interface state, live firmware states and queue occupancy.
    pub fn get_status(&self) -> DeviceStatus {
        let s = &self.shared;
        let cached = *s.state.lock();
        let streams = core::array::from_fn(|i| StreamStatus {
            vif: cached.vif[i],
            vin: InterfaceState::from_vin(s.regs.read32(regs::main::vin_state(i))),
            eh: InterfaceState::from_eh(s.regs.read32(regs::main::eh_state(i))),
        });
        DeviceStatus {
            main_state: s.regs.main_state(),
            encode_mode: cached.encode_mode,
            firmware: cached.firmware,
            streams,
            gpio: cached.gpio,
            command: s.commands.status(),
            vei: s.vei.status(),
            seo: s.seo.status(),
        }
    }

    /// Status plus statistics, then clear the statistics selected by the
    /// two sub-stream masks.
    pub fn get_debug_info(&self, clear_raw_bits: u32, clear_enc_bits: u32) -> DebugInfo {
        let s = &self.shared;
        let info = DebugInfo {
            status: self.get_status(),
            raw_stats: s.vei.stats().snapshot(),
            enc_stats: s.seo.stats().snapshot(),
            frame_levels: s.frames.levels(),
            continuity: s.regs.read_continuity(),
        };
        s.vei.stats().clear(clear_raw_bits);
        s.seo.stats().clear(clear_enc_bits);
        info
    }

    /// Restart the firmware and fail every outstanding request.
    ///
    /// Queues, frame queues, statistics and cached state are reset even
    /// when the restart times out.
    ///
    /// # Returns
    /// `Timeout` if the firmware never reported boot.
    pub fn reset_device(&self) -> Result<()> {
        let s = &self.shared;
        info!("device reset");
        let booted = s.regs.restart();

        *s.state.lock() = CachedState::default();
        s.commands.reset();
        s.vei.reset();
        s.seo.reset();
        s.frames.reset_all();
        s.vei.stats().clear(ALL_STREAMS);
        s.seo.stats().clear(ALL_STREAMS);

        if !booted {
            error!("device reset timed out");
            return Err(HevcError::Timeout);
        }
        Ok(())
    }

    /// Driver version, PCI identity and the firmware versions as the
    /// board reports them now.
    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            driver_version: DRIVER_VERSION,
            pci_id: self.shared.pci_id,
            firmware: FirmwareVersions::read(&self.shared.regs),
        }
    }

    /// Masked diagnostic register access.
    ///
    /// A read returns `(value >> shift) & mask`; a write with a full mask
    /// and no shift stores the value, anything else is a read-modify-write
    /// of the `mask << shift` field. A shift of 32 or more counts as zero.
    /// Remapped accesses always go through BAR4.
    ///
    /// # Returns
    /// The register field after the access. `BadState` for an access
    /// touching the encoder work area outside the encode and error states.
    pub fn register_access(&self, op: RegisterOp) -> Result<u32> {
        let r = &self.shared.regs;
        let address = op.address();
        if touches_encode_work(address, 4) {
            let state = r.main_state();
            if !matches!(state, MainState::Encode | MainState::Error) {
                error!(address, ?state, "encoder work area not accessible");
                return Err(HevcError::BadState);
            }
        }

        let read = |remap: bool| {
            if remap {
                r.read_remapped(address)
            } else {
                r.read32(address)
            }
        };
        let field = |value: u32, mask: u32, shift: u32| {
            let shift = if shift >= 32 { 0 } else { shift };
            (value >> shift) & mask
        };

        match op {
            RegisterOp::Read {
                mask, shift, remap, ..
            } => Ok(field(read(remap), mask, shift)),
            RegisterOp::Write {
                mask,
                shift,
                value,
                remap,
                ..
            } => {
                let shift = if shift >= 32 { 0 } else { shift };
                if remap {
                    let field_mask = mask << shift;
                    let old = r.read_remapped(address);
                    r.write_remapped(address, (old & !field_mask) | ((value << shift) & field_mask));
                } else if mask == u32::MAX && shift == 0 {
                    r.write32(address, value);
                } else {
                    r.read_modify_write(address, mask, shift, value);
                }
                Ok(field(read(remap), mask, shift))
            }
        }
    }

    /// Capture records waiting on a sub-stream.
    pub fn frame_level(&self, stream_id: usize) -> usize {
        self.shared.frames.level(stream_id)
    }

    /// Bounce groups of a (direction, sub-stream) currently out of the pool.
    pub fn active_buffers(&self, direction: Direction, stream_id: usize) -> usize {
        match direction {
            Direction::Vei => self.shared.vei.active_buffers(stream_id),
            Direction::Seo => self.shared.seo.active_buffers(stream_id),
        }
    }
}

impl Drop for HevcDevice {
    fn drop(&mut self) {
        self.shared.dpcs.shutdown();
        debug!("encoder closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::testing::RegisterFile;
    use crate::register::version::SUPPORTED_PCI_ID;
    use crate::stream::buffer::HostDmaAllocator;

    fn device() -> HevcDevice {
        HevcDevice::open(
            Arc::new(RegisterFile::default()),
            &HostDmaAllocator::default(),
            HevcConfig::for_simulation(),
            SUPPORTED_PCI_ID,
        )
        .unwrap()
    }

    fn write(address: u32, value: u32) -> RegisterOp {
        RegisterOp::Write {
            address,
            mask: u32::MAX,
            shift: 0,
            value,
            remap: false,
        }
    }

    fn read(address: u32) -> RegisterOp {
        RegisterOp::Read {
            address,
            mask: u32::MAX,
            shift: 0,
            remap: false,
        }
    }

    #[test]
    fn test_encode_work_overlap() {
        assert!(touches_encode_work(regs::encode_work::BASE, 4));
        assert!(touches_encode_work(regs::encode_work::END, 4));
        assert!(touches_encode_work(regs::encode_work::BASE - 2, 4));
        assert!(!touches_encode_work(regs::encode_work::BASE - 4, 4));
        assert!(!touches_encode_work(regs::encode_work::END + 1, 4));
    }

    #[test]
    fn test_open_rejects_bad_config() {
        let config = HevcConfig::for_simulation().orphan_distance(0);
        let opened = HevcDevice::open(
            Arc::new(RegisterFile::default()),
            &HostDmaAllocator::default(),
            config,
            SUPPORTED_PCI_ID,
        );
        assert_eq!(opened.err(), Some(HevcError::BadParameter));
    }

    #[test]
    fn test_open_fails_without_dma_memory() {
        struct NoDma;
        impl DmaAllocator for NoDma {
            fn allocate(&self, _size: usize) -> Option<crate::stream::buffer::DmaBuffer> {
                None
            }
        }
        let opened = HevcDevice::open(
            Arc::new(RegisterFile::default()),
            &NoDma,
            HevcConfig::for_simulation(),
            SUPPORTED_PCI_ID,
        );
        assert_eq!(opened.err(), Some(HevcError::NoDevice));
    }

    #[test]
    fn test_dead_device_refuses_requests() {
        let dev = device();
        assert!(!dev.is_alive());
        let req = CommandRequest::new(1, 2, [0; 6]);
        assert_eq!(dev.submit_command(req), Err(HevcError::BadState));
        let payload = TransferPayload::Raw {
            video: &[0u8; 16],
            info: &[],
            last_frame: false,
            segment: None,
        };
        assert_eq!(dev.submit_transfer(0, payload), Err(HevcError::BadState));
    }

    #[test]
    fn test_parameter_checks_precede_submission() {
        let dev = device();
        dev.register_access(write(regs::main::MAIN_STATE, regs::main_state::INIT))
            .unwrap();
        assert!(dev.is_alive());

        let payload = TransferPayload::Raw {
            video: &[0u8; 16],
            info: &[],
            last_frame: false,
            segment: None,
        };
        assert_eq!(dev.submit_transfer(STREAM_MAX, payload), Err(HevcError::BadParameter));
        assert_eq!(
            dev.set_vin_state(VinCommand::Start, 1 << STREAM_MAX),
            Err(HevcError::BadParameter)
        );
        assert_eq!(
            dev.gpio(GpioCommand::Get(GPIO_PORT_MAX + 1)),
            Err(HevcError::BadParameter)
        );
        assert_eq!(
            dev.change_param(STREAM_MAX, RateControl::Cbr { average: 1 }),
            Err(HevcError::BadParameter)
        );
        // nothing reached the command ring
        assert_eq!(dev.get_status().command.count, 0);
    }

    #[test]
    fn test_encode_work_guarded_by_main_state() {
        let dev = device();
        dev.register_access(write(regs::main::MAIN_STATE, regs::main_state::INIT))
            .unwrap();
        assert_eq!(
            dev.register_access(read(regs::encode_work::BASE)),
            Err(HevcError::BadState)
        );
        dev.register_access(write(regs::main::MAIN_STATE, regs::main_state::ENCODE))
            .unwrap();
        assert!(dev.register_access(read(regs::encode_work::BASE)).is_ok());
    }

    #[test]
    fn test_masked_register_access() {
        let dev = device();
        dev.register_access(write(regs::vei::TOTAL_SIZE, 0x1234_5678))
            .unwrap();
        let nibble = RegisterOp::Read {
            address: regs::vei::TOTAL_SIZE,
            mask: 0xf,
            shift: 4,
            remap: false,
        };
        assert_eq!(dev.register_access(nibble), Ok(0x7));
        let set = RegisterOp::Write {
            address: regs::vei::TOTAL_SIZE,
            mask: 0xff,
            shift: 8,
            value: 0xab,
            remap: false,
        };
        assert_eq!(dev.register_access(set), Ok(0xab));
        assert_eq!(dev.register_access(read(regs::vei::TOTAL_SIZE)), Ok(0x1234_ab78));
    }

    #[test]
    fn test_interrupt_claimed_only_when_pending() {
        let file = Arc::new(RegisterFile::default());
        let dev = HevcDevice::open(
            file.clone(),
            &HostDmaAllocator::default(),
            HevcConfig::for_simulation(),
            SUPPORTED_PCI_ID,
        )
        .unwrap();
        assert!(!dev.handle_interrupt());

        file.set(crate::register::Bar::Bar0, regs::pcie::INT_STATUS, regs::factor::MESSAGE);
        assert!(dev.handle_interrupt());
        assert_eq!(file.get(crate::register::Bar::Bar0, regs::pcie::INT_STATUS), 0);
        assert!(!dev.handle_interrupt());
    }

    #[test]
    fn test_status_of_fresh_device() {
        let dev = device();
        let status = dev.get_status();
        assert_eq!(status.encode_mode, None);
        assert_eq!(status.streams[0].vif, InterfaceState::Unknown);
        assert_eq!(status.vei.level, 0);
        let info = dev.device_info();
        assert!(info.pci_supported());
        assert_eq!(info.driver_version, DRIVER_VERSION);
    }
}
