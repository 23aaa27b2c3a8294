//! Interrupt Dispatcher.
//!
//! The interrupt path only latches and clears the status word, then
//! schedules one deferred unit per factor bit. Each unit reads its
//! category's result block, acknowledges it to the firmware and forwards
//! the parsed response to its queue, then reschedules that queue's sender.
//!
//! ```text
//! handle_interrupt ─┬─ CMD_ACK ──────────── command_ack ──┐
//!                   ├─ CMD_RESULT ───────── command_result┼─> command_send
//!                   ├─ MESSAGE ──────────── message (frame queue)
//!                   ├─ DMA_VEI_ACK/COMPLETE vei_* ────────┼─> vei_send
//!                   ├─ DMA_SEO_ACK/COMPLETE seo_* ────────┴─> seo_send
//!                   └─ FATAL_ERROR ──────── logged
//! ```

use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use tracing::{debug, error, trace, warn};

use crate::device::Shared;
use crate::regs::{self, COMMAND_RESULT_PARAM_MAX, MESSAGE_PARAM_MAX, STREAM_MAX};
use crate::stream::{DmaAck, DmaCompletion};
use crate::sync::Dpc;
use crate::types::{CommandAck, CommandResult, FrameData, InterfaceState};

bitflags! {
    /// Interrupt status bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InterruptFactor: u32 {
        const CMD_ACK = regs::factor::CMD_ACK;
        const CMD_RESULT = regs::factor::CMD_RESULT;
        const MESSAGE = regs::factor::MESSAGE;
        const DMA_VEI_ACK = regs::factor::DMA_VEI_ACK;
        const DMA_VEI_COMPLETE = regs::factor::DMA_VEI_COMPLETE;
        const DMA_SEO_ACK = regs::factor::DMA_SEO_ACK;
        const DMA_SEO_COMPLETE = regs::factor::DMA_SEO_COMPLETE;
        const FATAL_ERROR = regs::factor::FATAL_ERROR;
    }
}

/// Unsolicited codec message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CodecMessage {
    pub target: u32,
    pub id: u32,
    pub params: [u32; MESSAGE_PARAM_MAX],
}

/// Host clock in 100 ns units.
pub(crate) fn host_time_100ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| (d.as_nanos() / 100) as u64)
}

// ═══════════════════════════════════════════════════════════════════════════
// DEFERRED WORK UNITS
// ═══════════════════════════════════════════════════════════════════════════

/// Every deferred unit of one device.
pub(crate) struct Dpcs {
    pub command_send: Dpc,
    pub vei_send: Dpc,
    pub seo_send: Dpc,
    pub command_ack: Dpc,
    pub command_result: Dpc,
    pub message: Dpc,
    pub vei_ack: Dpc,
    pub vei_complete: Dpc,
    pub seo_ack: Dpc,
    pub seo_complete: Dpc,
}

impl Dpcs {
    pub fn new() -> Self {
        Self {
            command_send: Dpc::new("cmd-send"),
            vei_send: Dpc::new("vei-send"),
            seo_send: Dpc::new("seo-send"),
            command_ack: Dpc::new("cmd-ack"),
            command_result: Dpc::new("cmd-result"),
            message: Dpc::new("message"),
            vei_ack: Dpc::new("vei-ack"),
            vei_complete: Dpc::new("vei-complete"),
            seo_ack: Dpc::new("seo-ack"),
            seo_complete: Dpc::new("seo-complete"),
        }
    }

    fn all(&self) -> [&Dpc; 10] {
        [
            &self.command_send,
            &self.vei_send,
            &self.seo_send,
            &self.command_ack,
            &self.command_result,
            &self.message,
            &self.vei_ack,
            &self.vei_complete,
            &self.seo_ack,
            &self.seo_complete,
        ]
    }

    pub fn shutdown(&self) {
        for dpc in self.all() {
            dpc.shutdown();
        }
    }
}

/// Spawn the worker behind every unit. Workers hold the device weakly so
/// dropping the device stops them.
pub(crate) fn start(shared: &Arc<Shared>) -> std::io::Result<()> {
    let units: [(&Dpc, fn(&Shared)); 10] = [
        (&shared.dpcs.command_send, Shared::send_commands),
        (&shared.dpcs.vei_send, Shared::send_vei),
        (&shared.dpcs.seo_send, Shared::send_seo),
        (&shared.dpcs.command_ack, Shared::on_command_ack),
        (&shared.dpcs.command_result, Shared::on_command_result),
        (&shared.dpcs.message, Shared::on_message),
        (&shared.dpcs.vei_ack, Shared::on_vei_ack),
        (&shared.dpcs.vei_complete, Shared::on_vei_complete),
        (&shared.dpcs.seo_ack, Shared::on_seo_ack),
        (&shared.dpcs.seo_complete, Shared::on_seo_complete),
    ];
    for (dpc, work) in units {
        let weak: Weak<Shared> = Arc::downgrade(shared);
        dpc.start(move || {
            if let Some(shared) = weak.upgrade() {
                work(&shared);
            }
        })?;
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// HANDLERS
// ═══════════════════════════════════════════════════════════════════════════

impl Shared {
    /// Interrupt entry: latch, clear and fan out.
    ///
    /// # Returns
    /// `false` if no status bit was set, so a shared line was not ours.
    pub(crate) fn dispatch_interrupt(&self) -> bool {
        let status = self.regs.take_interrupt_status();
        if status == 0 {
            return false;
        }
        let factors = InterruptFactor::from_bits_retain(status);
        trace!(status, "interrupt");

        let unknown = status & !InterruptFactor::all().bits();
        if unknown != 0 {
            error!(bits = unknown, "unknown interrupt factor");
        }

        let routes = [
            (InterruptFactor::CMD_ACK, &self.dpcs.command_ack),
            (InterruptFactor::CMD_RESULT, &self.dpcs.command_result),
            (InterruptFactor::MESSAGE, &self.dpcs.message),
            (InterruptFactor::DMA_VEI_ACK, &self.dpcs.vei_ack),
            (InterruptFactor::DMA_VEI_COMPLETE, &self.dpcs.vei_complete),
            (InterruptFactor::DMA_SEO_ACK, &self.dpcs.seo_ack),
            (InterruptFactor::DMA_SEO_COMPLETE, &self.dpcs.seo_complete),
        ];
        for (factor, dpc) in routes {
            if factors.contains(factor) {
                dpc.schedule();
            }
        }
        if factors.contains(InterruptFactor::FATAL_ERROR) {
            error!(main_state = ?self.regs.main_state(), "fatal error interrupt");
        }
        true
    }

    pub(crate) fn send_commands(&self) {
        self.commands.send(&*self.regs);
    }

    pub(crate) fn send_vei(&self) {
        self.vei.send(&*self.regs);
    }

    pub(crate) fn send_seo(&self) {
        self.seo.send(&*self.regs);
    }

    fn on_command_ack(&self) {
        let ack = CommandAck {
            count: self.regs.read32(regs::command::ACK_CONTINUITY),
            target: self.regs.read32(regs::command::ACK_TARGET),
            id: self.regs.read32(regs::command::ACK_ID),
            result: self.regs.read32(regs::command::ACK_RESULT),
        };
        self.commands.record_ack(ack);
        self.dpcs.command_send.schedule();
    }

    fn on_command_result(&self) {
        let mut result = CommandResult {
            count: self.regs.read32(regs::command::RESULT_CONTINUITY),
            target: self.regs.read32(regs::command::RESULT_TARGET),
            id: self.regs.read32(regs::command::RESULT_ID),
            result: [0; COMMAND_RESULT_PARAM_MAX],
        };
        self.regs
            .read_many(regs::command::RESULT_PARAM_BASE, &mut result.result);
        self.regs.doorbell(regs::doorbell::CMD_RESULT_ACK);
        self.commands.record_result(result);
        self.dpcs.command_send.schedule();
    }

    fn on_message(&self) {
        let mut message = CodecMessage {
            target: self.regs.read32(regs::message::TARGET),
            id: self.regs.read32(regs::message::ID),
            params: [0; MESSAGE_PARAM_MAX],
        };
        self.regs
            .read_many(regs::message::PARAM_BASE, &mut message.params);
        self.regs.doorbell(regs::doorbell::MESSAGE_ACK);
        self.codec_message(&message);
    }

    /// Act on one codec message.
    pub(crate) fn codec_message(&self, message: &CodecMessage) {
        use regs::message::*;

        match (message.target, message.id) {
            (TARGET_VI, ID_CAPTURE_START) => {
                let stream_id = message.params[0] as usize;
                if stream_id >= STREAM_MAX {
                    warn!(stream_id, "capture start for unknown stream");
                    return;
                }
                self.state.lock().vif[stream_id] = InterfaceState::Start;
                let frame = FrameData {
                    stream_id,
                    sync_count: message.params[1],
                    itc_low: message.params[2],
                    itc_high: message.params[3],
                    itc_ext: message.params[4],
                    encode_time: host_time_100ns(),
                };
                self.frames.push(frame);
                self.vei.stats().record_transfer(stream_id, 0);
                trace!(stream_id, sync = frame.sync_count, "capture start");
            }
            (TARGET_VI, ID_VSYNC) => trace!("vsync"),
            (TARGET_EH, ID_ENCODE_ADDITIONAL_INFO) => trace!("encode additional info"),
            (target, id) => debug!(target_id = target, id, "unhandled codec message"),
        }
    }

    fn on_vei_ack(&self) {
        let ack = DmaAck {
            count: self.regs.read32(regs::vei::ACK_CONTINUITY),
            stream_id: self.regs.read32(regs::vei::ACK_DATA_ID),
            result: self.regs.read32(regs::vei::ACK_RESULT),
        };
        self.vei.record_ack(ack);
        self.dpcs.vei_send.schedule();
    }

    fn on_vei_complete(&self) {
        let result = self.regs.read32(regs::vei::COMPLETE_RESULT);
        let completion = DmaCompletion {
            count: self.regs.read32(regs::vei::COMPLETE_CONTINUITY),
            stream_id: self.regs.read32(regs::vei::COMPLETE_DATA_ID),
            result,
            video_size: if result == regs::dma::RESULT_OK {
                self.regs.read32(regs::vei::COMPLETE_TOTAL_SIZE)
            } else {
                0
            },
            info_size: 0,
            last_frame: false,
        };
        self.regs.doorbell(regs::doorbell::DMA_VEI_COMPLETE_ACK);
        self.vei.record_result(completion);
        self.dpcs.vei_send.schedule();
    }

    fn on_seo_ack(&self) {
        let ack = DmaAck {
            count: self.regs.read32(regs::seo::ACK_CONTINUITY),
            stream_id: self.regs.read32(regs::seo::ACK_DATA_ID),
            result: self.regs.read32(regs::seo::ACK_RESULT),
        };
        self.seo.record_ack(ack);
        self.dpcs.seo_send.schedule();
    }

    fn on_seo_complete(&self) {
        let result = self.regs.read32(regs::seo::COMPLETE_RESULT);
        let ok = result == regs::dma::RESULT_OK;
        let completion = DmaCompletion {
            count: self.regs.read32(regs::seo::COMPLETE_CONTINUITY),
            stream_id: self.regs.read32(regs::seo::COMPLETE_DATA_ID),
            result,
            video_size: if ok {
                self.regs.read32(regs::seo::COMPLETE_TOTAL_SIZE)
            } else {
                0
            },
            info_size: if ok {
                self.regs.read32(regs::seo::COMPLETE_ES_INFO_TOTAL_SIZE)
            } else {
                0
            },
            last_frame: self.regs.read32(regs::seo::COMPLETE_LAST_MARKER) == regs::seo::LAST_ES,
        };
        self.regs.doorbell(regs::doorbell::DMA_SEO_COMPLETE_ACK);
        self.seo.record_result(completion);
        self.dpcs.seo_send.schedule();
    }
}
