//! Simulated encoder board and test harness

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use morpheus_hevc::register::version::{
    encode_string, EXPECTED_ENCODER_VERSION, EXPECTED_MCPU_VERSION, EXPECTED_SYSTEM_VERSION,
    SUPPORTED_PCI_ID,
};
use morpheus_hevc::regs::{self, COMMAND_PARAM_MAX, COMMAND_RESULT_PARAM_MAX, STREAM_MAX};
use morpheus_hevc::{Bar, HevcConfig, HevcDevice, HostDmaAllocator, RegisterIo};
use parking_lot::Mutex;

/// `result[0]` the simulated firmware reports for a rejected command.
pub const COMMAND_FAILED: u32 = 0x0000_0bad;

/// Result code of a failed simulated DMA.
pub const DMA_FAILED: u32 = 0x0000_0001;

/// Counters of responses to drop or corrupt. Each one applies to the
/// next N matching responses.
#[derive(Default)]
pub struct Faults {
    pub drop_command_acks: AtomicU32,
    pub drop_command_results: AtomicU32,
    /// Echo a continuity count no command was sent with.
    pub corrupt_result_counts: AtomicU32,
    pub fail_commands: AtomicU32,
    pub drop_vei_acks: AtomicU32,
    pub drop_vei_completions: AtomicU32,
    pub fail_vei_acks: AtomicU32,
    pub drop_seo_acks: AtomicU32,
    pub drop_seo_completions: AtomicU32,
    pub fail_seo_completions: AtomicU32,
    /// Mark the next encoded access unit as the last of its sequence.
    pub last_es: AtomicU32,
    /// Ignore every doorbell while set.
    pub stalled: AtomicBool,
    /// Leave the main state alone on a restart request.
    pub boot_hangs: AtomicBool,
}

fn take(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

enum Job {
    Command {
        generation: u64,
        count: u32,
        target: u32,
        id: u32,
        params: [u32; COMMAND_PARAM_MAX],
    },
    Vei {
        generation: u64,
        count: u32,
        stream_id: u32,
        size: u32,
    },
    Seo {
        generation: u64,
        count: u32,
        stream_id: u32,
        size: u32,
        info_size: u32,
    },
    Message {
        target: u32,
        id: u32,
        params: Vec<u32>,
    },
    Acked(u32),
    Restart,
}

/// Register writes plus the factor bit raised once they are visible.
struct Response {
    writes: Vec<(u32, u32)>,
    factor: u32,
}

/// One response category whose block may only be rewritten after the
/// host has acknowledged the previous one.
#[derive(Default)]
struct Gated {
    pending: VecDeque<Response>,
    outstanding: bool,
}

/// In-memory model of the encoder's register space and firmware.
pub struct SimulatedEncoder {
    cells: Mutex<HashMap<u32, u32>>,
    jobs: Mutex<Sender<Job>>,
    device: Mutex<Option<Weak<HevcDevice>>>,
    generation: AtomicU64,
    pub faults: Faults,
    /// Size of each encoded access unit produced.
    pub encoded_size: AtomicU32,
    /// Size of the ES info block produced with each access unit.
    pub es_info_size: AtomicU32,
    pub doorbells: AtomicU32,
    pub interrupts: AtomicU32,
}

impl SimulatedEncoder {
    /// Power up a board in the boot state and start its firmware thread.
    pub fn start() -> Arc<Self> {
        let (tx, rx) = mpsc::channel();
        let sim = Arc::new(Self {
            cells: Mutex::new(HashMap::new()),
            jobs: Mutex::new(tx),
            device: Mutex::new(None),
            generation: AtomicU64::new(0),
            faults: Faults::default(),
            encoded_size: AtomicU32::new(0x2000),
            es_info_size: AtomicU32::new(64),
            doorbells: AtomicU32::new(0),
            interrupts: AtomicU32::new(0),
        });
        sim.power_on();
        let weak = Arc::downgrade(&sim);
        thread::Builder::new()
            .name("sim-firmware".into())
            .spawn(move || firmware(weak, rx))
            .expect("spawn simulated firmware");
        sim
    }

    fn power_on(&self) {
        self.set(regs::main::MAIN_STATE, regs::main_state::BOOT);
        self.set(
            regs::window::BAR5_BASE + regs::pcie::AXI_MASTER_REMAP_OFFSET,
            regs::window::BAR4_BASE,
        );
        for (i, word) in EXPECTED_MCPU_VERSION.iter().enumerate() {
            self.set(regs::version::MCPU + (i as u32) * 4, *word);
        }
        let strings = [
            (regs::version::SYSTEM, EXPECTED_SYSTEM_VERSION, regs::version::SYSTEM_SIZE),
            (
                regs::version::ENCODER_STD_SINGLE,
                EXPECTED_ENCODER_VERSION,
                regs::version::ENCODER_SIZE,
            ),
            (
                regs::version::ENCODER_STD_MULTI,
                EXPECTED_ENCODER_VERSION,
                regs::version::ENCODER_SIZE,
            ),
        ];
        for (addr, text, size) in strings {
            for (i, word) in encode_string(text, size).into_iter().enumerate() {
                self.set(addr + (i as u32) * 4, word);
            }
        }
    }

    /// Route interrupts to `device`.
    pub fn attach(&self, device: &Arc<HevcDevice>) {
        *self.device.lock() = Some(Arc::downgrade(device));
        // anything raised before the device existed
        self.interrupt();
    }

    pub fn get(&self, addr: u32) -> u32 {
        self.cells.lock().get(&addr).copied().unwrap_or(0)
    }

    pub fn set(&self, addr: u32, value: u32) {
        self.cells.lock().insert(addr, value);
    }

    pub fn main_state(&self) -> u32 {
        self.get(regs::main::MAIN_STATE)
    }

    /// Send a capture-start codec message for a sub-stream.
    pub fn post_capture(&self, stream_id: u32, sync_count: u32) {
        self.send(Job::Message {
            target: regs::message::TARGET_VI,
            id: regs::message::ID_CAPTURE_START,
            params: vec![stream_id, sync_count, 0x1000, 0x2000, 0],
        });
    }

    /// Raise the fatal error factor.
    pub fn raise_fatal(&self) {
        self.set(regs::main::MAIN_STATE, regs::main_state::ERROR);
        self.raise(regs::factor::FATAL_ERROR);
    }

    fn send(&self, job: Job) {
        // the firmware thread only exits once the board is gone
        let _ = self.jobs.lock().send(job);
    }

    fn flat(&self, bar: Bar, offset: u32) -> u32 {
        match bar {
            Bar::Bar0 => regs::window::BAR0_BASE + offset,
            Bar::Bar2 => regs::window::BAR2_BASE + offset,
            Bar::Bar5 => regs::window::BAR5_BASE + offset,
            Bar::Bar4 => {
                self.get(regs::window::BAR5_BASE + regs::pcie::AXI_MASTER_REMAP_OFFSET) + offset
            }
        }
    }

    fn raise(&self, factor: u32) {
        {
            let mut cells = self.cells.lock();
            *cells.entry(regs::pcie::INT_STATUS).or_insert(0) |= factor;
        }
        self.interrupt();
    }

    fn interrupt(&self) {
        let device = self.device.lock().as_ref().and_then(Weak::upgrade);
        if let Some(device) = device {
            self.interrupts.fetch_add(1, Ordering::SeqCst);
            device.handle_interrupt();
        }
    }

    fn doorbell(&self, bits: u32) {
        self.doorbells.fetch_add(1, Ordering::SeqCst);
        if self.faults.stalled.load(Ordering::SeqCst) {
            return;
        }
        let generation = self.generation.load(Ordering::SeqCst);
        if bits & regs::doorbell::CMD != 0 {
            let mut params = [0; COMMAND_PARAM_MAX];
            for (i, p) in params.iter_mut().enumerate() {
                *p = self.get(regs::command::PARAM_BASE + (i as u32) * 4);
            }
            self.send(Job::Command {
                generation,
                count: self.get(regs::command::CONTINUITY),
                target: self.get(regs::command::TARGET),
                id: self.get(regs::command::ID),
                params,
            });
        }
        if bits & regs::doorbell::DMA_VEI_REQ != 0 {
            self.send(Job::Vei {
                generation,
                count: self.get(regs::vei::CONTINUITY),
                stream_id: self.get(regs::vei::DATA_ID),
                size: self.get(regs::vei::TOTAL_SIZE),
            });
        }
        if bits & regs::doorbell::DMA_SEO_REQ != 0 {
            let size = self.get(regs::seo::TOTAL_SIZE);
            let info = self.get(regs::seo::ES_INFO_SIZE);
            self.send(Job::Seo {
                generation,
                count: self.get(regs::seo::CONTINUITY),
                stream_id: self.get(regs::seo::DATA_ID),
                size: self.encoded_size.load(Ordering::SeqCst).min(size),
                info_size: self.es_info_size.load(Ordering::SeqCst).min(info),
            });
        }
        let acks = regs::doorbell::CMD_RESULT_ACK
            | regs::doorbell::MESSAGE_ACK
            | regs::doorbell::DMA_VEI_COMPLETE_ACK
            | regs::doorbell::DMA_SEO_COMPLETE_ACK;
        if bits & acks != 0 {
            self.send(Job::Acked(bits & acks));
        }
    }

    fn restart_request(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.set(regs::pcie::INT_STATUS, 0);
        if !self.faults.boot_hangs.load(Ordering::SeqCst) {
            self.set(regs::main::MAIN_STATE, regs::main_state::BOOT);
        }
        self.send(Job::Restart);
    }
}

impl RegisterIo for SimulatedEncoder {
    fn read(&self, bar: Bar, offset: u32) -> u32 {
        self.get(self.flat(bar, offset))
    }

    fn write(&self, bar: Bar, offset: u32, value: u32) {
        let addr = self.flat(bar, offset);
        match addr {
            regs::pcie::INT_CLEAR => {
                let mut cells = self.cells.lock();
                *cells.entry(regs::pcie::INT_STATUS).or_insert(0) &= !value;
            }
            regs::pcie::INT_REG_SET => self.doorbell(value),
            regs::main::MCPU_FIRMWARE_RESTART_REQUEST
                if value == regs::main::MCPU_FIRMWARE_RESTART =>
            {
                self.restart_request()
            }
            _ => self.set(addr, value),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// FIRMWARE THREAD
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct Firmware {
    results: Gated,
    messages: Gated,
    vei: Gated,
    seo: Gated,
    gpio: HashMap<u32, u32>,
}

fn firmware(sim: Weak<SimulatedEncoder>, rx: Receiver<Job>) {
    let mut fw = Firmware::default();
    loop {
        let job = match rx.recv_timeout(Duration::from_millis(20)) {
            Ok(job) => job,
            Err(RecvTimeoutError::Timeout) => {
                if sim.strong_count() == 0 {
                    return;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => return,
        };
        let Some(sim) = sim.upgrade() else { return };
        fw.handle(&sim, job);
    }
}

impl Firmware {
    fn handle(&mut self, sim: &SimulatedEncoder, job: Job) {
        let current = sim.generation.load(Ordering::SeqCst);
        match job {
            Job::Command {
                generation,
                count,
                target,
                id,
                params,
            } if generation == current => self.command(sim, count, target, id, params),
            Job::Vei {
                generation,
                count,
                stream_id,
                size,
            } if generation == current => self.vei(sim, count, stream_id, size),
            Job::Seo {
                generation,
                count,
                stream_id,
                size,
                info_size,
            } if generation == current => self.seo(sim, count, stream_id, size, info_size),
            Job::Message { target, id, params } => {
                let mut writes = vec![(regs::message::TARGET, target), (regs::message::ID, id)];
                for (i, p) in params.into_iter().enumerate() {
                    writes.push((regs::message::PARAM_BASE + (i as u32) * 4, p));
                }
                Self::post(
                    sim,
                    &mut self.messages,
                    Response {
                        writes,
                        factor: regs::factor::MESSAGE,
                    },
                );
            }
            Job::Acked(bits) => {
                let gates = [
                    (regs::doorbell::CMD_RESULT_ACK, &mut self.results),
                    (regs::doorbell::MESSAGE_ACK, &mut self.messages),
                    (regs::doorbell::DMA_VEI_COMPLETE_ACK, &mut self.vei),
                    (regs::doorbell::DMA_SEO_COMPLETE_ACK, &mut self.seo),
                ];
                for (bit, gate) in gates {
                    if bits & bit != 0 {
                        gate.outstanding = false;
                        Self::flush(sim, gate);
                    }
                }
            }
            Job::Restart => {
                self.results = Gated::default();
                self.messages = Gated::default();
                self.vei = Gated::default();
                self.seo = Gated::default();
                self.gpio.clear();
            }
            // submitted before the last restart
            _ => {}
        }
    }

    /// Write a response block immediately; acks are never gated.
    fn respond(sim: &SimulatedEncoder, response: Response) {
        for (addr, value) in response.writes {
            sim.set(addr, value);
        }
        sim.raise(response.factor);
    }

    fn post(sim: &SimulatedEncoder, gate: &mut Gated, response: Response) {
        gate.pending.push_back(response);
        Self::flush(sim, gate);
    }

    fn flush(sim: &SimulatedEncoder, gate: &mut Gated) {
        if gate.outstanding {
            return;
        }
        if let Some(response) = gate.pending.pop_front() {
            gate.outstanding = true;
            Self::respond(sim, response);
        }
    }

    fn command(
        &mut self,
        sim: &SimulatedEncoder,
        count: u32,
        target: u32,
        id: u32,
        params: [u32; COMMAND_PARAM_MAX],
    ) {
        if !take(&sim.faults.drop_command_acks) {
            Self::respond(
                sim,
                Response {
                    writes: vec![
                        (regs::command::ACK_CONTINUITY, count),
                        (regs::command::ACK_TARGET, target),
                        (regs::command::ACK_ID, id),
                        (regs::command::ACK_RESULT, 0),
                    ],
                    factor: regs::factor::CMD_ACK,
                },
            );
        }

        let mut result = [0u32; COMMAND_RESULT_PARAM_MAX];
        if take(&sim.faults.fail_commands) {
            result[0] = COMMAND_FAILED;
        } else {
            result[0] = regs::command::RESULT_0_OK;
            self.apply(sim, target, id, params, &mut result);
        }
        if take(&sim.faults.drop_command_results) {
            return;
        }
        let echoed = if take(&sim.faults.corrupt_result_counts) {
            count.wrapping_add(0x100)
        } else {
            count
        };
        let mut writes = vec![
            (regs::command::RESULT_CONTINUITY, echoed),
            (regs::command::RESULT_TARGET, target),
            (regs::command::RESULT_ID, id),
        ];
        for (i, word) in result.iter().enumerate() {
            writes.push((regs::command::RESULT_PARAM_BASE + (i as u32) * 4, *word));
        }
        Self::post(
            sim,
            &mut self.results,
            Response {
                writes,
                factor: regs::factor::CMD_RESULT,
            },
        );
    }

    fn apply(
        &mut self,
        sim: &SimulatedEncoder,
        target: u32,
        id: u32,
        params: [u32; COMMAND_PARAM_MAX],
        result: &mut [u32; COMMAND_RESULT_PARAM_MAX],
    ) {
        let streams = || (0..STREAM_MAX).filter(move |i| params[1] & (1 << i) != 0);
        match (target, id) {
            (regs::target::MAIN, regs::command_id::STATE_CHANGE) => {
                sim.set(regs::main::MAIN_STATE, params[0]);
            }
            (regs::target::VIN_ID, regs::command_id::STATE_CHANGE) => {
                for i in streams() {
                    sim.set(regs::main::vin_state(i), params[0]);
                }
            }
            (regs::target::EH_ID, regs::command_id::STATE_CHANGE) => {
                for i in streams() {
                    sim.set(regs::main::eh_state(i), params[0]);
                }
            }
            (regs::target::GPIO, regs::command_id::GPIO_SET_VALUE) => {
                self.gpio.insert(params[1], params[0]);
            }
            (regs::target::GPIO, regs::command_id::GPIO_GET_VALUE) => {
                result[1] = self.gpio.get(&params[1]).copied().unwrap_or(0);
            }
            _ => {}
        }
    }

    fn vei(&mut self, sim: &SimulatedEncoder, count: u32, stream_id: u32, size: u32) {
        if !take(&sim.faults.drop_vei_acks) {
            let result = if take(&sim.faults.fail_vei_acks) {
                DMA_FAILED
            } else {
                regs::dma::RESULT_OK
            };
            Self::respond(
                sim,
                Response {
                    writes: vec![
                        (regs::vei::ACK_CONTINUITY, count),
                        (regs::vei::ACK_DATA_ID, stream_id),
                        (regs::vei::ACK_RESULT, result),
                    ],
                    factor: regs::factor::DMA_VEI_ACK,
                },
            );
            if result != regs::dma::RESULT_OK {
                return;
            }
        }
        if take(&sim.faults.drop_vei_completions) {
            return;
        }
        Self::post(
            sim,
            &mut self.vei,
            Response {
                writes: vec![
                    (regs::vei::COMPLETE_CONTINUITY, count),
                    (regs::vei::COMPLETE_DATA_ID, stream_id),
                    (regs::vei::COMPLETE_RESULT, regs::dma::RESULT_OK),
                    (regs::vei::COMPLETE_TOTAL_SIZE, size),
                ],
                factor: regs::factor::DMA_VEI_COMPLETE,
            },
        );
    }

    fn seo(
        &mut self,
        sim: &SimulatedEncoder,
        count: u32,
        stream_id: u32,
        size: u32,
        info_size: u32,
    ) {
        if !take(&sim.faults.drop_seo_acks) {
            Self::respond(
                sim,
                Response {
                    writes: vec![
                        (regs::seo::ACK_CONTINUITY, count),
                        (regs::seo::ACK_DATA_ID, stream_id),
                        (regs::seo::ACK_RESULT, regs::dma::RESULT_OK),
                    ],
                    factor: regs::factor::DMA_SEO_ACK,
                },
            );
        }
        if take(&sim.faults.drop_seo_completions) {
            return;
        }
        let result = if take(&sim.faults.fail_seo_completions) {
            DMA_FAILED
        } else {
            regs::dma::RESULT_OK
        };
        let last = if take(&sim.faults.last_es) {
            regs::seo::LAST_ES
        } else {
            0
        };
        Self::post(
            sim,
            &mut self.seo,
            Response {
                writes: vec![
                    (regs::seo::COMPLETE_CONTINUITY, count),
                    (regs::seo::COMPLETE_DATA_ID, stream_id),
                    (regs::seo::COMPLETE_RESULT, result),
                    (regs::seo::COMPLETE_TOTAL_SIZE, size),
                    (regs::seo::COMPLETE_ES_INFO_TOTAL_SIZE, info_size),
                    (regs::seo::COMPLETE_LAST_MARKER, last),
                ],
                factor: regs::factor::DMA_SEO_COMPLETE,
            },
        );
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// HARNESS
// ═══════════════════════════════════════════════════════════════════════════

/// A device opened against a fresh simulated board.
pub struct Harness {
    pub sim: Arc<SimulatedEncoder>,
    pub device: Arc<HevcDevice>,
}

pub fn open(config: HevcConfig) -> Harness {
    let sim = SimulatedEncoder::start();
    let device = HevcDevice::open(
        sim.clone(),
        &HostDmaAllocator::default(),
        config,
        SUPPORTED_PCI_ID,
    )
    .expect("open simulated device");
    let device = Arc::new(device);
    sim.attach(&device);
    Harness { sim, device }
}

/// Simulation config with every wait window shortened.
pub fn fast_config(timeout: Duration) -> HevcConfig {
    HevcConfig::for_simulation()
        .command_timeout(timeout)
        .stream_timeout(timeout)
        .buffer_timeout(timeout)
}

/// Poll `cond` for up to a second.
#[allow(dead_code)]
pub fn eventually<F: FnMut() -> bool>(mut cond: F) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}
