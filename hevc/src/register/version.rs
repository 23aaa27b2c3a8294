//! Firmware versions and device identity.

use super::Registers;
use crate::regs;

/// Version of this controller, reported alongside the firmware's.
pub const DRIVER_VERSION: [u32; 4] = [1, 1, 0, 0];

/// MCPU firmware the controller was qualified against.
pub const EXPECTED_MCPU_VERSION: [u32; 4] = [3, 0, 0, 9888];
pub const EXPECTED_SYSTEM_VERSION: &str = "010202.01.00.364";
pub const EXPECTED_ENCODER_VERSION: &str = "20160704_094422_dee4284";

/// PCI identity of the supported board.
pub const SUPPORTED_PCI_ID: PciId = PciId {
    vendor: 0x10cf,
    device: 0x2049,
    subsystem_vendor: 0xf1d0,
    subsystem_device: 0xeb15,
};

/// PCI identity read by the bootstrap collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PciId {
    pub vendor: u16,
    pub device: u16,
    pub subsystem_vendor: u16,
    pub subsystem_device: u16,
}

impl PciId {
    pub fn is_supported(&self) -> bool {
        *self == SUPPORTED_PCI_ID
    }
}

/// Firmware version block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FirmwareVersions {
    pub mcpu: [u32; 4],
    pub system: String,
    pub encoder_std_single: String,
    pub encoder_std_multi: String,
    pub encoder_user_single: String,
    pub encoder_user_multi: String,
}

impl FirmwareVersions {
    /// Read every version register.
    pub fn read(registers: &Registers) -> Self {
        let mut mcpu = [0u32; regs::version::MCPU_WORDS];
        registers.read_many(regs::version::MCPU, &mut mcpu);
        let text = |addr, size| read_string(registers, addr, size);
        Self {
            mcpu,
            system: text(regs::version::SYSTEM, regs::version::SYSTEM_SIZE),
            encoder_std_single: text(
                regs::version::ENCODER_STD_SINGLE,
                regs::version::ENCODER_SIZE,
            ),
            encoder_std_multi: text(regs::version::ENCODER_STD_MULTI, regs::version::ENCODER_SIZE),
            encoder_user_single: text(
                regs::version::ENCODER_USER_SINGLE,
                regs::version::ENCODER_SIZE,
            ),
            encoder_user_multi: text(
                regs::version::ENCODER_USER_MULTI,
                regs::version::ENCODER_SIZE,
            ),
        }
    }

    /// Whether MCPU, system and standard encoder firmware are the
    /// qualified builds.
    pub fn is_expected(&self) -> bool {
        self.mcpu == EXPECTED_MCPU_VERSION
            && self.system == EXPECTED_SYSTEM_VERSION
            && self.encoder_std_single == EXPECTED_ENCODER_VERSION
            && self.encoder_std_multi == EXPECTED_ENCODER_VERSION
    }

    pub fn mcpu_string(&self) -> String {
        let [a, b, c, d] = self.mcpu;
        format!("{}.{}.{}.{}", a, b, c, d)
    }
}

/// Everything known about the attached board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub driver_version: [u32; 4],
    pub pci_id: PciId,
    pub firmware: FirmwareVersions,
}

impl DeviceInfo {
    pub fn pci_supported(&self) -> bool {
        self.pci_id.is_supported()
    }

    pub fn firmware_expected(&self) -> bool {
        self.firmware.is_expected()
    }
}

/// Decode a little-endian byte-quad string, stopping at the first byte
/// outside printable ASCII.
pub fn decode_string(words: &[u32]) -> String {
    words
        .iter()
        .flat_map(|w| w.to_le_bytes())
        .take_while(|b| (0x20..=0x7e).contains(b))
        .map(char::from)
        .collect()
}

fn read_string(registers: &Registers, addr: u32, size: usize) -> String {
    let mut words = vec![0u32; size / 4];
    registers.read_many(addr, &mut words);
    decode_string(&words)
}

/// Encode a string the way the firmware stores it. Used by device models.
pub fn encode_string(text: &str, size: usize) -> Vec<u32> {
    let mut bytes = text.as_bytes().to_vec();
    bytes.resize(size, 0);
    bytes
        .chunks(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
