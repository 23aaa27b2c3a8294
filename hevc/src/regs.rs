//! Encoder register map and bit definitions.
//!
//! Addresses are in the device's flat 32-bit register space. The
//! register layer resolves each one to a BAR window (see `register`).

/// Number of logical sub-streams per direction.
pub const STREAM_MAX: usize = 4;

/// Number of GPIO ports tracked by the controller.
pub const GPIO_MAX: usize = 64;

/// Highest GPIO port number the firmware accepts.
pub const GPIO_PORT_MAX: u32 = (GPIO_MAX as u32) - 1;

/// Command parameter words.
pub const COMMAND_PARAM_MAX: usize = 6;

/// Command result words.
pub const COMMAND_RESULT_PARAM_MAX: usize = 8;

/// Codec message parameter words.
pub const MESSAGE_PARAM_MAX: usize = 8;

/// Hardware limit on DMA descriptors per transfer.
pub const DESCRIPTOR_MAX: usize = 512;

/// Default BAR window layout.
pub mod window {
    pub const BAR0_BASE: u32 = 0x0000_0000;
    pub const BAR0_SIZE: u32 = 0x0000_1000;
    pub const BAR2_BASE: u32 = 0x0001_0000;
    pub const BAR2_SIZE: u32 = 0x0001_0000;
    pub const BAR5_BASE: u32 = 0x0002_0000;
    pub const BAR5_SIZE: u32 = 0x0000_1000;
    /// Default block mapped by the remap window.
    pub const BAR4_BASE: u32 = 0x0040_0000;
    pub const BAR4_SIZE: u32 = 0x0010_0000;
}

/// PCIe bridge control registers (BAR0).
pub mod pcie {
    /// Interrupt factor status.
    pub const INT_STATUS: u32 = 0x0000_0100;
    /// Interrupt factor clear (write 1 to clear).
    pub const INT_CLEAR: u32 = 0x0000_0104;
    /// Host to device doorbell.
    pub const INT_REG_SET: u32 = 0x0000_0108;
    /// Remap register offset inside BAR5, or BAR0 without BAR5.
    pub const AXI_MASTER_REMAP_OFFSET: u32 = 0x0000_0020;
}

/// Doorbell bits written to `pcie::INT_REG_SET`.
pub mod doorbell {
    pub const CMD: u32 = 1 << 0;
    pub const CMD_RESULT_ACK: u32 = 1 << 1;
    pub const MESSAGE_ACK: u32 = 1 << 2;
    pub const DMA_VEI_REQ: u32 = 1 << 3;
    pub const DMA_VEI_COMPLETE_ACK: u32 = 1 << 4;
    pub const DMA_SEO_REQ: u32 = 1 << 5;
    pub const DMA_SEO_COMPLETE_ACK: u32 = 1 << 6;
}

/// Interrupt factor bits read from `pcie::INT_STATUS`.
pub mod factor {
    pub const CMD_ACK: u32 = 1 << 0;
    pub const CMD_RESULT: u32 = 1 << 1;
    pub const MESSAGE: u32 = 1 << 2;
    pub const DMA_VEI_ACK: u32 = 1 << 3;
    pub const DMA_VEI_COMPLETE: u32 = 1 << 4;
    pub const DMA_SEO_ACK: u32 = 1 << 5;
    pub const DMA_SEO_COMPLETE: u32 = 1 << 6;
    pub const FATAL_ERROR: u32 = 1 << 7;
}

/// Main firmware state and control.
pub mod main {
    pub const MAIN_STATE: u32 = 0x0040_0000;
    pub const MCPU_FIRMWARE_RESTART_REQUEST: u32 = 0x0040_0004;
    pub const MCPU_FIRMWARE_RESTART: u32 = 0x0000_0001;

    /// Video input state for a sub-stream.
    pub const fn vin_state(stream: usize) -> u32 {
        0x0040_0100 + (stream as u32) * 4
    }

    /// Encoder (EH) state for a sub-stream.
    pub const fn eh_state(stream: usize) -> u32 {
        0x0040_0140 + (stream as u32) * 4
    }
}

/// `main::MAIN_STATE` values.
pub mod main_state {
    pub const BOOT: u32 = 0x0001;
    pub const INIT: u32 = 0x0002;
    pub const ENCODE: u32 = 0x0003;
    pub const ERROR: u32 = 0x00ff;
}

/// `main::vin_state` values.
pub mod vin_state {
    pub const STOP: u32 = 0x0001;
    pub const START: u32 = 0x0002;
}

/// `main::eh_state` values.
pub mod eh_state {
    pub const STOP: u32 = 0x0001;
    pub const START: u32 = 0x0002;
    pub const READY_TO_STOP: u32 = 0x0003;
}

/// Firmware version strings, stored as little-endian byte quads.
pub mod version {
    pub const MCPU: u32 = 0x0040_0200;
    pub const MCPU_WORDS: usize = 4;
    pub const SYSTEM: u32 = 0x0040_0210;
    pub const SYSTEM_SIZE: usize = 32;
    pub const ENCODER_STD_SINGLE: u32 = 0x0040_0230;
    pub const ENCODER_STD_MULTI: u32 = 0x0040_0250;
    pub const ENCODER_USER_SINGLE: u32 = 0x0040_0270;
    pub const ENCODER_USER_MULTI: u32 = 0x0040_0290;
    pub const ENCODER_SIZE: usize = 32;
}

/// Command slot, ack block and result block.
pub mod command {
    pub const TARGET: u32 = 0x0040_1000;
    pub const ID: u32 = 0x0040_1004;
    pub const PARAM_BASE: u32 = 0x0040_1008;
    pub const CONTINUITY: u32 = 0x0040_1020;

    pub const ACK_CONTINUITY: u32 = 0x0040_1040;
    pub const ACK_TARGET: u32 = 0x0040_1044;
    pub const ACK_ID: u32 = 0x0040_1048;
    pub const ACK_RESULT: u32 = 0x0040_104c;

    pub const RESULT_CONTINUITY: u32 = 0x0040_1080;
    pub const RESULT_TARGET: u32 = 0x0040_1084;
    pub const RESULT_ID: u32 = 0x0040_1088;
    pub const RESULT_PARAM_BASE: u32 = 0x0040_108c;

    /// `result[0]` of a successful command.
    pub const RESULT_0_OK: u32 = 0x0000_0000;
}

/// Command targets.
pub mod target {
    pub const MAIN: u32 = 0x0001;
    pub const VIN_ID: u32 = 0x0002;
    pub const EH_ID: u32 = 0x0003;
    pub const GPIO: u32 = 0x0004;
}

/// Command ids.
pub mod command_id {
    pub const STATE_CHANGE: u32 = 0x0001;
    pub const GPIO_FUNCTION: u32 = 0x0010;
    pub const GPIO_DIRECTION: u32 = 0x0011;
    pub const GPIO_SET_VALUE: u32 = 0x0012;
    pub const GPIO_GET_VALUE: u32 = 0x0013;
    pub const EH_ENCODE_PARAM_CHANGE: u32 = 0x0020;
    pub const EH_PICTURE_TYPE_CHANGE: u32 = 0x0021;
}

/// Command parameter values.
pub mod param {
    pub const ENCODE_MODE_SINGLE_CH: u32 = 0;
    pub const ENCODE_MODE_MULTI_CH: u32 = 1;
    pub const FIRM_STD: u32 = 0;
    pub const FIRM_USER: u32 = 1;
    pub const GPIO_FUNCTION_GPIO: u32 = 0;
    pub const GPIO_FUNCTION_PERIPHERAL: u32 = 1;
    pub const GPIO_DIRECTION_IN: u32 = 0;
    pub const GPIO_DIRECTION_OUT: u32 = 1;
    pub const GPIO_VALUE_LOW: u32 = 0;
    pub const GPIO_VALUE_HIGH: u32 = 1;
    pub const CHANGE_CBR: u32 = 1 << 0;
    pub const CHANGE_VBR: u32 = 1 << 1;
    pub const CONTINUOUS_SEQUENCE: u32 = 0;
    pub const DISCONTINUOUS_SEQUENCE: u32 = 1;
}

/// Unsolicited codec messages.
pub mod message {
    pub const TARGET: u32 = 0x0040_1100;
    pub const ID: u32 = 0x0040_1104;
    pub const PARAM_BASE: u32 = 0x0040_1108;

    pub const TARGET_VI: u32 = 0x0001;
    pub const TARGET_EH: u32 = 0x0002;

    pub const ID_CAPTURE_START: u32 = 0x0001;
    pub const ID_VSYNC: u32 = 0x0002;
    pub const ID_ENCODE_ADDITIONAL_INFO: u32 = 0x0010;
}

/// DMA result codes.
pub mod dma {
    pub const RESULT_OK: u32 = 0x0000_0000;
}

/// Raw video in (VEI) descriptor table and status (BAR2).
pub mod vei {
    const DESCRIPTOR_BASE: u32 = 0x0001_0000;

    pub const fn descriptor_address_l(index: usize) -> u32 {
        DESCRIPTOR_BASE + (index as u32) * 12
    }

    pub const fn descriptor_address_h(index: usize) -> u32 {
        DESCRIPTOR_BASE + (index as u32) * 12 + 4
    }

    pub const fn descriptor_size(index: usize) -> u32 {
        DESCRIPTOR_BASE + (index as u32) * 12 + 8
    }

    pub const DATA_ID: u32 = 0x0001_1800;
    pub const NUMBER_OF_DESCRIPTORS: u32 = 0x0001_1804;
    pub const TOTAL_SIZE: u32 = 0x0001_1808;
    pub const LAST_FRAME_MARKER: u32 = 0x0001_180c;
    pub const PICTURE_INFO_ADDRESS_L: u32 = 0x0001_1810;
    pub const PICTURE_INFO_ADDRESS_H: u32 = 0x0001_1814;
    pub const PICTURE_INFO_SIZE: u32 = 0x0001_1818;
    pub const CONTINUITY: u32 = 0x0001_181c;

    pub const ACK_CONTINUITY: u32 = 0x0001_1840;
    pub const ACK_DATA_ID: u32 = 0x0001_1844;
    pub const ACK_RESULT: u32 = 0x0001_1848;

    pub const COMPLETE_CONTINUITY: u32 = 0x0001_1880;
    pub const COMPLETE_DATA_ID: u32 = 0x0001_1884;
    pub const COMPLETE_RESULT: u32 = 0x0001_1888;
    pub const COMPLETE_TOTAL_SIZE: u32 = 0x0001_188c;

    pub const LAST_FRAME: u32 = 0x0000_0001;
    pub const NOT_LAST_FRAME: u32 = 0x0000_0000;

    /// Smallest picture info block the firmware accepts.
    pub const PIC_INFO_MIN_SIZE: usize = 16;
}

/// Encoded stream out (SEO) descriptor table and status (BAR2).
pub mod seo {
    const DESCRIPTOR_BASE: u32 = 0x0001_2000;

    pub const fn descriptor_address_l(index: usize) -> u32 {
        DESCRIPTOR_BASE + (index as u32) * 12
    }

    pub const fn descriptor_address_h(index: usize) -> u32 {
        DESCRIPTOR_BASE + (index as u32) * 12 + 4
    }

    pub const fn descriptor_size(index: usize) -> u32 {
        DESCRIPTOR_BASE + (index as u32) * 12 + 8
    }

    pub const DATA_ID: u32 = 0x0001_3800;
    pub const NUMBER_OF_DESCRIPTORS: u32 = 0x0001_3804;
    pub const TOTAL_SIZE: u32 = 0x0001_3808;
    pub const ES_INFO_ADDRESS_L: u32 = 0x0001_3810;
    pub const ES_INFO_ADDRESS_H: u32 = 0x0001_3814;
    pub const ES_INFO_SIZE: u32 = 0x0001_3818;
    pub const CONTINUITY: u32 = 0x0001_381c;

    pub const ACK_CONTINUITY: u32 = 0x0001_3840;
    pub const ACK_DATA_ID: u32 = 0x0001_3844;
    pub const ACK_RESULT: u32 = 0x0001_3848;

    pub const COMPLETE_CONTINUITY: u32 = 0x0001_3880;
    pub const COMPLETE_DATA_ID: u32 = 0x0001_3884;
    pub const COMPLETE_RESULT: u32 = 0x0001_3888;
    pub const COMPLETE_TOTAL_SIZE: u32 = 0x0001_388c;
    pub const COMPLETE_ES_INFO_TOTAL_SIZE: u32 = 0x0001_3890;
    pub const COMPLETE_LAST_MARKER: u32 = 0x0001_3894;

    /// Last-ES marker value in `COMPLETE_LAST_MARKER`.
    pub const LAST_ES: u32 = 0x0000_0001;
}

/// Encoder working memory, only safe to touch while encoding or failed.
pub mod encode_work {
    pub const BASE: u32 = 0x0100_0000;
    pub const END: u32 = 0x01ff_ffff;
}

/// Every continuity counter register, send counters first.
pub const CONTINUITY_REGISTERS: [u32; 9] = [
    command::CONTINUITY,
    command::ACK_CONTINUITY,
    command::RESULT_CONTINUITY,
    vei::CONTINUITY,
    vei::ACK_CONTINUITY,
    vei::COMPLETE_CONTINUITY,
    seo::CONTINUITY,
    seo::ACK_CONTINUITY,
    seo::COMPLETE_CONTINUITY,
];
