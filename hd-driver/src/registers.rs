//! Register map of the helicity decoder.
//!
//! Offsets are bytes from the module's A24 base. Every register is a 32-bit
//! big-endian word; the backend handles the byte order.

use hd_io::Field;

#[repr(u32)]
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, strum::VariantArray, strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum Reg {
    Version = 0x00,
    Csr = 0x04,
    Ctrl1 = 0x08,
    Ctrl2 = 0x0C,
    Adr32 = 0x10,
    Interrupt = 0x14,
    BlockSize = 0x18,
    Delay = 0x1C,
    GeneratorConfig1 = 0x20,
    GeneratorConfig2 = 0x24,
    GeneratorConfig3 = 0x28,
    TestTriggerDelay = 0x2C,
    Trig1Scaler = 0x30,
    Trig2Scaler = 0x34,
    SyncResetScaler = 0x38,
    EventsOnBoard = 0x3C,
    BlocksOnBoard = 0x40,
    TstableRisingScaler = 0x44,
    TstableFallingScaler = 0x48,
    PatternSyncScaler = 0x4C,
    PairSyncScaler = 0x50,
    Clock125Test = 0x54,
    RecoveredShiftReg = 0x58,
    GeneratorShiftReg = 0x5C,
    LatencyConfirm = 0x60,
    DelayConfirm = 0x64,
    HelicityHistory1 = 0x68,
    HelicityHistory2 = 0x6C,
    HelicityHistory3 = 0x70,
    HelicityHistory4 = 0x74,
    PairDelaySetup = 0x80,
    PairErrorCount = 0x84,
    EepromCsr = 0x90,
    EepromData = 0x94,
}

impl Reg {
    pub const fn offset(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        self.into()
    }
}

/// Expected value of [`version::BOARD_TYPE`].
pub const BOARD_TYPE: u32 = 0x4844;
pub const SUPPORTED_FIRMWARE: u32 = 0x03;

/// Default A32 base of the data FIFO window.
pub const DEFAULT_A32_BASE: u32 = 0x0900_0000;

/// ```text
/// [31:16] board type
/// [15: 8] board revision
/// [ 7: 0] firmware version
/// ```
pub mod version {
    use super::Field;

    pub const BOARD_TYPE: Field = Field::new(31, 16);
    pub const BOARD_REV: Field = Field::new(15, 8);
    pub const FIRMWARE: Field = Field::new(7, 0);
}

/// Writes are one-shot commands, reads return status.
#[rustfmt::skip]
pub mod csr {
    use super::Field;

    pub const BLOCK_READY       : Field = Field::bit(0);
    pub const BUSY              : Field = Field::bit(1);
    pub const BUSY_LATCHED      : Field = Field::bit(2);
    pub const SYSTEM_PLL_LOCKED : Field = Field::bit(3);
    pub const LOCAL_PLL_LOCKED  : Field = Field::bit(4);

    pub const TRIG2             : Field = Field::bit(27);
    pub const SYNC_RESET        : Field = Field::bit(28);
    pub const TRIG1             : Field = Field::bit(29);
    pub const SOFT_RESET        : Field = Field::bit(30);
    pub const HARD_RESET        : Field = Field::bit(31);
}

/// Source fields hold 0 internal (software for trigger/sync), 1 front panel,
/// 2 backplane.
#[rustfmt::skip]
pub mod ctrl1 {
    use super::Field;

    pub const CLK_SRC            : Field = Field::new(1, 0);
    pub const INT_CLK_ENABLE     : Field = Field::bit(2);
    pub const TRIG_SRC           : Field = Field::new(5, 4);
    pub const SYNC_RESET_SRC     : Field = Field::new(7, 6);
    pub const USE_INT_HELICITY   : Field = Field::bit(8);
    pub const USE_EXT_CU_IN      : Field = Field::bit(9);
    pub const INT_HELICITY_TO_FP : Field = Field::bit(10);
    pub const HEL_SRC            : Field = Field::new(10, 8);
    pub const INVERT_FIBER_IN    : Field = Field::bit(12);
    pub const INVERT_CU_IN       : Field = Field::bit(13);
    pub const INVERT_OUTPUT      : Field = Field::bit(14);
    pub const INVERT             : Field = Field::new(14, 12);
    pub const BERR_ENABLE        : Field = Field::bit(20);

    /// Every bit touched by a signal source update.
    pub const SOURCES: u32 = CLK_SRC.mask()
        | INT_CLK_ENABLE.mask()
        | TRIG_SRC.mask()
        | SYNC_RESET_SRC.mask();
}

#[rustfmt::skip]
pub mod ctrl2 {
    use super::Field;

    pub const DECODER_ENABLE     : Field = Field::bit(0);
    pub const EVENT_BUILD_ENABLE : Field = Field::bit(1);
    pub const GENERATOR_ENABLE   : Field = Field::bit(2);
    pub const FORCE_BUSY         : Field = Field::bit(3);
}

/// ```text
/// [15: 7] A32 base, bits [31:23] of the bus address
/// [    0] enable
/// ```
pub mod adr32 {
    use super::Field;

    pub const BASE: Field = Field::new(15, 7);
    pub const ENABLE: Field = Field::bit(0);
    /// Alignment required of the A32 base.
    pub const ALIGN: u32 = 1 << 23;
}

pub mod interrupt {
    use super::Field;

    pub const GEO_SLOT: Field = Field::new(20, 16);
}

pub mod block_size {
    use super::Field;

    pub const BLOCKLEVEL: Field = Field::new(7, 0);
}

/// ```text
/// [27:16] trigger latency
/// [11: 0] data input delay
/// ```
pub mod delay {
    use super::Field;

    pub const TRIGGER_LATENCY: Field = Field::new(27, 16);
    pub const DATA_INPUT: Field = Field::new(11, 0);
}

/// Circular buffer pointers behind [`Reg::LatencyConfirm`] and
/// [`Reg::DelayConfirm`].
pub mod confirm {
    use super::Field;

    pub const WRITE_ADDR: Field = Field::new(11, 0);
    pub const READ_ADDR: Field = Field::new(27, 16);
}

/// ```text
/// config1 [31:16] settle time  [15:8] window delay  [1:0] pattern
/// config2 [23: 0] stable time
/// config3 [29: 0] seed
/// ```
#[rustfmt::skip]
pub mod generator {
    use super::Field;

    pub const PATTERN      : Field = Field::new(1, 0);
    pub const WINDOW_DELAY : Field = Field::new(15, 8);
    pub const SETTLE_TIME  : Field = Field::new(31, 16);
    pub const STABLE_TIME  : Field = Field::new(23, 0);
    pub const SEED         : Field = Field::new(29, 0);
}

#[rustfmt::skip]
pub mod eeprom {
    use super::Field;

    pub const DATA : Field = Field::new(7, 0);
    pub const BUSY : Field = Field::bit(8);

    pub const READ         : u32 = 0x0000_0000;
    pub const WRITE        : u32 = 0x8000_0000; // byte program
    pub const SECTOR_ERASE : u32 = 0xA000_0000;
    pub const BULK_ERASE   : u32 = 0xC000_0000;

    /// Pack an EEPROM address and byte for the address/data register.
    pub const fn command(address: u32, byte: u8) -> u32 {
        (address << 8) | byte as u32
    }
}
