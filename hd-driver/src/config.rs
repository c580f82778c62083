use std::time::Duration;

use bitflags::bitflags;
use hd_io::Backend;

use crate::{
    error::{Error, Result},
    registers::{self, generator},
};

#[repr(u8)]
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::FromRepr,
    strum::Display,
    strum::VariantArray,
)]
pub enum SignalSource {
    #[default]
    Internal = 0,
    FrontPanel = 1,
    /// VXS backplane (P0).
    Backplane = 2,
}

impl SignalSource {
    /// Unknown codes fall back to [`SignalSource::Internal`]; the flag says
    /// whether that happened.
    pub fn clamp(raw: u8) -> (Self, bool) {
        match Self::from_repr(raw) {
            Some(source) => (source, false),
            None => (Self::Internal, true),
        }
    }

    pub(crate) fn raw(self) -> u32 {
        self as u32
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalSources {
    pub clock: SignalSource,
    pub trigger: SignalSource,
    pub sync: SignalSource,
}

impl SignalSources {
    pub const fn all(source: SignalSource) -> Self {
        Self {
            clock: source,
            trigger: source,
            sync: source,
        }
    }
}

/// Where the helicity signals come from and where they go.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HelicitySource {
    /// Use the onboard generator instead of an external input.
    pub internal: bool,
    /// External input on copper instead of fiber.
    pub copper_input: bool,
    /// Route the internal generator to the front panel outputs.
    pub internal_to_front_panel: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HelicityInversion {
    pub fiber_input: bool,
    pub copper_input: bool,
    pub output: bool,
}

/// Parameters of the onboard helicity generator.
///
/// `pattern` selects 0 pair, 1 quartet, 2 octet, 3 toggle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GeneratorConfig {
    pub pattern: u8,
    pub window_delay: u8,
    pub settle_time: u16,
    /// 24 bits.
    pub stable_time: u32,
    /// 30-bit LFSR seed.
    pub seed: u32,
}

impl GeneratorConfig {
    pub fn validate(&self) -> Result<()> {
        if !generator::PATTERN.fits(self.pattern as u32) {
            return Err(Error::invalid(format!(
                "helicity pattern {} out of range [0, 3]",
                self.pattern
            )));
        }
        if !generator::STABLE_TIME.fits(self.stable_time) {
            return Err(Error::invalid(format!(
                "stable time 0x{:X} wider than 24 bits",
                self.stable_time
            )));
        }
        if !generator::SEED.fits(self.seed) {
            return Err(Error::invalid(format!(
                "seed 0x{:X} wider than 30 bits",
                self.seed
            )));
        }
        Ok(())
    }

    /// Contents of the three generator config registers.
    pub(crate) fn to_raw(self) -> [u32; 3] {
        let config1 = generator::PATTERN.with(self.pattern as u32)
            | generator::WINDOW_DELAY.with(self.window_delay as u32)
            | generator::SETTLE_TIME.with(self.settle_time as u32);
        [
            config1,
            generator::STABLE_TIME.with(self.stable_time),
            generator::SEED.with(self.seed),
        ]
    }

    pub(crate) fn from_raw([config1, config2, config3]: [u32; 3]) -> Self {
        Self {
            pattern: generator::PATTERN.get(config1) as u8,
            window_delay: generator::WINDOW_DELAY.get(config1) as u8,
            settle_time: generator::SETTLE_TIME.get(config1) as u16,
            stable_time: generator::STABLE_TIME.get(config2),
            seed: generator::SEED.get(config3),
        }
    }
}

/// Processing pipeline delays in 8 ns ticks, each in `[1, 0xFFF]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcDelay {
    pub data_input: u32,
    pub trigger_latency: u32,
}

impl Default for ProcDelay {
    fn default() -> Self {
        Self {
            data_input: 0x100,
            trigger_latency: 0x40,
        }
    }
}

impl ProcDelay {
    pub const MAX: u32 = registers::delay::DATA_INPUT.max();

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("data input", self.data_input),
            ("trigger latency", self.trigger_latency),
        ] {
            if value == 0 || value > Self::MAX {
                return Err(Error::invalid(format!(
                    "{name} delay 0x{value:X} out of range [1, 0x{:X}]",
                    Self::MAX
                )));
            }
        }
        Ok(())
    }
}

bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct InitFlags: u32 {
        /// Stop after the identity checks, leave the board as found.
        const NO_INIT               = 1<<0;
        /// Downgrade a firmware version mismatch to a diagnostic.
        const IGNORE_FIRMWARE_CHECK = 1<<1;
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InitOptions {
    /// 0 scans the slots, below 22 is a slot number, anything else an A24
    /// address.
    pub address: u32,
    pub sources: SignalSources,
    pub helicity: HelicitySource,
    pub flags: InitFlags,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, strum::Display, strum::VariantArray)]
pub enum ResetKind {
    Soft,
    #[default]
    Hard,
    Both,
}

/// How [`ResetKind`] is honored.
///
/// Deployed systems have always seen a hard reset whatever was asked for;
/// [`ResetPolicy::AsRequested`] issues the requested kind instead.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ResetPolicy {
    #[default]
    AlwaysHard,
    AsRequested,
}

impl ResetPolicy {
    pub(crate) fn csr_word(self, kind: ResetKind) -> u32 {
        use registers::csr::{HARD_RESET, SOFT_RESET};
        match (self, kind) {
            (Self::AlwaysHard, _) | (Self::AsRequested, ResetKind::Hard) => HARD_RESET.mask(),
            (Self::AsRequested, ResetKind::Soft) => SOFT_RESET.mask(),
            (Self::AsRequested, ResetKind::Both) => HARD_RESET.mask() | SOFT_RESET.mask(),
        }
    }
}

/// A bounded busy-wait: at most `limit` checks, `interval` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poll {
    pub interval: Duration,
    pub limit: u32,
}

impl Poll {
    /// Bulk erase of the whole EEPROM takes minutes.
    pub const ERASE: Self = Self {
        interval: Duration::from_millis(1),
        limit: 600_000,
    };
    pub const BYTE: Self = Self {
        interval: Duration::ZERO,
        limit: 100_000,
    };
    pub const BLOCK_READY: Self = Self {
        interval: Duration::ZERO,
        limit: 100,
    };

    /// Check `done` until it reports true. `on_poll` sees the running count
    /// of failed checks.
    pub(crate) fn wait<B: Backend + ?Sized>(
        &self,
        bus: &mut B,
        what: &'static str,
        mut done: impl FnMut(&mut B) -> Result<bool>,
        mut on_poll: impl FnMut(u32),
    ) -> Result<()> {
        for polls in 1..=self.limit {
            if done(bus)? {
                return Ok(());
            }
            on_poll(polls);
            if !self.interval.is_zero() {
                bus.delay(self.interval);
            }
        }
        Err(Error::Timeout {
            what,
            polls: self.limit,
        })
    }
}

/// Tuning knobs of a [`crate::HelicityDecoder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub reset_policy: ResetPolicy,
    pub a32_base: u32,
    pub supported_firmware: u32,
    /// Wait after changing signal sources, for the clock to settle.
    pub source_settle: Duration,
    /// Wait between the steps of a generator reconfiguration.
    pub generator_settle: Duration,
    pub erase_poll: Poll,
    pub byte_poll: Poll,
    pub block_ready_poll: Poll,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            reset_policy: ResetPolicy::default(),
            a32_base: registers::DEFAULT_A32_BASE,
            supported_firmware: registers::SUPPORTED_FIRMWARE,
            source_settle: Duration::from_millis(40),
            generator_settle: Duration::from_millis(10),
            erase_poll: Poll::ERASE,
            byte_poll: Poll::BYTE,
            block_ready_poll: Poll::BLOCK_READY,
        }
    }
}
