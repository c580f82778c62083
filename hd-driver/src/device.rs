use std::{
    fmt::{Display, Formatter},
    sync::{Mutex, MutexGuard, PoisonError},
};

use hd_io::{Backend, Hex};
use strum::VariantArray;

use crate::{
    config::{
        GeneratorConfig, HelicityInversion, HelicitySource, InitFlags, InitOptions, ProcDelay,
        ResetKind, Settings, SignalSource, SignalSources,
    },
    error::{Diagnostic, Error, Result},
    registers::{
        self, BOARD_TYPE, Reg, adr32, block_size, confirm, csr, ctrl1, ctrl2, delay, interrupt,
        version,
    },
};

/// First and one-past-last slot searched when no address is given.
const SCAN_SLOTS: std::ops::Range<u32> = 3..21;

/// Identity of an initialized board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Board {
    pub a24: u32,
    pub version: u32,
}

impl Board {
    pub fn board_type(&self) -> u32 {
        version::BOARD_TYPE.get(self.version)
    }

    pub fn revision(&self) -> u32 {
        version::BOARD_REV.get(self.version)
    }

    pub fn firmware(&self) -> u32 {
        version::FIRMWARE.get(self.version)
    }

    /// Slot implied by a geographic A24 address.
    pub fn slot(&self) -> u32 {
        (self.a24 >> 19) & 0x1f
    }
}

struct Inner<B> {
    bus: B,
    board: Option<Board>,
}

/// Handle to one helicity decoder module.
///
/// Every operation takes the handle's lock for its whole register
/// transaction, so a shared `&HelicityDecoder` can be used from several
/// threads.
pub struct HelicityDecoder<B> {
    inner: Mutex<Inner<B>>,
    diagnostics: Mutex<Vec<Diagnostic>>,
    settings: Settings,
}

/// Register access for the duration of one locked transaction.
pub(crate) struct Regs<'a, B: ?Sized> {
    pub(crate) bus: &'a mut B,
    pub(crate) board: &'a Board,
    pub(crate) settings: &'a Settings,
    diagnostics: &'a Mutex<Vec<Diagnostic>>,
}

fn report(diagnostics: &Mutex<Vec<Diagnostic>>, diagnostic: Diagnostic) {
    tracing::warn!("{diagnostic}");
    diagnostics
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(diagnostic);
}

impl<B: Backend + ?Sized> Regs<'_, B> {
    pub(crate) fn read(&mut self, reg: Reg) -> Result<u32> {
        Ok(self.bus.read32(reg.offset())?)
    }

    pub(crate) fn write(&mut self, reg: Reg, value: u32) -> Result<()> {
        tracing::trace!(reg = reg.name(), value = %Hex(value), "write");
        Ok(self.bus.write32(reg.offset(), value)?)
    }

    /// Read-modify-write, returning the value written.
    pub(crate) fn modify(&mut self, reg: Reg, f: impl FnOnce(u32) -> u32) -> Result<u32> {
        let value = f(self.read(reg)?);
        self.write(reg, value)?;
        Ok(value)
    }

    pub(crate) fn report(&self, diagnostic: Diagnostic) {
        report(self.diagnostics, diagnostic)
    }

    fn reset(&mut self, kind: ResetKind) -> Result<()> {
        let word = self.settings.reset_policy.csr_word(kind);
        tracing::debug!(?kind, word = %Hex(word), "reset");
        self.write(Reg::Csr, word)
    }

    fn set_a32(&mut self, a32: u32) -> Result<()> {
        if a32 == 0 || a32 % adr32::ALIGN != 0 {
            return Err(Error::invalid(format!(
                "A32 base 0x{a32:08X} must be a non-zero multiple of 0x{:X}",
                adr32::ALIGN
            )));
        }
        let wreg = adr32::BASE.with(a32 / adr32::ALIGN) | adr32::ENABLE.mask();
        self.write(Reg::Adr32, 0)?;
        self.write(Reg::Adr32, wreg)?;
        self.bus.map_a32(a32)?;
        Ok(())
    }

    fn a32(&mut self) -> Result<Option<u32>> {
        let reg = self.read(Reg::Adr32)?;
        Ok(adr32::ENABLE
            .is_set(reg)
            .then(|| adr32::BASE.get(reg) * adr32::ALIGN))
    }

    fn set_signal_sources(&mut self, sources: SignalSources) -> Result<()> {
        let mut wreg = ctrl1::CLK_SRC.with(sources.clock.raw())
            | ctrl1::TRIG_SRC.with(sources.trigger.raw())
            | ctrl1::SYNC_RESET_SRC.with(sources.sync.raw());
        if sources.clock == SignalSource::Internal {
            wreg |= ctrl1::INT_CLK_ENABLE.mask();
        }
        self.modify(Reg::Ctrl1, |v| (v & !ctrl1::SOURCES) | wreg)?;
        self.bus.delay(self.settings.source_settle);
        Ok(())
    }

    fn signal_sources(&mut self) -> Result<SignalSources> {
        let reg = self.read(Reg::Ctrl1)?;
        let field = |f: hd_io::Field| SignalSource::clamp(f.get(reg) as u8).0;
        Ok(SignalSources {
            clock: field(ctrl1::CLK_SRC),
            trigger: field(ctrl1::TRIG_SRC),
            sync: field(ctrl1::SYNC_RESET_SRC),
        })
    }

    fn set_helicity_source(&mut self, source: HelicitySource) -> Result<()> {
        let wreg = ctrl1::USE_INT_HELICITY.flag(0, source.internal)
            | ctrl1::USE_EXT_CU_IN.flag(0, source.copper_input)
            | ctrl1::INT_HELICITY_TO_FP.flag(0, source.internal_to_front_panel);
        self.modify(Reg::Ctrl1, |v| (v & !ctrl1::HEL_SRC.mask()) | wreg)?;
        Ok(())
    }

    fn set_blocklevel(&mut self, level: u32) -> Result<()> {
        if level == 0 || !block_size::BLOCKLEVEL.fits(level) {
            return Err(Error::invalid(format!(
                "block level {level} out of range [1, 255]"
            )));
        }
        self.modify(Reg::BlockSize, |v| block_size::BLOCKLEVEL.set(v, level))?;
        Ok(())
    }

    fn set_proc_delay(&mut self, delays: ProcDelay) -> Result<()> {
        delays.validate()?;
        self.modify(Reg::Delay, |v| {
            let v = delay::DATA_INPUT.set(v, delays.data_input);
            delay::TRIGGER_LATENCY.set(v, delays.trigger_latency)
        })?;
        Ok(())
    }

    pub(crate) fn set_berr(&mut self, enable: bool) -> Result<()> {
        self.modify(Reg::Ctrl1, |v| ctrl1::BERR_ENABLE.flag(v, enable))?;
        Ok(())
    }

    pub(crate) fn berr(&mut self) -> Result<bool> {
        Ok(ctrl1::BERR_ENABLE.is_set(self.read(Reg::Ctrl1)?))
    }

    fn configure_generator(&mut self, config: GeneratorConfig) -> Result<()> {
        config.validate()?;
        let settle = self.settings.generator_settle;
        let ctrl = self.read(Reg::Ctrl2)?;
        let armed = ctrl2::GENERATOR_ENABLE.is_set(ctrl);
        if armed {
            self.write(Reg::Ctrl2, ctrl2::GENERATOR_ENABLE.flag(ctrl, false))?;
            self.bus.delay(settle);
        }
        let [config1, config2, config3] = config.to_raw();
        for (reg, value) in [
            (Reg::GeneratorConfig1, config1),
            (Reg::GeneratorConfig2, config2),
            (Reg::GeneratorConfig3, config3),
        ] {
            self.write(reg, value)?;
            self.bus.delay(settle);
        }
        if armed {
            self.write(Reg::Ctrl2, ctrl)?;
        }
        Ok(())
    }
}

/// Probe every candidate slot, returning the A24 address of the first
/// helicity decoder.
fn find<B: Backend + ?Sized>(bus: &mut B) -> Result<u32> {
    for slot in SCAN_SLOTS {
        let a24 = slot << 19;
        bus.map_a24(a24)?;
        let Some(version) = bus.probe32(Reg::Version.offset())? else {
            continue;
        };
        if version::BOARD_TYPE.get(version) == BOARD_TYPE {
            tracing::info!(slot, a24 = %Hex(a24), "found helicity decoder");
            return Ok(a24);
        }
        tracing::debug!(slot, version = %Hex(version), "skipping board");
    }
    Err(Error::NotFound)
}

impl<B: Backend> HelicityDecoder<B> {
    pub fn new(bus: B) -> Self {
        Self::with_settings(bus, Settings::default())
    }

    pub fn with_settings(bus: B, settings: Settings) -> Self {
        Self {
            inner: Mutex::new(Inner { bus, board: None }),
            diagnostics: Mutex::new(Vec::new()),
            settings,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn lock(&self) -> MutexGuard<'_, Inner<B>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with exclusive register access, failing if the board was never
    /// initialized.
    pub(crate) fn with_regs<T>(&self, f: impl FnOnce(&mut Regs<'_, B>) -> Result<T>) -> Result<T> {
        let mut inner = self.lock();
        let Inner { bus, board } = &mut *inner;
        let Some(board) = board.as_ref() else {
            return Err(Error::NotInitialized);
        };
        f(&mut Regs {
            bus,
            board,
            settings: &self.settings,
            diagnostics: &self.diagnostics,
        })
    }

    pub fn board(&self) -> Option<Board> {
        self.lock().board
    }

    pub fn is_initialized(&self) -> bool {
        self.board().is_some()
    }

    /// Diagnostics recorded since the last call.
    pub fn take_diagnostics(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut *self.diagnostics.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Scan slots 3 through 20 for a helicity decoder.
    pub fn find(&self) -> Result<u32> {
        let mut inner = self.lock();
        let found = find(&mut inner.bus);
        if let Some(board) = inner.board {
            inner.bus.map_a24(board.a24)?;
        }
        found
    }

    /// Locate, identify and (unless [`InitFlags::NO_INIT`]) configure the
    /// board. Any failure leaves the handle uninitialized.
    pub fn initialize(&self, options: InitOptions) -> Result<Board> {
        let mut inner = self.lock();
        inner.board = None;

        let a24 = match options.address {
            0 => find(&mut inner.bus)?,
            slot @ 1..22 => {
                tracing::info!(slot, a24 = %Hex(slot << 19), "using slot number");
                slot << 19
            }
            a24 if a24 > 0xff_ffff => {
                return Err(Error::invalid(format!("invalid A24 address 0x{a24:X}")));
            }
            a24 => a24,
        };

        inner.bus.map_a24(a24)?;
        let Some(version) = inner.bus.probe32(Reg::Version.offset())? else {
            return Err(Error::NotPresent { a24 });
        };
        let board = Board { a24, version };
        if board.board_type() != BOARD_TYPE {
            return Err(Error::WrongDevice {
                a24,
                board_type: board.board_type(),
            });
        }
        tracing::info!(
            a24 = %Hex(a24),
            revision = board.revision(),
            firmware = board.firmware(),
            "helicity decoder"
        );

        let supported = self.settings.supported_firmware;
        if board.firmware() != supported {
            if options.flags.contains(InitFlags::IGNORE_FIRMWARE_CHECK) {
                report(
                    &self.diagnostics,
                    Diagnostic::FirmwareIgnored {
                        found: board.firmware(),
                        supported,
                    },
                );
            } else {
                return Err(Error::UnsupportedFirmware {
                    found: board.firmware(),
                    supported,
                });
            }
        }

        if !options.flags.contains(InitFlags::NO_INIT) {
            let mut regs = Regs {
                bus: &mut inner.bus,
                board: &board,
                settings: &self.settings,
                diagnostics: &self.diagnostics,
            };
            regs.reset(ResetKind::Hard)?;
            regs.set_a32(self.settings.a32_base)?;
            regs.set_signal_sources(options.sources)?;
            regs.set_helicity_source(options.helicity)?;
            regs.set_blocklevel(1)?;
            regs.set_proc_delay(ProcDelay::default())?;
            regs.set_berr(true)?;
        }

        inner.board = Some(board);
        Ok(board)
    }

    pub fn reset(&self, kind: ResetKind) -> Result<()> {
        self.with_regs(|r| r.reset(kind))
    }

    pub fn set_a32(&self, a32: u32) -> Result<()> {
        self.with_regs(|r| r.set_a32(a32))
    }

    /// Programmed A32 base, `None` while the data window is disabled.
    pub fn a32(&self) -> Result<Option<u32>> {
        self.with_regs(|r| r.a32())
    }

    pub fn set_signal_sources(&self, sources: SignalSources) -> Result<()> {
        self.with_regs(|r| r.set_signal_sources(sources))
    }

    /// Like [`Self::set_signal_sources`] from raw source codes. Unknown codes
    /// are set to internal and reported as a diagnostic.
    pub fn set_signal_sources_raw(
        &self,
        clock: u8,
        trigger: u8,
        sync: u8,
    ) -> Result<SignalSources> {
        self.with_regs(|r| {
            let clamp = |signal: &'static str, raw: u8| {
                let (source, clamped) = SignalSource::clamp(raw);
                if clamped {
                    r.report(Diagnostic::SourceClamped {
                        signal,
                        requested: raw,
                    });
                }
                source
            };
            let sources = SignalSources {
                clock: clamp("clock", clock),
                trigger: clamp("trigger", trigger),
                sync: clamp("sync reset", sync),
            };
            r.set_signal_sources(sources)?;
            Ok(sources)
        })
    }

    pub fn signal_sources(&self) -> Result<SignalSources> {
        self.with_regs(|r| r.signal_sources())
    }

    pub fn set_helicity_source(&self, source: HelicitySource) -> Result<()> {
        self.with_regs(|r| r.set_helicity_source(source))
    }

    pub fn helicity_source(&self) -> Result<HelicitySource> {
        let reg = self.with_regs(|r| r.read(Reg::Ctrl1))?;
        Ok(HelicitySource {
            internal: ctrl1::USE_INT_HELICITY.is_set(reg),
            copper_input: ctrl1::USE_EXT_CU_IN.is_set(reg),
            internal_to_front_panel: ctrl1::INT_HELICITY_TO_FP.is_set(reg),
        })
    }

    pub fn set_helicity_inversion(&self, inversion: HelicityInversion) -> Result<()> {
        let wreg = ctrl1::INVERT_FIBER_IN.flag(0, inversion.fiber_input)
            | ctrl1::INVERT_CU_IN.flag(0, inversion.copper_input)
            | ctrl1::INVERT_OUTPUT.flag(0, inversion.output);
        self.with_regs(|r| {
            r.modify(Reg::Ctrl1, |v| (v & !ctrl1::INVERT.mask()) | wreg)?;
            Ok(())
        })
    }

    pub fn helicity_inversion(&self) -> Result<HelicityInversion> {
        let reg = self.with_regs(|r| r.read(Reg::Ctrl1))?;
        Ok(HelicityInversion {
            fiber_input: ctrl1::INVERT_FIBER_IN.is_set(reg),
            copper_input: ctrl1::INVERT_CU_IN.is_set(reg),
            output: ctrl1::INVERT_OUTPUT.is_set(reg),
        })
    }

    pub fn set_proc_delay(&self, delays: ProcDelay) -> Result<()> {
        delays.validate()?;
        self.with_regs(|r| r.set_proc_delay(delays))
    }

    pub fn proc_delay(&self) -> Result<ProcDelay> {
        let reg = self.with_regs(|r| r.read(Reg::Delay))?;
        Ok(ProcDelay {
            data_input: delay::DATA_INPUT.get(reg),
            trigger_latency: delay::TRIGGER_LATENCY.get(reg),
        })
    }

    /// Compare the programmed delays with the ones implied by the circular
    /// buffer pointers. A mismatch is reported, never corrected.
    pub fn confirm_proc_delay(&self) -> Result<DelayConfirmation> {
        self.with_regs(|r| {
            let programmed = r.read(Reg::Delay)?;
            let measure = |reg: u32| {
                let write = confirm::WRITE_ADDR.get(reg);
                let read = confirm::READ_ADDR.get(reg);
                write.wrapping_sub(read) & confirm::WRITE_ADDR.max()
            };
            let confirmation = DelayConfirmation {
                programmed: ProcDelay {
                    data_input: delay::DATA_INPUT.get(programmed),
                    trigger_latency: delay::TRIGGER_LATENCY.get(programmed),
                },
                measured: ProcDelay {
                    data_input: measure(r.read(Reg::DelayConfirm)?),
                    trigger_latency: measure(r.read(Reg::LatencyConfirm)?),
                },
            };
            let DelayConfirmation {
                programmed,
                measured,
            } = confirmation;
            for (delay, programmed, measured) in [
                ("data input", programmed.data_input, measured.data_input),
                (
                    "trigger latency",
                    programmed.trigger_latency,
                    measured.trigger_latency,
                ),
            ] {
                if programmed != measured {
                    r.report(Diagnostic::DelayMismatch {
                        delay,
                        programmed,
                        measured,
                    });
                }
            }
            Ok(confirmation)
        })
    }

    /// Events per block, `[1, 255]`.
    pub fn set_blocklevel(&self, level: u32) -> Result<()> {
        self.with_regs(|r| r.set_blocklevel(level))
    }

    pub fn blocklevel(&self) -> Result<u32> {
        let reg = self.with_regs(|r| r.read(Reg::BlockSize))?;
        Ok(block_size::BLOCKLEVEL.get(reg))
    }

    pub fn set_berr(&self, enable: bool) -> Result<()> {
        self.with_regs(|r| r.set_berr(enable))
    }

    pub fn berr(&self) -> Result<bool> {
        self.with_regs(|r| r.berr())
    }

    fn modify_ctrl2(&self, f: impl FnOnce(u32) -> u32) -> Result<()> {
        self.with_regs(|r| {
            r.modify(Reg::Ctrl2, f)?;
            Ok(())
        })
    }

    /// Enable the decoder and event building.
    pub fn enable(&self) -> Result<()> {
        self.modify_ctrl2(|v| {
            ctrl2::DECODER_ENABLE.flag(ctrl2::EVENT_BUILD_ENABLE.flag(v, true), true)
        })
    }

    /// Enable the decoder without building events.
    pub fn enable_decoder_only(&self) -> Result<()> {
        self.modify_ctrl2(|v| {
            ctrl2::DECODER_ENABLE.flag(ctrl2::EVENT_BUILD_ENABLE.flag(v, false), true)
        })
    }

    pub fn disable(&self) -> Result<()> {
        self.modify_ctrl2(|v| {
            ctrl2::DECODER_ENABLE.flag(ctrl2::EVENT_BUILD_ENABLE.flag(v, false), false)
        })
    }

    pub fn trig1(&self) -> Result<()> {
        self.with_regs(|r| r.write(Reg::Csr, csr::TRIG1.mask()))
    }

    pub fn trig2(&self) -> Result<()> {
        self.with_regs(|r| r.write(Reg::Csr, csr::TRIG2.mask()))
    }

    pub fn sync(&self) -> Result<()> {
        self.with_regs(|r| r.write(Reg::Csr, csr::SYNC_RESET.mask()))
    }

    /// Force the busy output on or off.
    pub fn busy(&self, force: bool) -> Result<()> {
        self.modify_ctrl2(|v| ctrl2::FORCE_BUSY.flag(v, force))
    }

    pub fn busy_status(&self) -> Result<BusyStatus> {
        let reg = self.with_regs(|r| r.read(Reg::Csr))?;
        Ok(BusyStatus {
            current: csr::BUSY.is_set(reg),
            latched: csr::BUSY_LATCHED.is_set(reg),
        })
    }

    /// Reprogram the helicity generator. An armed generator is disabled
    /// first and re-armed once all three registers are written.
    pub fn configure_generator(&self, config: GeneratorConfig) -> Result<()> {
        config.validate()?;
        self.with_regs(|r| r.configure_generator(config))
    }

    pub fn generator_config(&self) -> Result<GeneratorConfig> {
        let raw = self.with_regs(|r| {
            Ok([
                r.read(Reg::GeneratorConfig1)?,
                r.read(Reg::GeneratorConfig2)?,
                r.read(Reg::GeneratorConfig3)?,
            ])
        })?;
        Ok(GeneratorConfig::from_raw(raw))
    }

    pub fn enable_generator(&self) -> Result<()> {
        self.modify_ctrl2(|v| ctrl2::GENERATOR_ENABLE.flag(v, true))
    }

    pub fn disable_generator(&self) -> Result<()> {
        self.modify_ctrl2(|v| ctrl2::GENERATOR_ENABLE.flag(v, false))
    }

    pub fn firmware_version(&self) -> Result<u32> {
        let reg = self.with_regs(|r| r.read(Reg::Version))?;
        Ok(version::FIRMWARE.get(reg))
    }

    /// Geographic slot reported by the backplane.
    pub fn slot_number(&self) -> Result<u32> {
        let reg = self.with_regs(|r| r.read(Reg::Interrupt))?;
        Ok(interrupt::GEO_SLOT.get(reg))
    }

    pub fn clock_pll_status(&self) -> Result<PllStatus> {
        let reg = self.with_regs(|r| r.read(Reg::Csr))?;
        Ok(PllStatus {
            system_locked: csr::SYSTEM_PLL_LOCKED.is_set(reg),
            local_locked: csr::LOCAL_PLL_LOCKED.is_set(reg),
        })
    }

    pub fn block_ready(&self) -> Result<bool> {
        let reg = self.with_regs(|r| r.read(Reg::Csr))?;
        Ok(csr::BLOCK_READY.is_set(reg))
    }

    /// Poll for a complete block, giving up after the configured number of
    /// checks.
    pub fn wait_block_ready(&self) -> Result<()> {
        self.with_regs(|r| {
            r.settings.block_ready_poll.wait(
                r.bus,
                "block ready",
                |bus| Ok(csr::BLOCK_READY.is_set(bus.read32(Reg::Csr.offset())?)),
                |_| {},
            )
        })
    }

    pub fn scalers(&self) -> Result<Scalers> {
        self.with_regs(|r| {
            Ok(Scalers {
                trig1: r.read(Reg::Trig1Scaler)?,
                trig2: r.read(Reg::Trig2Scaler)?,
                sync_reset: r.read(Reg::SyncResetScaler)?,
                events_on_board: r.read(Reg::EventsOnBoard)?,
                blocks_on_board: r.read(Reg::BlocksOnBoard)?,
                helicity: [
                    r.read(Reg::TstableRisingScaler)?,
                    r.read(Reg::TstableFallingScaler)?,
                    r.read(Reg::PatternSyncScaler)?,
                    r.read(Reg::PairSyncScaler)?,
                ],
                clock_125: r.read(Reg::Clock125Test)?,
            })
        })
    }

    /// Snapshot of every register, read under one lock.
    pub fn status(&self) -> Result<Status> {
        self.with_regs(|r| {
            let regs = Reg::VARIANTS
                .iter()
                .map(|&reg| Ok((reg, r.read(reg)?)))
                .collect::<Result<Vec<_>>>()?;
            Ok(Status {
                board: *r.board,
                regs,
            })
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayConfirmation {
    pub programmed: ProcDelay,
    pub measured: ProcDelay,
}

impl DelayConfirmation {
    pub fn matches(&self) -> bool {
        self.programmed == self.measured
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusyStatus {
    pub current: bool,
    pub latched: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PllStatus {
    pub system_locked: bool,
    pub local_locked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scalers {
    pub trig1: u32,
    pub trig2: u32,
    pub sync_reset: u32,
    pub events_on_board: u32,
    pub blocks_on_board: u32,
    /// Tstable rising, tstable falling, pattern sync, pair sync.
    pub helicity: [u32; 4],
    pub clock_125: u32,
}

impl Display for Scalers {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "  trig1        {:>10}", self.trig1)?;
        writeln!(f, "  trig2        {:>10}", self.trig2)?;
        writeln!(f, "  syncreset    {:>10}", self.sync_reset)?;
        writeln!(f, "  events       {:>10}", self.events_on_board)?;
        writeln!(f, "  blocks       {:>10}", self.blocks_on_board)?;
        let [rising, falling, pattern, pair] = self.helicity;
        writeln!(f, "  tstable rise {rising:>10}")?;
        writeln!(f, "  tstable fall {falling:>10}")?;
        writeln!(f, "  pattern sync {pattern:>10}")?;
        writeln!(f, "  pair sync    {pair:>10}")?;
        write!(f, "  clock 125    {:>10}", self.clock_125)
    }
}

pub struct Status {
    pub board: Board,
    pub regs: Vec<(Reg, u32)>,
}

impl Status {
    pub fn get(&self, reg: Reg) -> u32 {
        self.regs
            .iter()
            .find(|(r, _)| *r == reg)
            .map_or(0, |(_, v)| *v)
    }

    /// Every register with its offset and raw value.
    pub fn raw(&self) -> impl Display + '_ {
        struct Raw<'a>(&'a Status);
        impl Display for Raw<'_> {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                for (reg, value) in &self.0.regs {
                    writeln!(
                        f,
                        "  {:>24} (0x{:02X}) = 0x{}",
                        reg.name(),
                        reg.offset(),
                        Hex(*value)
                    )?;
                }
                Ok(())
            }
        }
        Raw(self)
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let on_off = |b: bool| if b { "enabled" } else { "disabled" };
        let ctrl1 = self.get(Reg::Ctrl1);
        let ctrl2 = self.get(Reg::Ctrl2);
        let csr = self.get(Reg::Csr);
        let source = |field: hd_io::Field| SignalSource::clamp(field.get(ctrl1) as u8).0;

        writeln!(f, "Helicity Decoder status")?;
        writeln!(
            f,
            "  A24 0x{:06X}  slot {}  revision 0x{:02X}  firmware 0x{:02X}",
            self.board.a24,
            self.board.slot(),
            self.board.revision(),
            self.board.firmware()
        )?;
        let adr = self.get(Reg::Adr32);
        if registers::adr32::ENABLE.is_set(adr) {
            writeln!(
                f,
                "  A32 data window 0x{}",
                Hex(registers::adr32::BASE.get(adr) * registers::adr32::ALIGN)
            )?;
        } else {
            writeln!(f, "  A32 data window disabled")?;
        }
        writeln!(
            f,
            "  clock {}  trigger {}  sync reset {}",
            source(ctrl1::CLK_SRC),
            source(ctrl1::TRIG_SRC),
            source(ctrl1::SYNC_RESET_SRC)
        )?;
        writeln!(
            f,
            "  helicity {}, input {}, front panel shows {}",
            if ctrl1::USE_INT_HELICITY.is_set(ctrl1) { "internal" } else { "external" },
            if ctrl1::USE_EXT_CU_IN.is_set(ctrl1) { "copper" } else { "fiber" },
            if ctrl1::INT_HELICITY_TO_FP.is_set(ctrl1) { "internal" } else { "external" },
        )?;
        writeln!(
            f,
            "  decoder {}  event build {}  generator {}  BERR {}",
            on_off(ctrl2::DECODER_ENABLE.is_set(ctrl2)),
            on_off(ctrl2::EVENT_BUILD_ENABLE.is_set(ctrl2)),
            on_off(ctrl2::GENERATOR_ENABLE.is_set(ctrl2)),
            on_off(ctrl1::BERR_ENABLE.is_set(ctrl1)),
        )?;
        let delays = self.get(Reg::Delay);
        writeln!(
            f,
            "  block level {}  data input delay 0x{:03X}  trigger latency 0x{:03X}",
            block_size::BLOCKLEVEL.get(self.get(Reg::BlockSize)),
            delay::DATA_INPUT.get(delays),
            delay::TRIGGER_LATENCY.get(delays)
        )?;
        writeln!(
            f,
            "  busy {}{}  block ready {}  PLL system {} local {}",
            csr::BUSY.is_set(csr),
            if csr::BUSY_LATCHED.is_set(csr) { " (latched)" } else { "" },
            csr::BLOCK_READY.is_set(csr),
            if csr::SYSTEM_PLL_LOCKED.is_set(csr) { "locked" } else { "unlocked" },
            if csr::LOCAL_PLL_LOCKED.is_set(csr) { "locked" } else { "unlocked" },
        )?;
        write!(
            f,
            "  events on board {}  blocks on board {}",
            self.get(Reg::EventsOnBoard),
            self.get(Reg::BlocksOnBoard)
        )
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use hd_io::{FakeBackend, fake_backend::Op};

    use super::*;
    use crate::testing::{A24, VERSION, initialized};

    #[test]
    fn test_uninitialized_fails_fast() {
        let hd = HelicityDecoder::new(FakeBackend::new(A24));
        assert!(matches!(hd.enable(), Err(Error::NotInitialized)));
        assert!(matches!(hd.signal_sources(), Err(Error::NotInitialized)));
        assert!(matches!(hd.status(), Err(Error::NotInitialized)));
    }

    #[test]
    fn test_init_by_slot() {
        let (hd, fake) = initialized();
        let board = hd.board().unwrap();
        assert_eq!(board.a24, A24);
        assert_eq!(board.slot(), 5);
        assert_eq!(fake.a32(), Some(registers::DEFAULT_A32_BASE));
        // hard reset first, then the A32 window
        let writes = fake.writes();
        assert_eq!(writes[0], (Reg::Csr.offset(), csr::HARD_RESET.mask()));
        assert_eq!(writes[1], (Reg::Adr32.offset(), 0));
        assert_eq!(writes[2], (Reg::Adr32.offset(), 0x0901));
        assert_eq!(hd.blocklevel().unwrap(), 1);
        assert_eq!(hd.proc_delay().unwrap(), ProcDelay::default());
        assert!(hd.berr().unwrap());
        assert_eq!(hd.signal_sources().unwrap(), SignalSources::default());
    }

    #[test]
    fn test_init_scans_slots() {
        let fake = FakeBackend::new(9 << 19);
        fake.set(Reg::Version.offset(), VERSION);
        let hd = HelicityDecoder::new(fake.clone());
        let board = hd.initialize(InitOptions::default()).unwrap();
        assert_eq!(board.a24, 9 << 19);
        let probed: Vec<u32> = fake
            .ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::MapA24(a24) => Some(a24 >> 19),
                _ => None,
            })
            .collect();
        // slots 3..=9 scanned, then the found board remapped
        assert_eq!(probed, [3, 4, 5, 6, 7, 8, 9, 9]);
    }

    #[test]
    fn test_init_scan_finds_nothing() {
        let fake = FakeBackend::new(21 << 19);
        fake.set(Reg::Version.offset(), VERSION);
        let hd = HelicityDecoder::new(fake);
        assert!(matches!(
            hd.initialize(InitOptions::default()),
            Err(Error::NotFound)
        ));
        assert!(!hd.is_initialized());
    }

    #[test]
    fn test_init_identity_failures() {
        let fake = FakeBackend::new(A24);
        fake.set(Reg::Version.offset(), 0x1234_0103);
        let hd = HelicityDecoder::new(fake.clone());

        let at = |address| InitOptions {
            address,
            ..Default::default()
        };
        assert!(matches!(
            hd.initialize(at(6)),
            Err(Error::NotPresent { a24 }) if a24 == 6 << 19
        ));
        assert!(matches!(
            hd.initialize(at(A24)),
            Err(Error::WrongDevice { board_type: 0x1234, .. })
        ));
        assert!(matches!(
            hd.initialize(at(0x100_0000)),
            Err(Error::InvalidArgument(_))
        ));
        assert!(!hd.is_initialized());
        assert!(fake.writes().is_empty());
    }

    #[test]
    fn test_firmware_check() {
        let fake = FakeBackend::new(A24);
        fake.set(Reg::Version.offset(), 0x4844_0107);
        let hd = HelicityDecoder::new(fake.clone());
        let mut options = InitOptions {
            address: 5,
            ..Default::default()
        };
        assert!(matches!(
            hd.initialize(options),
            Err(Error::UnsupportedFirmware { found: 7, supported: 3 })
        ));
        assert!(!hd.is_initialized());

        options.flags = InitFlags::IGNORE_FIRMWARE_CHECK | InitFlags::NO_INIT;
        hd.initialize(options).unwrap();
        assert_eq!(
            hd.take_diagnostics(),
            [Diagnostic::FirmwareIgnored {
                found: 7,
                supported: 3
            }]
        );
        // NO_INIT leaves the board untouched
        assert!(fake.writes().is_empty());
        assert_eq!(hd.firmware_version().unwrap(), 7);
    }

    #[test]
    fn test_signal_sources_clamp() {
        let (hd, fake) = initialized();
        fake.set(Reg::Ctrl1.offset(), 0xFFFF_FFFF);
        let sources = hd.set_signal_sources_raw(1, 7, 2).unwrap();
        assert_eq!(
            sources,
            SignalSources {
                clock: SignalSource::FrontPanel,
                trigger: SignalSource::Internal,
                sync: SignalSource::Backplane,
            }
        );
        assert_eq!(hd.signal_sources().unwrap(), sources);
        assert_eq!(
            hd.take_diagnostics(),
            [Diagnostic::SourceClamped {
                signal: "trigger",
                requested: 7
            }]
        );
        let ctrl = fake.get(Reg::Ctrl1.offset());
        // bits outside the source fields are preserved
        assert_eq!(ctrl | ctrl1::SOURCES, 0xFFFF_FFFF);
        assert!(!ctrl1::INT_CLK_ENABLE.is_set(ctrl));
        assert!(fake.ops().contains(&Op::Delay(Duration::from_millis(40))));

        for raw in [3, 4, 200, u8::MAX] {
            let stored = hd.set_signal_sources_raw(raw, raw, raw).unwrap();
            assert_eq!(stored, SignalSources::all(SignalSource::Internal));
            assert_eq!(hd.signal_sources().unwrap(), stored);
            assert!(ctrl1::INT_CLK_ENABLE.is_set(fake.get(Reg::Ctrl1.offset())));
        }
    }

    #[test]
    fn test_helicity_source_and_inversion() {
        let (hd, fake) = initialized();
        let source = HelicitySource {
            internal: false,
            copper_input: true,
            internal_to_front_panel: true,
        };
        hd.set_helicity_source(source).unwrap();
        assert_eq!(hd.helicity_source().unwrap(), source);
        let inversion = HelicityInversion {
            fiber_input: true,
            copper_input: false,
            output: true,
        };
        hd.set_helicity_inversion(inversion).unwrap();
        assert_eq!(hd.helicity_inversion().unwrap(), inversion);
        assert_eq!(hd.helicity_source().unwrap(), source);
        assert!(hd.berr().unwrap());
        let ctrl = fake.get(Reg::Ctrl1.offset());
        assert_eq!(ctrl & ctrl1::HEL_SRC.mask(), 0x600);
    }

    #[test]
    fn test_generator_invalid_writes_nothing() {
        let (hd, fake) = initialized();
        fake.clear_ops();
        for pattern in 4..=u8::MAX {
            let config = GeneratorConfig {
                pattern,
                ..Default::default()
            };
            assert!(matches!(
                hd.configure_generator(config),
                Err(Error::InvalidArgument(_))
            ));
        }
        assert!(fake.ops().is_empty());
    }

    #[test]
    fn test_generator_rearm_sequence() {
        let (hd, fake) = initialized();
        let config = GeneratorConfig {
            pattern: 2,
            window_delay: 0,
            settle_time: 0x40,
            stable_time: 0x80,
            seed: 0x2BCD_EF01,
        };

        // not armed: only the config registers
        fake.clear_ops();
        hd.configure_generator(config).unwrap();
        assert!(fake.writes_to(Reg::Ctrl2.offset()).is_empty());
        assert_eq!(hd.generator_config().unwrap(), config);

        hd.enable_generator().unwrap();
        fake.clear_ops();
        hd.configure_generator(config).unwrap();
        let settle = Op::Delay(Duration::from_millis(10));
        let enabled = ctrl2::GENERATOR_ENABLE.mask();
        let [c1, c2, c3] = config.to_raw();
        assert_eq!(
            fake.ops(),
            [
                Op::Write(Reg::Ctrl2.offset(), 0),
                settle,
                Op::Write(Reg::GeneratorConfig1.offset(), c1),
                settle,
                Op::Write(Reg::GeneratorConfig2.offset(), c2),
                settle,
                Op::Write(Reg::GeneratorConfig3.offset(), c3),
                settle,
                Op::Write(Reg::Ctrl2.offset(), enabled),
            ]
        );
    }

    #[test]
    fn test_proc_delay() {
        let (hd, fake) = initialized();
        fake.clear_ops();
        for (data_input, trigger_latency) in [(0, 0x40), (0x1000, 0x40), (0x100, 0)] {
            let delay = ProcDelay {
                data_input,
                trigger_latency,
            };
            assert!(matches!(
                hd.set_proc_delay(delay),
                Err(Error::InvalidArgument(_))
            ));
        }
        assert!(fake.writes().is_empty());

        let delay = ProcDelay {
            data_input: 0x123,
            trigger_latency: 0x456,
        };
        hd.set_proc_delay(delay).unwrap();
        assert_eq!(fake.get(Reg::Delay.offset()), 0x0456_0123);
        assert_eq!(hd.proc_delay().unwrap(), delay);
    }

    #[test]
    fn test_confirm_proc_delay() {
        let (hd, fake) = initialized();
        // data input: write 0x020, read 0xF20 -> 0x100 after wrapping
        fake.set(Reg::DelayConfirm.offset(), 0x0F20_0020);
        // trigger latency: write 0x050, read 0x000 -> 0x050, programmed 0x040
        fake.set(Reg::LatencyConfirm.offset(), 0x0000_0050);
        let confirmation = hd.confirm_proc_delay().unwrap();
        assert_eq!(confirmation.measured.data_input, 0x100);
        assert_eq!(confirmation.measured.trigger_latency, 0x50);
        assert!(!confirmation.matches());
        assert_eq!(
            hd.take_diagnostics(),
            [Diagnostic::DelayMismatch {
                delay: "trigger latency",
                programmed: 0x40,
                measured: 0x50
            }]
        );
        // reported, not corrected
        assert_eq!(hd.proc_delay().unwrap(), ProcDelay::default());
    }

    #[test]
    fn test_blocklevel_and_enables() {
        let (hd, fake) = initialized();
        assert!(matches!(hd.set_blocklevel(0), Err(Error::InvalidArgument(_))));
        assert!(matches!(hd.set_blocklevel(256), Err(Error::InvalidArgument(_))));
        hd.set_blocklevel(255).unwrap();
        assert_eq!(hd.blocklevel().unwrap(), 255);

        hd.enable().unwrap();
        assert_eq!(fake.get(Reg::Ctrl2.offset()), 0b011);
        hd.enable_decoder_only().unwrap();
        assert_eq!(fake.get(Reg::Ctrl2.offset()), 0b001);
        hd.busy(true).unwrap();
        hd.disable().unwrap();
        assert_eq!(fake.get(Reg::Ctrl2.offset()), 0b1000);
        hd.busy(false).unwrap();
        assert_eq!(fake.get(Reg::Ctrl2.offset()), 0);
    }

    #[test]
    fn test_pulses_and_status_bits() {
        let (hd, fake) = initialized();
        fake.clear_ops();
        hd.trig1().unwrap();
        hd.trig2().unwrap();
        hd.sync().unwrap();
        assert_eq!(
            fake.writes_to(Reg::Csr.offset()),
            [1 << 29, 1 << 27, 1 << 28]
        );

        fake.set(Reg::Csr.offset(), 0b10101);
        assert_eq!(
            hd.busy_status().unwrap(),
            BusyStatus {
                current: false,
                latched: true
            }
        );
        assert_eq!(
            hd.clock_pll_status().unwrap(),
            PllStatus {
                system_locked: false,
                local_locked: true
            }
        );
        assert!(hd.block_ready().unwrap());
        hd.wait_block_ready().unwrap();

        fake.set(Reg::Csr.offset(), 0);
        assert!(matches!(
            hd.wait_block_ready(),
            Err(Error::Timeout { polls: 100, .. })
        ));
    }

    #[test]
    fn test_reset_policy() {
        let (hd, fake) = initialized();
        fake.clear_ops();
        hd.reset(ResetKind::Soft).unwrap();
        assert_eq!(fake.writes(), [(Reg::Csr.offset(), csr::HARD_RESET.mask())]);

        let settings = Settings {
            reset_policy: crate::ResetPolicy::AsRequested,
            ..Default::default()
        };
        let fake = FakeBackend::new(A24);
        fake.set(Reg::Version.offset(), VERSION);
        let hd = HelicityDecoder::with_settings(fake.clone(), settings);
        hd.initialize(InitOptions {
            address: A24,
            flags: InitFlags::NO_INIT,
            ..Default::default()
        })
        .unwrap();
        hd.reset(ResetKind::Soft).unwrap();
        assert_eq!(fake.writes(), [(Reg::Csr.offset(), csr::SOFT_RESET.mask())]);
    }

    #[test]
    fn test_a32() {
        let (hd, fake) = initialized();
        assert_eq!(hd.a32().unwrap(), Some(registers::DEFAULT_A32_BASE));
        assert!(matches!(hd.set_a32(0x0910_0000), Err(Error::InvalidArgument(_))));
        assert!(matches!(hd.set_a32(0), Err(Error::InvalidArgument(_))));
        hd.set_a32(0x0880_0000).unwrap();
        assert_eq!(fake.a32(), Some(0x0880_0000));
        assert_eq!(hd.a32().unwrap(), Some(0x0880_0000));
    }

    #[test]
    fn test_status_snapshot() {
        let (hd, fake) = initialized();
        fake.set(Reg::Trig1Scaler.offset(), 12);
        fake.set(Reg::PairSyncScaler.offset(), 34);
        fake.set(Reg::Interrupt.offset(), 5 << 16);
        let scalers = hd.scalers().unwrap();
        assert_eq!(scalers.trig1, 12);
        assert_eq!(scalers.helicity[3], 34);
        assert_eq!(hd.slot_number().unwrap(), 5);

        let status = hd.status().unwrap();
        assert_eq!(status.regs.len(), Reg::VARIANTS.len());
        assert_eq!(status.get(Reg::Trig1Scaler), 12);
        let text = status.to_string();
        assert!(text.contains("slot 5"), "{text}");
        assert!(text.contains("A32 data window 0x09000000"), "{text}");
        assert!(status.raw().to_string().contains("trig1_scaler"));
    }

    #[test]
    fn test_ctrl1_updates_never_lost() {
        let (hd, fake) = initialized();
        // a read-modify-write now spans a window where another thread could
        // get to the bus unless the handle is held across it
        fake.slow_reads(Duration::from_micros(50));
        let hd = Arc::new(hd);
        let helicity = {
            let hd = Arc::clone(&hd);
            std::thread::spawn(move || {
                for i in 0..200 {
                    let source = HelicitySource {
                        internal: i % 2 == 0,
                        ..Default::default()
                    };
                    hd.set_helicity_source(source).unwrap();
                    assert_eq!(hd.helicity_source().unwrap(), source);
                }
            })
        };
        for i in 0..200 {
            let enable = i % 2 == 0;
            hd.set_berr(enable).unwrap();
            assert_eq!(hd.berr().unwrap(), enable, "bus error bit lost at {i}");
        }
        helicity.join().unwrap();
    }
}
