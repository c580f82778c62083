use std::{
    io::Write,
    path::PathBuf,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{bail, ensure},
};
use hd_driver::{
    Decoder, Error, FirmwareImage, FirmwareSession, HelicityDecoder, HelicityInversion,
    HelicitySource, InitFlags, InitOptions, MAX_IMAGE_SIZE, ProcDelay, ReadMode, ResetKind,
    ResetPolicy, Settings, SignalSource, SignalSources,
    registers::{BOARD_TYPE, Reg, SUPPORTED_FIRMWARE},
    reverse_bits,
};
use hd_io::{Backend as BackendTrait, FakeBackend, Hex, MmapBackend, WordDump};

use crate::cli_helpers::HexArg;

mod cli_helpers;

type Hd = HelicityDecoder<Box<dyn BackendTrait + Send>>;

#[derive(clap::Parser)]
struct Args {
    #[command(flatten)]
    global: GlobalOpts,
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(clap::Args)]
struct GlobalOpts {
    /// Slot number, A24 address, or 0 to scan the crate
    #[arg(short, long, default_value_t = HexArg(0), global = true)]
    address: HexArg,

    #[arg(long, default_value = "mmap", global = true)]
    backend: Backend,

    /// Bridge device file for the A24 address space
    #[arg(long, default_value = "/dev/vme_a24", global = true)]
    a24_device: PathBuf,

    /// Bridge device file for the A32 address space
    #[arg(long, default_value = "/dev/vme_a32", global = true)]
    a32_device: PathBuf,

    /// Issue the reset kind asked for instead of always a hard reset
    #[arg(long, global = true)]
    reset_as_requested: bool,

    /// Accept unsupported firmware versions
    #[arg(short, long, global = true)]
    force: bool,

    /// Disable the progress bar
    #[arg(long, global = true)]
    no_progress_bar: bool,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum Backend {
    #[default]
    Mmap,
    /// Simulated board, nothing persists between runs
    Fake,
}

#[derive(clap::Subcommand)]
enum CliCommand {
    /// Reset and configure the board
    Init(Init),
    Status(Status),
    /// Enable decoding and event building
    Enable,
    Disable(Disable),
    Reset(Reset),
    /// Pulse trigger 1
    Trig1,
    /// Pulse trigger 2
    Trig2,
    /// Pulse sync reset
    Syncreset,
    Busy(Busy),
    /// Show the PLL lock status
    Clock,
    Scalers,
    Delays(Delays),
    Readout(Readout),
    #[command(subcommand)]
    Eeprom(Eeprom),
    FirmwareUpdate(FirmwareUpdate),
    /// Read commands from stdin
    Shell,
}

#[derive(clap::Args)]
struct Init {
    /// Clock, trigger and sync reset source
    #[arg(short, long, default_value = "internal")]
    source: Source,

    #[arg(long, default_value = "internal")]
    helicity: Helicity,

    /// Route the internal generator to the front panel outputs
    #[arg(long)]
    to_front_panel: bool,

    /// Invert the helicity inputs
    #[arg(short, long)]
    invert_input: bool,

    /// Invert the helicity outputs
    #[arg(short = 'o', long)]
    invert_output: bool,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum Source {
    #[default]
    Internal,
    FrontPanel,
    Backplane,
}

impl From<Source> for SignalSource {
    fn from(source: Source) -> Self {
        match source {
            Source::Internal => Self::Internal,
            Source::FrontPanel => Self::FrontPanel,
            Source::Backplane => Self::Backplane,
        }
    }
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum Helicity {
    #[default]
    Internal,
    Fiber,
    Copper,
}

impl Helicity {
    fn source(self, to_front_panel: bool) -> HelicitySource {
        HelicitySource {
            internal: matches!(self, Self::Internal),
            copper_input: matches!(self, Self::Copper),
            internal_to_front_panel: to_front_panel,
        }
    }
}

#[derive(clap::Args)]
struct Status {
    /// Also print every register
    #[arg(long)]
    raw: bool,
}

#[derive(clap::Args)]
struct Disable {
    /// Stop event building but keep decoding
    #[arg(long)]
    decoder_only: bool,
}

#[derive(clap::Args)]
struct Reset {
    #[arg(long, default_value = "hard")]
    kind: Kind,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum Kind {
    Soft,
    Hard,
    Both,
}

impl From<Kind> for ResetKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Soft => Self::Soft,
            Kind::Hard => Self::Hard,
            Kind::Both => Self::Both,
        }
    }
}

#[derive(clap::Args)]
struct Busy {
    /// Force the busy output, otherwise only show it
    state: Option<OnOff>,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum OnOff {
    On,
    Off,
}

#[derive(clap::Args)]
struct Delays {
    /// Data input delay in 8 ns ticks
    #[arg(long)]
    data_input: Option<HexArg>,

    /// Trigger latency in 8 ns ticks
    #[arg(long)]
    trigger_latency: Option<HexArg>,
}

#[derive(clap::Args)]
struct Readout {
    #[arg(long, default_value = "programmed")]
    mode: Mode,

    #[arg(short, long, default_value_t = 1)]
    blocks: usize,

    /// Read buffer size in words
    #[arg(long, default_value_t = 1024)]
    words: usize,

    /// Print decoded words instead of a hex dump
    #[arg(long)]
    decode: bool,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum Mode {
    Programmed,
    Dma,
}

impl From<Mode> for ReadMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Programmed => Self::Programmed,
            Mode::Dma => Self::Dma,
        }
    }
}

#[derive(clap::Subcommand)]
enum Eeprom {
    /// Read EEPROM contents back in firmware file order
    Dump(EepromDump),
}

#[derive(clap::Args)]
struct EepromDump {
    #[arg(long, default_value_t = HexArg(0))]
    start: HexArg,

    #[arg(long, default_value_t = 0x100)]
    len: usize,

    /// Write raw bytes here instead of printing hex
    output_file: Option<PathBuf>,
}

#[derive(clap::Args)]
struct FirmwareUpdate {
    input_file: PathBuf,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    yes: bool,
}

fn main() -> Result<()> {
    init_logging()?;
    let Args { global, command } = Args::parse();

    let settings = Settings {
        reset_policy: if global.reset_as_requested {
            ResetPolicy::AsRequested
        } else {
            ResetPolicy::AlwaysHard
        },
        ..Default::default()
    };
    let hd = HelicityDecoder::with_settings(get_backend(&global)?, settings);

    match command {
        CliCommand::Init(args) => init(&hd, &global, args),
        CliCommand::FirmwareUpdate(args) => firmware_update(&hd, &global, args),
        command => {
            open(&hd, &global, InitFlags::NO_INIT)?;
            run(command, &hd)
        }
    }
}

fn get_backend(global: &GlobalOpts) -> Result<Box<dyn BackendTrait + Send>> {
    let backend: Box<dyn BackendTrait + Send> = match global.backend {
        Backend::Mmap => Box::new(MmapBackend::open(&global.a24_device, &global.a32_device)?),
        Backend::Fake => Box::new(fake_board(global.address.0)),
    };
    Ok(backend)
}

/// A simulated board where `--address` points, or in the first scanned slot.
fn fake_board(address: u32) -> FakeBackend {
    let a24 = match address {
        0 => 3 << 19,
        slot @ 1..22 => slot << 19,
        a24 => a24,
    };
    let fake = FakeBackend::new(a24).with_eeprom(
        Reg::EepromCsr.offset(),
        Reg::EepromData.offset(),
        MAX_IMAGE_SIZE,
        1,
    );
    fake.set(
        Reg::Version.offset(),
        BOARD_TYPE << 16 | 0x01 << 8 | SUPPORTED_FIRMWARE,
    );
    fake
}

fn init_flags(global: &GlobalOpts, flags: InitFlags) -> InitFlags {
    if global.force {
        flags | InitFlags::IGNORE_FIRMWARE_CHECK
    } else {
        flags
    }
}

/// Identify the board without touching its configuration.
fn open(hd: &Hd, global: &GlobalOpts, flags: InitFlags) -> Result<()> {
    let board = hd.initialize(InitOptions {
        address: global.address.0,
        flags: init_flags(global, flags),
        ..Default::default()
    })?;
    tracing::debug!(?board, ?flags, "opened");
    Ok(())
}

fn run(command: CliCommand, hd: &Hd) -> Result<()> {
    match command {
        // handled in main
        CliCommand::Init(_) | CliCommand::FirmwareUpdate(_) => unreachable!(),

        CliCommand::Status(args) => {
            let status = hd.status()?;
            println!("{status}");
            if args.raw {
                print!("{}", status.raw());
            }
        }
        CliCommand::Enable => enable(hd)?,
        CliCommand::Disable(args) => {
            if args.decoder_only {
                hd.enable_decoder_only()?;
            } else {
                disable(hd)?;
            }
        }
        CliCommand::Reset(args) => hd.reset(args.kind.into())?,
        CliCommand::Trig1 => trig1(hd)?,
        CliCommand::Trig2 => trig2(hd)?,
        CliCommand::Syncreset => syncreset(hd)?,
        CliCommand::Busy(args) => {
            if let Some(state) = args.state {
                hd.busy(matches!(state, OnOff::On))?;
            }
            busy(hd)?;
        }
        CliCommand::Clock => clock(hd)?,
        CliCommand::Scalers => scalers(hd)?,
        CliCommand::Delays(args) => {
            if args.data_input.is_some() || args.trigger_latency.is_some() {
                let current = hd.proc_delay()?;
                hd.set_proc_delay(ProcDelay {
                    data_input: args.data_input.map_or(current.data_input, |d| d.0),
                    trigger_latency: args
                        .trigger_latency
                        .map_or(current.trigger_latency, |d| d.0),
                })?;
            }
            delays(hd)?;
        }
        CliCommand::Readout(args) => {
            map_data_window(hd)?;
            read_blocks(hd, args.mode.into(), args.blocks, args.words, args.decode)?;
        }
        CliCommand::Eeprom(Eeprom::Dump(args)) => eeprom_dump(hd, args)?,
        CliCommand::Shell => shell(hd)?,
    }

    Ok(())
}

fn init(hd: &Hd, global: &GlobalOpts, args: Init) -> Result<()> {
    hd.initialize(InitOptions {
        address: global.address.0,
        sources: SignalSources::all(args.source.into()),
        helicity: args.helicity.source(args.to_front_panel),
        flags: init_flags(global, InitFlags::empty()),
    })?;
    if args.invert_input || args.invert_output {
        hd.set_helicity_inversion(HelicityInversion {
            fiber_input: args.invert_input,
            copper_input: args.invert_input,
            output: args.invert_output,
        })?;
    }
    println!("{}", hd.status()?);
    Ok(())
}

/// Re-map the data window a previous `init` programmed.
fn map_data_window(hd: &Hd) -> Result<()> {
    let Some(base) = hd.a32()? else {
        bail!("A32 data window is disabled, run init first");
    };
    hd.set_a32(base)?;
    Ok(())
}

fn read_blocks(hd: &Hd, mode: ReadMode, blocks: usize, words: usize, decode: bool) -> Result<()> {
    let mut buf = vec![0; words];
    let mut decoder = Decoder::new();
    for block in 0..blocks {
        match hd.wait_block_ready() {
            Ok(()) => {}
            Err(Error::Timeout { .. }) => {
                println!("no block ready");
                break;
            }
            Err(e) => return Err(e.into()),
        }
        let n = hd.read_block(&mut buf, mode)?;
        println!("block {block}: {n} words");
        if !decode {
            print!("{}", WordDump(&buf[..n]));
            continue;
        }
        decoder.reset();
        let record = decoder.decode_block(&buf[..n]);
        for word in &record.words {
            println!("  {} {:?}", Hex(word.raw), word.record);
        }
        for (idx, e) in &record.errors {
            println!("  word {idx}: {e}");
        }
    }
    Ok(())
}

fn eeprom_dump(hd: &Hd, args: EepromDump) -> Result<()> {
    let start = args.start.0 as usize;
    ensure!(
        start + args.len <= MAX_IMAGE_SIZE,
        "dump past the end of the EEPROM (0x{MAX_IMAGE_SIZE:X} bytes)"
    );
    let mut data = FirmwareSession::new(hd).dump(args.start.0, args.len)?;
    for b in &mut data {
        *b = reverse_bits(*b);
    }
    match args.output_file {
        Some(path) => std::fs::write(path, data)?,
        None => {
            for (idx, chunk) in data.chunks(16).enumerate() {
                println!("{:06X}: {}", start + idx * 16, hex::encode(chunk));
            }
        }
    }
    Ok(())
}

fn firmware_update(hd: &Hd, global: &GlobalOpts, args: FirmwareUpdate) -> Result<()> {
    let notify = AtomicUsize::new(0);
    let image = FirmwareImage::load(&args.input_file)?;
    open(
        hd,
        global,
        InitFlags::NO_INIT | InitFlags::IGNORE_FIRMWARE_CHECK,
    )?;
    println!("Current firmware version: 0x{:02X}", hd.firmware_version()?);
    if !args.yes && !confirm()? {
        println!("Exiting without update");
        return Ok(());
    }

    // every byte is counted once written and once verified
    let total = image.len().0 * 2;
    let mut session = FirmwareSession::new(hd);
    session.set_image(image);
    if global.no_progress_bar {
        session.run()?;
    } else {
        let notify = &notify;
        let done = &AtomicBool::new(false);
        let pb = &setup_progress_bar()?;
        pb.set_length(total as _);
        std::thread::scope(|s| {
            s.spawn(move || {
                while !done.load(Ordering::Acquire) {
                    pb.set_position(notify.load(Ordering::Acquire) as _);
                }
            });

            let r = session.with_notifications(notify, |session| session.run());
            done.store(true, Ordering::Release);
            r
        })?;
    }
    println!("Firmware update complete, power cycle the crate to load it");
    Ok(())
}

fn confirm() -> Result<bool> {
    print!("<ENTER> to continue... or q and <ENTER> to quit without update: ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(!line.trim_start().starts_with(['q', 'Q']))
}

fn setup_progress_bar() -> Result<indicatif::ProgressBar> {
    let template =
        "{spinner:.green} {elapsed:>3}/{duration:>3} {bar} {bytes}/{total_bytes} ({bytes_per_sec})";
    let style = indicatif::ProgressStyle::with_template(template)?;
    let pb = indicatif::ProgressBar::new(0)
        .with_finish(indicatif::ProgressFinish::Abandon)
        .with_style(style);
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    Ok(pb)
}

type Handler = fn(&Hd) -> Result<()>;

const SHELL_COMMANDS: &[(&str, &str, Handler)] = &[
    ("status", "show the board status", |hd| {
        println!("{}", hd.status()?);
        Ok(())
    }),
    ("enable", "enable decoding and event building", enable),
    ("disable", "disable decoding and event building", disable),
    ("reset", "reset the board", |hd| Ok(hd.reset(ResetKind::default())?)),
    ("trig1", "pulse trigger 1", trig1),
    ("trig2", "pulse trigger 2", trig2),
    ("syncreset", "pulse sync reset", syncreset),
    ("busy", "show the busy status", busy),
    ("clock", "show the PLL lock status", clock),
    ("scalers", "show the scalers", scalers),
    ("delays", "show programmed and measured delays", delays),
    ("readout", "read one block", |hd| {
        read_blocks(hd, ReadMode::Programmed, 1, 1024, true)
    }),
];

fn shell(hd: &Hd) -> Result<()> {
    let stdin = std::io::stdin();
    let mut line = String::new();
    loop {
        print!("hd> ");
        std::io::stdout().flush()?;
        line.clear();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let name = line.trim();
        match name {
            "" => continue,
            "quit" | "exit" => break,
            "help" => {
                for (name, help, _) in SHELL_COMMANDS {
                    println!("  {name:<10} {help}");
                }
                continue;
            }
            _ => {}
        }
        let Some((_, _, handler)) = SHELL_COMMANDS.iter().find(|(n, _, _)| *n == name) else {
            println!("unknown command {name:?}, try help");
            continue;
        };
        if let Err(e) = handler(hd) {
            println!("error: {e}");
        }
    }
    Ok(())
}

fn enable(hd: &Hd) -> Result<()> {
    Ok(hd.enable()?)
}

fn disable(hd: &Hd) -> Result<()> {
    Ok(hd.disable()?)
}

fn trig1(hd: &Hd) -> Result<()> {
    Ok(hd.trig1()?)
}

fn trig2(hd: &Hd) -> Result<()> {
    Ok(hd.trig2()?)
}

fn syncreset(hd: &Hd) -> Result<()> {
    Ok(hd.sync()?)
}

fn busy(hd: &Hd) -> Result<()> {
    let status = hd.busy_status()?;
    println!("busy {} (latched {})", status.current, status.latched);
    Ok(())
}

fn clock(hd: &Hd) -> Result<()> {
    let lock = |locked| if locked { "locked" } else { "unlocked" };
    let pll = hd.clock_pll_status()?;
    println!("system PLL {}", lock(pll.system_locked));
    println!(" local PLL {}", lock(pll.local_locked));
    Ok(())
}

fn scalers(hd: &Hd) -> Result<()> {
    println!("{}", hd.scalers()?);
    Ok(())
}

fn delays(hd: &Hd) -> Result<()> {
    let c = hd.confirm_proc_delay()?;
    println!(
        "data input delay 0x{:03X} (measured 0x{:03X})",
        c.programmed.data_input, c.measured.data_input
    );
    println!(
        "trigger latency  0x{:03X} (measured 0x{:03X})",
        c.programmed.trigger_latency, c.measured.trigger_latency
    );
    Ok(())
}

fn init_logging() -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .with(tracing_error::ErrorLayer::default())
        .init();
    color_eyre::install()?;
    Ok(())
}
