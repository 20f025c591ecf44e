// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `fxtool` is a program for getting games onto Arduboys and their FX
//! flashcarts.
//!
//! It reads and writes sketches, flashcart images and `.arduboy` packages,
//! and talks to the Arduboy bootloader over USB serial to upload and back up
//! onboard flash, the FX chip and EEPROM. Device commands accept `--all` to
//! run against every attached board at once.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serialport::SerialPort;
use tracing_subscriber::EnvFilter;

use fxtool::cart::{self, Cart, CompileOptions, CompiledCart, Slot};
use fxtool::device::{self, Device};
use fxtool::format::{FX_MAX_PAGES, FX_PAGE_SIZE, SAVE_ALIGNMENT, pad_to};
use fxtool::hex::{self, DecodedHex};
use fxtool::package::{ArduboyPackage, DEFAULT_DEVICE};
use fxtool::patch::{self, DisplayPatch};
use fxtool::protocol::{Exit, Progress, Session, SessionConfig};
use fxtool::{sketch, title, update};

///////////////////////////////////////////////////////////////////////
// Top-level command line interface definition and dispatch.

/// fxtool uploads, backs up and builds Arduboy sketches and FX flashcarts.
#[derive(Parser)]
#[clap(term_width = 80)]
struct FxTool {
    #[clap(flatten)]
    global: GlobalFlags,
    #[clap(subcommand)]
    command: Cmd,
}

#[derive(Parser)]
struct GlobalFlags {
    /// Enable additional output, probably more of it than you'd like.
    #[clap(long, short, global = true)]
    verbose: bool,
    /// Only print errors. Also suppresses progress output.
    #[clap(long, short, global = true, conflicts_with = "verbose")]
    quiet: bool,
}

#[derive(Parser)]
enum Cmd {
    /// List attached Arduboys and compatible boards.
    Scan(ScanArgs),
    /// Work with sketches in onboard flash.
    #[clap(subcommand)]
    Hex(HexCmd),
    /// Work with FX flashcart images and the FX chip.
    #[clap(subcommand)]
    Fx(FxCmd),
    /// Back up, restore or erase EEPROM.
    #[clap(subcommand)]
    Eeprom(EepromCmd),
    /// Inspect `.arduboy` packages and move games between packages and
    /// flashcarts.
    #[clap(subcommand)]
    Package(PackageCmd),
    /// Compare a flashcart with a game catalog and report which games have
    /// newer versions.
    Update(UpdateArgs),
}

#[derive(Parser)]
enum HexCmd {
    /// Decode a hex file and print what it occupies.
    Info(HexInfoArgs),
    /// Upload a sketch (hex file or package) to onboard flash.
    Upload(HexUploadArgs),
    /// Read onboard flash back into a file.
    Backup(HexBackupArgs),
}

#[derive(Parser)]
enum FxCmd {
    /// Read a flashcart image and list its slots.
    Info(FxInfoArgs),
    /// Cut a flashcart image down to the slot chain it holds.
    Trim(FxTrimArgs),
    /// Write an image to the FX chip.
    Upload(FxUploadArgs),
    /// Read the whole FX chip into a file.
    Backup(FxBackupArgs),
    /// Build a flashcart image from categories, packages and other carts.
    Compile(FxCompileArgs),
}

#[derive(Parser)]
enum EepromCmd {
    /// Read EEPROM into a file.
    Backup(EepromBackupArgs),
    /// Write a file back to EEPROM.
    Restore(EepromRestoreArgs),
    /// Reset every EEPROM byte to 0xFF.
    Erase(EepromEraseArgs),
}

#[derive(Parser)]
enum PackageCmd {
    /// Print a package's metadata and binaries.
    Info(PackageInfoArgs),
    /// Turn a flashcart slot into a package.
    FromSlot(FromSlotArgs),
    /// Add a package's game to a flashcart.
    ToSlot(ToSlotArgs),
}

///////////////////////////////////////////////////////////////////////
// Main function / dispatch routine.

fn main() -> Result<()> {
    let args = FxTool::parse();
    init_logging(&args.global);

    match &args.command {
        Cmd::Scan(subargs) => cmd_scan(&args.global, subargs),

        Cmd::Hex(HexCmd::Info(subargs)) => cmd_hex_info(&args.global, subargs),
        Cmd::Hex(HexCmd::Upload(subargs)) => cmd_hex_upload(&args.global, subargs),
        Cmd::Hex(HexCmd::Backup(subargs)) => cmd_hex_backup(&args.global, subargs),

        Cmd::Fx(FxCmd::Info(subargs)) => cmd_fx_info(&args.global, subargs),
        Cmd::Fx(FxCmd::Trim(subargs)) => cmd_fx_trim(&args.global, subargs),
        Cmd::Fx(FxCmd::Upload(subargs)) => cmd_fx_upload(&args.global, subargs),
        Cmd::Fx(FxCmd::Backup(subargs)) => cmd_fx_backup(&args.global, subargs),
        Cmd::Fx(FxCmd::Compile(subargs)) => cmd_fx_compile(&args.global, subargs),

        Cmd::Eeprom(EepromCmd::Backup(subargs)) => cmd_eeprom_backup(&args.global, subargs),
        Cmd::Eeprom(EepromCmd::Restore(subargs)) => cmd_eeprom_restore(&args.global, subargs),
        Cmd::Eeprom(EepromCmd::Erase(subargs)) => cmd_eeprom_erase(&args.global, subargs),

        Cmd::Package(PackageCmd::Info(subargs)) => cmd_package_info(&args.global, subargs),
        Cmd::Package(PackageCmd::FromSlot(subargs)) => cmd_from_slot(&args.global, subargs),
        Cmd::Package(PackageCmd::ToSlot(subargs)) => cmd_to_slot(&args.global, subargs),

        Cmd::Update(subargs) => cmd_update(&args.global, subargs),
    }
}

/// `RUST_LOG` wins if set; otherwise the level follows `-v`/`-q`.
fn init_logging(global: &GlobalFlags) {
    let level = if global.verbose {
        "debug"
    } else if global.quiet {
        "error"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .init();
}

///////////////////////////////////////////////////////////////////////
// Device selection, shared by every command that talks to hardware.

#[derive(Parser)]
struct DeviceArgs {
    /// Only consider boards on this serial port. May be repeated.
    #[clap(long = "port", short = 'p', value_name = "PORT")]
    ports: Vec<String>,

    /// Normally, the tool will fail if more than one board matches, to avoid
    /// doing something questionable. This flag runs the command on all of
    /// them instead.
    #[clap(long)]
    all: bool,

    /// With `--all`, talk to every board at the same time.
    #[clap(long, requires = "all")]
    parallel: bool,

    /// Leave boards in the bootloader menu afterwards instead of starting
    /// the sketch.
    #[clap(long)]
    stay: bool,

    /// Serial baud rate for the bootloader connection.
    #[clap(long, default_value = "57600", parse(try_from_str = parse_u32))]
    baud: u32,

    /// Milliseconds to wait for each reply from the bootloader.
    #[clap(long, default_value = "2000", value_name = "MS")]
    timeout: u64,

    /// Seconds to wait for a board to come back after resetting it into the
    /// bootloader.
    #[clap(long, default_value = "20", value_name = "SECONDS")]
    reconnect_wait: u64,
}

impl DeviceArgs {
    fn config(&self) -> SessionConfig {
        SessionConfig {
            baud: self.baud,
            timeout: Duration::from_millis(self.timeout),
            reconnect_wait: Duration::from_secs(self.reconnect_wait),
            ..SessionConfig::default()
        }
    }

    fn exit(&self) -> Exit {
        if self.stay { Exit::Normal } else { Exit::Bootloader }
    }

    fn select(&self) -> Result<Vec<Device>> {
        let devices: Vec<Device> = device::find_devices()?
            .into_iter()
            .filter(|d| self.ports.is_empty() || self.ports.contains(&d.port))
            .collect();
        match devices.len() {
            0 => bail!("no matching devices were found"),
            1 => (),
            _ if self.all => (),
            n => bail!("couldn't find unique matching device ({n} found, use --all)"),
        }
        Ok(devices)
    }
}

type Port = Box<dyn SerialPort>;

/// Runs `op` on the selected devices and returns the successful results,
/// tagged with the position of their device in the batch.
///
/// A lone device's error comes back as is. In a batch, each failure has
/// already been logged, so they are only counted.
fn run_on_devices<R: Send>(
    args: &DeviceArgs,
    op: impl Fn(&mut Session<Port>) -> fxtool::Result<R> + Sync,
) -> Result<Vec<(usize, R)>> {
    let devices = args.select()?;
    let results = device::for_each_device(
        &devices,
        &args.config(),
        args.exit(),
        args.parallel,
        op,
    );

    let mut out = vec![];
    let mut failed = 0;
    for (i, (device, result)) in devices.iter().zip(results).enumerate() {
        match result {
            Ok(r) => out.push((i, r)),
            Err(e) if devices.len() == 1 => {
                return Err(e).with_context(|| format!("on {}", device));
            }
            Err(_) => failed += 1,
        }
    }
    if failed > 0 {
        bail!("{} of {} devices failed", failed, devices.len());
    }
    Ok(out)
}

/// Progress printer for one device.
fn progress_for(global: &GlobalFlags, label: &str) -> impl FnMut(Progress) {
    let quiet = global.quiet;
    let label = label.to_string();
    move |p: Progress| {
        if quiet {
            return;
        }
        eprint!("\r{}: {}/{}", label, p.done, p.total);
        if p.done == p.total {
            eprintln!();
        }
    }
}

/// Output path for device `index` of a batch: `name-N.ext` with `--all`,
/// `out` itself otherwise.
fn numbered_output(out: &Path, index: usize, numbered: bool) -> PathBuf {
    if !numbered {
        return out.to_path_buf();
    }
    let stem = out.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let name = match out.extension() {
        Some(ext) => format!("{}-{}.{}", stem, index, ext.to_string_lossy()),
        None => format!("{}-{}", stem, index),
    };
    out.with_file_name(name)
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path)
        .with_context(|| format!("can't read input path {}", path.display()))
}

fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    std::fs::write(path, data)
        .with_context(|| format!("can't write output file {}", path.display()))
}

#[derive(Parser)]
struct DisplayArgs {
    /// Patch the display setup for SSD1309 screens.
    #[clap(long)]
    ssd1309: bool,

    /// Replace the display contrast, given as a number or one of `normal`,
    /// `dim`, `dimmer`, `dimmest` or `highest`.
    #[clap(long, parse(try_from_str = parse_contrast))]
    contrast: Option<u8>,
}

impl DisplayArgs {
    fn patch(&self) -> DisplayPatch {
        DisplayPatch {
            ssd1309: self.ssd1309,
            contrast: self.contrast,
        }
    }

    /// Applies the display patch to `data`, reporting if it found nothing to
    /// change.
    fn apply(&self, data: Vec<u8>) -> Vec<u8> {
        let patch = self.patch();
        if patch.is_noop() {
            return data;
        }
        let patched = patch::patch_display(&data, patch);
        if patched.sites == 0 {
            println!("warning: no display setup found to patch");
        } else {
            println!("patched display setup in {} places", patched.sites);
        }
        patched.data
    }
}

///////////////////////////////////////////////////////////////////////
// scan

#[derive(Parser)]
struct ScanArgs {
    /// Print the table of boards the tool recognizes instead of scanning.
    #[clap(long)]
    known: bool,
}

fn cmd_scan(
    _global: &GlobalFlags,
    args: &ScanArgs,
) -> Result<()> {
    if args.known {
        println!("{:4} {:4} {:10} {}", "VID", "PID", "MODE", "NAME");
        for d in device::known_devices() {
            println!("{:04X} {:04X} {:10} {}",
                d.vid, d.pid,
                if d.bootloader { "bootloader" } else { "sketch" },
                d.name);
        }
        return Ok(());
    }

    let devices = device::find_devices()?;
    if devices.is_empty() {
        println!("no devices found.");
        return Ok(());
    }

    println!("devices found: {}", devices.len());
    println!("{:24} {:9} {:10} {}", "PORT", "VID:PID", "MODE", "NAME");
    for d in devices {
        println!("{:24} {:04X}:{:04X} {:10} {}",
            d.port, d.vid, d.pid,
            if d.bootloader { "bootloader" } else { "sketch" },
            d.name);
    }
    Ok(())
}

///////////////////////////////////////////////////////////////////////
// hex

#[derive(Parser)]
struct HexInfoArgs {
    /// Path to an Intel HEX file to analyze.
    input: PathBuf,
}

fn cmd_hex_info(
    global: &GlobalFlags,
    args: &HexInfoArgs,
) -> Result<()> {
    let text = std::fs::read_to_string(&args.input)
        .with_context(|| format!("can't read input path {}", args.input.display()))?;
    let decoded = hex::decode(&text)
        .with_context(|| format!("could not parse {}", args.input.display()))?;
    let analysis = sketch::analyze_hex(&decoded);

    println!("{} flash pages used, {} bytes after trimming",
        analysis.page_count, analysis.len());
    if analysis.overwrites_bootloader {
        println!("- writes into the bootloader area; refused on Caterina boards");
    }
    if global.verbose {
        println!("- {:<6}  ADDR", "PAGE");
        for page in decoded.pages.iter() {
            println!("  {:<6}  {:#06x}", page, page * decoded.pages.page_size());
        }
    }
    Ok(())
}

#[derive(Parser)]
struct HexUploadArgs {
    #[clap(flatten)]
    device: DeviceArgs,

    #[clap(flatten)]
    display: DisplayArgs,

    /// Swap the RX/TX LED polarity, for Arduino Micro based builds.
    #[clap(long)]
    micro: bool,

    /// Skip reading the sketch back after writing it.
    #[clap(long)]
    no_verify: bool,

    /// Which binary to take from a package.
    #[clap(long, default_value = DEFAULT_DEVICE)]
    target: String,

    /// A `.hex` file or an `.arduboy` package. A package's FX data and save
    /// are written to the top of the FX chip as well.
    input: PathBuf,
}

fn cmd_hex_upload(
    global: &GlobalFlags,
    args: &HexUploadArgs,
) -> Result<()> {
    let package = ArduboyPackage::read(&args.input)
        .with_context(|| format!("could not load {}", args.input.display()))?;
    let binary = package.binary_for(&args.target)
        .with_context(|| format!("{} has no binaries", args.input.display()))?;
    let decoded = hex::decode(&binary.hex)
        .with_context(|| format!("bad hex in {}", args.input.display()))?;

    let mut data = args.display.apply(decoded.data);
    if args.micro {
        let patched = patch::patch_micro_led(&data);
        println!("patched LED polarity in {} places", patched.sites);
        data = patched.data;
    }
    let sketch = DecodedHex { data, pages: decoded.pages };

    // Development data sits at the very end of the chip, save after data.
    let mut fx = binary.data.clone();
    if !binary.save.is_empty() {
        pad_to(&mut fx, SAVE_ALIGNMENT);
        fx.extend_from_slice(&binary.save);
    }

    let verify = !args.no_verify;
    run_on_devices(&args.device, |s| {
        let label = s.label().to_string();
        if !fx.is_empty() {
            s.require_fx_support()?;
            let mut progress = progress_for(global, &format!("{} FX data", label));
            s.flash_fx_at_end(&fx, verify, &mut progress)?;
        }
        let mut progress = progress_for(global, &label);
        s.flash_sketch(&sketch, verify, &mut progress)
    })?;
    println!("upload complete");
    Ok(())
}

#[derive(Parser)]
struct HexBackupArgs {
    #[clap(flatten)]
    device: DeviceArgs,

    /// Include the bootloader area in the backup.
    #[clap(long)]
    bootloader: bool,

    /// Path for the backup. A `.hex` extension writes Intel HEX, anything
    /// else a raw binary. With `--all`, a device number is added to the
    /// name.
    output: PathBuf,
}

fn cmd_hex_backup(
    _global: &GlobalFlags,
    args: &HexBackupArgs,
) -> Result<()> {
    let as_hex = args.output.extension()
        .map_or(false, |e| e.eq_ignore_ascii_case("hex"));
    let backups = run_on_devices(&args.device, |s| s.backup_sketch(args.bootloader))?;

    for (i, image) in backups {
        let path = numbered_output(&args.output, i, args.device.all);
        if as_hex {
            let trimmed = sketch::analyze(&image).trimmed;
            write_file(&path, hex::encode(&trimmed)?.as_bytes())?;
        } else {
            write_file(&path, &image)?;
        }
        println!("wrote {}", path.display());
    }
    Ok(())
}

///////////////////////////////////////////////////////////////////////
// fx

#[derive(Parser)]
struct FxInfoArgs {
    /// Path to a flashcart image or chip backup.
    input: PathBuf,
}

fn cmd_fx_info(
    global: &GlobalFlags,
    args: &FxInfoArgs,
) -> Result<()> {
    let bytes = read_file(&args.input)?;
    let cart = Cart::parse(&bytes)
        .with_context(|| format!("could not parse {}", args.input.display()))?;

    let games = cart.slots.iter().filter(|s| !s.is_category()).count();
    println!("{} slots: {} categories, {} games",
        cart.slots.len(), cart.slots.len() - games, games);
    if let Err(e) = cart.check_menu_layout() {
        println!("warning: {}", e);
    }

    println!("{:>4} {:>3} {:24} {:10} {:>6} {:>7} {:>6}",
        "SLOT", "CAT", "TITLE", "VERSION", "PROG", "DATA", "SAVE");
    for (i, slot) in cart.slots.iter().enumerate() {
        if slot.is_category() {
            println!("{:>4} {:>3} [{}]", i, slot.category, slot.meta.title);
            continue;
        }
        println!("{:>4} {:>3} {:24} {:10} {:>6} {:>7} {:>6}",
            i, slot.category,
            slot.meta.title, slot.meta.version,
            slot.program.len(), slot.data.len(), slot.save.len());
        if global.verbose && !slot.meta.developer.is_empty() {
            println!("         by {}", slot.meta.developer);
        }
    }
    Ok(())
}

#[derive(Parser)]
struct FxTrimArgs {
    /// Flashcart image or chip backup to trim.
    input: PathBuf,
    /// Path for the trimmed image.
    output: PathBuf,
}

fn cmd_fx_trim(
    _global: &GlobalFlags,
    args: &FxTrimArgs,
) -> Result<()> {
    let bytes = read_file(&args.input)?;
    let trimmed = cart::trim(&bytes)
        .with_context(|| format!("could not walk slots in {}", args.input.display()))?;
    println!("trimmed {} bytes to {}", bytes.len(), trimmed.len());
    write_file(&args.output, trimmed)
}

#[derive(Parser)]
struct FxUploadArgs {
    #[clap(flatten)]
    device: DeviceArgs,

    #[clap(flatten)]
    display: DisplayArgs,

    /// Write the image so it ends at the top of the chip, as development
    /// data for a sketch under test.
    #[clap(long, conflicts_with = "page")]
    at_end: bool,

    /// FX page to start writing at.
    #[clap(long, default_value = "0", parse(try_from_str = parse_u16))]
    page: u16,

    /// Save region produced by `fx compile`, written to the top of the chip.
    /// The cart must have been compiled for this chip's capacity.
    #[clap(long, value_name = "FILE")]
    save_region: Option<PathBuf>,

    /// Skip reading each block back after writing it.
    #[clap(long)]
    no_verify: bool,

    /// Image to write.
    input: PathBuf,
}

fn cmd_fx_upload(
    global: &GlobalFlags,
    args: &FxUploadArgs,
) -> Result<()> {
    let image = args.display.apply(read_file(&args.input)?);
    let saves = args.save_region.as_deref().map(read_file).transpose()?;
    if image.is_empty() {
        bail!("{} is empty, nothing to write", args.input.display());
    }

    let verify = !args.no_verify;
    let address = usize::from(args.page) * FX_PAGE_SIZE;
    run_on_devices(&args.device, |s| {
        s.require_fx_support()?;
        let label = s.label().to_string();
        let mut progress = progress_for(global, &label);
        if args.at_end {
            let at = s.flash_fx_at_end(&image, verify, &mut progress)?;
            tracing::info!("{}: development data at page {:#06x}", label, at / FX_PAGE_SIZE);
        } else {
            s.write_fx(address, &image, verify, &mut progress)?;
        }
        if let Some(saves) = &saves {
            let mut progress = progress_for(global, &format!("{} saves", label));
            let at = s.flash_fx_at_end(saves, verify, &mut progress)?;
            tracing::info!("{}: save region at page {:#06x}", label, at / FX_PAGE_SIZE);
        }
        Ok(())
    })?;
    println!("upload complete");
    Ok(())
}

#[derive(Parser)]
struct FxBackupArgs {
    #[clap(flatten)]
    device: DeviceArgs,

    /// Keep only the slot chain rather than the whole chip.
    #[clap(long)]
    trim: bool,

    /// Path for the backup. With `--all`, a device number is added to the
    /// name.
    output: PathBuf,
}

fn cmd_fx_backup(
    global: &GlobalFlags,
    args: &FxBackupArgs,
) -> Result<()> {
    let backups = run_on_devices(&args.device, |s| {
        s.require_fx_support()?;
        let chip = s.fx_chip()?;
        tracing::info!("{}: {} byte {} chip", s.label(), chip.capacity, chip.manufacturer);
        let mut progress = progress_for(global, &s.label().to_string());
        s.backup_fx(&mut progress)
    })?;

    for (i, image) in backups {
        let path = numbered_output(&args.output, i, args.device.all);
        let data = if args.trim {
            cart::trim(&image).context("backup is not a flashcart")?
        } else {
            &image[..]
        };
        write_file(&path, data)?;
        println!("wrote {} bytes to {}", data.len(), path.display());
    }
    Ok(())
}

#[derive(Parser)]
struct CompileOutput {
    /// Install the hold UP + DOWN return-to-menu handler in every game
    /// that allows it.
    #[clap(long)]
    menu_patch: bool,

    /// Capacity of the target FX chip in bytes. Save areas are placed below
    /// its top.
    #[clap(long, parse(try_from_str = parse_usize))]
    capacity: Option<usize>,

    /// Write a complete chip image, with the save region in place, instead
    /// of the slot chain plus a separate `.save` file.
    #[clap(long)]
    full_image: bool,
}

impl CompileOutput {
    fn options(&self) -> CompileOptions {
        CompileOptions {
            menu_patch: self.menu_patch,
            capacity: self.capacity.unwrap_or(FX_MAX_PAGES * FX_PAGE_SIZE),
        }
    }

    fn write(&self, compiled: &CompiledCart, output: &Path) -> Result<()> {
        if self.full_image {
            let image = compiled.to_image(self.options().capacity)?;
            write_file(output, &image)?;
            println!("wrote {} byte chip image to {}", image.len(), output.display());
            return Ok(());
        }

        write_file(output, &compiled.stream)?;
        println!("wrote {} games in {} categories ({} bytes) to {}",
            compiled.games, compiled.categories, compiled.stream.len(), output.display());
        if let Some((address, region)) = compiled.save_region_bytes() {
            let mut name = output.as_os_str().to_owned();
            name.push(".save");
            let path = PathBuf::from(name);
            write_file(&path, &region)?;
            println!("wrote {} byte save region for address {:#x} to {}",
                region.len(), address, path.display());
        }
        Ok(())
    }
}

#[derive(Parser)]
struct FxCompileArgs {
    #[clap(flatten)]
    output_opts: CompileOutput,

    /// Path for the compiled flashcart.
    output: PathBuf,

    /// Slots in order. `@Name` starts a new category; a `.bin` file appends
    /// the slots of an existing flashcart; anything else is read as a
    /// package or hex file.
    #[clap(required = true)]
    inputs: Vec<String>,
}

fn cmd_fx_compile(
    _global: &GlobalFlags,
    args: &FxCompileArgs,
) -> Result<()> {
    let mut slots = vec![];
    for input in &args.inputs {
        if let Some(name) = input.strip_prefix('@') {
            slots.push(Slot::new_category(name, "", title::blank()));
            continue;
        }
        let path = Path::new(input);
        let is_cart = path.extension().map_or(false, |e| e.eq_ignore_ascii_case("bin"));
        if is_cart {
            let cart = Cart::parse(&read_file(path)?)
                .with_context(|| format!("could not parse {}", path.display()))?;
            slots.extend(cart.slots);
        } else {
            let package = ArduboyPackage::read(path)
                .with_context(|| format!("could not load {}", path.display()))?;
            slots.push(package.to_slot(0)
                .with_context(|| format!("could not make a slot from {}", path.display()))?);
        }
    }

    let mut cart = Cart::new(slots);
    cart.renumber().context("can't number categories")?;
    if let Err(e) = cart.check_menu_layout() {
        println!("warning: {}", e);
    }
    let compiled = cart.compile(&args.output_opts.options())?;
    args.output_opts.write(&compiled, &args.output)
}

///////////////////////////////////////////////////////////////////////
// eeprom

#[derive(Parser)]
struct EepromBackupArgs {
    #[clap(flatten)]
    device: DeviceArgs,
    /// Path for the 1K EEPROM image.
    output: PathBuf,
}

fn cmd_eeprom_backup(
    _global: &GlobalFlags,
    args: &EepromBackupArgs,
) -> Result<()> {
    let backups = run_on_devices(&args.device, |s| s.read_eeprom())?;
    for (i, image) in backups {
        let path = numbered_output(&args.output, i, args.device.all);
        write_file(&path, &image)?;
        println!("wrote {}", path.display());
    }
    Ok(())
}

#[derive(Parser)]
struct EepromRestoreArgs {
    #[clap(flatten)]
    device: DeviceArgs,
    /// A 1K EEPROM image.
    input: PathBuf,
}

fn cmd_eeprom_restore(
    _global: &GlobalFlags,
    args: &EepromRestoreArgs,
) -> Result<()> {
    let image = read_file(&args.input)?;
    run_on_devices(&args.device, |s| s.write_eeprom(&image))?;
    println!("EEPROM restored");
    Ok(())
}

#[derive(Parser)]
struct EepromEraseArgs {
    #[clap(flatten)]
    device: DeviceArgs,
}

fn cmd_eeprom_erase(
    _global: &GlobalFlags,
    args: &EepromEraseArgs,
) -> Result<()> {
    run_on_devices(&args.device, |s| s.erase_eeprom())?;
    println!("EEPROM erased");
    Ok(())
}

///////////////////////////////////////////////////////////////////////
// package

#[derive(Parser)]
struct PackageInfoArgs {
    /// `.arduboy` package or `.hex` file.
    input: PathBuf,
}

fn cmd_package_info(
    global: &GlobalFlags,
    args: &PackageInfoArgs,
) -> Result<()> {
    let package = ArduboyPackage::read(&args.input)
        .with_context(|| format!("could not load {}", args.input.display()))?;

    let field = |name: &str, value: &Option<String>| {
        if let Some(v) = value {
            println!("{:12} {}", name, v);
        }
    };
    field("title", &package.title);
    field("version", &package.version);
    field("author", &package.author);
    field("genre", &package.genre);
    field("date", &package.date);
    field("url", &package.url);
    field("source", &package.source_url);
    field("publisher", &package.publisher);
    field("companion", &package.companion);
    if global.verbose {
        field("description", &package.description);
        for c in &package.contributors {
            println!("{:12} {} ({})", "contributor", c.name, c.contributions.join(", "));
        }
    }

    println!("{} binaries:", package.binaries.len());
    for (i, b) in package.binaries.iter().enumerate() {
        let pages = hex::decode(&b.hex).map(|d| d.pages.page_count());
        println!("- {}: {}{}, {} flash pages, {} bytes data, {} bytes save{}",
            i,
            b.device,
            b.title.as_ref().map(|t| format!(" \"{}\"", t)).unwrap_or_default(),
            pages.map_or_else(|e| format!("bad hex ({})", e), |n| n.to_string()),
            b.data.len(),
            b.save.len(),
            if b.cart_image.is_some() { ", title screen" } else { "" });
    }
    Ok(())
}

#[derive(Parser)]
struct FromSlotArgs {
    /// Device name to record for the binary.
    #[clap(long, default_value = DEFAULT_DEVICE)]
    target: String,

    /// Flashcart image to read.
    cart: PathBuf,
    /// Index of the slot to package, as listed by `fx info`.
    #[clap(parse(try_from_str = parse_usize))]
    slot: usize,
    /// Path for the `.arduboy` package.
    output: PathBuf,
}

fn cmd_from_slot(
    _global: &GlobalFlags,
    args: &FromSlotArgs,
) -> Result<()> {
    let cart = Cart::parse(&read_file(&args.cart)?)
        .with_context(|| format!("could not parse {}", args.cart.display()))?;
    let slot = cart.slots.get(args.slot)
        .with_context(|| format!("cart has {} slots", cart.slots.len()))?;
    let package = ArduboyPackage::from_slot(slot, &args.target)?;
    package.write(&args.output)
        .with_context(|| format!("could not write {}", args.output.display()))?;
    println!("wrote {}", args.output.display());
    Ok(())
}

#[derive(Parser)]
struct ToSlotArgs {
    #[clap(flatten)]
    output_opts: CompileOutput,

    /// Which of the package's binaries to use.
    #[clap(long, default_value = "0")]
    binary: usize,

    /// Slot index to insert at. Defaults to the end of the cart.
    #[clap(long)]
    position: Option<usize>,

    /// Where to write the new cart. Defaults to overwriting the input.
    #[clap(long, short)]
    output: Option<PathBuf>,

    /// Package to add.
    package: PathBuf,
    /// Flashcart image to add it to.
    cart: PathBuf,
}

fn cmd_to_slot(
    _global: &GlobalFlags,
    args: &ToSlotArgs,
) -> Result<()> {
    let package = ArduboyPackage::read(&args.package)
        .with_context(|| format!("could not load {}", args.package.display()))?;
    let slot = package.to_slot(args.binary)?;
    let mut cart = Cart::parse(&read_file(&args.cart)?)
        .with_context(|| format!("could not parse {}", args.cart.display()))?;

    let position = args.position.unwrap_or(cart.slots.len());
    if position > cart.slots.len() {
        bail!("cart has {} slots, can't insert at {}", cart.slots.len(), position);
    }
    println!("inserting \"{}\" at slot {}", slot.meta.title, position);
    cart.slots.insert(position, slot);
    cart.renumber()?;

    let compiled = cart.compile(&args.output_opts.options())?;
    args.output_opts.write(&compiled, args.output.as_ref().unwrap_or(&args.cart))
}

///////////////////////////////////////////////////////////////////////
// update

#[derive(Parser)]
struct UpdateArgs {
    /// Device whose builds to compare against.
    #[clap(long, default_value = DEFAULT_DEVICE)]
    target: String,

    /// Flashcart image to check.
    cart: PathBuf,
    /// Catalog JSON, as downloaded from the game list.
    catalog: PathBuf,
}

fn cmd_update(
    global: &GlobalFlags,
    args: &UpdateArgs,
) -> Result<()> {
    let cart = Cart::parse(&read_file(&args.cart)?)
        .with_context(|| format!("could not parse {}", args.cart.display()))?;
    let json = std::fs::read_to_string(&args.catalog)
        .with_context(|| format!("can't read catalog {}", args.catalog.display()))?;
    let catalog = update::parse_catalog(&json, &args.target)
        .with_context(|| format!("could not parse {}", args.catalog.display()))?;

    let plan = update::compute_update(&cart.slots, catalog);

    println!("{} updates available:", plan.updates.len());
    for (i, entry) in &plan.updates {
        let local = &cart.slots[*i].meta;
        println!("  {:>4} {} {} -> {}", i, entry.title,
            if local.version.is_empty() { "?" } else { &local.version },
            entry.version);
    }
    println!("{} games up to date", plan.current.len());
    if global.verbose {
        for (i, entry) in &plan.current {
            println!("  {:>4} {} {}", i, entry.title, entry.version);
        }
    }
    println!("{} games not in the catalog", plan.unmatched.len());
    for i in &plan.unmatched {
        println!("  {:>4} {}", i, cart.slots[*i].meta.title);
    }
    println!("{} catalog games not on the cart", plan.new.len());
    if global.verbose {
        for entry in &plan.new {
            println!("       {} by {} ({})", entry.title, entry.developer, entry.version);
        }
    }
    Ok(())
}

///////////////////////////////////////////////////////////////////////
// Clap helper functions. Out of the box, Clap does not appear to be able to
// parse numbers with a base prefix. So, let's fix that.

fn parse_u32(s: &str) -> Result<u32> {
    parse_with_prefix(s, u32::from_str_radix)
}

fn parse_u16(s: &str) -> Result<u16> {
    parse_with_prefix(s, u16::from_str_radix)
}

fn parse_u8(s: &str) -> Result<u8> {
    parse_with_prefix(s, u8::from_str_radix)
}

fn parse_usize(s: &str) -> Result<usize> {
    parse_with_prefix(s, usize::from_str_radix)
}

fn parse_with_prefix<T>(
    s: &str,
    parse_radix: impl FnOnce(&str, u32) -> Result<T, std::num::ParseIntError>,
) -> Result<T> {
    if let Some(digits) = s.strip_prefix("0x") {
        parse_radix(digits, 16)
            .context("has hex prefix 0x but is not a hex number")
    } else if let Some(digits) = s.strip_prefix("0b") {
        parse_radix(digits, 2)
            .context("has binary prefix 0b but is not a binary number")
    } else {
        parse_radix(s, 10)
            .context("expected decimal number or 0x/0b prefix")
    }
}

fn parse_contrast(s: &str) -> Result<u8> {
    match s {
        "normal" => Ok(patch::CONTRAST_NORMAL),
        "dim" => Ok(patch::CONTRAST_DIM),
        "dimmer" => Ok(patch::CONTRAST_DIMMER),
        "dimmest" => Ok(patch::CONTRAST_DIMMEST),
        "highest" => Ok(patch::CONTRAST_HIGHEST),
        _ => parse_u8(s)
            .with_context(|| format!("can't parse {} as a contrast name or number", s)),
    }
}
