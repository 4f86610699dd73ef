//! sflterm CLI - Serial firmware loader terminal for SFL bootloaders.
//!
//! ## Features
//!
//! - Interactive duplex terminal over serial or a JTAG scan-chain tunnel
//! - Autonomous firmware upload when the bootloader requests it
//! - Non-interactive push-and-boot mode
//! - Serial port discovery
//! - Shell completion generation

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{Shell, generate};
use console::style;
use env_logger::Env;
use log::{debug, info, warn};
use sflterm::{
    DEFAULT_BRIDGE_ADDR, DEFAULT_TAP, Link, MAGIC_ACK, MagicDetector, SerialLink, Session,
    SessionConfig, Transport, Uploader,
};
use std::io::{self, Write as _};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use std::{env, fs, thread};

mod terminal;

use terminal::{CrosstermKeys, RawModeGuard, RawWriter};

/// Set by the Ctrl-C handler; long loops poll it.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// sflterm - serial firmware loader terminal for SFL bootloaders.
///
/// Environment variables:
///   SFLTERM_PORT    - Default serial port
///   SFLTERM_BAUD    - Default baud rate (default: 115200)
///   SFLTERM_BRIDGE  - Debug-probe bridge address (default: 127.0.0.1:6666)
///   SFLTERM_TAP     - Scan-chain TAP name (default: xc6s.tap)
#[derive(Parser)]
#[command(name = "sflterm")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Serial port to use (first available port if not specified).
    #[arg(short, long, global = true, env = "SFLTERM_PORT")]
    port: Option<String>,

    /// Serial baud rate.
    #[arg(
        short,
        long,
        global = true,
        default_value = "115200",
        env = "SFLTERM_BAUD"
    )]
    baud: u32,

    /// Debug-probe bridge address for the jtag transport.
    #[arg(
        long,
        global = true,
        default_value = DEFAULT_BRIDGE_ADDR,
        env = "SFLTERM_BRIDGE"
    )]
    bridge: String,

    /// Scan-chain TAP name for the jtag transport.
    #[arg(long, global = true, default_value = DEFAULT_TAP, env = "SFLTERM_TAP")]
    tap: String,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

/// How to reach the bootloader.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum LinkKind {
    /// Direct serial connection.
    Serial,
    /// JTAG scan-chain tunnel through a debug-probe bridge.
    Jtag,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Open an interactive terminal, answering firmware requests.
    Term {
        /// Connection type.
        #[arg(value_enum)]
        kind: LinkKind,

        /// Firmware image to deliver when the bootloader asks for one.
        #[arg(long)]
        kernel: Option<PathBuf>,

        /// Memory address the image is loaded at.
        #[arg(long, value_parser = parse_hex_u32, default_value = "0x40000000")]
        kernel_addr: u32,

        /// Execution entry address (defaults to the load address).
        #[arg(long, value_parser = parse_hex_u32)]
        entry_addr: Option<u32>,
    },

    /// Upload a firmware image and boot it, without a terminal.
    Load {
        /// Connection type.
        #[arg(value_enum)]
        kind: LinkKind,

        /// Firmware image to upload.
        #[arg(long, required = true)]
        kernel: PathBuf,

        /// Memory address the image is loaded at.
        #[arg(long, value_parser = parse_hex_u32, default_value = "0x40000000")]
        kernel_addr: u32,

        /// Execution entry address (defaults to the load address).
        #[arg(long, value_parser = parse_hex_u32)]
        entry_addr: Option<u32>,

        /// Upload immediately instead of waiting for the boot request.
        #[arg(long)]
        no_wait: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions.
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Parse hexadecimal address (supports 0x prefix and underscores).
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    // Support underscore separators like 0x40_00_00_00
    let s: String = s.chars().filter(|c| *c != '_').collect();
    u32::from_str_radix(&s, 16).map_err(|e| format!("Invalid hex address: {e}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            _ => "debug",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    if env::var("NO_COLOR").is_ok() {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed))
        .context("Failed to install Ctrl-C handler")?;

    debug!(
        "sflterm v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    match &cli.command {
        Commands::Term {
            kind,
            kernel,
            kernel_addr,
            entry_addr,
        } => cmd_term(&cli, *kind, kernel.clone(), *kernel_addr, *entry_addr),
        Commands::Load {
            kind,
            kernel,
            kernel_addr,
            entry_addr,
            no_wait,
        } => cmd_load(&cli, *kind, kernel, *kernel_addr, *entry_addr, *no_wait),
        Commands::ListPorts { json } => cmd_list_ports(*json),
        Commands::Completions { shell } => {
            cmd_completions(*shell);
            Ok(())
        }
    }
}

/// Pick the serial port: explicit flag first, else the first one found.
fn resolve_port(port: Option<&str>) -> Result<String> {
    if let Some(port) = port {
        return Ok(port.to_string());
    }
    let ports = SerialLink::list_ports().context("Failed to list serial ports")?;
    let first = ports
        .first()
        .context("No serial ports found; specify one with --port")?;
    info!("auto-selected serial port {}", first.port_name);
    Ok(first.port_name.clone())
}

/// Open the requested transport.
fn open_link(cli: &Cli, kind: LinkKind) -> Result<Link> {
    match kind {
        LinkKind::Serial => {
            let port = resolve_port(cli.port.as_deref())?;
            if !cli.quiet {
                eprintln!(
                    "{} Using {} at {} baud",
                    style("🔌").cyan(),
                    style(&port).green(),
                    cli.baud
                );
            }
            Link::open_serial(&port, cli.baud)
                .with_context(|| format!("Failed to open serial port {port}"))
        }
        LinkKind::Jtag => {
            if !cli.quiet {
                eprintln!(
                    "{} Using debug bridge {} (tap {})",
                    style("🔌").cyan(),
                    style(&cli.bridge).green(),
                    cli.tap
                );
            }
            Link::open_jtag(&cli.bridge, &cli.tap)
                .with_context(|| format!("Failed to connect to bridge {}", cli.bridge))
        }
    }
}

/// Interactive terminal command implementation.
fn cmd_term(
    cli: &Cli,
    kind: LinkKind,
    kernel: Option<PathBuf>,
    kernel_addr: u32,
    entry_addr: Option<u32>,
) -> Result<()> {
    let link = open_link(cli, kind)?;

    if !cli.quiet {
        if let Some(ref image) = kernel {
            eprintln!(
                "{} Serving {} at {:#010x} on boot requests",
                style("📦").cyan(),
                image.display(),
                kernel_addr
            );
        }
        eprintln!("{}", style("Press Ctrl+C to exit.").dim());
    }

    let config = SessionConfig {
        image: kernel,
        load_address: kernel_addr,
        entry_address: entry_addr.unwrap_or(kernel_addr),
    };

    let quit = Arc::new(AtomicBool::new(false));
    let mut session = Session::new(link, config);

    let raw_guard = RawModeGuard::enable().context("Failed to enable raw terminal mode")?;
    session.start(
        Box::new(RawWriter::new(io::stdout())),
        Box::new(CrosstermKeys::new(Arc::clone(&quit))),
    )?;

    // Supervise: leave when the user quits or the reader dies.
    while session.reader_alive() && !quit.load(Ordering::Relaxed) && !was_interrupted() {
        thread::sleep(Duration::from_millis(50));
    }

    session.stop();
    session.join_writer()?;

    // The reader observes the flag at its next poll; give it a moment.
    for _ in 0..20 {
        if !session.reader_alive() {
            break;
        }
        thread::sleep(Duration::from_millis(50));
    }
    let session_result = if session.reader_alive() {
        warn!("reader is still blocked on the transport, abandoning it");
        Ok(())
    } else {
        session.join()
    };
    session.close()?;
    drop(raw_guard);

    if !cli.quiet {
        eprintln!("\n{} Terminal closed.", style("👋").cyan());
    }
    session_result.map_err(|e| anyhow::anyhow!(e).context("Session ended with an error"))
}

/// Non-interactive upload command implementation.
fn cmd_load(
    cli: &Cli,
    kind: LinkKind,
    kernel: &PathBuf,
    kernel_addr: u32,
    entry_addr: Option<u32>,
    no_wait: bool,
) -> Result<()> {
    let image = fs::read(kernel)
        .with_context(|| format!("Failed to read firmware image {}", kernel.display()))?;
    if !cli.quiet {
        eprintln!(
            "{} {} ({} bytes) -> {:#010x}",
            style("📦").cyan(),
            kernel.display(),
            image.len(),
            kernel_addr
        );
    }

    let mut link = open_link(cli, kind)?;

    if !no_wait {
        if !cli.quiet {
            eprintln!(
                "{} Waiting for the device to request firmware (reset it now)...",
                style("⏳").yellow()
            );
        }
        wait_for_boot_request(&mut link)?;
        link.send(MAGIC_ACK)?;
    }

    let pb = if cli.quiet {
        indicatif::ProgressBar::hidden()
    } else {
        let pb = indicatif::ProgressBar::new(image.len() as u64);
        #[allow(clippy::unwrap_used)] // Static template string
        pb.set_style(
            indicatif::ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes}",
                )
                .unwrap()
                .progress_chars("#>-"),
        );
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb
    };

    let start = Instant::now();
    let sent = Uploader::new(&mut link)
        .upload(&image, kernel_addr, |done, _| {
            pb.set_position(done as u64);
        })
        .context("Upload failed")?;
    pb.finish_and_clear();

    let elapsed = start.elapsed().as_secs_f64();
    if !cli.quiet {
        #[allow(clippy::cast_precision_loss)]
        let rate = sent as f64 / (elapsed.max(f64::EPSILON) * 1024.0);
        eprintln!(
            "{} Uploaded {} bytes ({:.1} KB/s)",
            style("✓").green(),
            sent,
            rate
        );
    }

    let entry = entry_addr.unwrap_or(kernel_addr);
    Uploader::new(&mut link)
        .boot(entry)
        .context("Boot command failed")?;
    if !cli.quiet {
        eprintln!("{} Booting at {:#010x}", style("🚀").green(), entry);
    }

    link.close()?;
    Ok(())
}

/// Echo device output until the boot request shows up.
fn wait_for_boot_request(link: &mut Link) -> Result<()> {
    let mut detector = MagicDetector::new();
    let mut stdout = io::stdout();
    loop {
        if was_interrupted() {
            anyhow::bail!("Interrupted while waiting for the boot request");
        }
        if let Some(byte) = link.poll_byte()? {
            let shown = if byte == b'\r' { b'\n' } else { byte };
            stdout.write_all(&[shown])?;
            stdout.flush()?;
            if detector.push(byte) {
                return Ok(());
            }
        }
    }
}

/// List ports command implementation.
fn cmd_list_ports(json: bool) -> Result<()> {
    let ports = SerialLink::list_ports().context("Failed to list serial ports")?;

    if json {
        let entries: Vec<serde_json::Value> = ports
            .iter()
            .map(|p| {
                let (vid, pid, manufacturer, product, serial) = match &p.port_type {
                    serialport::SerialPortType::UsbPort(info) => (
                        Some(info.vid),
                        Some(info.pid),
                        info.manufacturer.clone(),
                        info.product.clone(),
                        info.serial_number.clone(),
                    ),
                    _ => (None, None, None, None, None),
                };
                serde_json::json!({
                    "name": p.port_name,
                    "vid": vid,
                    "pid": pid,
                    "manufacturer": manufacturer,
                    "product": product,
                    "serial": serial,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&entries).unwrap_or_default()
        );
        return Ok(());
    }

    eprintln!("{}", style("Available serial ports:").bold().underlined());
    if ports.is_empty() {
        eprintln!("  {}", style("none found").dim());
    } else {
        for port in &ports {
            match &port.port_type {
                serialport::SerialPortType::UsbPort(info) => {
                    let product = info.product.as_deref().unwrap_or("");
                    eprintln!(
                        "  {} {} ({:04X}:{:04X}){}",
                        style("•").green(),
                        style(&port.port_name).cyan(),
                        info.vid,
                        info.pid,
                        if product.is_empty() {
                            String::new()
                        } else {
                            format!(" - {}", style(product).dim())
                        }
                    );
                }
                _ => {
                    eprintln!(
                        "  {} {}",
                        style("•").green(),
                        style(&port.port_name).cyan()
                    );
                }
            }
        }
    }
    Ok(())
}

/// Generate shell completions.
fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
}
