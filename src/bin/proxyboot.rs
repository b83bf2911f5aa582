//! proxyboot CLI tool
//!
//! Loads a Linux kernel, device tree and initramfs onto a target running the
//! proxy stub, and boots it.

use std::path::PathBuf;
use std::process;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use proxyboot::boot::{BootPlan, Compression, Orchestrator};
use proxyboot::config::{DEFAULT_BAUD, DEFAULT_DEVICE, DEVICE_ENV};
use proxyboot::sim::SimTarget;
use proxyboot::{Error, Proxy, Session, SessionConfig};

#[derive(Parser)]
#[command(name = "proxyboot", version, about = "Boot Linux on a target through its serial proxy stub")]
struct Cli {
    /// Serial device the proxy stub listens on
    #[arg(long, global = true, env = DEVICE_ENV, default_value = DEFAULT_DEVICE)]
    device: PathBuf,

    /// Link speed
    #[arg(long, global = true, default_value_t = DEFAULT_BAUD)]
    baud: u32,

    /// Reply timeout in seconds
    #[arg(long, global = true, default_value_t = 3.0)]
    timeout: f64,

    /// Assumed link throughput in bytes per second (default: baud / 10)
    #[arg(long, global = true)]
    throughput: Option<u64>,

    /// Debug logging for every category
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Run against a simulated target instead of the serial device
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load and boot a Linux kernel
    Linux {
        /// Kernel image
        payload: PathBuf,
        /// Device tree blob
        dtb: PathBuf,
        /// Initramfs image
        initramfs: Option<PathBuf>,
        /// Kernel image compression
        #[arg(long, default_value = "auto", value_parser = ["auto", "none", "gz", "xz"])]
        compression: String,
        /// Kernel command line
        #[arg(short, long, value_name = "boot arguments")]
        bootargs: Option<String>,
        /// Serial device for the console after boot (default: the proxy device)
        #[arg(short, long)]
        tty: Option<PathBuf>,
        /// Save the patched device tree here
        #[arg(short, long)]
        retrieve: Option<PathBuf>,
        /// Load u-boot after linux and boot into it
        #[arg(short, long = "u-boot")]
        u_boot: Option<PathBuf>,
    },
    /// Busy-wait on the target timer and report how long it took
    Udelay {
        /// Microseconds to wait
        #[arg(long, default_value_t = 1_000_000)]
        usec: u32,
    },
    /// Show the proxy base address and boot args
    Info,
}

fn main() {
    let cli = Cli::parse();
    proxyboot::debug::init(cli.verbose);

    if let Err(e) = run(cli) {
        if let Some(Error::DeviceTreePrepare(status)) = e.downcast_ref::<Error>() {
            log::debug!("prepare status {}", status);
            println!("DT prepare failed");
            process::exit(1);
        }
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn reply_timeout(secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs.max(0.001))
        .with_context(|| format!("invalid timeout {} s", secs))
}

fn run(cli: Cli) -> Result<()> {
    let mut builder = SessionConfig::builder()
        .device(&cli.device)
        .baud(cli.baud)
        .response_timeout(reply_timeout(cli.timeout)?);
    if let Some(throughput) = cli.throughput {
        builder = builder.throughput(throughput);
    }
    let config = builder.build()?;

    let proxy = connect(&config, cli.dry_run)?;
    let mut session = Session::new(proxy, config)?;

    match cli.command {
        Command::Linux {
            payload,
            dtb,
            initramfs,
            compression,
            bootargs,
            tty,
            retrieve,
            u_boot,
        } => {
            let compression: Compression = compression.parse()?;
            let mut plan = BootPlan::from_files(&payload, &dtb, initramfs.as_deref())
                .context("reading boot images")?
                .compression(compression);
            if let Some(bootargs) = bootargs {
                plan = plan.bootargs(bootargs);
            }
            if let Some(path) = retrieve {
                plan = plan.retrieve_to(path);
            }
            if let Some(path) = u_boot {
                plan = plan.u_boot(proxyboot::boot::read_payload(&path)?);
            }

            Orchestrator::new(&mut session).boot(&plan)?;

            match tty {
                Some(tty) if !cli.dry_run => console_on(&tty, cli.baud)?,
                _ => session.attach_console()?,
            }
        }
        Command::Udelay { usec } => {
            let mut timer = session.timer()?;
            timer.enable()?;
            let start = Instant::now();
            let ticks = timer.delay(usec)?;
            let elapsed = start.elapsed();
            println!(
                "udelay({}) took {:?} on the host, {} target ticks",
                usec, elapsed, ticks
            );
        }
        Command::Info => {
            println!("Proxy base: {:#x}", session.base()?);
            println!("Boot args:");
            println!("{}", session.boot_args()?);
        }
    }

    Ok(())
}

fn connect(config: &SessionConfig, dry_run: bool) -> Result<Box<dyn Proxy>> {
    if dry_run {
        log::info!("dry run: using a simulated target");
        return Ok(Box::new(SimTarget::new()));
    }
    open_uart(config)
}

#[cfg(unix)]
fn open_uart(config: &SessionConfig) -> Result<Box<dyn Proxy>> {
    use proxyboot::transport::SerialPort;
    use proxyboot::UartProxy;

    let link = SerialPort::open(&config.device, config.baud, config.response_timeout)
        .with_context(|| format!("opening {}", config.device.display()))?;
    let proxy = UartProxy::connect(link)
        .with_context(|| format!("no proxy stub answering on {}", config.device.display()))?;
    Ok(Box::new(proxy))
}

#[cfg(not(unix))]
fn open_uart(_config: &SessionConfig) -> Result<Box<dyn Proxy>> {
    anyhow::bail!("serial devices are only supported on unix hosts; use --dry-run")
}

#[cfg(unix)]
fn console_on(tty: &std::path::Path, baud: u32) -> Result<()> {
    use proxyboot::console::{self, RawTerminal};
    use proxyboot::transport::SerialPort;

    let mut link = SerialPort::open(tty, baud, Duration::from_millis(200))
        .with_context(|| format!("opening console {}", tty.display()))?;
    let _raw = RawTerminal::enable();
    console::passthrough(&mut link, std::io::stdin(), std::io::stdout())?;
    Ok(())
}

#[cfg(not(unix))]
fn console_on(_tty: &std::path::Path, _baud: u32) -> Result<()> {
    anyhow::bail!("serial devices are only supported on unix hosts")
}
