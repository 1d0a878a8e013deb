// SPDX-License-Identifier: AGPL-3.0-only

//! `xgemm`: command-line interface for the FPGA GEMM accelerator.
//!
//! ```text
//! USAGE:
//!   xgemm probe                      Map the windows, print status and registers
//!   xgemm reset                      Hard reset the core back to idle
//!   xgemm layout --m M --n N --k K   Show where A, B, C land (no hardware)
//!   xgemm selftest [--compute]       Window loopback, optionally a block GEMM
//! ```
//!
//! The memory file defaults to `/dev/mem` (or `XGEMM_MEM_PATH`).

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use xgemm_chip::reference;
use xgemm_driver::chip::{Port, ProtocolFlavor, WindowId};
use xgemm_driver::placement::Placement;
use xgemm_driver::{DeviceConfig, Dims, PollPolicy, XgemmDevice};

#[derive(Parser)]
#[command(name = "xgemm", about = "FPGA GEMM accelerator CLI", version)]
struct Cli {
    /// Memory file giving access to physical addresses.
    #[arg(long, global = true)]
    mem: Option<PathBuf>,

    /// Control register protocol of the loaded bitstream.
    #[arg(long, global = true, value_enum, default_value_t = Flavor::ApCtrl)]
    flavor: Flavor,

    /// Give up on the core after this many milliseconds.
    #[arg(long, global = true, default_value_t = 1000)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Clone, Copy, ValueEnum)]
enum Flavor {
    /// HLS ap_start / ap_done / ap_idle.
    ApCtrl,
    /// Self-clearing reset + data-ready.
    SelfClear,
}

impl From<Flavor> for ProtocolFlavor {
    fn from(flavor: Flavor) -> Self {
        match flavor {
            Flavor::ApCtrl => Self::ApCtrl,
            Flavor::SelfClear => Self::SelfClear,
        }
    }
}

#[derive(Subcommand)]
enum Cmd {
    /// Map every window, report readiness and dump the control registers.
    Probe,
    /// Write the control register back to idle, discarding in-flight work.
    Reset,
    /// Print the placement of a whole-matrix problem in the operand space.
    Layout {
        /// Rows of A and C.
        #[arg(long)]
        m: usize,
        /// Columns of B and C.
        #[arg(long)]
        n: usize,
        /// Columns of A, rows of B.
        #[arg(long)]
        k: usize,
        /// Element width in bytes.
        #[arg(long, default_value_t = 2)]
        elem_bytes: usize,
    },
    /// Write and verify every operand window; with --compute, run one block per port.
    Selftest {
        /// Block edge S.
        #[arg(long, default_value_t = 16)]
        block: usize,
        /// Also run a block GEMM and compare against the CPU reference.
        #[arg(long)]
        compute: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();

    let mut config = DeviceConfig::from_env()
        .with_flavor(cli.flavor.into())
        .with_poll(PollPolicy::timeout(Duration::from_millis(cli.timeout_ms)));
    if let Some(mem) = cli.mem {
        config = config.with_mem_path(mem);
    }

    match cli.command {
        Cmd::Probe => cmd_probe(config)?,
        Cmd::Reset => cmd_reset(config)?,
        Cmd::Layout { m, n, k, elem_bytes } => cmd_layout(&config, Dims::new(m, n, k), elem_bytes)?,
        Cmd::Selftest { block, compute } => cmd_selftest(config, block, compute)?,
    }

    Ok(())
}

fn open(config: DeviceConfig) -> Result<XgemmDevice> {
    let path = config.mem_path.clone();
    XgemmDevice::initialize(config).with_context(|| format!("initialising accelerator via {}", path.display()))
}

fn cmd_probe(config: DeviceConfig) -> Result<()> {
    let mut dev = open(config)?;
    let config = dev.config().clone();

    println!("Memory file : {}", config.mem_path.display());
    println!("Protocol    : {}", config.flavor);
    for id in WindowId::ALL {
        let w = config.layout.window(id);
        println!("  {:<8} {:#012x}..{:#012x}  ({} KiB)", id.to_string(), w.base, w.end(), w.size / 1024);
    }
    println!("Ready       : {}", dev.is_ready());
    println!("Done        : {}", dev.is_done());
    println!();
    println!("Registers:");
    for (name, value) in dev.registers()? {
        println!("  {name:<10} {value:#010x}");
    }

    dev.shutdown();
    Ok(())
}

fn cmd_reset(config: DeviceConfig) -> Result<()> {
    let mut dev = open(config)?;
    dev.reset()?;
    println!("Reset issued. Ready: {}", dev.is_ready());
    dev.shutdown();
    Ok(())
}

fn cmd_layout(config: &DeviceConfig, dims: Dims, elem_bytes: usize) -> Result<()> {
    if elem_bytes == 0 {
        bail!("element width must be non-zero");
    }
    let space = config.gemm_address_space(elem_bytes);
    let counts = [dims.m * dims.k, dims.k * dims.n, dims.m * dims.n];
    let layout = space.pack(0, counts)?;

    println!(
        "Operand space: {} elements of {elem_bytes} bytes over {:?}",
        space.capacity(),
        config.gemm_space
    );
    for (name, placement) in [("A", layout.a), ("B", layout.b), ("C", layout.c)] {
        print_placement(name, &placement);
    }
    println!("Free after C: {} elements", space.capacity() - layout.c.end());
    Ok(())
}

fn print_placement(name: &str, p: &Placement) {
    print!("  {name}  {:>8}..{:<8}", p.start(), p.end());
    for segment in p.segments() {
        print!("  {}[{}..{}]", segment.window, segment.offset, segment.offset + segment.len);
    }
    if p.is_split() {
        print!("  (split n0={} n1={})", p.head_len(), p.tail_len());
    }
    println!();
}

fn cmd_selftest(config: DeviceConfig, s: usize, compute: bool) -> Result<()> {
    if s == 0 {
        bail!("block edge must be non-zero");
    }
    let mut dev = open(config.with_verify_writes(true))?;
    let dims = Dims::new(s, s, s);

    let a = pattern(s * s, 1);
    let b = [pattern(s * s, 2), pattern(s * s, 3)];

    dev.write_block_a(s, s, &a).context("A window loopback")?;
    println!("A   ok");
    for port in Port::ALL {
        dev.write_block_b(s, s, &b[port.index()], port)
            .with_context(|| format!("B window loopback on {port}"))?;
        dev.write_block_c(s, s, &vec![0i32; s * s], port)
            .with_context(|| format!("C window loopback on {port}"))?;
        println!("{port} ok");
    }

    if compute {
        for port in Port::ALL {
            dev.start_block(dims, s, port)?;
            let mut got = vec![0i32; s * s];
            dev.read_result(s, s, &mut got, Some(port))?;

            let mut want = vec![0i32; s * s];
            reference::gemm_acc(s, s, s, &a, s, &b[port.index()], s, &mut want, s);
            let mismatches = got.iter().zip(&want).filter(|(g, w)| g != w).count();
            if mismatches > 0 {
                bail!("{port}: {mismatches} of {} results differ from the reference", s * s);
            }
            println!("{port} compute ok ({s}x{s}x{s})");
        }
    }

    dev.shutdown();
    println!("Self-test passed");
    Ok(())
}

fn pattern(len: usize, seed: usize) -> Vec<i16> {
    (0..len)
        .map(|i| i16::try_from((i * 31 + seed * 17) % 255).map_or(0, |v| v - 127))
        .collect()
}
