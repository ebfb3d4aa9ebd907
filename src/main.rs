use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::io;
use std::path::PathBuf;
use std::process;

use minikvm::vmm::boot;
use minikvm::{run_vm, LaunchConfig, SerialConsole};


/// Boot a raw real-mode payload on one KVM vCPU and echo its COM1 output.
#[derive(Parser, Debug)]
#[command(name = "minikvm", version)]
struct Args {
    /// JSON launch config (defaults: slot 0, 4 KiB at 0x1000, rax=rbx=2)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Raw payload, loaded at the region base (default: built-in "'0'+al+bl" printer)
    #[arg(long)]
    payload: Option<PathBuf>,

    /// Initial RAX
    #[arg(long)]
    rax: Option<u64>,

    /// Initial RBX
    #[arg(long)]
    rbx: Option<u64>,
}


fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run(Args::parse()) {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}


fn run(args: Args) -> Result<()> {
    let mut cfg = match &args.config {
        Some(path) => LaunchConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => LaunchConfig::default(),
    };
    if let Some(p) = args.payload {
        cfg.payload = Some(p);
    }
    if let Some(rax) = args.rax {
        cfg.registers.rax = rax;
    }
    if let Some(rbx) = args.rbx {
        cfg.registers.rbx = rbx;
    }

    let payload = boot::read_payload(cfg.payload.as_deref()).context("reading payload")?;
    let mut console = SerialConsole::new(cfg.console_port, io::stdout());
    let res = run_vm(&cfg, &payload, &mut console).map_err(|e| {
        let kind = e.kind();
        anyhow::Error::new(e).context(kind)
    })?;

    info!("guest halted cleanly after {} I/O exits", res.io_exits);
    Ok(())
}
