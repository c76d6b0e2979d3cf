use anyhow::{Context, Result};
use clap::Parser;
use std::process::Command;

#[derive(Parser)]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Parser)]
enum Cmd {
    /// Compile the kernel probes into an object file the agent can load
    BuildEbpf {
        #[arg(long, default_value = "bpfel-unknown-none")]
        target: String,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Cmd::BuildEbpf { target } => build_ebpf(&target)?,
    }

    Ok(())
}

fn build_ebpf(target: &str) -> Result<()> {
    // Debug builds pull in formatting code the BPF linker rejects
    let status = Command::new("cargo")
        .arg("+nightly")
        .arg("build")
        .arg("--package")
        .arg("tailtrace-ebpf")
        .arg("--target")
        .arg(target)
        .arg("-Z")
        .arg("build-std=core")
        .arg("--release")
        .status()
        .context("Failed to build eBPF program")?;

    if !status.success() {
        anyhow::bail!("Failed to build eBPF program");
    }

    println!("✓ eBPF probes built successfully");
    println!("  Object: target/{target}/release/tailtrace");
    println!("  Load with: sudo tailtrace --source ebpf --object target/{target}/release/tailtrace");

    Ok(())
}
