//! Build helper for hier-pubsub.
//!
//! The eBPF program needs a nightly toolchain, `-Z build-std=core` and
//! `bpf-linker`, so it lives outside the workspace and is built from here.
//!
//! Usage:
//!   cargo xtask build-ebpf [--release]
//!   cargo xtask build [--release]         # eBPF program and daemon
//!   cargo xtask test                      # host tests, data path included
//!   cargo xtask run [--release] -- <args> # build everything and run

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use clap::Parser;

const EBPF_CRATE: &str = "hier-pubsub-ebpf";
const DAEMON_CRATE: &str = "hier-pubsub";

#[derive(Parser)]
enum Cli {
    /// Build the eBPF program only.
    BuildEbpf {
        /// Build in release mode.
        #[arg(long)]
        release: bool,
    },
    /// Build everything (eBPF + userspace).
    Build {
        /// Build in release mode.
        #[arg(long)]
        release: bool,
    },
    /// Run the host test suites of the shared data path and the daemon.
    Test,
    /// Build everything and run the daemon.
    Run {
        /// Build in release mode.
        #[arg(long)]
        release: bool,
        /// Arguments to pass to the daemon (e.g. `--config`, `--dry-run`).
        #[arg(last = true)]
        args: Vec<String>,
    },
}

fn main() -> Result<()> {
    let root = workspace_root()?;

    match Cli::parse() {
        Cli::BuildEbpf { release } => build_ebpf(&root, release)?,
        Cli::Build { release } => {
            build_ebpf(&root, release)?;
            build_userspace(&root, release)?;
        }
        Cli::Test => cargo(
            &root,
            &["test", "-p", "hier-pubsub-common", "-p", DAEMON_CRATE],
            "host tests",
        )?,
        Cli::Run { release, args } => {
            build_ebpf(&root, release)?;
            build_userspace(&root, release)?;
            run_daemon(&root, release, &args)?;
        }
    }

    Ok(())
}

fn workspace_root() -> Result<PathBuf> {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map(Path::to_path_buf)
        .context("xtask must live inside the workspace")
}

fn profile(release: bool) -> &'static str {
    if release {
        "release"
    } else {
        "debug"
    }
}

/// Run `cargo` with `args` in `dir`, failing on a non-zero exit.
fn cargo(dir: &Path, args: &[&str], what: &str) -> Result<()> {
    println!("=> {}...", what);

    let status = Command::new("cargo")
        .current_dir(dir)
        .args(args)
        .status()
        .with_context(|| format!("running cargo for {}", what))?;

    if !status.success() {
        bail!("{} failed", what);
    }
    Ok(())
}

/// Build the eBPF program and copy it to `target/hier-pubsub-ebpf`.
///
/// This requires:
/// - `bpf-linker` installed: `cargo install bpf-linker`
/// - Nightly Rust for the BPF target: `rustup toolchain install nightly`
/// - BPF target: `rustup target add bpfel-unknown-none --toolchain nightly`
fn build_ebpf(root: &Path, release: bool) -> Result<()> {
    let ebpf_dir = root.join(EBPF_CRATE);

    let mut args = vec![
        "+nightly",
        "build",
        "--target=bpfel-unknown-none",
        "-Z",
        "build-std=core",
    ];
    if release {
        args.push("--release");
    }
    cargo(&ebpf_dir, &args, "eBPF build")?;

    let built = ebpf_dir
        .join("target")
        .join("bpfel-unknown-none")
        .join(profile(release))
        .join(EBPF_CRATE);
    if !built.exists() {
        bail!("eBPF build produced no binary at {}", built.display());
    }

    let dest = root.join("target").join(EBPF_CRATE);
    std::fs::create_dir_all(root.join("target"))?;
    std::fs::copy(&built, &dest).with_context(|| {
        format!(
            "copying eBPF binary from {} to {}",
            built.display(),
            dest.display()
        )
    })?;

    println!("   eBPF program: {}", dest.display());
    Ok(())
}

/// Build the userspace daemon.
fn build_userspace(root: &Path, release: bool) -> Result<()> {
    let mut args = vec!["build", "-p", DAEMON_CRATE];
    if release {
        args.push("--release");
    }
    cargo(root, &args, "userspace build")
}

/// Run the daemon with the freshly built eBPF program.
fn run_daemon(root: &Path, release: bool, extra_args: &[String]) -> Result<()> {
    let binary = root.join("target").join(profile(release)).join(DAEMON_CRATE);
    let ebpf_program = root.join("target").join(EBPF_CRATE);

    println!("=> Running {}...", DAEMON_CRATE);

    let status = Command::new(&binary)
        .arg("--ebpf-program")
        .arg(&ebpf_program)
        .args(extra_args)
        .status()
        .with_context(|| format!("running {}", binary.display()))?;

    if !status.success() {
        bail!("{} exited with error", DAEMON_CRATE);
    }

    Ok(())
}
