//! Build, run and screenshot-test a UEFI application in QEMU.
//!
//! `run` (the default) builds the guest, stages it on an ESP, boots it with
//! OVMF and answers its `SCREENSHOT:` directives until QEMU exits.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use vm_test_harness::qemu::EXPECTED_FAILURE_CODE;
use vm_test_harness::{find_ovmf, BootMedia, ExitClass, GuestBuild, HarnessConfig};

#[derive(Parser)]
#[command(name = "vm-test-harness")]
#[command(about = "Build and run a UEFI test application in QEMU with screenshot checks")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// TOML config file (flags override its values)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print commands before executing them
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Run QEMU without a display window
    #[arg(long, global = true)]
    headless: bool,

    /// Build the guest in release mode
    #[arg(long, global = true)]
    release: bool,

    /// Directory containing OVMF_CODE.fd and OVMF_VARS.fd
    #[arg(long, global = true)]
    ovmf_dir: Option<PathBuf>,

    /// QEMU executable to use
    #[arg(long, global = true)]
    qemu: Option<String>,

    /// Don't pass --enable-kvm to QEMU
    #[arg(long, global = true)]
    no_kvm: bool,

    /// Save captures as new references when none exist yet
    #[arg(long, global = true)]
    record_missing: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the guest and stage it on the ESP
    Build,
    /// Build, then boot in QEMU and run the tests (default)
    Run,
    /// Run clippy on the guest workspace
    Clippy,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Build => {
            let esp = GuestBuild::new(&config).build()?;
            println!("{} {}", "Staged ESP:".green(), esp.display());
            Ok(())
        }
        Commands::Clippy => Ok(GuestBuild::new(&config).clippy()?),
        Commands::Run => run_tests(&config),
    }
}

fn load_config(cli: &Cli) -> Result<HarnessConfig> {
    let mut config = match &cli.config {
        Some(path) => HarnessConfig::from_file(path)
            .with_context(|| format!("Loading config {}", path.display()))?,
        None => HarnessConfig::default(),
    };

    config.verbose |= cli.verbose;
    config.headless |= cli.headless;
    config.release |= cli.release;
    config.record_missing_references |= cli.record_missing;
    if cli.no_kvm {
        config.kvm = false;
    }
    if let Some(dir) = &cli.ovmf_dir {
        config.ovmf_dir = Some(dir.clone());
    }
    if let Some(qemu) = &cli.qemu {
        config.qemu_binary = qemu.clone();
    }
    Ok(config)
}

fn run_tests(config: &HarnessConfig) -> Result<()> {
    println!("{}", "UEFI Screenshot Tests".bold());
    println!();

    let esp = GuestBuild::new(config)
        .build()
        .context("Building the guest")?;
    let ovmf = find_ovmf(config.ovmf_dir.as_deref(), &config.workspace_dir)
        .context("UEFI boot requires OVMF")?;

    println!("  OVMF code: {}", ovmf.code.display());
    println!("  OVMF vars: {}", ovmf.vars.display());
    println!("  ESP:       {}", esp.display());
    println!("  Refs:      {}", config.reference_dir.display());
    println!();

    let media = BootMedia { ovmf, esp };
    let report = vm_test_harness::run(config, &media)?;

    println!();
    println!("{}", "━".repeat(60));
    println!();

    if report.passed() {
        match report.exit_class {
            ExitClass::ExpectedTestFailure => println!(
                "{} Guest flagged an expected test failure (exit code {}), {} screenshots checked",
                "✓".yellow().bold(),
                EXPECTED_FAILURE_CODE,
                report.directives
            ),
            _ => println!(
                "{} All tests passed, {} screenshots checked",
                "✓".green().bold(),
                report.directives
            ),
        }
    } else {
        match (report.exit_class.is_success(), report.exit_code) {
            (true, _) => {}
            (false, Some(code)) => {
                println!("    {} QEMU exited with error code {}", "✗".red(), code)
            }
            (false, None) => println!("    {} QEMU was killed", "✗".red()),
        }
        for failure in &report.failures {
            println!("    {} {}", "✗".red(), failure);
        }
        println!("{} Tests failed", "✗".red().bold());
    }

    report.into_result()?;
    Ok(())
}
