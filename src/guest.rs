//! Guest build and EFI system partition staging.
//!
//! The guest is a UEFI application built with cargo. QEMU mounts the staged
//! ESP directory as a FAT drive, and OVMF boots `EFI/Boot/BootX64.efi`.

use crate::config::{HarnessConfig, GUEST_TARGET};
use crate::error::{HarnessError, Result};
use colored::Colorize;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Subset of `cargo metadata` output we need.
#[derive(Debug, Deserialize)]
struct CargoMetadata {
    target_directory: PathBuf,
}

/// Cargo invocations for the guest workspace.
pub struct GuestBuild<'a> {
    config: &'a HarnessConfig,
}

impl<'a> GuestBuild<'a> {
    pub fn new(config: &'a HarnessConfig) -> Self {
        Self { config }
    }

    /// Build the guest and copy it into the ESP. Returns the ESP directory.
    pub fn build(&self) -> Result<PathBuf> {
        let mut args = vec!["build"];
        if self.config.release {
            args.push("--release");
        }
        self.cargo(&args)?;

        let target_dir = self.target_dir()?;
        let built = self
            .build_dir(&target_dir)
            .join(format!("{}.efi", self.config.guest_binary));
        let esp = self.esp_dir(&target_dir);
        stage_esp(&built, &esp)?;
        Ok(esp)
    }

    /// Run clippy on every crate in the guest workspace.
    pub fn clippy(&self) -> Result<()> {
        self.cargo(&["clippy", "--all"])
    }

    fn build_dir(&self, target_dir: &Path) -> PathBuf {
        target_dir.join(GUEST_TARGET).join(self.config.profile())
    }

    fn esp_dir(&self, target_dir: &Path) -> PathBuf {
        self.build_dir(target_dir).join("esp")
    }

    fn target_dir(&self) -> Result<PathBuf> {
        let mut cmd = Command::new("cargo");
        cmd.args(["metadata", "--format-version=1", "--no-deps"])
            .current_dir(&self.config.workspace_dir);
        self.trace(&cmd);

        let output = cmd
            .output()
            .map_err(|e| HarnessError::Build(format!("failed to run cargo metadata: {}", e)))?;
        if !output.status.success() {
            return Err(HarnessError::Build(format!(
                "cargo metadata failed ({})",
                output.status
            )));
        }
        target_dir_from_metadata(&output.stdout)
    }

    fn cargo(&self, args: &[&str]) -> Result<()> {
        let mut cmd = Command::new("cargo");
        cmd.args(args)
            .args(["--target", GUEST_TARGET])
            .current_dir(&self.config.workspace_dir)
            // Host RUSTFLAGS would leak into the UEFI target build
            .env("RUSTFLAGS", "");
        self.trace(&cmd);

        let status = cmd
            .status()
            .map_err(|e| HarnessError::Build(format!("failed to run cargo: {}", e)))?;
        if !status.success() {
            return Err(HarnessError::Build(format!(
                "cargo {} failed ({})",
                args.join(" "),
                status
            )));
        }
        Ok(())
    }

    fn trace(&self, cmd: &Command) {
        if self.config.verbose {
            eprintln!("{} {:?}", "$".dimmed(), cmd);
        }
    }
}

fn target_dir_from_metadata(json: &[u8]) -> Result<PathBuf> {
    let metadata: CargoMetadata = serde_json::from_slice(json)
        .map_err(|e| HarnessError::Build(format!("unreadable cargo metadata: {}", e)))?;
    Ok(metadata.target_directory)
}

/// Copy a built EFI binary to the removable-media boot path of an ESP.
pub fn stage_esp(efi_binary: &Path, esp_dir: &Path) -> Result<PathBuf> {
    if !efi_binary.is_file() {
        return Err(HarnessError::Build(format!(
            "built guest not found at {}",
            efi_binary.display()
        )));
    }
    let boot_dir = esp_dir.join("EFI").join("Boot");
    std::fs::create_dir_all(&boot_dir).map_err(|e| {
        HarnessError::Build(format!("creating {}: {}", boot_dir.display(), e))
    })?;
    let output = boot_dir.join("BootX64.efi");
    std::fs::copy(efi_binary, &output).map_err(|e| {
        HarnessError::Build(format!("copying to {}: {}", output.display(), e))
    })?;
    Ok(output)
}
