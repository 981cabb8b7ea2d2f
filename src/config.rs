//! Run configuration.
//!
//! Built once at startup (defaults, then an optional TOML file, then CLI
//! overrides) and passed by reference everywhere after that.

use crate::error::{HarnessError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Target triple the guest is built for.
pub const GUEST_TARGET: &str = "x86_64-unknown-uefi";

/// Settings shared by the build and run phases.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    /// QEMU executable to launch.
    pub qemu_binary: String,
    /// Directory holding `OVMF_CODE.fd` / `OVMF_VARS.fd`. Searched for if unset.
    pub ovmf_dir: Option<PathBuf>,
    /// Directory containing the guest's top-level `Cargo.toml`.
    pub workspace_dir: PathBuf,
    /// Directory QEMU runs in; holds the monitor pipes and the transient capture.
    pub work_dir: PathBuf,
    /// Directory of committed reference screenshots.
    pub reference_dir: PathBuf,
    /// Extension appended to a directive name to find its reference file.
    pub reference_extension: String,
    /// Bound on the final wait for QEMU to exit before it is killed.
    pub exit_timeout_secs: u64,
    /// Pass `--enable-kvm` to QEMU.
    pub kvm: bool,
    /// Run without a display window (screenshots still work).
    pub headless: bool,
    /// Print external commands and discarded QMP events.
    pub verbose: bool,
    /// Build the guest in release mode.
    pub release: bool,
    /// Copy captures into place when a reference does not exist yet.
    pub record_missing_references: bool,
    /// Name of the guest's EFI binary (without extension).
    pub guest_binary: String,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            qemu_binary: "qemu-system-x86_64".to_string(),
            ovmf_dir: None,
            workspace_dir: PathBuf::from("."),
            work_dir: PathBuf::from("."),
            reference_dir: PathBuf::from("screenshots"),
            reference_extension: "ppm".to_string(),
            exit_timeout_secs: 60,
            kvm: true,
            headless: false,
            verbose: false,
            release: false,
            record_missing_references: false,
            guest_binary: "partabled".to_string(),
        }
    }
}

impl HarnessConfig {
    /// Load a TOML config file. Keys that are absent keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            HarnessError::Config(format!("reading {}: {}", path.display(), e))
        })?;
        Self::from_toml(&contents)
            .map_err(|e| HarnessError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Parse config from a TOML string.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(contents).map_err(|e| HarnessError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.qemu_binary.trim().is_empty() {
            return Err(HarnessError::Config("qemu_binary must not be empty".into()));
        }
        if self.exit_timeout_secs == 0 {
            return Err(HarnessError::Config(
                "exit_timeout_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn exit_timeout(&self) -> Duration {
        Duration::from_secs(self.exit_timeout_secs)
    }

    /// `debug` or `release`, matching cargo's output directory name.
    pub fn profile(&self) -> &'static str {
        if self.release {
            "release"
        } else {
            "debug"
        }
    }

    /// Reference screenshot for a directive name.
    pub fn reference_path(&self, name: &str) -> PathBuf {
        self.reference_dir
            .join(format!("{}.{}", name, self.reference_extension))
    }
}
