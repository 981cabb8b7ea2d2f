//! Screenshot-verified UEFI test runs in QEMU.
//!
//! This library provides the harness infrastructure:
//! - Guest build and ESP staging
//! - OVMF firmware discovery
//! - QEMU command construction and process lifecycle
//! - QMP over named pipes
//! - Serial console scanning for `SCREENSHOT:` directives

pub mod config;
pub mod error;
pub mod firmware;
pub mod guest;
pub mod qemu;

// Re-export commonly used items
pub use config::HarnessConfig;
pub use error::{HarnessError, Result};
pub use firmware::{find_ovmf, OvmfFiles};
pub use guest::GuestBuild;
pub use qemu::{run, BootMedia, ExitClass, QemuBuilder, RunReport};
