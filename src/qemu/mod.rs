//! QEMU infrastructure for screenshot-verified UEFI test runs.
//!
//! - `builder`: the QEMU command line
//! - `qmp`: monitor pipes and the QMP client
//! - `serial`: console scanning and directive recognition
//! - `screenshot`: the `SCREENSHOT:` directive handler
//! - `session`: spawn, drive and tear down one run

mod builder;
mod exit;
pub mod qmp;
mod screenshot;
pub mod serial;
mod session;

pub use builder::QemuBuilder;
pub use exit::{ExitClass, EXPECTED_FAILURE_CODE};
pub use screenshot::{ScreenshotCheck, Verdict, ACK, CAPTURE_FILENAME};
pub use session::{run, BootMedia, RunReport, MONITOR_PIPE};
