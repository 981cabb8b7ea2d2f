//! Serial console handling for QEMU runs.
//!
//! OVMF connects the UEFI console to the first serial port, which QEMU puts
//! on its stdio. The guest's stdout is our log, and its stdin is how we
//! answer directives.

mod ansi;
mod scanner;

pub use ansi::strip_ansi_codes;
pub use scanner::{clean_line, Directive, OutputScanner, SCREENSHOT_PREFIX};
