//! Classification of QEMU's exit code.
//!
//! The guest sets the exit code through the isa-debug-exit device. QEMU's
//! own clean shutdown exits 0.

use std::fmt;
use std::process::ExitStatus;

/// Exit code for "tests ran, and a failure was expected/flagged" (debug-exit value 1).
pub const EXPECTED_FAILURE_CODE: i32 = 3;

/// Terminal classification of a run's emulator exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    Success,
    ExpectedTestFailure,
    UnexpectedFailure,
}

impl ExitClass {
    /// Classify a raw exit code. `None` means QEMU was killed by a signal.
    pub fn from_code(code: Option<i32>) -> Self {
        match code {
            Some(0) => ExitClass::Success,
            Some(EXPECTED_FAILURE_CODE) => ExitClass::ExpectedTestFailure,
            _ => ExitClass::UnexpectedFailure,
        }
    }

    pub fn from_status(status: &ExitStatus) -> Self {
        Self::from_code(status.code())
    }

    /// Whether the invoking caller should treat the run as passed.
    pub fn is_success(self) -> bool {
        matches!(self, ExitClass::Success | ExitClass::ExpectedTestFailure)
    }
}

impl fmt::Display for ExitClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitClass::Success => "success",
            ExitClass::ExpectedTestFailure => "expected test failure",
            ExitClass::UnexpectedFailure => "unexpected failure",
        };
        f.write_str(s)
    }
}
