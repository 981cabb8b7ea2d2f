//! Screenshot directives: capture via QMP, release the guest, compare.
//!
//! The guest prints `SCREENSHOT: <name>` and then blocks reading its console
//! until the host answers `OK`, so the capture shows exactly the frame the
//! guest meant. The capture is compared byte-for-byte with
//! `<reference_dir>/<name>.<ext>`.

use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::qemu::qmp::QmpClient;
use colored::Colorize;
use std::io::{self, BufRead, Write};
use std::path::{Component, Path, PathBuf};

/// File name of the capture inside the work directory.
pub const CAPTURE_FILENAME: &str = "screenshot.ppm";

/// Line sent to the guest once the capture exists.
pub const ACK: &str = "OK";

/// Outcome of a screenshot directive that didn't fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Capture matched the reference.
    Matched,
    /// No reference existed; the capture was saved as the new one.
    Recorded(PathBuf),
}

/// Handles `SCREENSHOT:` directives for one run.
pub struct ScreenshotCheck<'a> {
    config: &'a HarnessConfig,
}

impl<'a> ScreenshotCheck<'a> {
    pub fn new(config: &'a HarnessConfig) -> Self {
        Self { config }
    }

    /// Where the capture lands on the host.
    pub fn capture_path(&self) -> PathBuf {
        self.config.work_dir.join(CAPTURE_FILENAME)
    }

    /// Capture, acknowledge to the guest, then verify against reference `name`.
    ///
    /// Protocol and I/O errors are fatal to the run; a missing or differing
    /// reference is a [`HarnessError::Verification`]. The capture is removed
    /// on every path.
    pub fn run<R, W, G>(
        &self,
        name: &str,
        qmp: &mut QmpClient<R, W>,
        guest: &mut G,
    ) -> Result<Verdict>
    where
        R: BufRead,
        W: Write,
        G: Write,
    {
        let capture = TransientFile::new(self.capture_path());

        qmp.screendump(&capture.path().to_string_lossy())?;

        writeln!(guest, "{}", ACK)?;
        guest.flush()?;

        self.verify(name, capture.path())
    }

    fn verify(&self, name: &str, capture: &Path) -> Result<Verdict> {
        if !is_plain_relative(name) {
            return Err(HarnessError::Verification(format!(
                "invalid reference name `{}`",
                name
            )));
        }

        let captured = std::fs::read(capture).map_err(|e| {
            HarnessError::Verification(format!(
                "reading capture {}: {}",
                capture.display(),
                e
            ))
        })?;

        let reference = self.config.reference_path(name);
        if !reference.is_file() {
            if self.config.record_missing_references {
                record(&reference, &captured)?;
                return Ok(Verdict::Recorded(reference));
            }
            return Err(HarnessError::Verification(format!(
                "reference screenshot {} does not exist",
                reference.display()
            )));
        }

        let expected = std::fs::read(&reference).map_err(|e| {
            HarnessError::Verification(format!("reading {}: {}", reference.display(), e))
        })?;
        if captured != expected {
            return Err(HarnessError::Verification(format!(
                "screenshot `{}` differs from {}",
                name,
                reference.display()
            )));
        }
        Ok(Verdict::Matched)
    }
}

/// Save a capture as a new reference. Failing to do so fails the directive,
/// not the run.
fn record(reference: &Path, captured: &[u8]) -> Result<()> {
    let saved = match reference.parent() {
        Some(parent) => std::fs::create_dir_all(parent),
        None => Ok(()),
    }
    .and_then(|()| std::fs::write(reference, captured));
    saved.map_err(|e| {
        HarnessError::Verification(format!(
            "recording reference {}: {}",
            reference.display(),
            e
        ))
    })
}

/// Names come from the guest; keep them inside the reference directory.
fn is_plain_relative(name: &str) -> bool {
    !name.is_empty()
        && Path::new(name)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

/// Remove a leftover capture, e.g. from a run that died mid-directive.
pub fn remove_capture(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => eprintln!(
            "{} failed to remove {}: {}",
            "warning:".yellow(),
            path.display(),
            e
        ),
    }
}

/// A file that is deleted when this guard goes out of scope.
struct TransientFile {
    path: PathBuf,
}

impl TransientFile {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TransientFile {
    fn drop(&mut self) {
        remove_capture(&self.path);
    }
}
