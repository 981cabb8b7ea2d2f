//! QEMU session lifecycle for a test run.
//!
//! Creates the monitor pipes, spawns QEMU, negotiates QMP, then scans the
//! serial console until it closes, handling directives as they appear.
//! Teardown (bounded wait for exit, pipe removal, capture removal) runs on
//! every path, including fatal errors.

use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::firmware::OvmfFiles;
use crate::qemu::exit::ExitClass;
use crate::qemu::qmp::{ControlChannel, QmpClient};
use crate::qemu::screenshot::{remove_capture, ScreenshotCheck, Verdict};
use crate::qemu::serial::{Directive, OutputScanner};
use crate::qemu::QemuBuilder;
use colored::Colorize;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus};
use std::time::{Duration, Instant};

/// Base name of the QMP pipe pair inside the work directory.
pub const MONITOR_PIPE: &str = "qemu-monitor";

const REAP_POLL: Duration = Duration::from_millis(50);

/// Firmware and ESP produced by the build step.
#[derive(Debug, Clone)]
pub struct BootMedia {
    pub ovmf: OvmfFiles,
    pub esp: PathBuf,
}

/// What happened during a run that got as far as teardown.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// QEMU's exit code; `None` if it was killed.
    pub exit_code: Option<i32>,
    pub exit_class: ExitClass,
    /// QEMU didn't exit within the configured timeout and was killed.
    pub timed_out: bool,
    /// Number of directives handled.
    pub directives: usize,
    /// One message per failed screenshot check.
    pub failures: Vec<String>,
}

impl RunReport {
    pub fn passed(&self) -> bool {
        self.exit_class.is_success() && self.failures.is_empty()
    }

    /// Map the report onto the caller's exit contract.
    ///
    /// A bad exit code wins over screenshot failures since it usually
    /// explains them.
    pub fn into_result(self) -> Result<Self> {
        if !self.exit_class.is_success() {
            return Err(HarnessError::Process(self.describe_exit()));
        }
        if !self.failures.is_empty() {
            return Err(HarnessError::Verification(format!(
                "{} of {} screenshot checks failed: {}",
                self.failures.len(),
                self.directives,
                self.failures.join("; ")
            )));
        }
        Ok(self)
    }

    fn describe_exit(&self) -> String {
        match self.exit_code {
            _ if self.timed_out => "QEMU did not exit in time and was killed".to_string(),
            Some(code) => format!("QEMU exited with error code {}", code),
            None => "QEMU was terminated by a signal".to_string(),
        }
    }
}

/// Directive bookkeeping from the scanning loop.
#[derive(Debug, Default)]
struct Progress {
    directives: usize,
    failures: Vec<String>,
}

/// The spawned QEMU process. Killed on drop if it is still running.
struct Emulator {
    child: Child,
}

impl Emulator {
    fn spawn(cmd: &mut Command) -> Result<Self> {
        let child = cmd.spawn().map_err(|e| {
            HarnessError::Process(format!(
                "failed to spawn {}: {}",
                cmd.get_program().to_string_lossy(),
                e
            ))
        })?;
        Ok(Self { child })
    }

    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn take_stdio(&mut self) -> Result<(ChildStdin, ChildStdout)> {
        let stdin = self
            .child
            .stdin
            .take()
            .ok_or_else(|| HarnessError::Process("QEMU stdin is not piped".into()))?;
        let stdout = self
            .child
            .stdout
            .take()
            .ok_or_else(|| HarnessError::Process("QEMU stdout is not piped".into()))?;
        Ok((stdin, stdout))
    }

    /// Wait for exit, killing QEMU once `timeout` has passed.
    ///
    /// Returns the exit status, if one could be collected, and whether the
    /// timeout forced the kill.
    fn reap(&mut self, timeout: Duration) -> (Option<ExitStatus>, bool) {
        let start = Instant::now();
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => return (Some(status), false),
                Ok(None) if start.elapsed() < timeout => std::thread::sleep(REAP_POLL),
                Ok(None) => {
                    eprintln!("{}", "Tests are taking too long to run, killing QEMU".yellow());
                    return (self.kill(), true);
                }
                Err(e) => {
                    eprintln!(
                        "{} waiting for QEMU failed ({}), killing it",
                        "warning:".yellow(),
                        e
                    );
                    return (self.kill(), false);
                }
            }
        }
    }

    fn kill(&mut self) -> Option<ExitStatus> {
        let _ = self.child.kill();
        self.child.wait().ok()
    }
}

impl Drop for Emulator {
    fn drop(&mut self) {
        if self.is_running() {
            self.kill();
        }
    }
}

/// Boot `media` in QEMU and serve the guest's directives until it exits.
///
/// Fatal errors (transport, protocol, I/O) are returned after teardown.
/// Otherwise the report says how the run went; use
/// [`RunReport::into_result`] to apply the exit contract.
pub fn run(config: &HarnessConfig, media: &BootMedia) -> Result<RunReport> {
    let check = ScreenshotCheck::new(config);
    let mut channel = ControlChannel::create(&config.work_dir.join(MONITOR_PIPE))?;

    let mut cmd = QemuBuilder::new()
        .binary(&config.qemu_binary)
        .uefi(media.ovmf.clone())
        .esp(media.esp.clone())
        .qmp_pipe(channel.base().to_path_buf())
        .kvm(config.kvm)
        .headless(config.headless)
        .debug_exit()
        .build_piped();
    if config.verbose {
        eprintln!("{} {:?}", "$".dimmed(), cmd);
    }

    println!("{}", "Starting QEMU...".cyan());
    let mut emulator = Emulator::spawn(&mut cmd)?;

    let driven = drive(config, &check, &channel, &mut emulator);

    let (status, timed_out) = emulator.reap(config.exit_timeout());
    channel.close();
    remove_capture(&check.capture_path());

    let progress = driven?;
    let exit_code = status.as_ref().and_then(ExitStatus::code);
    let exit_class = match &status {
        Some(status) if !timed_out => ExitClass::from_status(status),
        _ => ExitClass::UnexpectedFailure,
    };
    Ok(RunReport {
        exit_code,
        exit_class,
        timed_out,
        directives: progress.directives,
        failures: progress.failures,
    })
}

/// Handshake, then the scanning loop. Returns when QEMU's stdout closes.
fn drive(
    config: &HarnessConfig,
    check: &ScreenshotCheck<'_>,
    channel: &ControlChannel,
    emulator: &mut Emulator,
) -> Result<Progress> {
    let (mut stdin, stdout) = emulator.take_stdio()?;

    let streams = channel.connect(|| emulator.is_running())?;
    let mut qmp = QmpClient::new(streams.replies, streams.commands);
    qmp.negotiate()?;
    match qmp.qemu_version() {
        Some(version) => println!("{} (QEMU {})", "QMP connected".green(), version),
        None => println!("{}", "QMP connected".green()),
    }

    let mut progress = Progress::default();
    for line in OutputScanner::new(BufReader::new(stdout)) {
        let line = line?;
        // Echo before acting so the log reads in the order things happened
        println!("{}", line);

        let Some(Directive::Screenshot(name)) = Directive::parse(&line) else {
            continue;
        };
        progress.directives += 1;

        let result = check.run(&name, &mut qmp, &mut stdin);
        log_events(config, &mut qmp);
        match result {
            Ok(Verdict::Matched) => {
                println!("{} screenshot `{}` matches", "✓".green(), name);
            }
            Ok(Verdict::Recorded(path)) => {
                println!(
                    "{} recorded new reference {}",
                    "!".yellow(),
                    path.display()
                );
            }
            Err(e) if !e.is_fatal() => {
                eprintln!("{} {}", "✗".red().bold(), e);
                progress.failures.push(e.to_string());
            }
            Err(e) => return Err(e),
        }
    }

    qmp.close();
    Ok(progress)
}

fn log_events<R: BufRead, W: Write>(config: &HarnessConfig, qmp: &mut QmpClient<R, W>) {
    for event in qmp.take_events() {
        if config.verbose {
            let name = event
                .get("event")
                .and_then(|v| v.as_str())
                .unwrap_or("?");
            eprintln!("{} {}", "QMP event:".dimmed(), name);
        }
    }
}
