//! Whole-run tests against a fake QEMU.
//!
//! The fake is a shell script that finds `-qmp pipe:<base>` in its
//! arguments, speaks just enough QMP over the FIFOs, and prints console
//! output on stdout like a guest behind `-serial stdio` would.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tempfile::TempDir;
use vm_test_harness::qemu::{CAPTURE_FILENAME, MONITOR_PIPE};
use vm_test_harness::{run, BootMedia, ExitClass, HarnessConfig, HarnessError, OvmfFiles};

/// Writing a script and exec'ing it while another test forks can fail with
/// ETXTBSY, so scenarios run one at a time.
static SPAWN_LOCK: Mutex<()> = Mutex::new(());

const PRELUDE: &str = r#"#!/bin/sh
for arg in "$@"; do
    case "$arg" in
        pipe:*) monitor="${arg#pipe:}" ;;
    esac
done
dir=$(dirname "$monitor")

greet() {
    exec 3<"$monitor.in" 4>"$monitor.out"
    echo '{"QMP": {"version": {"qemu": {"micro": 0, "minor": 2, "major": 8}, "package": ""}, "capabilities": []}}' >&4
    read -r line <&3
    echo '{"return": {}}' >&4
}

# Serve one screenshot directive, capturing $2 as the frame
screenshot() {
    printf '\033[32mSCREENSHOT: %s\033[0m\r\n' "$1"
    read -r cmd <&3
    case "$cmd" in
        *screendump*) ;;
        *) exit 10 ;;
    esac
    printf '%s' "$2" > "$dir/screenshot.ppm"
    echo '{"timestamp": {"seconds": 1, "microseconds": 0}, "event": "DEVICE_TRAY_MOVED"}' >&4
    echo '{"return": {}}' >&4
    read -r ack
    [ "$ack" = "OK" ] || exit 11
}
"#;

struct Scenario {
    dir: TempDir,
    config: HarnessConfig,
    media: BootMedia,
}

impl Scenario {
    fn new(body: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-qemu");
        std::fs::write(&script, format!("{}\n{}\n", PRELUDE, body)).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = HarnessConfig {
            qemu_binary: script.display().to_string(),
            work_dir: dir.path().to_path_buf(),
            reference_dir: dir.path().join("screenshots"),
            exit_timeout_secs: 2,
            kvm: false,
            headless: true,
            ..HarnessConfig::default()
        };
        std::fs::create_dir_all(&config.reference_dir).unwrap();

        let media = BootMedia {
            ovmf: OvmfFiles::in_dir(dir.path()),
            esp: dir.path().join("esp"),
        };
        Self { dir, config, media }
    }

    fn reference(&self, name: &str, contents: &str) {
        std::fs::write(self.config.reference_path(name), contents).unwrap();
    }

    fn run(&self) -> vm_test_harness::Result<vm_test_harness::RunReport> {
        let _guard = SPAWN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        run(&self.config, &self.media)
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn assert_cleaned_up(&self) {
        for leftover in [
            format!("{}.in", MONITOR_PIPE),
            format!("{}.out", MONITOR_PIPE),
            CAPTURE_FILENAME.to_string(),
        ] {
            assert!(
                !exists(&self.path(&leftover)),
                "{} left behind",
                leftover
            );
        }
    }
}

fn exists(path: &Path) -> bool {
    std::fs::symlink_metadata(path).is_ok()
}

#[test]
fn test_expected_failure_exit_without_directives_passes() {
    let scenario = Scenario::new(
        r#"
greet
echo "Running 0 tests"
exit 3
"#,
    );

    let report = scenario.run().unwrap();
    assert_eq!(report.exit_code, Some(3));
    assert_eq!(report.exit_class, ExitClass::ExpectedTestFailure);
    assert_eq!(report.directives, 0);
    assert!(report.passed());
    assert!(report.into_result().is_ok());
    scenario.assert_cleaned_up();
}

#[test]
fn test_matching_screenshot_passes() {
    let scenario = Scenario::new(
        r#"
greet
echo "Testing graphics output"
screenshot boot_menu "P6 640 480 255 frame"
echo "All tests passed"
exit 0
"#,
    );
    scenario.reference("boot_menu", "P6 640 480 255 frame");

    let report = scenario.run().unwrap();
    assert_eq!(report.exit_class, ExitClass::Success);
    assert_eq!(report.directives, 1);
    assert!(report.failures.is_empty());
    assert!(report.into_result().is_ok());
    scenario.assert_cleaned_up();
}

#[test]
fn test_mismatch_fails_run_but_scanning_continues() {
    let scenario = Scenario::new(
        r#"
greet
screenshot boot_menu "P6 640 480 255 wrong"
screenshot gop "P6 640 480 255 gop"
exit 0
"#,
    );
    scenario.reference("boot_menu", "P6 640 480 255 right");
    scenario.reference("gop", "P6 640 480 255 gop");

    let report = scenario.run().unwrap();
    // Both directives were served even though the first one failed
    assert_eq!(report.directives, 2);
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].contains("boot_menu"));
    assert_eq!(report.exit_class, ExitClass::Success);
    assert!(!report.passed());
    assert!(matches!(
        report.into_result(),
        Err(HarnessError::Verification(_))
    ));
    scenario.assert_cleaned_up();
}

#[test]
fn test_unexpected_exit_code_fails() {
    let scenario = Scenario::new(
        r#"
greet
echo "guest panicked"
exit 1
"#,
    );

    let report = scenario.run().unwrap();
    assert_eq!(report.exit_class, ExitClass::UnexpectedFailure);
    let err = report.into_result().unwrap_err();
    assert_eq!(err.to_string(), "Process error: QEMU exited with error code 1");
    scenario.assert_cleaned_up();
}

#[test]
fn test_emulator_outliving_its_console_is_killed() {
    let scenario = Scenario::new(
        r#"
greet
echo "Shutting down console"
exec >&-
exec sleep 30
"#,
    );

    let start = std::time::Instant::now();
    let report = scenario.run().unwrap();
    assert!(start.elapsed() < std::time::Duration::from_secs(20));
    assert!(report.timed_out);
    assert_eq!(report.exit_code, None);
    assert_eq!(report.exit_class, ExitClass::UnexpectedFailure);
    let err = report.into_result().unwrap_err();
    assert!(matches!(err, HarnessError::Process(_)));
    assert!(err.to_string().contains("killed"), "{err}");
    scenario.assert_cleaned_up();
}

#[test]
fn test_bad_greeting_is_fatal_and_emulator_is_killed() {
    let scenario = Scenario::new(
        r#"
exec 3<"$monitor.in" 4>"$monitor.out"
echo 'hello there' >&4
exec sleep 30
"#,
    );

    let err = scenario.run().unwrap_err();
    assert!(matches!(err, HarnessError::Protocol(_)), "{err}");
    assert!(err.to_string().contains("unexpected greeting"));
    scenario.assert_cleaned_up();
}

#[test]
fn test_emulator_exiting_before_rendezvous() {
    let scenario = Scenario::new("exit 1");

    let err = scenario.run().unwrap_err();
    assert!(matches!(err, HarnessError::Transport { .. }), "{err}");
    scenario.assert_cleaned_up();
}

#[test]
fn test_missing_emulator_binary() {
    let mut scenario = Scenario::new("exit 0");
    scenario.config.qemu_binary = scenario.path("no-such-qemu").display().to_string();

    let err = scenario.run().unwrap_err();
    assert!(matches!(err, HarnessError::Process(_)), "{err}");
    scenario.assert_cleaned_up();
}

#[test]
fn test_stale_monitor_pipe_refused() {
    let scenario = Scenario::new("exit 0");
    std::fs::write(scenario.path(&format!("{}.in", MONITOR_PIPE)), b"").unwrap();

    let err = scenario.run().unwrap_err();
    assert!(matches!(err, HarnessError::Transport { .. }), "{err}");
}
