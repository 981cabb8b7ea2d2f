//! QEMU command builder for UEFI test runs.
//!
//! The machine shape is fixed so every run is reproducible; only firmware,
//! ESP, monitor pipes and host-side toggles vary. QEMU shares the harness's
//! working directory, so relative paths mean the same thing to both.

use crate::firmware::OvmfFiles;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Modern chipset with PCIe.
const MACHINE: &str = "q35";
/// The multi-processor services test in the guest needs exactly 4 CPUs.
const SMP: &str = "4";
const MEMORY: &str = "256M";
/// Guest writes to port 0xf4 become QEMU exit codes `(value << 1) | 1`.
const DEBUG_EXIT_DEVICE: &str = "isa-debug-exit,iobase=0xf4,iosize=0x04";

/// Builder for QEMU commands.
pub struct QemuBuilder {
    binary: String,
    ovmf: Option<OvmfFiles>,
    esp: Option<PathBuf>,
    qmp_pipe: Option<PathBuf>,
    kvm: bool,
    headless: bool,
    debug_exit: bool,
}

impl Default for QemuBuilder {
    fn default() -> Self {
        Self {
            binary: "qemu-system-x86_64".to_string(),
            ovmf: None,
            esp: None,
            qmp_pipe: None,
            kvm: false,
            headless: false,
            debug_exit: false,
        }
    }
}

impl QemuBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// QEMU executable to run
    pub fn binary(mut self, binary: &str) -> Self {
        self.binary = binary.to_string();
        self
    }

    /// Boot with OVMF (code read-only, vars read-only)
    pub fn uefi(mut self, ovmf: OvmfFiles) -> Self {
        self.ovmf = Some(ovmf);
        self
    }

    /// Mount a host directory as a FAT drive (the ESP)
    pub fn esp(mut self, dir: PathBuf) -> Self {
        self.esp = Some(dir);
        self
    }

    /// Attach QMP to the named pipe pair `<base>.in` / `<base>.out`
    pub fn qmp_pipe(mut self, base: PathBuf) -> Self {
        self.qmp_pipe = Some(base);
        self
    }

    /// Use hardware acceleration
    pub fn kvm(mut self, enabled: bool) -> Self {
        self.kvm = enabled;
        self
    }

    /// Don't open a display window. The framebuffer is still emulated.
    pub fn headless(mut self, enabled: bool) -> Self {
        self.headless = enabled;
        self
    }

    /// Map guest-triggered exits to QEMU exit codes
    pub fn debug_exit(mut self) -> Self {
        self.debug_exit = true;
        self
    }

    /// Build the QEMU command with stdin/stdout piped for the serial console
    pub fn build_piped(self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(self.args());
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        cmd
    }

    /// The full argument list, in order.
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        let mut push =
            |values: &[&str]| args.extend(values.iter().map(|v| OsString::from(*v)));

        // QEMU enables a ton of devices by default which slow down boot
        push(&["-nodefaults"]);
        push(&["-machine", MACHINE, "-smp", SMP, "-m", MEMORY]);

        if self.kvm {
            push(&["--enable-kvm"]);
        }

        if let Some(ovmf) = &self.ovmf {
            push(&[
                "-drive",
                &format!("if=pflash,format=raw,file={},readonly=on", ovmf.code.display()),
            ]);
            push(&[
                "-drive",
                &format!("if=pflash,format=raw,file={},readonly=on", ovmf.vars.display()),
            ]);
        }

        if let Some(esp) = &self.esp {
            push(&["-drive", &format!("format=raw,file=fat:rw:{}", esp.display())]);
        }

        // OVMF connects the UEFI console to the first serial port
        push(&["-serial", "stdio"]);

        if let Some(base) = &self.qmp_pipe {
            push(&["-qmp", &format!("pipe:{}", base.display())]);
        }

        if self.debug_exit {
            push(&["-device", DEBUG_EXIT_DEVICE]);
        }

        // Emulated framebuffer, needed for screendump even when headless
        push(&["-vga", "std"]);
        if self.headless {
            push(&["-display", "none"]);
        }

        args
    }
}
