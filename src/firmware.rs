//! OVMF firmware discovery for UEFI boot.

use crate::error::{HarnessError, Result};
use std::path::{Path, PathBuf};

/// Common OVMF directories across distros.
const OVMF_CANDIDATES: &[&str] = &[
    // Most distros, including CentOS, Fedora, Debian, and Ubuntu
    "/usr/share/OVMF",
    // Arch
    "/usr/share/ovmf/x64",
    // Gentoo
    "/usr/share/edk2-ovmf",
    // Fedora/RHEL (newer layout)
    "/usr/share/edk2/ovmf",
];

/// Code and vars firmware images, attached to QEMU as pflash drives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OvmfFiles {
    pub code: PathBuf,
    pub vars: PathBuf,
}

impl OvmfFiles {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            code: dir.join("OVMF_CODE.fd"),
            vars: dir.join("OVMF_VARS.fd"),
        }
    }

    fn exist(&self) -> bool {
        self.code.is_file() && self.vars.is_file()
    }
}

/// Find the OVMF firmware files.
///
/// A configured directory must contain both files; there is no fallback
/// when it doesn't. Otherwise the workspace directory is tried, then the
/// usual distro locations.
pub fn find_ovmf(configured: Option<&Path>, workspace_dir: &Path) -> Result<OvmfFiles> {
    if let Some(dir) = configured {
        let files = OvmfFiles::in_dir(dir);
        if files.exist() {
            return Ok(files);
        }
        return Err(HarnessError::Firmware(format!(
            "OVMF files not found in `{}`",
            dir.display()
        )));
    }

    let workspace = OvmfFiles::in_dir(workspace_dir);
    if workspace.exist() {
        return Ok(workspace);
    }

    OVMF_CANDIDATES
        .iter()
        .map(|dir| OvmfFiles::in_dir(Path::new(dir)))
        .find(OvmfFiles::exist)
        .ok_or_else(|| HarnessError::Firmware("OVMF files not found anywhere".into()))
}
