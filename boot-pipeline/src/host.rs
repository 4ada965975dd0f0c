//! Questions asked about the host machine: which tools are installed and
//! where UEFI firmware lives.

use std::path::{Path, PathBuf};

use crate::config::Arch;

/// Well-known OVMF locations across distributions.
pub const X86_64_FIRMWARE: &[&str] = &[
    "/usr/share/OVMF/OVMF_CODE.fd",
    "/usr/share/ovmf/OVMF.fd",
    "/usr/share/edk2/ovmf/OVMF_CODE.fd",
    "/usr/share/edk2-ovmf/x64/OVMF_CODE.fd",
    "/usr/share/qemu/OVMF.fd",
];

/// Well-known AAVMF / QEMU_EFI locations.
pub const AARCH64_FIRMWARE: &[&str] = &[
    "/usr/share/AAVMF/AAVMF_CODE.fd",
    "/usr/share/qemu-efi-aarch64/QEMU_EFI.fd",
    "/usr/share/edk2/aarch64/QEMU_EFI.fd",
    "/usr/share/qemu/edk2-aarch64-code.fd",
];

pub fn firmware_candidates(arch: Arch) -> &'static [&'static str] {
    match arch {
        Arch::X86_64 => X86_64_FIRMWARE,
        Arch::Aarch64 => AARCH64_FIRMWARE,
    }
}

pub trait Host: Send + Sync {
    fn has_tool(&self, name: &str) -> bool;
    fn is_file(&self, path: &Path) -> bool;

    /// First firmware image present for `arch`, in candidate order.
    fn find_firmware(&self, arch: Arch) -> Option<PathBuf> {
        firmware_candidates(arch)
            .iter()
            .map(Path::new)
            .find(|p| self.is_file(p))
            .map(Path::to_path_buf)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHost;

impl Host for SystemHost {
    fn has_tool(&self, name: &str) -> bool {
        which::which(name).is_ok()
    }

    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }
}


#[cfg(test)]
mod tests {
    use super::fake::FakeHost;
    use super::*;

    #[test]
    fn firmware_lookup_follows_candidate_order() {
        let mut host = FakeHost::default();
        host.files.insert(X86_64_FIRMWARE[3].into());
        host.files.insert(X86_64_FIRMWARE[1].into());
        assert_eq!(
            host.find_firmware(Arch::X86_64),
            Some(PathBuf::from(X86_64_FIRMWARE[1]))
        );
        assert_eq!(host.find_firmware(Arch::Aarch64), None);
    }
}
