//! Boot media derived from the final artifact.
//!
//! BIOS gets a raw disk image: the APE file already starts with a valid
//! boot sector, so the image is a plain copy with no partition table. UEFI
//! gets an `EFI/BOOT` tree plus a shell script that packs the tree into a
//! FAT32 image. That script needs root for the loop mount, so it is only
//! written here and never run.

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{BootMode, BuildConfig};
use crate::error::IoContext;
use crate::manifest::ArtifactSet;
use crate::templates::make_executable;
use crate::Result;

pub const BIOS_IMAGE: &str = "llamafile-bios.img";
pub const EFI_DIR: &str = "efi";
pub const FAT_SCRIPT: &str = "make-efi-image.sh";
pub const FAT_IMAGE: &str = "llamafile-efi.img";

const MIB: u64 = 1024 * 1024;
/// FAT32 needs roughly 33 MiB before it will format at all.
const MIN_FAT_MIB: u64 = 64;
const FAT_SLACK_MIB: u64 = 32;

pub fn assemble(config: &BuildConfig, final_artifact: &Path, artifacts: &mut ArtifactSet) -> Result<()> {
    let combos = config.combinations();
    let out = &config.output_dir;

    if combos.iter().any(|(mode, _)| *mode == BootMode::Bios) {
        let image = out.join(BIOS_IMAGE);
        fs::copy(final_artifact, &image).at(&image)?;
        tracing::info!(image = %image.display(), "BIOS disk image ready");
        artifacts.bios_image = Some(image);
    } else if config.boot_modes.includes(BootMode::Bios) {
        tracing::warn!("skipping BIOS image: no x86_64 target selected");
    }

    let uefi_arches = config.uefi_arches();
    if !uefi_arches.is_empty() {
        let efi_root = out.join(EFI_DIR);
        let boot_dir = efi_root.join("EFI").join("BOOT");
        fs::create_dir_all(&boot_dir).at(&boot_dir)?;

        for arch in uefi_arches {
            let target = boot_dir.join(arch.efi_boot_file());
            fs::copy(final_artifact, &target).at(&target)?;
            tracing::info!(%arch, file = %target.display(), "EFI boot file ready");
            artifacts.efi_boot_files.push(target);
        }

        let payload = fs::metadata(final_artifact).at(final_artifact)?.len()
            * artifacts.efi_boot_files.len() as u64;
        let script = out.join(FAT_SCRIPT);
        fs::write(&script, render_fat_script(fat_image_mib(payload))).at(&script)?;
        make_executable(&script)?;
        tracing::info!(
            script = %script.display(),
            "run the script as root to build {FAT_IMAGE}"
        );
        artifacts.efi_dir = Some(efi_root);
        artifacts.fat_image_script = Some(script);
    }
    Ok(())
}

/// Size of the FAT image needed to hold `payload` bytes.
pub fn fat_image_mib(payload: u64) -> u64 {
    (payload.div_ceil(MIB) + FAT_SLACK_MIB).max(MIN_FAT_MIB)
}

/// Paths in the script are relative to its own directory.
pub fn render_fat_script(size_mib: u64) -> String {
    let mut s = String::new();
    s.push_str("#!/bin/sh\n");
    s.push_str("# Pack the EFI tree into a FAT32 image. Needs root for the loop mount.\n");
    s.push_str("set -eu\n");
    s.push_str("cd \"$(dirname \"$0\")\"\n\n");
    s.push_str(&format!("IMG={FAT_IMAGE}\n"));
    s.push_str(&format!("dd if=/dev/zero of=\"$IMG\" bs=1M count={size_mib}\n"));
    s.push_str("mkfs.fat -F 32 -n LLAMAFILE \"$IMG\"\n\n");
    s.push_str("MNT=$(mktemp -d)\n");
    s.push_str("mount -o loop \"$IMG\" \"$MNT\"\n");
    s.push_str("trap 'umount \"$MNT\"; rmdir \"$MNT\"' EXIT\n");
    s.push_str(&format!("cp -r {EFI_DIR}/EFI \"$MNT\"/\n"));
    s.push_str("sync\n");
    s.push_str("echo \"wrote $IMG\"\n");
    s
}

/// Where a given combination boots from.
pub fn boot_source(artifacts: &ArtifactSet, mode: BootMode) -> Option<PathBuf> {
    match mode {
        BootMode::Bios => artifacts.bios_image.clone(),
        BootMode::Uefi => artifacts.efi_dir.clone(),
    }
}
