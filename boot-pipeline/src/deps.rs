//! Preflight: are the external tools and firmware this run needs present?

use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::config::{BootMode, BuildConfig, DebugConfig};
use crate::host::{firmware_candidates, Host};
use crate::{Error, Result};

/// Tools the build tool shells out to.
pub fn build_tools(config: &BuildConfig) -> BTreeSet<&'static str> {
    let mut tools = BTreeSet::from(["git", "make", "gcc"]);
    if config.test {
        tools.extend(config.combinations().into_iter().map(|(_, arch)| arch.qemu_binary()));
    }
    tools
}

/// Tools the debug tool shells out to.
pub fn debug_tools(config: &DebugConfig) -> BTreeSet<&'static str> {
    let mut tools = BTreeSet::from([config.arch.qemu_binary()]);
    if config.gdb {
        tools.insert("gdb");
    }
    tools
}

fn require(tools: &BTreeSet<&'static str>, host: &dyn Host) -> Result<()> {
    let missing: Vec<String> = tools
        .iter()
        .filter(|tool| !host.has_tool(tool))
        .map(|tool| tool.to_string())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::MissingTools(missing))
    }
}

/// At build time a missing firmware image only earns a warning; the image
/// can still be produced and booted elsewhere.
pub fn check_build(config: &BuildConfig, host: &dyn Host) -> Result<()> {
    require(&build_tools(config), host)?;
    for arch in config.uefi_arches() {
        match host.find_firmware(arch) {
            Some(path) => tracing::debug!(%arch, firmware = %path.display(), "found UEFI firmware"),
            None => tracing::warn!(
                %arch,
                "no UEFI firmware found; UEFI images cannot be tested on this host"
            ),
        }
    }
    tracing::info!("all build dependencies present");
    Ok(())
}

/// Returns the firmware image to boot with when the mode is UEFI. A
/// missing image is fatal here since the emulator cannot start without it.
pub fn check_debug(config: &DebugConfig, host: &dyn Host) -> Result<Option<PathBuf>> {
    require(&debug_tools(config), host)?;
    let firmware = match config.mode {
        BootMode::Bios => None,
        BootMode::Uefi => Some(require_firmware(config.arch, host)?),
    };
    tracing::info!("all debug dependencies present");
    Ok(firmware)
}

pub fn require_firmware(arch: crate::config::Arch, host: &dyn Host) -> Result<PathBuf> {
    host.find_firmware(arch).ok_or_else(|| Error::MissingFirmware {
        arch,
        searched: firmware_candidates(arch)
            .iter()
            .map(|p| p.to_string())
            .collect(),
    })
}
