//! Immutable run configuration shared by every pipeline stage.
//!
//! Both binaries parse their flags with `clap` and hand the result to
//! [`BuildConfig::validate`] / [`DebugConfig::validate`] before anything
//! touches the filesystem.

use std::fmt;
use std::path::PathBuf;

use clap::ValueEnum;
use serde::Serialize;

use crate::{Error, Result};

pub const DEFAULT_REPO: &str = "https://github.com/Mozilla-Ocho/llamafile.git";
pub const DEFAULT_MEMORY: &str = "2G";
pub const DEFAULT_RUNTIME_ARGS: &str = "--interactive --log-disable";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BootMode {
    Bios,
    Uefi,
}

impl fmt::Display for BootMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootMode::Bios => write!(f, "bios"),
            BootMode::Uefi => write!(f, "uefi"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum, Serialize)]
pub enum Arch {
    #[value(name = "x86_64")]
    #[serde(rename = "x86_64")]
    X86_64,
    #[value(name = "aarch64")]
    #[serde(rename = "aarch64")]
    Aarch64,
}

impl Arch {
    /// QEMU system emulator for this architecture.
    pub fn qemu_binary(self) -> &'static str {
        match self {
            Arch::X86_64 => "qemu-system-x86_64",
            Arch::Aarch64 => "qemu-system-aarch64",
        }
    }

    /// Removable-media boot filename UEFI firmware looks for under `EFI/BOOT`.
    pub fn efi_boot_file(self) -> &'static str {
        match self {
            Arch::X86_64 => "bootx64.efi",
            Arch::Aarch64 => "bootaa64.efi",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arch::X86_64 => write!(f, "x86_64"),
            Arch::Aarch64 => write!(f, "aarch64"),
        }
    }
}

/// Legacy BIOS boot only exists on x86.
pub fn supports(mode: BootMode, arch: Arch) -> bool {
    !(mode == BootMode::Bios && arch == Arch::Aarch64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BootModes {
    Bios,
    Uefi,
    Both,
}

impl BootModes {
    pub fn modes(self) -> Vec<BootMode> {
        match self {
            BootModes::Bios => vec![BootMode::Bios],
            BootModes::Uefi => vec![BootMode::Uefi],
            BootModes::Both => vec![BootMode::Bios, BootMode::Uefi],
        }
    }

    pub fn includes(self, mode: BootMode) -> bool {
        self.modes().contains(&mode)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
pub enum Arches {
    #[value(name = "x86_64")]
    #[serde(rename = "x86_64")]
    X86_64,
    #[value(name = "aarch64")]
    #[serde(rename = "aarch64")]
    Aarch64,
    #[value(name = "both")]
    #[serde(rename = "both")]
    Both,
}

impl Arches {
    pub fn arches(self) -> Vec<Arch> {
        match self {
            Arches::X86_64 => vec![Arch::X86_64],
            Arches::Aarch64 => vec![Arch::Aarch64],
            Arches::Both => vec![Arch::X86_64, Arch::Aarch64],
        }
    }
}

/// Where the model payload comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSource {
    Local(PathBuf),
    Url(String),
}

impl ModelSource {
    pub fn parse(raw: &str) -> Self {
        if raw.starts_with("http://") || raw.starts_with("https://") {
            ModelSource::Url(raw.to_owned())
        } else {
            ModelSource::Local(PathBuf::from(raw))
        }
    }
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelSource::Local(path) => write!(f, "{}", path.display()),
            ModelSource::Url(url) => f.write_str(url),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildConfig {
    pub repo: String,
    pub model: ModelSource,
    pub build_dir: PathBuf,
    pub output_dir: PathBuf,
    pub boot_modes: BootModes,
    pub arches: Arches,
    pub memory: String,
    pub verbose: bool,
    pub test: bool,
    pub vga: bool,
    pub runtime_args: Option<String>,
}

impl BuildConfig {
    pub fn validate(self) -> Result<Self> {
        if let ModelSource::Local(path) = &self.model {
            if !path.is_file() {
                return Err(Error::Config(format!(
                    "model file not found: {}",
                    path.display()
                )));
            }
        }
        validate_memory(&self.memory)?;
        if self.combinations().is_empty() {
            return Err(Error::Config(
                "BIOS boot is not available on aarch64; use --boot-mode uefi".into(),
            ));
        }
        Ok(self)
    }

    /// Every (mode, arch) pair this run produces media for.
    pub fn combinations(&self) -> Vec<(BootMode, Arch)> {
        let mut combos = Vec::new();
        for mode in self.boot_modes.modes() {
            for arch in self.arches.arches() {
                if supports(mode, arch) {
                    combos.push((mode, arch));
                }
            }
        }
        combos
    }

    /// Architectures that receive an EFI boot file.
    pub fn uefi_arches(&self) -> Vec<Arch> {
        if self.boot_modes.includes(BootMode::Uefi) {
            self.arches.arches()
        } else {
            Vec::new()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DebugConfig {
    pub image: PathBuf,
    pub mode: BootMode,
    pub arch: Arch,
    pub memory: String,
    pub output_dir: PathBuf,
    pub gdb: bool,
    pub wait: bool,
    pub verbose: bool,
}

impl DebugConfig {
    pub fn validate(mut self) -> Result<Self> {
        if !self.image.exists() {
            return Err(Error::Config(format!(
                "image not found: {}",
                self.image.display()
            )));
        }
        // Only a UEFI boot can take a directory, as the EFI tree.
        if self.mode == BootMode::Bios && !self.image.is_file() {
            return Err(Error::Config(format!(
                "BIOS boot needs a disk image file, not {}",
                self.image.display()
            )));
        }
        if !supports(self.mode, self.arch) {
            return Err(Error::Config(format!(
                "{} boot is not available on {}",
                self.mode, self.arch
            )));
        }
        validate_memory(&self.memory)?;
        // --wait is meaningless without the stub.
        self.gdb |= self.wait;
        Ok(self)
    }
}

/// QEMU `-m` syntax: a number with an optional K/M/G/T suffix.
fn validate_memory(memory: &str) -> Result<()> {
    let digits = memory.trim_end_matches(|c: char| "KMGTkmgt".contains(c));
    let suffix_len = memory.len() - digits.len();
    let valid = !digits.is_empty()
        && suffix_len <= 1
        && digits.bytes().all(|b| b.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(Error::Config(format!("invalid memory size `{memory}`")))
    }
}
