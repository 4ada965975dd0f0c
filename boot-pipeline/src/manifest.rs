use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::BuildConfig;
use crate::error::IoContext;
use crate::Result;

/// Every file a build run produced.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactSet {
    pub final_artifact: Option<PathBuf>,
    pub bios_image: Option<PathBuf>,
    pub efi_dir: Option<PathBuf>,
    pub efi_boot_files: Vec<PathBuf>,
    pub fat_image_script: Option<PathBuf>,
    pub patch: Option<PathBuf>,
    pub build_log: Option<PathBuf>,
}

#[derive(Serialize)]
struct Manifest<'a> {
    session: &'a str,
    config: &'a BuildConfig,
    artifacts: &'a ArtifactSet,
}

pub fn write(path: &Path, session: &str, config: &BuildConfig, artifacts: &ArtifactSet) -> Result<()> {
    let manifest = Manifest {
        session,
        config,
        artifacts,
    };
    let json = serde_json::to_string_pretty(&manifest)?;
    fs::write(path, json).at(path)?;
    tracing::debug!(path = %path.display(), "wrote artifact manifest");
    Ok(())
}
