//! Working directories, the upstream source checkout, and the per-run
//! session namespace.

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{Arch, BootMode};
use crate::error::IoContext;
use crate::runner::{CommandRunner, ToolCommand};
use crate::Result;

/// One invocation. The id is a local timestamp with one-second resolution
/// and namespaces every log and report the run writes.
#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    log_dir: PathBuf,
}

impl Session {
    pub fn start(output_dir: &Path) -> Result<Self> {
        let id = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
        Self::with_id(output_dir, id)
    }

    pub fn with_id(output_dir: &Path, id: impl Into<String>) -> Result<Self> {
        let log_dir = output_dir.join("logs");
        fs::create_dir_all(&log_dir).at(&log_dir)?;
        Ok(Self {
            id: id.into(),
            log_dir,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn session_log(&self) -> PathBuf {
        self.log_file("session", "log")
    }

    pub fn build_log(&self) -> PathBuf {
        self.log_file("build", "log")
    }

    pub fn serial_log(&self, mode: BootMode, arch: Arch) -> PathBuf {
        self.log_file(&format!("serial-{mode}-{arch}"), "log")
    }

    pub fn monitor_log(&self, mode: BootMode, arch: Arch) -> PathBuf {
        self.log_file(&format!("monitor-{mode}-{arch}"), "log")
    }

    pub fn summary(&self) -> PathBuf {
        self.log_file("debug-summary", "txt")
    }

    pub fn manifest(&self) -> PathBuf {
        self.log_file("artifacts", "json")
    }

    fn log_file(&self, kind: &str, ext: &str) -> PathBuf {
        self.log_dir.join(format!("{kind}-{}.{ext}", self.id))
    }
}

/// Directory a repository URL is checked out into.
pub fn checkout_name(repo: &str) -> String {
    let name = repo
        .trim_end_matches('/')
        .rsplit(['/', ':'])
        .next()
        .unwrap_or_default()
        .trim_end_matches(".git");
    if name.is_empty() {
        "source".to_owned()
    } else {
        name.to_owned()
    }
}

/// Clone `repo` under `build_dir`, or fast-forward an existing checkout.
/// Returns the checkout path.
pub async fn prepare_source(
    repo: &str,
    build_dir: &Path,
    runner: &dyn CommandRunner,
) -> Result<PathBuf> {
    fs::create_dir_all(build_dir).at(build_dir)?;
    let checkout = build_dir.join(checkout_name(repo));

    let cmd = if checkout.join(".git").exists() {
        tracing::info!(path = %checkout.display(), "updating existing source tree");
        ToolCommand::new("git")
            .arg("-C")
            .arg(&checkout)
            .args(["pull", "--ff-only"])
    } else {
        tracing::info!(%repo, path = %checkout.display(), "cloning source tree");
        ToolCommand::new("git")
            .args(["clone", "--depth", "1", repo])
            .arg(&checkout)
    };
    cmd.check(runner.run(&cmd).await?)?;
    Ok(checkout)
}

pub fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).at(dir)
}

/// Lay out a scratch EFI system partition tree for booting `image` under
/// UEFI. A directory image is taken to be such a tree already. A `.efi`
/// file is copied in under the removable-media boot name; anything else
/// leaves the tree empty and the firmware will drop to its shell.
pub fn stage_efi(image: &Path, arch: Arch, scratch: &Path) -> Result<PathBuf> {
    if image.is_dir() {
        return Ok(image.to_path_buf());
    }

    let boot_dir = scratch.join("EFI").join("BOOT");
    fs::create_dir_all(&boot_dir).at(&boot_dir)?;

    let is_efi = image
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("efi"));
    if is_efi {
        let target = boot_dir.join(arch.efi_boot_file());
        fs::copy(image, &target).at(&target)?;
        tracing::info!(target = %target.display(), "staged EFI application");
    } else {
        tracing::warn!(
            image = %image.display(),
            "image is not an .efi application; EFI tree left empty"
        );
    }
    Ok(scratch.to_path_buf())
}
