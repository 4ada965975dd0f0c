//! QEMU invocation and live serial output.
//!
//! The emulator writes the guest's serial port to a file; a tail task
//! copies that file to the console while the emulator runs. The two only
//! share the file. Once QEMU exits the tail is told to stop, drains what
//! is left, and is aborted if it does not finish promptly.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::{Arch, BootMode};
use crate::runner::{CommandRunner, Exit, ToolCommand};
use crate::templates::GDB_PORT;
use crate::Result;

const POLL: Duration = Duration::from_millis(200);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugStub {
    /// Freeze the CPU until a debugger connects (`-S`).
    pub wait: bool,
}

/// Everything needed to boot one (mode, arch) combination.
#[derive(Debug, Clone)]
pub struct EmulatorPlan {
    pub mode: BootMode,
    pub arch: Arch,
    pub memory: String,
    pub graphical: bool,
    /// Raw disk image for BIOS, EFI tree root for UEFI.
    pub boot_source: PathBuf,
    pub firmware: Option<PathBuf>,
    pub serial_log: PathBuf,
    pub monitor_log: PathBuf,
    pub debug: Option<DebugStub>,
}

/// QEMU splits `-drive` options on commas; a literal comma is doubled.
fn qemu_path(path: &Path) -> String {
    path.display().to_string().replace(',', ",,")
}

fn opt(prefix: &str, path: &Path) -> OsString {
    OsString::from(format!("{prefix}{}", qemu_path(path)))
}

pub fn qemu_command(plan: &EmulatorPlan) -> ToolCommand {
    let mut cmd = ToolCommand::new(plan.arch.qemu_binary());
    cmd = match plan.arch {
        Arch::X86_64 => cmd.args(["-machine", "q35"]),
        Arch::Aarch64 => cmd.args(["-machine", "virt", "-cpu", "cortex-a72"]),
    };
    cmd = cmd.arg("-m").arg(&plan.memory);

    cmd = match (plan.graphical, plan.arch) {
        (true, Arch::X86_64) => cmd.args(["-vga", "std"]),
        (true, Arch::Aarch64) => cmd.args(["-device", "ramfb"]),
        (false, _) => cmd.args(["-display", "none"]),
    };
    cmd = cmd
        .arg("-serial")
        .arg(opt("file:", &plan.serial_log))
        .arg("-monitor")
        .arg(opt("file:", &plan.monitor_log));

    cmd = match plan.mode {
        BootMode::Bios => cmd
            .arg("-drive")
            .arg(opt("format=raw,file=", &plan.boot_source)),
        BootMode::Uefi => {
            if let Some(firmware) = &plan.firmware {
                cmd = match plan.arch {
                    Arch::X86_64 => cmd
                        .arg("-drive")
                        .arg(opt("if=pflash,format=raw,readonly=on,file=", firmware)),
                    Arch::Aarch64 => cmd.arg("-bios").arg(firmware),
                };
            }
            cmd.arg("-drive")
                .arg(opt("format=raw,file=fat:rw:", &plan.boot_source))
        }
    };

    if let Some(stub) = plan.debug {
        cmd = cmd.arg("-gdb").arg(format!("tcp::{GDB_PORT}"));
        if stub.wait {
            cmd = cmd.arg("-S");
        }
    }
    cmd
}

/// Boot `plan` and block until QEMU exits. Only a failure to launch is an
/// error; any exit status, including the user quitting, is returned.
pub async fn run(plan: &EmulatorPlan, runner: &dyn CommandRunner) -> Result<Exit> {
    let cmd = qemu_command(plan);
    tracing::info!(mode = %plan.mode, arch = %plan.arch, "starting emulator");
    tracing::debug!(command = %cmd);
    if let Some(stub) = plan.debug {
        tracing::info!(
            port = GDB_PORT,
            wait = stub.wait,
            "GDB stub enabled"
        );
    }

    let tail = Tail::spawn(plan.serial_log.clone(), tokio::io::stdout());
    let result = runner.run(&cmd).await;
    tail.finish().await;

    let status = result?;
    if status.success() {
        tracing::info!("emulator exited cleanly");
    } else {
        tracing::warn!(%status, "emulator exited");
    }
    Ok(status)
}

/// Background copy of a growing file to a writer.
pub struct Tail {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<io::Result<()>>,
}

impl Tail {
    pub fn spawn<W>(path: PathBuf, out: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (stop, stopped) = oneshot::channel();
        let handle = tokio::spawn(follow(path, out, stopped));
        Self { stop, handle }
    }

    pub async fn finish(mut self) {
        // The task may already be gone; that is fine.
        let _ = self.stop.send(());
        match tokio::time::timeout(DRAIN_TIMEOUT, &mut self.handle).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => tracing::warn!(error = %e, "serial tail failed"),
            Ok(Err(e)) => tracing::warn!(error = %e, "serial tail task died"),
            Err(_) => self.handle.abort(),
        }
    }
}

/// Copy `path` to `out` as it grows. After `stop` fires, copy whatever is
/// left and return.
pub async fn follow<W>(path: PathBuf, mut out: W, mut stop: oneshot::Receiver<()>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut file = loop {
        match File::open(&path).await {
            Ok(file) => break file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        tokio::select! {
            _ = &mut stop => return Ok(()),
            _ = tokio::time::sleep(POLL) => {}
        }
    };

    let mut buf = vec![0u8; 8192];
    let mut stopping = false;
    loop {
        let n = file.read(&mut buf).await?;
        if n > 0 {
            out.write_all(&buf[..n]).await?;
            out.flush().await?;
            continue;
        }
        if stopping {
            return Ok(());
        }
        tokio::select! {
            _ = &mut stop => stopping = true,
            _ = tokio::time::sleep(POLL) => {}
        }
    }
}
