//! The subprocess boundary.
//!
//! Every external tool (`git`, `make`, QEMU) is described by a
//! [`ToolCommand`] and executed through a [`CommandRunner`]. Arguments are
//! kept as a list and handed straight to `execve`; nothing is ever passed
//! through a shell.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;

use crate::error::IoContext;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    program: String,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    log: Option<PathBuf>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            log: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_owned()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Append stdout and stderr to `path` instead of inheriting them.
    pub fn log_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.log = Some(path.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    pub fn get_current_dir(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn get_log(&self) -> Option<&Path> {
        self.log.as_deref()
    }

    /// True if any argument equals `needle`.
    pub fn has_arg(&self, needle: &str) -> bool {
        self.args.iter().any(|a| a == needle)
    }

    /// Turn a non-zero exit into [`Error::CommandFailed`].
    pub fn check(&self, status: Exit) -> Result<()> {
        if status.success() {
            Ok(())
        } else {
            Err(Error::CommandFailed {
                tool: self.program.clone(),
                status,
            })
        }
    }
}

/// Display form for logs only; it is never executed.
impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Exit state of a finished child. `None` means killed by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exit(pub Option<i32>);

impl Exit {
    pub const SUCCESS: Exit = Exit(Some(0));

    pub fn success(self) -> bool {
        self.0 == Some(0)
    }
}

impl fmt::Display for Exit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(code) => write!(f, "exit code {code}"),
            None => write!(f, "signal"),
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `cmd` to completion. Launch failures are errors; a non-zero
    /// exit is reported through [`Exit`] so callers decide whether it is
    /// fatal.
    async fn run(&self, cmd: &ToolCommand) -> Result<Exit>;
}

/// Runs commands on the host with `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, cmd: &ToolCommand) -> Result<Exit> {
        tracing::debug!(command = %cmd, "spawning");

        let mut child = tokio::process::Command::new(&cmd.program);
        child.args(&cmd.args).stdin(Stdio::null());
        if let Some(dir) = &cmd.cwd {
            child.current_dir(dir);
        }
        if let Some(log) = &cmd.log {
            let out = OpenOptions::new()
                .create(true)
                .append(true)
                .open(log)
                .at(log)?;
            let err = out.try_clone().at(log)?;
            child.stdout(Stdio::from(out)).stderr(Stdio::from(err));
        }

        let status = child.status().await.map_err(|source| Error::Spawn {
            tool: cmd.program.clone(),
            source,
        })?;
        Ok(Exit(status.code()))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_keeps_arguments_separate() {
        let cmd = ToolCommand::new("make")
            .arg("MODE=opt")
            .args(["-j", "4"])
            .arg("CPPFLAGS=-DA -DB")
            .current_dir("/src");
        assert_eq!(cmd.get_args().len(), 4);
        assert!(cmd.has_arg("CPPFLAGS=-DA -DB"));
        assert_eq!(cmd.get_current_dir(), Some(Path::new("/src")));
        assert_eq!(cmd.to_string(), "make MODE=opt -j 4 CPPFLAGS=-DA -DB");
    }

    #[test]
    fn check_maps_failures() {
        let cmd = ToolCommand::new("git");
        assert!(cmd.check(Exit::SUCCESS).is_ok());
        let err = cmd.check(Exit(Some(128))).unwrap_err();
        assert_eq!(err.to_string(), "`git` failed with exit code 128");
        assert!(cmd.check(Exit(None)).is_err());
    }
}
