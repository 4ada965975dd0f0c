use std::io;
use std::path::{Path, PathBuf};

use crate::config::Arch;
use crate::runner::Exit;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("missing required tools: {}", .0.join(", "))]
    MissingTools(Vec<String>),

    #[error("no {arch} UEFI firmware found (searched: {})", searched.join(", "))]
    MissingFirmware { arch: Arch, searched: Vec<String> },

    #[error("failed to launch `{tool}`: {source}")]
    Spawn { tool: String, source: io::Error },

    #[error("`{tool}` failed with {status}")]
    CommandFailed { tool: String, status: Exit },

    #[error("no build output named `{pattern}` under {}", dir.display())]
    ArtifactNotFound { pattern: String, dir: PathBuf },

    #[error("no `int main(` definition in {}", path.display())]
    EntryNotFound { path: PathBuf },

    #[error("failed to fetch {url}: {source}")]
    Fetch { url: String, source: reqwest::Error },

    #[error("failed to fetch {url}: server returned {status}")]
    FetchStatus { url: String, status: u16 },

    #[error("{}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("failed to write manifest: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to install logger: {0}")]
    Logging(String),
}

/// Attach a path to an [`io::Error`].
pub(crate) trait IoContext<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.as_ref().to_path_buf(),
            source,
        })
    }
}
