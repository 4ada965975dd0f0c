//! Resolve the model source to a local file, downloading it if needed.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use crate::config::ModelSource;
use crate::error::IoContext;
use crate::{Error, Result};

/// File name a URL is cached under.
pub fn cache_name(url: &str) -> String {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let rest = rest.split(['?', '#']).next().unwrap_or_default();
    let name = match rest.split_once('/') {
        Some((_host, path)) => path.trim_end_matches('/').rsplit('/').next().unwrap_or_default(),
        None => "",
    };
    if name.is_empty() {
        "model.gguf".to_owned()
    } else {
        name.to_owned()
    }
}

pub async fn resolve_model(source: &ModelSource, cache_dir: &Path) -> Result<PathBuf> {
    match source {
        ModelSource::Local(path) => Ok(path.clone()),
        ModelSource::Url(url) => {
            let target = cache_dir.join(cache_name(url));
            if target.is_file() {
                tracing::info!(path = %target.display(), "using cached model");
                return Ok(target);
            }
            tokio::fs::create_dir_all(cache_dir).await.at(cache_dir)?;
            download(url, &target).await?;
            Ok(target)
        }
    }
}

/// Stream `url` into `target`. The body lands in a `.part` file first so an
/// interrupted download is never mistaken for a cached model.
async fn download(url: &str, target: &Path) -> Result<()> {
    tracing::info!(%url, "downloading model");
    let fetch_err = |source| Error::Fetch {
        url: url.to_owned(),
        source,
    };

    let mut response = reqwest::get(url).await.map_err(fetch_err)?;
    let status = response.status();
    if !status.is_success() {
        return Err(Error::FetchStatus {
            url: url.to_owned(),
            status: status.as_u16(),
        });
    }

    let partial = target.with_extension("part");
    let mut file = tokio::fs::File::create(&partial).await.at(&partial)?;
    let mut written = 0u64;
    while let Some(chunk) = response.chunk().await.map_err(fetch_err)? {
        file.write_all(&chunk).await.at(&partial)?;
        written += chunk.len() as u64;
    }
    file.flush().await.at(&partial)?;
    drop(file);

    tokio::fs::rename(&partial, target).await.at(target)?;
    tracing::info!(bytes = written, path = %target.display(), "model downloaded");
    Ok(())
}
