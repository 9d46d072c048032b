//! Install media: a local ISO, or one downloaded once into the cache.

use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::AsyncWriteExt;

use crate::error::ScratchError;

fn is_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

/// Stream a response body into `path`, advancing `pb` per chunk.
async fn download_to_file(
    path: &Path,
    response: reqwest::Response,
    pb: &ProgressBar,
) -> Result<(), ScratchError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| ScratchError::Io {
            context: format!("creating {}", path.display()),
            source: e,
        })?;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ScratchError::Download {
            message: "error reading response body".into(),
            source: Box::new(e),
        })?;
        file.write_all(&chunk).await.map_err(|e| ScratchError::Io {
            context: "writing ISO data".into(),
            source: e,
        })?;
        pb.inc(chunk.len() as u64);
    }

    file.flush().await.map_err(|e| ScratchError::Io {
        context: "flushing ISO file".into(),
        source: e,
    })
}

/// Resolve the installer ISO.
///
/// `iso` wins when given: a local path must exist, a URL is downloaded.
/// Otherwise `iso_url` is downloaded. Downloads land in `cache_dir` under
/// the URL's file name and are reused on later runs.
pub async fn ensure_iso(
    iso: Option<&str>,
    iso_url: Option<&str>,
    cache_dir: &Path,
) -> Result<PathBuf, ScratchError> {
    let source = match (iso, iso_url) {
        (Some(iso), _) => iso,
        (None, Some(url)) => url,
        (None, None) => {
            return Err(ScratchError::PrerequisiteMissing {
                what: "installer ISO".into(),
                hint: "pass --iso PATH or set template.iso_url in scratchvm.toml".into(),
            });
        }
    };

    if !is_url(source) {
        let path = crate::paths::expand_home(source);
        if !path.is_file() {
            return Err(ScratchError::PrerequisiteMissing {
                what: format!("installer ISO {}", path.display()),
                hint: "check the --iso path".into(),
            });
        }
        return Ok(path);
    }

    let filename = source
        .rsplit('/')
        .next()
        .filter(|f| !f.is_empty())
        .unwrap_or("install.iso");

    tokio::fs::create_dir_all(cache_dir)
        .await
        .map_err(|e| ScratchError::Io {
            context: format!("creating cache dir {}", cache_dir.display()),
            source: e,
        })?;

    let dest = cache_dir.join(filename);
    if dest.exists() {
        tracing::info!(path = %dest.display(), "using cached ISO");
        return Ok(dest);
    }

    tracing::info!(url = %source, "downloading ISO");
    let response = reqwest::get(source)
        .await
        .map_err(|e| ScratchError::Download {
            message: format!("request to {source} failed"),
            source: Box::new(e),
        })?;

    if !response.status().is_success() {
        return Err(ScratchError::Download {
            message: format!("HTTP {} from {source}", response.status()),
            source: format!("HTTP {}", response.status()).into(),
        });
    }

    let pb = ProgressBar::new(response.content_length().unwrap_or(0));
    if let Ok(style) =
        ProgressStyle::default_bar().template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
    {
        pb.set_style(style.progress_chars("#>-"));
    }

    let tmp_path = dest.with_extension("part");
    let _ = tokio::fs::remove_file(&tmp_path).await;

    if let Err(e) = download_to_file(&tmp_path, response, &pb).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        pb.abandon();
        return Err(e);
    }

    tokio::fs::rename(&tmp_path, &dest)
        .await
        .map_err(|e| ScratchError::Io {
            context: format!("renaming {} to {}", tmp_path.display(), dest.display()),
            source: e,
        })?;

    pb.finish_and_clear();
    tracing::info!(path = %dest.display(), "ISO cached");
    Ok(dest)
}
