use std::ffi::OsString;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use futures_util::StreamExt;
use log::{debug, info, warn};
use reqwest::Client;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::util::{CANCELLED, cancel_requested, format_speed, progress_percent};

use super::{ArchiveTarget, ProgressCallback, ProgressUpdate, emit_progress};

/// Download `target` into `cache_dir`, reusing a cached copy that still checks out.
pub async fn fetch_archive(
    client: &Client,
    target: &ArchiveTarget,
    cache_dir: &Path,
    cancel: Option<Arc<AtomicBool>>,
    progress: &mut ProgressCallback<'_>,
) -> Result<PathBuf, String> {
    if cancel_requested(&cancel) {
        return Err(CANCELLED.into());
    }
    fs::create_dir_all(cache_dir).map_err(|e| format!("failed to create cache directory: {e}"))?;
    let dest = cache_dir.join(&target.file_name);

    if dest.exists() {
        if cache_is_fresh(client, target, &dest).await {
            info!("fetch: cache hit for {}", target.file_name);
            emit_progress(
                progress,
                ProgressUpdate::done("download", &target.name, "cached"),
            );
            return Ok(dest);
        }
        debug!("fetch: cached {} is stale or unverifiable", dest.display());
    }

    let part = partial_path(&dest);
    match download(client, target, &part, cancel, progress).await {
        Ok(downloaded) => {
            fs::rename(&part, &dest).map_err(|e| {
                discard(&part);
                format!("failed to move {} into the cache: {e}", part.display())
            })?;
            info!("fetch: completed {} ({downloaded} bytes)", dest.display());
            Ok(dest)
        }
        Err(err) => {
            discard(&part);
            if err == CANCELLED {
                return Err(err);
            }
            Err(format!("{}: {err}", target.file_name))
        }
    }
}

/// Sibling `<file>.part` that holds a download until it is complete.
fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("archive"));
    name.push(".part");
    dest.with_file_name(name)
}

fn discard(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("fetch: removed {}", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!("fetch: unable to remove {} ({err})", path.display()),
    }
}

/// A cached archive is reused only when its digest, or failing that its
/// size against the server's `Content-Length`, matches.
async fn cache_is_fresh(client: &Client, target: &ArchiveTarget, dest: &Path) -> bool {
    if let Some(expected) = target.sha256.as_deref() {
        return verify_sha256(dest, expected).is_ok();
    }

    let local_len = match fs::metadata(dest) {
        Ok(meta) => meta.len(),
        Err(_) => return false,
    };
    match client.head(&target.url).send().await {
        Ok(resp) if resp.status().is_success() => {
            resp.content_length().is_some_and(|len| len == local_len)
        }
        Ok(resp) => {
            debug!("fetch: HEAD {} returned {}", target.url, resp.status());
            false
        }
        Err(err) => {
            warn!(
                "fetch: HEAD {} failed ({err}); cached archive cannot be verified without a sha256",
                target.url
            );
            false
        }
    }
}

/// Stream `target` into `part`, checking the digest before returning the byte count.
async fn download(
    client: &Client,
    target: &ArchiveTarget,
    part: &Path,
    cancel: Option<Arc<AtomicBool>>,
    progress: &mut ProgressCallback<'_>,
) -> Result<u64, String> {
    info!("fetch: downloading {} -> {}", target.url, part.display());
    emit_progress(
        progress,
        ProgressUpdate {
            stage: "download",
            progress: 0.0,
            message: format!("Downloading {}...", target.name),
            current_file: Some(target.file_name.clone()),
            speed: None,
            downloaded: None,
            total: None,
        },
    );

    let response = client
        .get(&target.url)
        .send()
        .await
        .map_err(|e| format!("download request failed: {e}"))?
        .error_for_status()
        .map_err(|e| format!("download status error: {e}"))?;

    let total = response.content_length();
    let mut stream = response.bytes_stream();
    let mut file = File::create(part)
        .await
        .map_err(|e| format!("failed to create archive file: {e}"))?;

    let mut downloaded: u64 = 0;
    let mut last_tick = Instant::now();
    let mut last_bytes = 0u64;

    while let Some(chunk) = stream.next().await {
        if cancel_requested(&cancel) {
            return Err(CANCELLED.into());
        }
        let chunk = chunk.map_err(|e| match total {
            Some(total) => {
                format!("download incomplete: received {downloaded} of {total} bytes ({e})")
            }
            None => format!("stream error: {e}"),
        })?;
        file.write_all(&chunk)
            .await
            .map_err(|e| format!("write error: {e}"))?;
        downloaded += chunk.len() as u64;

        let elapsed = last_tick.elapsed().as_secs_f32();
        if elapsed > 0.2 {
            let speed = (downloaded - last_bytes) as f32 / elapsed;
            emit_progress(
                progress,
                ProgressUpdate {
                    stage: "download",
                    progress: progress_percent(downloaded, total),
                    message: format!("Downloading {}...", target.name),
                    current_file: Some(target.file_name.clone()),
                    speed: Some(format_speed(speed)),
                    downloaded: Some(downloaded),
                    total,
                },
            );
            last_tick = Instant::now();
            last_bytes = downloaded;
        }
    }

    file.flush()
        .await
        .map_err(|e| format!("flush error: {e}"))?;
    drop(file);

    if let Some(total) = total
        && downloaded < total
    {
        return Err(format!(
            "download incomplete: received {downloaded} of {total} bytes"
        ));
    }
    if let Some(expected) = target.sha256.as_deref() {
        verify_sha256(part, expected)?;
    }

    emit_progress(
        progress,
        ProgressUpdate {
            stage: "download",
            progress: 100.0,
            message: format!("Downloaded {}", target.name),
            current_file: Some(target.file_name.clone()),
            speed: Some("0 B/s".into()),
            downloaded: Some(downloaded),
            total,
        },
    );
    Ok(downloaded)
}

pub fn verify_sha256(path: &Path, expected: &str) -> Result<(), String> {
    let mut file = fs::File::open(path).map_err(|e| format!("checksum open error: {e}"))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let read = file
            .read(&mut buf)
            .map_err(|e| format!("checksum read error: {e}"))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    let actual = format!("{:x}", hasher.finalize());
    let expected = expected.trim().to_lowercase();
    if actual != expected {
        return Err(format!(
            "checksum mismatch: expected {expected}, got {actual}"
        ));
    }
    Ok(())
}
