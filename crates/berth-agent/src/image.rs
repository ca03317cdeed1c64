//! Shared base-image cache for the managed-vm kind.
//!
//! One tarball per OS variant, downloaded at most once and shared by every
//! instance. Downloads stream to a temp file with periodic progress lines
//! into the requesting workload's console ring, retry with backoff, and are
//! moved into place atomically. Concurrent requests for the same variant
//! serialize on a per-variant lock so only one download runs.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Context;
use berth_workload::{OsVariant, StreamKind, WorkloadId};
use futures_util::StreamExt;
use sha1::Digest;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::config::AgentConfig;
use crate::log_ring::LogRing;

const PROGRESS_STEP_BYTES: u64 = 64 * 1024 * 1024;
const DOWNLOAD_ATTEMPTS: u32 = 3;

fn download_locks() -> &'static std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>> {
    static LOCKS: OnceLock<std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>> = OnceLock::new();
    LOCKS.get_or_init(|| std::sync::Mutex::new(HashMap::new()))
}

fn lock_for(key: &str) -> Arc<Mutex<()>> {
    let mut map = download_locks().lock().unwrap_or_else(|e| e.into_inner());
    map.entry(key.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

fn http_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .user_agent("berth-agent")
            .timeout(Duration::from_secs(15 * 60))
            .build()
            .expect("failed to build reqwest client")
    })
}

pub fn image_url(cfg: &AgentConfig, variant: OsVariant) -> String {
    cfg.image_base_url.replace("{variant}", variant.as_str())
}

pub fn cached_image_path(cfg: &AgentConfig, variant: OsVariant) -> PathBuf {
    cfg.image_cache_dir()
        .join(variant.as_str())
        .join("base.tar.gz")
}

fn mark_last_used(entry_dir: &std::path::Path) {
    let path = entry_dir.join(".last_used");
    let now_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    // Best-effort.
    let _ = std::fs::write(path, format!("{now_ms}\n"));
}

/// Ensure the base image for `variant` is present in the cache, downloading
/// it if needed. Progress and retry narration goes to `id`'s console ring.
/// `expected_sha1` (hex), when known, is verified before the file is
/// published into the cache.
pub async fn ensure_base_image(
    cfg: &AgentConfig,
    variant: OsVariant,
    expected_sha1: Option<&str>,
    logs: &LogRing,
    id: &WorkloadId,
) -> anyhow::Result<PathBuf> {
    let path = cached_image_path(cfg, variant);
    if path.exists() {
        if let Some(dir) = path.parent() {
            mark_last_used(dir);
        }
        return Ok(path);
    }

    let lock = lock_for(variant.as_str());
    let _guard = lock.lock().await;
    if path.exists() {
        if let Some(dir) = path.parent() {
            mark_last_used(dir);
        }
        return Ok(path);
    }

    let dir = path.parent().expect("cache path has a parent");
    tokio::fs::create_dir_all(dir)
        .await
        .context("create image cache dir")?;

    let url = image_url(cfg, variant);
    logs.append(
        id,
        StreamKind::System,
        format!("downloading base image for {} from {url}", variant.as_str()),
    )
    .await;

    let tmp = path.with_extension("tar.gz.tmp");
    let mut last_err: Option<anyhow::Error> = None;
    for attempt in 1..=DOWNLOAD_ATTEMPTS {
        match download_to(&url, &tmp, logs, id).await {
            Ok(()) => {
                last_err = None;
                break;
            }
            Err(e) => {
                logs.append(
                    id,
                    StreamKind::System,
                    format!("image download attempt {attempt} failed: {e:#}"),
                )
                .await;
                last_err = Some(e);
                if attempt < DOWNLOAD_ATTEMPTS {
                    tokio::time::sleep(Duration::from_millis(
                        500_u64.saturating_mul(2_u64.pow(attempt - 1)),
                    ))
                    .await;
                }
            }
        }
    }
    if let Some(e) = last_err {
        // The partial temp file stays behind so the next provisioning
        // attempt resumes instead of starting over.
        return Err(e);
    }

    if let Some(expected) = expected_sha1 {
        let data = tokio::fs::read(&tmp).await.context("read downloaded image")?;
        let got = hex::encode(sha1::Sha1::digest(&data));
        if got != expected {
            let _ = tokio::fs::remove_file(&tmp).await;
            anyhow::bail!("base image sha1 mismatch: expected {expected}, got {got}");
        }
    }

    tokio::fs::rename(&tmp, &path)
        .await
        .context("publish image into cache")?;
    write_meta(dir, &url, &path, expected_sha1).await;
    mark_last_used(dir);

    logs.append(
        id,
        StreamKind::System,
        format!("base image ready: {}", path.display()),
    )
    .await;
    Ok(path)
}

/// Best-effort cache-entry descriptor next to the published image.
async fn write_meta(
    dir: &std::path::Path,
    url: &str,
    image: &std::path::Path,
    sha1: Option<&str>,
) {
    let size = tokio::fs::metadata(image).await.map(|m| m.len()).unwrap_or(0);
    let meta = serde_json::json!({
        "url": url,
        "size_bytes": size,
        "sha1": sha1,
        "fetched_at": chrono::Utc::now().to_rfc3339(),
    });
    if let Ok(data) = serde_json::to_vec_pretty(&meta) {
        let _ = tokio::fs::write(dir.join("meta.json"), data).await;
    }
}

/// One download attempt into `tmp`. A partial file left by a previous
/// attempt is resumed with a range request; a server that ignores the range
/// (plain 200) restarts the file from scratch.
async fn download_to(
    url: &str,
    tmp: &std::path::Path,
    logs: &LogRing,
    id: &WorkloadId,
) -> anyhow::Result<()> {
    let offset = tokio::fs::metadata(tmp).await.map(|m| m.len()).unwrap_or(0);

    let mut request = http_client().get(url);
    if offset > 0 {
        request = request.header(reqwest::header::RANGE, format!("bytes={offset}-"));
    }
    let resp = request
        .send()
        .await
        .context("request base image")?
        .error_for_status()
        .context("base image request status")?;

    let resuming = offset > 0 && resp.status() == reqwest::StatusCode::PARTIAL_CONTENT;
    let total = match resp.content_length() {
        Some(len) if resuming => len + offset,
        Some(len) => len,
        None => 0,
    };

    let mut file = if resuming {
        logs.append(
            id,
            StreamKind::System,
            format!("resuming image download at {} MiB", offset / (1024 * 1024)),
        )
        .await;
        tokio::fs::OpenOptions::new()
            .append(true)
            .open(tmp)
            .await
            .context("reopen partial image temp file")?
    } else {
        tokio::fs::File::create(tmp)
            .await
            .context("create image temp file")?
    };

    let mut stream = resp.bytes_stream();
    let mut downloaded: u64 = if resuming { offset } else { 0 };
    let mut next_report = (downloaded / PROGRESS_STEP_BYTES + 1) * PROGRESS_STEP_BYTES;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("read image chunk")?;
        file.write_all(&chunk).await.context("write image chunk")?;
        downloaded += chunk.len() as u64;
        if downloaded >= next_report {
            next_report += PROGRESS_STEP_BYTES;
            let pct = if total > 0 {
                format!(" ({}%)", downloaded * 100 / total)
            } else {
                String::new()
            };
            logs.append(
                id,
                StreamKind::System,
                format!("image download: {} MiB{pct}", downloaded / (1024 * 1024)),
            )
            .await;
        }
    }
    file.flush().await.ok();
    Ok(())
}
