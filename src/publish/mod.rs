use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use log::{debug, info, warn};
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use tokio::time::sleep;

use crate::settings::{SmokeSettings, ViewerSettings};
use crate::util::cancel_requested;

const LOG_EVERY: u64 = 30;
const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Content type sent with a frame, from its file extension.
pub fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        _ => "application/octet-stream",
    }
}

/// Image files cycled frame after frame.
#[derive(Debug)]
pub struct FrameSource {
    files: Vec<PathBuf>,
    next: usize,
}

impl FrameSource {
    /// A single file, or the images of a directory in name order.
    pub fn open(path: &Path) -> Result<Self, String> {
        let meta = std::fs::metadata(path)
            .map_err(|e| format!("unable to read {}: {e}", path.display()))?;
        let files = if meta.is_dir() {
            let entries = std::fs::read_dir(path)
                .map_err(|e| format!("unable to list {}: {e}", path.display()))?;
            let mut files: Vec<PathBuf> = entries
                .filter_map(|entry| entry.ok().map(|entry| entry.path()))
                .filter(|file| file.is_file() && is_image(file))
                .collect();
            files.sort();
            files
        } else {
            vec![path.to_path_buf()]
        };
        if files.is_empty() {
            return Err(format!("no images found in {}", path.display()));
        }
        debug!("publish: {} frame file(s) from {}", files.len(), path.display());
        Ok(Self { files, next: 0 })
    }

    pub async fn next_frame(&mut self) -> Result<(Vec<u8>, &'static str), String> {
        let path = &self.files[self.next];
        self.next = (self.next + 1) % self.files.len();
        let body = tokio::fs::read(path)
            .await
            .map_err(|e| format!("unable to read frame {}: {e}", path.display()))?;
        Ok((body, content_type(path)))
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

/// Key expressions the frames are put to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishKeys {
    pub rgb: String,
    pub depth: String,
}

impl PublishKeys {
    /// `<prefix>/rgb` and `<prefix>/depth`, or the viewer's keys without a prefix.
    pub fn new(viewer: &ViewerSettings, prefix: Option<&str>) -> Self {
        match prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
            Some(prefix) => Self {
                rgb: format!("{prefix}/rgb"),
                depth: format!("{prefix}/depth"),
            },
            None => Self {
                rgb: viewer.rgb_key.trim_matches('/').to_owned(),
                depth: viewer.depth_key.trim_matches('/').to_owned(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PublishOptions {
    pub interval: Duration,
    /// Stop after this many frames; run until cancelled otherwise.
    pub count: Option<u64>,
    /// Pause after a failed put before the next frame.
    pub retry_delay: Duration,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(33),
            count: None,
            retry_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishSummary {
    pub frames: u64,
    pub failures: u64,
}

/// Puts camera frames into the router through its REST plugin.
pub struct Publisher {
    client: Client,
    rest_url: String,
    keys: PublishKeys,
}

impl Publisher {
    pub fn new(settings: &SmokeSettings, keys: PublishKeys) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs.max(1)))
            .user_agent(concat!("zenohd-setup/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|err| {
                warn!("publish: falling back to default HTTP client configuration ({err})");
                Client::new()
            });
        Self {
            client,
            rest_url: settings.rest_url.trim_end_matches('/').to_owned(),
            keys,
        }
    }

    pub fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.rest_url, key.trim_start_matches('/'))
    }

    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), String> {
        let url = self.url_for(key);
        let resp = self
            .client
            .put(&url)
            .header(CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await
            .map_err(|e| format!("put to {url} failed: {e}"))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(format!("put to {url} returned {}", resp.status()))
        }
    }

    /// Publish frames until `count` is reached or the cancel flag is set.
    ///
    /// Failed puts are logged and counted; unreadable frame files end the run.
    pub async fn run(
        &self,
        rgb: &mut FrameSource,
        mut depth: Option<&mut FrameSource>,
        options: PublishOptions,
        cancel: &Option<Arc<AtomicBool>>,
    ) -> Result<PublishSummary, String> {
        info!(
            "publish: sending to {} every {} ms",
            self.url_for(&self.keys.rgb),
            options.interval.as_millis()
        );
        let mut summary = PublishSummary::default();

        while options.count.is_none_or(|count| summary.frames < count) {
            if cancel_requested(cancel) {
                info!("publish: stopping after {} frame(s)", summary.frames);
                break;
            }

            let (body, kind) = rgb.next_frame().await?;
            let mut result = self.put(&self.keys.rgb, body, kind).await;
            if let Some(source) = depth.as_deref_mut() {
                let (body, kind) = source.next_frame().await?;
                let depth_result = self.put(&self.keys.depth, body, kind).await;
                result = result.and(depth_result);
            }
            summary.frames += 1;

            match result {
                Ok(()) => {
                    if summary.frames % LOG_EVERY == 0 {
                        info!(
                            "publish: {} frame(s) sent to {}",
                            summary.frames,
                            self.url_for(&self.keys.rgb)
                        );
                    }
                    sleep(options.interval).await;
                }
                Err(err) => {
                    summary.failures += 1;
                    warn!("publish: frame {}: {err}", summary.frames);
                    sleep(options.retry_delay).await;
                }
            }
        }
        Ok(summary)
    }
}
