use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use log::{debug, info, warn};
use reqwest::Client;

use crate::env;
use crate::settings::ReleaseSettings;
use crate::storage::StorageManager;
use crate::util::expand_template;

pub mod apt;
pub mod archive;
pub mod fetch;

pub use apt::InstallOptions;
use archive::ArchiveKind;

#[derive(Clone, Debug)]
pub struct ProgressUpdate {
    pub stage: &'static str,
    pub progress: f32,
    pub message: String,
    pub current_file: Option<String>,
    pub speed: Option<String>,
    pub downloaded: Option<u64>,
    pub total: Option<u64>,
}

impl ProgressUpdate {
    pub fn done(stage: &'static str, file: &str, message: &str) -> Self {
        Self {
            stage,
            progress: 100.0,
            message: message.to_owned(),
            current_file: Some(file.to_owned()),
            speed: None,
            downloaded: None,
            total: None,
        }
    }
}

pub type ProgressCallback<'a> = Option<&'a mut (dyn FnMut(ProgressUpdate) + Send)>;

pub(crate) fn emit_progress(cb: &mut ProgressCallback<'_>, update: ProgressUpdate) {
    if let Some(callback) = cb.as_deref_mut() {
        callback(update);
    }
}

/// A release archive resolved for the host platform.
#[derive(Clone, Debug)]
pub struct ArchiveTarget {
    pub name: String,
    pub url: String,
    pub file_name: String,
    pub sha256: Option<String>,
    pub kind: ArchiveKind,
}

fn template_vars(version: &str) -> [(&'static str, String); 3] {
    [
        ("version", version.to_owned()),
        ("target", env::target_triple().to_owned()),
        ("deb_arch", env::deb_arch().to_owned()),
    ]
}

fn expand(template: &str, version: &str) -> String {
    let vars = template_vars(version);
    let borrowed: Vec<(&str, &str)> = vars.iter().map(|(k, v)| (*k, v.as_str())).collect();
    expand_template(template, &borrowed)
}

/// Expand archive URL templates for this host.
pub fn resolve_archives(release: &ReleaseSettings) -> Vec<ArchiveTarget> {
    release
        .archives
        .iter()
        .map(|source| {
            let url = expand(&source.url, &release.version);
            let file_name = url
                .rsplit('/')
                .next()
                .filter(|name| !name.is_empty())
                .map(|name| name.split('?').next().unwrap_or(name).to_owned())
                .unwrap_or_else(|| format!("{}.zip", source.name));
            let kind = ArchiveKind::guess(&file_name);
            ArchiveTarget {
                name: source.name.clone(),
                url,
                file_name,
                sha256: source
                    .sha256
                    .as_deref()
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(str::to_owned),
                kind,
            }
        })
        .collect()
}

/// Fixed `.deb` file names to install, in order.
pub fn deb_file_names(release: &ReleaseSettings) -> Vec<String> {
    release
        .packages
        .iter()
        .map(|template| expand(template, &release.version))
        .collect()
}

/// Package names (for removal and dpkg queries) of the configured debs.
pub fn package_names(release: &ReleaseSettings) -> Vec<String> {
    deb_file_names(release)
        .iter()
        .map(|file| archive::package_name(file).to_owned())
        .collect()
}

pub struct PackageInstaller {
    client: Client,
    cache_dir: PathBuf,
    staging_dir: PathBuf,
    release: ReleaseSettings,
}

impl PackageInstaller {
    pub fn new(release: ReleaseSettings, storage: &StorageManager) -> Self {
        Self::with_dirs(release, storage.cache_dir(), storage.staging_dir())
    }

    pub fn with_dirs(release: ReleaseSettings, cache_dir: PathBuf, staging_dir: PathBuf) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30 * 60))
            .build()
            .unwrap_or_else(|err| {
                warn!("packages: falling back to default HTTP client configuration ({err})");
                Client::new()
            });
        Self {
            client,
            cache_dir,
            staging_dir,
            release,
        }
    }

    pub fn version(&self) -> &str {
        &self.release.version
    }

    /// Download and unpack every archive, then locate the wanted debs.
    pub async fn prepare(
        &self,
        cancel: Option<Arc<AtomicBool>>,
        mut progress: ProgressCallback<'_>,
    ) -> Result<Vec<PathBuf>, String> {
        let targets = resolve_archives(&self.release);
        if targets.is_empty() {
            return Err("no release archives configured".into());
        }
        clean_dir(&self.staging_dir)?;

        for target in &targets {
            let dest = self.staging_dir.join(&target.name);
            // Retry once on a bad archive to recover from truncated downloads.
            for attempt in 0..2 {
                let path = fetch::fetch_archive(
                    &self.client,
                    target,
                    &self.cache_dir,
                    cancel.clone(),
                    &mut progress,
                )
                .await?;
                emit_progress(
                    &mut progress,
                    ProgressUpdate {
                        stage: "extract",
                        progress: 0.0,
                        message: format!("Extracting {}...", target.file_name),
                        current_file: Some(target.file_name.clone()),
                        speed: None,
                        downloaded: None,
                        total: None,
                    },
                );
                match archive::extract_archive(&path, target.kind, &dest) {
                    Ok(()) => break,
                    Err(err) if attempt == 0 => {
                        warn!(
                            "packages: extracting {} failed ({err}); downloading once more",
                            target.file_name
                        );
                        fs::remove_file(&path).map_err(|e| {
                            format!("failed to discard corrupt {}: {e}", path.display())
                        })?;
                        clean_dir(&dest)?;
                    }
                    Err(err) => return Err(format!("{}: {err}", target.file_name)),
                }
            }
        }

        let wanted = deb_file_names(&self.release);
        let debs = archive::collect_debs(&self.staging_dir, &wanted)?;
        info!("packages: {} package file(s) ready", debs.len());
        Ok(debs)
    }

    pub async fn install(
        &self,
        debs: &[PathBuf],
        options: InstallOptions,
        cancel: Option<Arc<AtomicBool>>,
        mut progress: ProgressCallback<'_>,
    ) -> Result<(), String> {
        emit_progress(
            &mut progress,
            ProgressUpdate {
                stage: "install",
                progress: 0.0,
                message: format!("Installing {} package(s)...", debs.len()),
                current_file: None,
                speed: None,
                downloaded: None,
                total: None,
            },
        );
        apt::install_debs(debs, options, &cancel).await?;
        emit_progress(
            &mut progress,
            ProgressUpdate::done("install", "packages", "Packages installed"),
        );
        Ok(())
    }

    pub async fn uninstall(&self, options: InstallOptions) -> Result<(), String> {
        let names = package_names(&self.release);
        debug!("packages: removing {:?}", names);
        apt::remove_packages(&names, options).await
    }
}

fn clean_dir(dir: &Path) -> Result<(), String> {
    if dir.exists() {
        fs::remove_dir_all(dir)
            .map_err(|e| format!("failed to clean {}: {e}", dir.display()))?;
    }
    fs::create_dir_all(dir).map_err(|e| format!("failed to create {}: {e}", dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{ArchiveSource, Settings};
    use sha2::{Digest, Sha256};
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        for (name, data) in entries {
            zip.start_file(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    /// Serves `bodies` in turn, repeating the last one; counts GET requests.
    async fn serve_in_turn(bodies: Vec<Vec<u8>>, gets: Arc<AtomicUsize>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                if !buf[..n].starts_with(b"GET") {
                    let _ = socket.write_all(b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").await;
                    continue;
                }
                let index = gets.fetch_add(1, Ordering::SeqCst).min(bodies.len() - 1);
                let body = &bodies[index];
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(body).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}/bundle.zip")
    }

    fn release() -> ReleaseSettings {
        Settings::embedded().unwrap().release
    }

    #[test]
    fn resolves_archive_urls_for_host() {
        let targets = resolve_archives(&release());
        assert_eq!(targets.len(), 2);
        let zenoh = &targets[0];
        assert!(zenoh.url.contains("/1.5.0/zenoh-1.5.0-"));
        assert!(zenoh.url.contains(env::target_triple()));
        assert!(!zenoh.url.contains('{'));
        assert_eq!(zenoh.kind, ArchiveKind::Zip);
        assert!(zenoh.file_name.ends_with("-debian.zip"));
        assert!(zenoh.sha256.is_none());
    }

    #[test]
    fn ignores_blank_digests_and_query_strings() {
        let mut release = release();
        release.archives = vec![ArchiveSource {
            name: "custom".into(),
            url: "https://mirror/{version}/bundle.tar.gz?token=abc".into(),
            sha256: Some("  ".into()),
        }];
        let targets = resolve_archives(&release);
        assert_eq!(targets[0].file_name, "bundle.tar.gz");
        assert_eq!(targets[0].kind, ArchiveKind::TarGz);
        assert!(targets[0].sha256.is_none());
    }

    #[test]
    fn expands_deb_names_and_package_names() {
        let debs = deb_file_names(&release());
        assert_eq!(debs[0], format!("zenohd_1.5.0_{}.deb", env::deb_arch()));
        assert_eq!(
            package_names(&release()),
            vec![
                "zenohd",
                "zenoh-plugin-rest",
                "zenoh-plugin-storage-manager",
                "zenoh-plugin-webserver"
            ]
        );
    }

    #[tokio::test]
    async fn prepares_debs_from_cached_archive() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("cache");
        fs::create_dir_all(&cache).unwrap();

        let mut release = release();
        let bytes = zip_bytes(&[("zenohd_1.5.0_test.deb", b"deb")]);
        fs::write(cache.join("bundle.zip"), &bytes).unwrap();
        // Nothing listens on the URL; the digest alone vouches for the cached copy.
        release.archives = vec![ArchiveSource {
            name: "bundle".into(),
            url: "http://127.0.0.1:9/bundle.zip".into(),
            sha256: Some(format!("{:x}", Sha256::digest(&bytes))),
        }];
        release.packages = vec!["zenohd_{version}_test.deb".into()];

        let installer = PackageInstaller::with_dirs(release, cache, dir.path().join("staging"));
        let debs = installer.prepare(None, None).await.unwrap();
        assert_eq!(debs.len(), 1);
        assert!(debs[0].ends_with("bundle/zenohd_1.5.0_test.deb"));
    }

    #[tokio::test]
    async fn refetches_once_after_corrupt_archive() {
        let dir = tempfile::tempdir().unwrap();
        let gets = Arc::new(AtomicUsize::new(0));
        let good = zip_bytes(&[("zenohd_1.5.0_test.deb", b"deb")]);
        let url = serve_in_turn(vec![b"not a zip at all".to_vec(), good], gets.clone()).await;

        let mut release = release();
        release.archives = vec![ArchiveSource {
            name: "bundle".into(),
            url,
            sha256: None,
        }];
        release.packages = vec!["zenohd_{version}_test.deb".into()];

        let installer = PackageInstaller::with_dirs(
            release,
            dir.path().join("cache"),
            dir.path().join("staging"),
        );
        let debs = installer.prepare(None, None).await.unwrap();
        assert_eq!(gets.load(Ordering::SeqCst), 2);
        assert_eq!(debs.len(), 1);
        assert!(debs[0].ends_with("bundle/zenohd_1.5.0_test.deb"));
    }

    #[tokio::test]
    async fn gives_up_after_second_corrupt_archive() {
        let dir = tempfile::tempdir().unwrap();
        let gets = Arc::new(AtomicUsize::new(0));
        let url = serve_in_turn(vec![b"garbage".to_vec()], gets.clone()).await;

        let mut release = release();
        release.archives = vec![ArchiveSource {
            name: "bundle".into(),
            url,
            sha256: None,
        }];
        let installer = PackageInstaller::with_dirs(
            release,
            dir.path().join("cache"),
            dir.path().join("staging"),
        );
        let err = installer.prepare(None, None).await.unwrap_err();
        assert!(err.starts_with("bundle.zip: zip parse error"), "{err}");
        assert_eq!(gets.load(Ordering::SeqCst), 2);
    }
}
