use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use log::{debug, info, warn};
use tar::Archive;
use walkdir::WalkDir;
use zip::read::ZipArchive;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchiveKind {
    TarGz,
    Zip,
}

impl ArchiveKind {
    /// Guess from the URL or file name suffix; release bundles default to zip.
    pub fn guess(name: &str) -> ArchiveKind {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            ArchiveKind::TarGz
        } else {
            ArchiveKind::Zip
        }
    }
}

pub fn extract_archive(archive_path: &Path, kind: ArchiveKind, dest: &Path) -> Result<(), String> {
    info!("archive: extracting {} as {:?}", archive_path.display(), kind);
    fs::create_dir_all(dest).map_err(|e| format!("failed to create staging dir: {e}"))?;
    match kind {
        ArchiveKind::TarGz => extract_targz(archive_path, dest),
        ArchiveKind::Zip => extract_zip(archive_path, dest),
    }
}

fn extract_targz(archive_path: &Path, dest: &Path) -> Result<(), String> {
    let file = fs::File::open(archive_path).map_err(|e| format!("tar.gz open error: {e}"))?;
    let mut archive = Archive::new(GzDecoder::new(file));
    archive
        .unpack(dest)
        .map_err(|e| format!("tar.gz extract error: {e}"))
}

fn extract_zip(archive_path: &Path, dest: &Path) -> Result<(), String> {
    let file = fs::File::open(archive_path).map_err(|e| format!("zip open error: {e}"))?;
    let mut archive = ZipArchive::new(file).map_err(|e| format!("zip parse error: {e}"))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| format!("zip entry error: {e}"))?;
        let Some(relative) = entry.enclosed_name() else {
            warn!("archive: skipping unsafe entry {}", entry.name());
            continue;
        };
        let out_path = dest.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&out_path).map_err(|e| format!("zip dir create error: {e}"))?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).map_err(|e| format!("zip parent dir error: {e}"))?;
        }
        let mut out_file =
            fs::File::create(&out_path).map_err(|e| format!("zip create file error: {e}"))?;
        io::copy(&mut entry, &mut out_file).map_err(|e| format!("zip write error: {e}"))?;
    }

    Ok(())
}

/// Find each wanted `.deb` file name under `staging`, in the order requested.
pub fn collect_debs(staging: &Path, wanted: &[String]) -> Result<Vec<PathBuf>, String> {
    let found: Vec<PathBuf> = WalkDir::new(staging)
        .into_iter()
        .flatten()
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "deb"))
        .collect();
    debug!("archive: {} .deb file(s) in {}", found.len(), staging.display());

    let mut picked = Vec::with_capacity(wanted.len());
    let mut missing = Vec::new();
    for name in wanted {
        match found
            .iter()
            .find(|path| path.file_name().is_some_and(|file| file == name.as_str()))
        {
            Some(path) => picked.push(path.clone()),
            None => missing.push(name.as_str()),
        }
    }

    if !missing.is_empty() {
        return Err(format!(
            "package file(s) not found in downloaded archives: {}",
            missing.join(", ")
        ));
    }
    Ok(picked)
}

/// Package name of a deb file: everything before the first `_`.
pub fn package_name(deb_file: &str) -> &str {
    let stem = deb_file.strip_suffix(".deb").unwrap_or(deb_file);
    stem.split('_').next().unwrap_or(stem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        for (name, data) in entries {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn guesses_archive_kind_from_suffix() {
        assert_eq!(ArchiveKind::guess("x/zenoh.tar.gz"), ArchiveKind::TarGz);
        assert_eq!(ArchiveKind::guess("x/zenoh.TGZ"), ArchiveKind::TarGz);
        assert_eq!(ArchiveKind::guess("x/zenoh-debian.zip"), ArchiveKind::Zip);
        assert_eq!(ArchiveKind::guess("x/zenoh"), ArchiveKind::Zip);
    }

    #[test]
    fn extracts_zip_and_collects_wanted_debs() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("bundle.zip");
        write_zip(
            &archive,
            &[
                ("zenohd_1.5.0_amd64.deb", b"d1"),
                ("nested/zenoh-plugin-rest_1.5.0_amd64.deb", b"d2"),
                ("README.md", b"docs"),
            ],
        );
        let staging = dir.path().join("staging");
        extract_archive(&archive, ArchiveKind::Zip, &staging).unwrap();

        let wanted = vec![
            "zenoh-plugin-rest_1.5.0_amd64.deb".to_owned(),
            "zenohd_1.5.0_amd64.deb".to_owned(),
        ];
        let debs = collect_debs(&staging, &wanted).unwrap();
        assert_eq!(debs.len(), 2);
        assert!(debs[0].ends_with("nested/zenoh-plugin-rest_1.5.0_amd64.deb"));
        assert!(debs[1].ends_with("zenohd_1.5.0_amd64.deb"));
    }

    #[test]
    fn reports_missing_debs_by_name() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("zenohd_1.5.0_amd64.deb"), b"d").unwrap();
        let err = collect_debs(
            dir.path(),
            &[
                "zenohd_1.5.0_amd64.deb".to_owned(),
                "zenoh-plugin-webserver_1.5.0_amd64.deb".to_owned(),
            ],
        )
        .unwrap_err();
        assert!(err.contains("zenoh-plugin-webserver_1.5.0_amd64.deb"));
        assert!(!err.contains("zenohd_"));
    }

    #[test]
    fn rejects_corrupt_zip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("broken.zip");
        fs::write(&archive, b"not a zip").unwrap();
        let err = extract_archive(&archive, ArchiveKind::Zip, &dir.path().join("out")).unwrap_err();
        assert!(err.starts_with("zip parse error"));
    }

    #[test]
    fn derives_package_names() {
        assert_eq!(package_name("zenohd_1.5.0_amd64.deb"), "zenohd");
        assert_eq!(
            package_name("zenoh-plugin-rest_1.5.0_arm64.deb"),
            "zenoh-plugin-rest"
        );
        assert_eq!(package_name("plain"), "plain");
    }
}
