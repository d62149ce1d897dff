//! Image archive handling
//!
//! Operators upload one ZIP holding an image per tree. Members whose name
//! starts with `_` or `.` (`__MACOSX/`, `.DS_Store`, ...) are archive
//! metadata and are ignored everywhere: listing, reconciliation and
//! extraction.

use std::fs::{self, File};
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{MemberFailure, Result, UploadError};

/// True for members that are archive metadata or hidden files
pub fn is_metadata_entry(name: &str) -> bool {
    name.starts_with('_') || name.starts_with('.')
}

/// An uploaded image archive, held in memory
pub struct ImageArchive {
    archive: zip::ZipArchive<Cursor<Vec<u8>>>,
    members: Vec<String>,
}

impl std::fmt::Debug for ImageArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageArchive")
            .field("members", &self.members)
            .finish()
    }
}

/// Extraction statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExtractStats {
    pub extracted: usize,
    pub bytes: u64,
}

impl ImageArchive {
    /// Open a ZIP from its raw bytes
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let archive = zip::ZipArchive::new(Cursor::new(bytes))?;

        let mut members = Vec::new();
        let mut skipped = 0usize;
        for name in archive.file_names() {
            if name.ends_with('/') {
                continue;
            }
            if is_metadata_entry(name) {
                skipped += 1;
                continue;
            }
            members.push(name.to_string());
        }
        // Stable order for reporting, independent of how the archive was built
        members.sort();

        debug!(
            "Image archive: {} members, {} metadata entries skipped",
            members.len(),
            skipped
        );

        Ok(Self { archive, members })
    }

    /// Open a ZIP file from disk
    pub fn open(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| UploadError::io(path, e))?;
        Self::from_bytes(bytes)
    }

    /// Member file names, sorted, without metadata entries
    pub fn member_names(&self) -> &[String] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Extract every member into `image_root`, overwriting same-named files.
    ///
    /// Members are written to a staging directory inside `image_root` first
    /// and only moved into place once all of them succeeded. If any member
    /// fails, `image_root` is left as it was and every failure is reported.
    pub fn extract_to(&mut self, image_root: &Path) -> Result<ExtractStats> {
        fs::create_dir_all(image_root).map_err(|e| UploadError::io(image_root, e))?;

        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(image_root)
            .map_err(|e| UploadError::io(image_root, e))?;

        let mut failures = Vec::new();
        let mut staged: Vec<PathBuf> = Vec::with_capacity(self.members.len());
        let mut stats = ExtractStats::default();

        for name in &self.members {
            match stage_member(&mut self.archive, name, staging.path()) {
                Ok((relative, size)) => {
                    staged.push(relative);
                    stats.bytes += size;
                }
                Err(reason) => {
                    warn!("Failed to extract {}: {}", name, reason);
                    failures.push(MemberFailure {
                        member: name.clone(),
                        reason,
                    });
                }
            }
        }

        if !failures.is_empty() {
            return Err(UploadError::Extraction { failures });
        }

        for relative in &staged {
            let src = staging.path().join(relative);
            let dst = image_root.join(relative);
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent).map_err(|e| UploadError::io(parent, e))?;
            }
            fs::rename(&src, &dst).map_err(|e| UploadError::io(&dst, e))?;
            stats.extracted += 1;
        }

        info!(
            "Extracted {} images ({} bytes) to {}",
            stats.extracted,
            stats.bytes,
            image_root.display()
        );

        Ok(stats)
    }
}

/// Write one member below `staging`. Returns its relative path and size.
fn stage_member(
    archive: &mut zip::ZipArchive<Cursor<Vec<u8>>>,
    name: &str,
    staging: &Path,
) -> std::result::Result<(PathBuf, u64), String> {
    let mut entry = archive.by_name(name).map_err(|e| e.to_string())?;
    let relative = entry
        .enclosed_name()
        .ok_or_else(|| "path escapes image root".to_string())?;

    let target = staging.join(&relative);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }

    let mut output = File::create(&target).map_err(|e| e.to_string())?;
    let written = io::copy(&mut entry, &mut output).map_err(|e| e.to_string())?;

    Ok((relative, written))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    /// Build an in-memory ZIP from (name, content) pairs
    pub(crate) fn build_zip(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, content) in entries {
            if name.ends_with('/') {
                writer
                    .add_directory(name.trim_end_matches('/'), SimpleFileOptions::default())
                    .unwrap();
            } else {
                writer.start_file(*name, SimpleFileOptions::default()).unwrap();
                writer.write_all(content.as_bytes()).unwrap();
            }
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_metadata_entries() {
        assert!(is_metadata_entry("__MACOSX/t1.png"));
        assert!(is_metadata_entry("_thumbs.db"));
        assert!(is_metadata_entry(".DS_Store"));
        assert!(!is_metadata_entry("t1.png"));
        assert!(!is_metadata_entry("img/_t1.png"));
    }

    #[test]
    fn test_member_names_skip_metadata_and_dirs() {
        let bytes = build_zip(&[
            ("t2.png", "two"),
            ("__MACOSX/", ""),
            ("__MACOSX/._t2.png", "junk"),
            (".DS_Store", "junk"),
            ("t1.png", "one"),
        ]);
        let archive = ImageArchive::from_bytes(bytes).unwrap();
        assert_eq!(archive.member_names(), ["t1.png", "t2.png"]);
        assert_eq!(archive.len(), 2);
    }

    #[test]
    fn test_not_a_zip() {
        assert!(matches!(
            ImageArchive::from_bytes(b"definitely not a zip".to_vec()),
            Err(UploadError::Zip(_))
        ));
    }

    #[test]
    fn test_extract_skips_metadata_and_overwrites() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("img");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("t1.png"), b"old").unwrap();

        let bytes = build_zip(&[
            ("t1.png", "new"),
            ("t2.png", "two"),
            (".hidden.png", "junk"),
            ("__MACOSX/._t1.png", "junk"),
        ]);
        let mut archive = ImageArchive::from_bytes(bytes).unwrap();
        let stats = archive.extract_to(&root).unwrap();

        assert_eq!(stats.extracted, 2);
        assert_eq!(stats.bytes, 6);
        assert_eq!(fs::read(root.join("t1.png")).unwrap(), b"new");
        assert_eq!(fs::read(root.join("t2.png")).unwrap(), b"two");
        assert!(!root.join(".hidden.png").exists());
        assert!(!root.join("__MACOSX").exists());

        // Staging directory is cleaned up
        let leftovers: Vec<_> = fs::read_dir(&root)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".staging-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_extract_creates_root() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("www/assets/img");

        let mut archive = ImageArchive::from_bytes(build_zip(&[("t1.png", "one")])).unwrap();
        archive.extract_to(&root).unwrap();
        assert!(root.join("t1.png").is_file());
    }

    #[test]
    fn test_extract_escaping_member_leaves_root_untouched() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("img");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("t1.png"), b"old").unwrap();

        let bytes = build_zip(&[("t1.png", "new"), ("img/../../escape.png", "bad")]);
        let mut archive = ImageArchive::from_bytes(bytes).unwrap();

        match archive.extract_to(&root).unwrap_err() {
            UploadError::Extraction { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].member, "img/../../escape.png");
            }
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(fs::read(root.join("t1.png")).unwrap(), b"old");
        assert!(!dir.path().join("escape.png").exists());
    }
}
