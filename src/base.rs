//! Raster base layer upload
//!
//! Base data is raster imagery the map user can toggle. Uploaded `.tif`
//! files land in `<DATADIR>/base` under their original name; re-uploading a
//! name overwrites the previous file.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::checksum::{Category, ChecksumRecord, ChecksumTracker};
use crate::config::{has_extension, Environment};
use crate::error::{Result, UploadError};
use crate::workflow::{Prompt, Step};

/// One uploaded raster file
#[derive(Debug, Clone)]
pub struct RasterUpload {
    /// Original file name, e.g. `ortho-2023.tif`
    pub name: String,
    pub bytes: Vec<u8>,
}

impl RasterUpload {
    /// Read an upload from a local file, keeping its file name
    pub fn from_path(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| UploadError::UnsupportedRaster(path.display().to_string()))?;
        let bytes = fs::read(path).map_err(|e| UploadError::io(path, e))?;
        Ok(Self { name, bytes })
    }
}

/// Result of a completed base layer upload
#[derive(Debug, Clone)]
pub struct BaseOutcome {
    pub written: Vec<PathBuf>,
    pub checksums: ChecksumRecord,
}

/// Check names before anything is written, so a bad file aborts the whole upload
fn validate(uploads: &[RasterUpload]) -> Result<()> {
    for upload in uploads {
        let name = Path::new(&upload.name);
        let plain = name.file_name().map(|n| n == name.as_os_str()).unwrap_or(false);
        if !plain || !has_extension(name, "tif") {
            return Err(UploadError::UnsupportedRaster(upload.name.clone()));
        }
    }
    Ok(())
}

/// Store uploaded rasters and refresh the base layer checksums.
///
/// `on_written` is called after each file with (done, total).
pub fn upload_rasters(
    env: &Environment,
    uploads: &[RasterUpload],
    on_written: impl Fn(usize, usize),
) -> Result<Step<BaseOutcome>> {
    if uploads.is_empty() {
        return Ok(Step::NeedsInput(Prompt::BaseRasters));
    }
    validate(uploads)?;

    fs::create_dir_all(&env.base_dir).map_err(|e| UploadError::io(&env.base_dir, e))?;

    let total = uploads.len();
    let mut written = Vec::with_capacity(total);
    for (i, upload) in uploads.iter().enumerate() {
        let target = env.base_dir.join(&upload.name);
        fs::write(&target, &upload.bytes).map_err(|e| UploadError::io(&target, e))?;
        info!("Wrote {} to target location: {}", upload.name, target.display());
        written.push(target);
        on_written(i + 1, total);
    }

    let checksums =
        ChecksumTracker::new(env).update(&[Category::Inventory, Category::Images])?;

    Ok(Step::Complete(BaseOutcome { written, checksums }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use tempfile::TempDir;

    fn env_in(dir: &Path) -> Environment {
        Environment::resolve(Some(dir.join("data")), Some(dir.join("www")), None)
    }

    fn raster(name: &str, bytes: &[u8]) -> RasterUpload {
        RasterUpload {
            name: name.to_string(),
            bytes: bytes.to_vec(),
        }
    }

    #[test]
    fn test_no_files_needs_input() {
        let dir = TempDir::new().unwrap();
        let env = env_in(dir.path());
        let step = upload_rasters(&env, &[], |_, _| {}).unwrap();
        assert!(matches!(step, Step::NeedsInput(Prompt::BaseRasters)));
        assert!(!env.base_dir.exists());
    }

    #[test]
    fn test_upload_writes_and_tracks() {
        let dir = TempDir::new().unwrap();
        let env = env_in(dir.path());
        let calls = Cell::new(0);

        let step = upload_rasters(
            &env,
            &[raster("ortho.tif", b"ortho"), raster("dem.TIF", b"dem")],
            |done, total| {
                assert_eq!(total, 2);
                calls.set(done);
            },
        )
        .unwrap();

        let outcome = match step {
            Step::Complete(outcome) => outcome,
            other => panic!("unexpected step: {other:?}"),
        };
        assert_eq!(calls.get(), 2);
        assert_eq!(outcome.written.len(), 2);
        assert_eq!(fs::read(env.base_dir.join("ortho.tif")).unwrap(), b"ortho");

        let baselayer = outcome.checksums.baselayer.unwrap();
        assert_eq!(baselayer.len(), 2);
        assert!(baselayer.contains_key("ortho"));
        assert!(baselayer.contains_key("dem"));
        assert!(outcome.checksums.inventory.is_none());
        assert!(outcome.checksums.images.is_none());
    }

    #[test]
    fn test_reupload_overwrites() {
        let dir = TempDir::new().unwrap();
        let env = env_in(dir.path());
        upload_rasters(&env, &[raster("ortho.tif", b"v1")], |_, _| {}).unwrap();
        upload_rasters(&env, &[raster("ortho.tif", b"v2")], |_, _| {}).unwrap();
        assert_eq!(fs::read(env.base_dir.join("ortho.tif")).unwrap(), b"v2");
    }

    #[test]
    fn test_rejects_non_tif_before_writing() {
        let dir = TempDir::new().unwrap();
        let env = env_in(dir.path());
        let err = upload_rasters(
            &env,
            &[raster("ortho.tif", b"ok"), raster("notes.txt", b"no")],
            |_, _| {},
        )
        .unwrap_err();
        assert!(matches!(err, UploadError::UnsupportedRaster(name) if name == "notes.txt"));
        assert!(!env.base_dir.join("ortho.tif").exists());
    }

    #[test]
    fn test_rejects_path_names() {
        let dir = TempDir::new().unwrap();
        let env = env_in(dir.path());
        let err = upload_rasters(&env, &[raster("../escape.tif", b"x")], |_, _| {}).unwrap_err();
        assert!(matches!(err, UploadError::UnsupportedRaster(_)));
    }
}
