//! Content checksums for served artifacts
//!
//! The map client polls `checksums.json` to decide which cached artifacts
//! to refetch. Digests are MD5 hex strings; they only detect change.
//! Updating a category never touches the others.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::{has_extension, Environment};
use crate::error::{Result, UploadError};

/// Artifact categories tracked in the record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Category {
    Inventory,
    Images,
    Baselayer,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Inventory, Category::Images, Category::Baselayer];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Inventory => "inventory",
            Category::Images => "images",
            Category::Baselayer => "baselayer",
        }
    }
}

/// Persisted checksum record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChecksumRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<String>,

    /// Base layer file stem -> digest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baselayer: Option<BTreeMap<String, String>>,

    /// Keys written by someone else are carried through untouched
    #[serde(flatten)]
    pub other: serde_json::Map<String, serde_json::Value>,
}

impl ChecksumRecord {
    /// Load the record, or an empty one if the file does not exist yet
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|e| UploadError::io(path, e))?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(&content)?)
    }

    /// Write the record through a temp file in the same directory
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(|e| UploadError::io(dir, e))?;

        let content = serde_json::to_string_pretty(self)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| UploadError::io(dir, e))?;
        tmp.write_all(content.as_bytes())
            .map_err(|e| UploadError::io(tmp.path(), e))?;
        tmp.persist(path).map_err(|e| UploadError::io(path, e.error))?;

        Ok(())
    }

    /// Overwrite the categories present in `update`, keep everything else
    pub fn merge(&mut self, update: ChecksumUpdate) {
        if let Some(digest) = update.inventory {
            self.inventory = Some(digest);
        }
        if let Some(digest) = update.images {
            self.images = Some(digest);
        }
        if let Some(map) = update.baselayer {
            self.baselayer = Some(map);
        }
    }
}

/// Digests computed in one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecksumUpdate {
    pub inventory: Option<String>,
    pub images: Option<String>,
    pub baselayer: Option<BTreeMap<String, String>>,
}

/// Compute MD5 hash of a file
pub fn compute_md5(path: &Path) -> Result<String> {
    let file = File::open(path).map_err(|e| UploadError::io(path, e))?;
    let mut reader = BufReader::with_capacity(1024 * 1024, file);
    let mut context = md5::Context::new();

    let mut buffer = [0u8; 65536];
    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .map_err(|e| UploadError::io(path, e))?;
        if bytes_read == 0 {
            break;
        }
        context.consume(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", context.compute()))
}

/// Aggregate digest: MD5 of the sorted, comma-joined member digests
pub fn aggregate_digest<I>(digests: I) -> String
where
    I: IntoIterator<Item = String>,
{
    let mut digests: Vec<String> = digests.into_iter().collect();
    digests.sort();
    format!("{:x}", md5::compute(digests.join(",").as_bytes()))
}

/// Files directly inside `dir` with the given extension. Missing dir -> empty.
fn files_with_extension(dir: &Path, ext: &str) -> Result<Vec<std::path::PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| {
            let source = e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::other("directory walk failed"));
            UploadError::io(dir, source)
        })?;
        if entry.file_type().is_file() && has_extension(entry.path(), ext) {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

/// Digest of every `*.png` in the image root
pub fn images_digest(img_dir: &Path) -> Result<String> {
    let files = files_with_extension(img_dir, "png")?;
    let digests = files
        .iter()
        .map(|p| compute_md5(p))
        .collect::<Result<Vec<_>>>()?;
    debug!("Hashed {} images in {}", digests.len(), img_dir.display());
    Ok(aggregate_digest(digests))
}

/// Per-file digests of every `*.tif` in the base layer root, keyed by file stem.
///
/// `ortho.tif` owns the key `ortho`; a second file with the same stem
/// (`ortho.TIF`) is keyed by its full file name instead.
pub fn baselayer_digests(base_dir: &Path) -> Result<BTreeMap<String, String>> {
    let mut files = files_with_extension(base_dir, "tif")?;
    files.sort_by_key(|p| (p.extension().map_or(true, |e| e != "tif"), p.clone()));

    let mut map = BTreeMap::new();
    for path in files {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let key = if map.contains_key(&stem) {
            let name = path
                .file_name()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            warn!(
                "Base layer {} shares the stem '{}' with another raster, recorded as '{}'",
                path.display(),
                stem,
                name
            );
            name
        } else {
            stem
        };
        map.insert(key, compute_md5(&path)?);
    }
    Ok(map)
}

/// Computes digests for the categories relevant to an action and merges them
pub struct ChecksumTracker<'a> {
    env: &'a Environment,
}

impl<'a> ChecksumTracker<'a> {
    pub fn new(env: &'a Environment) -> Self {
        Self { env }
    }

    /// Digests for every category not in `omit`
    pub fn compute(&self, omit: &[Category]) -> Result<ChecksumUpdate> {
        let wanted: BTreeSet<Category> = Category::ALL
            .into_iter()
            .filter(|c| !omit.contains(c))
            .collect();

        let mut update = ChecksumUpdate::default();

        if wanted.contains(&Category::Inventory) {
            if self.env.inventory_gpkg.is_file() {
                update.inventory = Some(compute_md5(&self.env.inventory_gpkg)?);
            } else {
                warn!(
                    "No inventory container at {}, keeping previous checksum",
                    self.env.inventory_gpkg.display()
                );
            }
        }
        if wanted.contains(&Category::Images) {
            update.images = Some(images_digest(&self.env.img_dir)?);
        }
        if wanted.contains(&Category::Baselayer) {
            update.baselayer = Some(baselayer_digests(&self.env.base_dir)?);
        }

        Ok(update)
    }

    /// Compute, merge into the persisted record, save. Returns the new record.
    pub fn update(&self, omit: &[Category]) -> Result<ChecksumRecord> {
        let update = self.compute(omit)?;
        let path = &self.env.checksums_json;

        let mut record = ChecksumRecord::load(path)?;
        record.merge(update);
        record.save(path)?;

        let skipped: Vec<&str> = omit.iter().map(|c| c.as_str()).collect();
        info!(
            "Updated {} (omitted: [{}])",
            path.display(),
            skipped.join(", ")
        );

        Ok(record)
    }
}
