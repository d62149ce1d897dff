//! Error taxonomy for the upload pipeline.
//!
//! Reconciliation mismatches and layer collisions are not errors: they are
//! reported as data and the operator decides. Waiting for an upload is a
//! `Step::NeedsInput`, see `workflow`.

use std::fmt;
use std::path::PathBuf;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, UploadError>;

/// Errors raised by the pipeline stages
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Required upload not provided: {0}")]
    MissingUpload(&'static str),

    #[error("I/O failure on {artifact}: {source}")]
    Io {
        artifact: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse inventory CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("Inventory CSV is missing required column '{0}'")]
    MissingColumn(&'static str),

    #[error("Inventory CSV column '{0}' is duplicated or reserved")]
    DuplicateColumn(String),

    #[error("Inventory line {line}: invalid {column} value '{value}'")]
    InvalidValue {
        line: u64,
        column: &'static str,
        value: String,
    },

    #[error("Inventory line {line}: image '{image}' already used on line {first_line}")]
    DuplicateImage {
        image: String,
        first_line: u64,
        line: u64,
    },

    #[error("Failed to read image archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("{} archive member(s) failed to extract: {}", .failures.len(), FailureList(.failures))]
    Extraction { failures: Vec<MemberFailure> },

    #[error("GeoPackage write failed: {0}")]
    Geopackage(#[from] rusqlite::Error),

    #[error("Checksum record is not valid JSON: {0}")]
    Checksum(#[from] serde_json::Error),

    #[error("Base raster '{0}' is not a .tif file")]
    UnsupportedRaster(String),
}

impl UploadError {
    /// Wrap an I/O error with the path of the artifact it concerns
    pub fn io(artifact: impl Into<PathBuf>, source: std::io::Error) -> Self {
        UploadError::Io {
            artifact: artifact.into(),
            source,
        }
    }
}

/// One archive member that could not be extracted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberFailure {
    pub member: String,
    pub reason: String,
}

struct FailureList<'a>(&'a [MemberFailure]);

impl fmt::Display for FailureList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{} ({})", failure.member, failure.reason)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extraction_message_lists_members() {
        let err = UploadError::Extraction {
            failures: vec![
                MemberFailure {
                    member: "a.png".into(),
                    reason: "disk full".into(),
                },
                MemberFailure {
                    member: "../b.png".into(),
                    reason: "path escapes image root".into(),
                },
            ],
        };

        let msg = err.to_string();
        assert!(msg.starts_with("2 archive member(s)"));
        assert!(msg.contains("a.png (disk full)"));
        assert!(msg.contains("../b.png (path escapes image root)"));
    }

    #[test]
    fn test_io_names_artifact() {
        let err = UploadError::io(
            "/src/data/inventory.gpkg",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.to_string().contains("/src/data/inventory.gpkg"));
    }
}
