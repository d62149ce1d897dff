//! Directory layout of the serving container
//!
//! The uploader runs next to the map server, so output locations come from
//! `DATADIR`, `WWWDIR` and `IMGDIR` (bound through the CLI). Nothing is
//! created here; stages create the directories they write into.

use std::path::{Path, PathBuf};

pub const DEFAULT_DATADIR: &str = "/src/data";
pub const DEFAULT_WWWDIR: &str = "/src/www";

/// Resolved output locations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    /// Data root (geoserver data directory)
    pub data_dir: PathBuf,

    /// Web root served to the map client
    pub www_dir: PathBuf,

    /// Where tree images are served from
    pub img_dir: PathBuf,

    /// Raster base layers
    pub base_dir: PathBuf,

    /// GeoPackage holding the inventory layers
    pub inventory_gpkg: PathBuf,

    /// Checksum record read by the map client
    pub checksums_json: PathBuf,
}

impl Environment {
    /// Resolve paths from optional overrides, falling back to the container defaults.
    pub fn resolve(
        data_dir: Option<PathBuf>,
        www_dir: Option<PathBuf>,
        img_dir: Option<PathBuf>,
    ) -> Self {
        let data_dir = absolute(data_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_DATADIR)));
        let www_dir = absolute(www_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_WWWDIR)));
        let assets = www_dir.join("assets");
        let img_dir = img_dir
            .map(absolute)
            .unwrap_or_else(|| assets.join("img"));

        Self {
            base_dir: data_dir.join("base"),
            inventory_gpkg: data_dir.join("inventory.gpkg"),
            checksums_json: assets.join("checksums.json"),
            data_dir,
            www_dir,
            img_dir,
        }
    }
}

fn absolute(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(&path))
        .unwrap_or(path)
}

/// True if `path` has the given extension, ignoring case
pub fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let env = Environment::resolve(None, None, None);
        assert_eq!(env.data_dir, PathBuf::from("/src/data"));
        assert_eq!(env.www_dir, PathBuf::from("/src/www"));
        assert_eq!(env.img_dir, PathBuf::from("/src/www/assets/img"));
        assert_eq!(env.base_dir, PathBuf::from("/src/data/base"));
        assert_eq!(env.inventory_gpkg, PathBuf::from("/src/data/inventory.gpkg"));
        assert_eq!(env.checksums_json, PathBuf::from("/src/www/assets/checksums.json"));
    }

    #[test]
    fn test_overrides() {
        let env = Environment::resolve(
            Some("/srv/data".into()),
            Some("/srv/www".into()),
            Some("/srv/images".into()),
        );
        assert_eq!(env.inventory_gpkg, PathBuf::from("/srv/data/inventory.gpkg"));
        assert_eq!(env.base_dir, PathBuf::from("/srv/data/base"));
        assert_eq!(env.img_dir, PathBuf::from("/srv/images"));
        assert_eq!(env.checksums_json, PathBuf::from("/srv/www/assets/checksums.json"));
    }

    #[test]
    fn test_img_dir_follows_www_dir() {
        let env = Environment::resolve(None, Some("/srv/www".into()), None);
        assert_eq!(env.img_dir, PathBuf::from("/srv/www/assets/img"));
    }

    #[test]
    fn test_relative_override_is_made_absolute() {
        let env = Environment::resolve(Some("data".into()), None, None);
        assert!(env.data_dir.is_absolute());
        assert!(env.data_dir.ends_with("data"));
    }

    #[test]
    fn test_has_extension() {
        assert!(has_extension(Path::new("ortho.tif"), "tif"));
        assert!(has_extension(Path::new("ORTHO.TIF"), "tif"));
        assert!(!has_extension(Path::new("ortho.tiff"), "tif"));
        assert!(!has_extension(Path::new("ortho"), "tif"));
    }
}
