//! Forest inventory uploader
//!
//! Ingests tree inventories (CSV + image archive) and raster base layers
//! into the directories served by the forest map, and keeps the checksum
//! record the map client uses to invalidate its caches.

pub mod archive;
pub mod base;
pub mod checksum;
pub mod config;
pub mod error;
pub mod gpkg;
pub mod inventory;
pub mod reconcile;
pub mod workflow;

pub use config::Environment;
pub use error::{Result, UploadError};
pub use workflow::{InventorySession, Prompt, Step};
