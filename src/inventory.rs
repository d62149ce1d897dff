//! Inventory CSV loading
//!
//! The inventory is a comma separated file with the header
//! `TreeID,Radius,X,Y,Height,Image`. Header names are matched after
//! lower-casing; coordinates must already be in EPSG:32632.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::error::{Result, UploadError};

/// Columns every inventory must carry, after lower-casing
pub const REQUIRED_COLUMNS: [&str; 6] = ["treeid", "radius", "x", "y", "height", "image"];

/// Column names used by the layer table itself
const RESERVED_COLUMNS: [&str; 2] = ["fid", "geom"];

/// One tree record
#[derive(Debug, Clone, PartialEq)]
pub struct InventoryRow {
    pub tree_id: i64,
    pub radius: f64,
    pub x: f64,
    pub y: f64,
    pub height: f64,
    /// Image file name, as found in the image archive
    pub image: String,
    /// Values of `Inventory::extra_columns`, same order
    pub extra: Vec<String>,
}

/// A parsed inventory upload
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inventory {
    /// Lower-cased names of columns beyond the required six, in input order
    pub extra_columns: Vec<String>,
    pub rows: Vec<InventoryRow>,
}

impl Inventory {
    /// Parse an inventory from raw CSV bytes
    pub fn from_csv(bytes: &[u8]) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(bytes);

        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| h.to_lowercase())
            .collect();

        for (i, name) in headers.iter().enumerate() {
            if RESERVED_COLUMNS.contains(&name.as_str()) || headers[..i].contains(name) {
                return Err(UploadError::DuplicateColumn(name.clone()));
            }
        }

        let mut index = [0usize; 6];
        for (slot, name) in index.iter_mut().zip(REQUIRED_COLUMNS) {
            *slot = headers
                .iter()
                .position(|h| h == name)
                .ok_or(UploadError::MissingColumn(name))?;
        }
        let [id_idx, radius_idx, x_idx, y_idx, height_idx, image_idx] = index;

        let extra_idx: Vec<usize> = (0..headers.len())
            .filter(|i| !index.contains(i))
            .collect();
        let extra_columns = extra_idx.iter().map(|&i| headers[i].clone()).collect();

        let mut rows = Vec::new();
        let mut seen: HashMap<String, u64> = HashMap::new();

        for record in reader.records() {
            let record = record?;
            let line = record.position().map(|p| p.line()).unwrap_or(0);
            let field = |i: usize| record.get(i).unwrap_or("");

            let image = field(image_idx).to_string();
            if image.is_empty() {
                return Err(UploadError::InvalidValue {
                    line,
                    column: "image",
                    value: image,
                });
            }
            if let Some(&first_line) = seen.get(&image) {
                return Err(UploadError::DuplicateImage {
                    image,
                    first_line,
                    line,
                });
            }
            seen.insert(image.clone(), line);

            rows.push(InventoryRow {
                tree_id: parse_field(field(id_idx), line, "treeid")?,
                radius: parse_field(field(radius_idx), line, "radius")?,
                x: parse_field(field(x_idx), line, "x")?,
                y: parse_field(field(y_idx), line, "y")?,
                height: parse_field(field(height_idx), line, "height")?,
                image,
                extra: extra_idx.iter().map(|&i| field(i).to_string()).collect(),
            });
        }

        debug!("Inventory columns: {:?}", headers);
        info!("Loaded {} inventory rows", rows.len());

        Ok(Self {
            extra_columns,
            rows,
        })
    }

    /// Image names declared by the inventory, in row order
    pub fn image_names(&self) -> impl Iterator<Item = &str> {
        self.rows.iter().map(|r| r.image.as_str())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

fn parse_field<T: std::str::FromStr>(value: &str, line: u64, column: &'static str) -> Result<T> {
    value.parse().map_err(|_| UploadError::InvalidValue {
        line,
        column,
        value: value.to_string(),
    })
}
