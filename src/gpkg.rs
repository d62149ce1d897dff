//! GeoPackage storage for inventory layers
//!
//! A GeoPackage is an SQLite database with a few OGC metadata tables, so the
//! container is written directly with rusqlite. Each inventory upload is a
//! point feature table in EPSG:32632. Writing a layer name that already
//! exists replaces that layer; rows are not merged with the old ones.

use std::fs;
use std::path::Path;

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tracing::{debug, info, warn};

use crate::error::{Result, UploadError};
use crate::inventory::Inventory;

/// EPSG code of every inventory geometry (WGS 84 / UTM zone 32N)
pub const INVENTORY_SRS_ID: i32 = 32632;

/// "GPKG" in ASCII
const GPKG_APPLICATION_ID: i32 = 0x4750_4B47;
/// GeoPackage 1.3.0
const GPKG_USER_VERSION: i32 = 10300;

const GEOMETRY_COLUMN: &str = "geom";

const WKT_4326: &str = r#"GEOGCS["WGS 84",DATUM["WGS_1984",SPHEROID["WGS 84",6378137,298.257223563,AUTHORITY["EPSG","7030"]],AUTHORITY["EPSG","6326"]],PRIMEM["Greenwich",0,AUTHORITY["EPSG","8901"]],UNIT["degree",0.0174532925199433,AUTHORITY["EPSG","9122"]],AXIS["Latitude",NORTH],AXIS["Longitude",EAST],AUTHORITY["EPSG","4326"]]"#;

const WKT_32632: &str = r#"PROJCS["WGS 84 / UTM zone 32N",GEOGCS["WGS 84",DATUM["WGS_1984",SPHEROID["WGS 84",6378137,298.257223563,AUTHORITY["EPSG","7030"]],AUTHORITY["EPSG","6326"]],PRIMEM["Greenwich",0,AUTHORITY["EPSG","8901"]],UNIT["degree",0.0174532925199433,AUTHORITY["EPSG","9122"]],AUTHORITY["EPSG","4326"]],PROJECTION["Transverse_Mercator"],PARAMETER["latitude_of_origin",0],PARAMETER["central_meridian",9],PARAMETER["scale_factor",0.9996],PARAMETER["false_easting",500000],PARAMETER["false_northing",0],UNIT["metre",1,AUTHORITY["EPSG","9001"]],AXIS["Easting",EAST],AXIS["Northing",NORTH],AUTHORITY["EPSG","32632"]]"#;

/// Outcome of writing one layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerWrite {
    pub layer: String,
    pub features: usize,
    /// A layer with the same name existed and was replaced
    pub replaced: bool,
}

/// List feature layers in a container. A missing file has no layers.
pub fn list_layers(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    let has_contents: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'gpkg_contents'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    if has_contents.is_none() {
        return Ok(Vec::new());
    }

    let mut stmt = conn.prepare(
        "SELECT table_name FROM gpkg_contents WHERE data_type = 'features' ORDER BY table_name",
    )?;
    let layers = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;

    Ok(layers)
}

/// Writable GeoPackage container
pub struct InventoryStore {
    conn: Connection,
}

impl InventoryStore {
    /// Open or create a container, creating its directory if needed
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| UploadError::io(parent, e))?;
        }

        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.create_tables()?;

        debug!("Opened GeoPackage {}", path.display());
        Ok(store)
    }

    /// Create an in-memory container (for testing)
    pub fn in_memory() -> Result<Self> {
        let store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.create_tables()?;
        Ok(store)
    }

    fn create_tables(&self) -> Result<()> {
        self.conn
            .pragma_update(None, "application_id", GPKG_APPLICATION_ID)?;
        self.conn
            .pragma_update(None, "user_version", GPKG_USER_VERSION)?;

        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS gpkg_spatial_ref_sys (
                srs_name TEXT NOT NULL,
                srs_id INTEGER PRIMARY KEY,
                organization TEXT NOT NULL,
                organization_coordsys_id INTEGER NOT NULL,
                definition TEXT NOT NULL,
                description TEXT
            );

            CREATE TABLE IF NOT EXISTS gpkg_contents (
                table_name TEXT NOT NULL PRIMARY KEY,
                data_type TEXT NOT NULL,
                identifier TEXT UNIQUE,
                description TEXT DEFAULT '',
                last_change DATETIME NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                min_x DOUBLE,
                min_y DOUBLE,
                max_x DOUBLE,
                max_y DOUBLE,
                srs_id INTEGER,
                CONSTRAINT fk_gc_r_srs_id FOREIGN KEY (srs_id) REFERENCES gpkg_spatial_ref_sys(srs_id)
            );

            CREATE TABLE IF NOT EXISTS gpkg_geometry_columns (
                table_name TEXT NOT NULL,
                column_name TEXT NOT NULL,
                geometry_type_name TEXT NOT NULL,
                srs_id INTEGER NOT NULL,
                z TINYINT NOT NULL,
                m TINYINT NOT NULL,
                CONSTRAINT pk_geom_cols PRIMARY KEY (table_name, column_name),
                CONSTRAINT uk_gc_table_name UNIQUE (table_name),
                CONSTRAINT fk_gc_tn FOREIGN KEY (table_name) REFERENCES gpkg_contents(table_name),
                CONSTRAINT fk_gc_srs FOREIGN KEY (srs_id) REFERENCES gpkg_spatial_ref_sys (srs_id)
            );
            "#,
        )?;

        let srs = [
            (
                "Undefined cartesian SRS",
                -1,
                "NONE",
                -1,
                "undefined",
                "undefined cartesian coordinate reference system",
            ),
            (
                "Undefined geographic SRS",
                0,
                "NONE",
                0,
                "undefined",
                "undefined geographic coordinate reference system",
            ),
            ("WGS 84 geodetic", 4326, "EPSG", 4326, WKT_4326, "longitude/latitude coordinates in decimal degrees on the WGS 84 spheroid"),
            ("WGS 84 / UTM zone 32N", INVENTORY_SRS_ID, "EPSG", INVENTORY_SRS_ID, WKT_32632, ""),
        ];
        for (name, id, org, org_id, definition, description) in srs {
            self.conn.execute(
                "INSERT OR IGNORE INTO gpkg_spatial_ref_sys
                 (srs_name, srs_id, organization, organization_coordsys_id, definition, description)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![name, id, org, org_id, definition, description],
            )?;
        }

        Ok(())
    }

    /// Names of the feature layers in this container
    pub fn layers(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT table_name FROM gpkg_contents WHERE data_type = 'features' ORDER BY table_name",
        )?;
        let layers = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(layers)
    }

    /// Write the inventory as layer `layer`, replacing a layer of the same name.
    /// Names are compared ignoring ASCII case, as SQLite does for tables.
    pub fn write_layer(&mut self, layer: &str, inventory: &Inventory) -> Result<LayerWrite> {
        let table = quote_ident(layer);
        let tx = self.conn.transaction()?;

        // SQLite table names are case-insensitive, so "Plot" and "plot" are one layer
        let existing: Option<String> = tx
            .query_row(
                "SELECT table_name FROM gpkg_contents WHERE table_name = ?1 COLLATE NOCASE",
                [layer],
                |row| row.get(0),
            )
            .optional()?;
        let replaced = existing.is_some();

        if let Some(old) = &existing {
            warn!("Replacing existing layer '{}' with '{}'", old, layer);
        }
        let old_name = existing.as_deref().unwrap_or(layer);

        // TODO: upsert by treeid instead of dropping the layer once merge semantics are agreed on
        tx.execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(old_name)), [])?;
        tx.execute(
            "DELETE FROM gpkg_geometry_columns WHERE table_name = ?1 COLLATE NOCASE",
            [layer],
        )?;
        tx.execute(
            "DELETE FROM gpkg_contents WHERE table_name = ?1 COLLATE NOCASE",
            [layer],
        )?;

        let mut columns = vec![
            "fid INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL".to_string(),
            format!("{GEOMETRY_COLUMN} POINT"),
            "treeid INTEGER".to_string(),
            "radius REAL".to_string(),
            "x REAL".to_string(),
            "y REAL".to_string(),
            "height REAL".to_string(),
            "image TEXT".to_string(),
        ];
        columns.extend(
            inventory
                .extra_columns
                .iter()
                .map(|c| format!("{} TEXT", quote_ident(c))),
        );
        tx.execute(&format!("CREATE TABLE {table} ({})", columns.join(", ")), [])?;

        let mut names = vec![GEOMETRY_COLUMN.to_string()];
        names.extend(["treeid", "radius", "x", "y", "height", "image"].map(String::from));
        names.extend(inventory.extra_columns.iter().map(|c| quote_ident(c)));
        let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{i}")).collect();
        let insert = format!(
            "INSERT INTO {table} ({}) VALUES ({})",
            names.join(", "),
            placeholders.join(", ")
        );

        let mut bounds: Option<(f64, f64, f64, f64)> = None;
        {
            let mut stmt = tx.prepare(&insert)?;
            for row in &inventory.rows {
                let mut values: Vec<Box<dyn rusqlite::ToSql>> = vec![
                    Box::new(point_blob(row.x, row.y, INVENTORY_SRS_ID)),
                    Box::new(row.tree_id),
                    Box::new(row.radius),
                    Box::new(row.x),
                    Box::new(row.y),
                    Box::new(row.height),
                    Box::new(row.image.clone()),
                ];
                values.extend(
                    row.extra
                        .iter()
                        .map(|v| Box::new(v.clone()) as Box<dyn rusqlite::ToSql>),
                );
                stmt.execute(rusqlite::params_from_iter(values.iter()))?;

                bounds = Some(match bounds {
                    None => (row.x, row.y, row.x, row.y),
                    Some((min_x, min_y, max_x, max_y)) => (
                        min_x.min(row.x),
                        min_y.min(row.y),
                        max_x.max(row.x),
                        max_y.max(row.y),
                    ),
                });
            }
        }

        let (min_x, min_y, max_x, max_y) = match bounds {
            Some((a, b, c, d)) => (Some(a), Some(b), Some(c), Some(d)),
            None => (None, None, None, None),
        };
        tx.execute(
            "INSERT INTO gpkg_contents
             (table_name, data_type, identifier, min_x, min_y, max_x, max_y, srs_id)
             VALUES (?1, 'features', ?1, ?2, ?3, ?4, ?5, ?6)",
            params![layer, min_x, min_y, max_x, max_y, INVENTORY_SRS_ID],
        )?;
        tx.execute(
            "INSERT INTO gpkg_geometry_columns
             (table_name, column_name, geometry_type_name, srs_id, z, m)
             VALUES (?1, ?2, 'POINT', ?3, 0, 0)",
            params![layer, GEOMETRY_COLUMN, INVENTORY_SRS_ID],
        )?;

        tx.commit()?;

        info!("Wrote {} features to layer '{}'", inventory.len(), layer);

        Ok(LayerWrite {
            layer: layer.to_string(),
            features: inventory.len(),
            replaced,
        })
    }

    /// Read back `(fid, x, y)` of every feature in a layer, ordered by fid
    pub fn read_points(&self, layer: &str) -> Result<Vec<(i64, f64, f64)>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT fid, {GEOMETRY_COLUMN} FROM {} ORDER BY fid",
            quote_ident(layer)
        ))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows
            .into_iter()
            .filter_map(|(fid, blob)| decode_point(&blob).map(|(x, y)| (fid, x, y)))
            .collect())
    }

    /// Bounding box recorded in gpkg_contents
    pub fn extent(&self, layer: &str) -> Result<Option<(f64, f64, f64, f64)>> {
        let extent = self
            .conn
            .query_row(
                "SELECT min_x, min_y, max_x, max_y FROM gpkg_contents WHERE table_name = ?1",
                [layer],
                |row| {
                    Ok((
                        row.get::<_, Option<f64>>(0)?,
                        row.get::<_, Option<f64>>(1)?,
                        row.get::<_, Option<f64>>(2)?,
                        row.get::<_, Option<f64>>(3)?,
                    ))
                },
            )
            .optional()?;

        Ok(match extent {
            Some((Some(a), Some(b), Some(c), Some(d))) => Some((a, b, c, d)),
            _ => None,
        })
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// GeoPackage binary point: "GP" header without envelope, then little-endian WKB
pub fn point_blob(x: f64, y: f64, srs_id: i32) -> Vec<u8> {
    let mut blob = Vec::with_capacity(29);
    blob.extend_from_slice(b"GP");
    blob.push(0); // version 1
    blob.push(0b0000_0001); // little endian, no envelope, not empty
    blob.extend_from_slice(&srs_id.to_le_bytes());
    blob.push(1); // WKB little endian
    blob.extend_from_slice(&1u32.to_le_bytes()); // wkbPoint
    blob.extend_from_slice(&x.to_le_bytes());
    blob.extend_from_slice(&y.to_le_bytes());
    blob
}

/// Decode a GeoPackage point blob back into coordinates
pub fn decode_point(blob: &[u8]) -> Option<(f64, f64)> {
    if blob.len() < 8 || &blob[0..2] != b"GP" {
        return None;
    }
    let envelope_len = match (blob[3] >> 1) & 0b111 {
        0 => 0,
        1 => 32,
        2 | 3 => 48,
        4 => 64,
        _ => return None,
    };
    let wkb = blob.get(8 + envelope_len..)?;
    if wkb.len() < 21 {
        return None;
    }

    let little = wkb[0] == 1;
    let read_u32 = |b: &[u8]| {
        let arr: [u8; 4] = b.try_into().ok()?;
        Some(if little { u32::from_le_bytes(arr) } else { u32::from_be_bytes(arr) })
    };
    let read_f64 = |b: &[u8]| {
        let arr: [u8; 8] = b.try_into().ok()?;
        Some(if little { f64::from_le_bytes(arr) } else { f64::from_be_bytes(arr) })
    };

    if read_u32(&wkb[1..5])? != 1 {
        return None;
    }
    Some((read_f64(&wkb[5..13])?, read_f64(&wkb[13..21])?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn inventory(csv: &str) -> Inventory {
        Inventory::from_csv(csv.as_bytes()).unwrap()
    }

    const TWO_TREES: &str = "TreeID,Radius,X,Y,Height,Image\n1,0.5,10,20,5,t1.png\n2,0.3,11,21,4,t2.png\n";

    #[test]
    fn test_point_blob_layout() {
        let blob = point_blob(10.0, 20.0, INVENTORY_SRS_ID);
        assert_eq!(blob.len(), 29);
        assert_eq!(&blob[0..2], b"GP");
        assert_eq!(i32::from_le_bytes(blob[4..8].try_into().unwrap()), 32632);
        assert_eq!(decode_point(&blob), Some((10.0, 20.0)));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(decode_point(b"nope"), None);
        assert_eq!(decode_point(b"GP\0\x01\0\0\0\0\x01"), None);
    }

    #[test]
    fn test_write_and_read_points() {
        let mut store = InventoryStore::in_memory().unwrap();
        let result = store
            .write_layer("inventory-2024", &inventory(TWO_TREES))
            .unwrap();

        assert_eq!(result.features, 2);
        assert!(!result.replaced);
        assert_eq!(store.layers().unwrap(), vec!["inventory-2024"]);
        assert_eq!(
            store.read_points("inventory-2024").unwrap(),
            vec![(1, 10.0, 20.0), (2, 11.0, 21.0)]
        );
        assert_eq!(
            store.extent("inventory-2024").unwrap(),
            Some((10.0, 20.0, 11.0, 21.0))
        );
    }

    #[test]
    fn test_same_name_replaces_layer() {
        let mut store = InventoryStore::in_memory().unwrap();
        store.write_layer("plot", &inventory(TWO_TREES)).unwrap();

        let one = "TreeID,Radius,X,Y,Height,Image\n9,1.0,50,60,7,t9.png\n";
        let result = store.write_layer("plot", &inventory(one)).unwrap();

        assert!(result.replaced);
        let points = store.read_points("plot").unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!((points[0].1, points[0].2), (50.0, 60.0));
        assert_eq!(store.layers().unwrap(), vec!["plot"]);
    }

    #[test]
    fn test_name_differing_in_case_replaces_layer() {
        let mut store = InventoryStore::in_memory().unwrap();
        store.write_layer("Plot", &inventory(TWO_TREES)).unwrap();

        let one = "TreeID,Radius,X,Y,Height,Image\n9,1.0,50,60,7,t9.png\n";
        let result = store.write_layer("plot", &inventory(one)).unwrap();

        assert!(result.replaced);
        assert_eq!(store.layers().unwrap(), vec!["plot"]);
        let points = store.read_points("plot").unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!((points[0].1, points[0].2), (50.0, 60.0));
        assert_eq!(store.extent("plot").unwrap(), Some((50.0, 60.0, 50.0, 60.0)));
    }

    #[test]
    fn test_layers_are_independent() {
        let mut store = InventoryStore::in_memory().unwrap();
        store.write_layer("inventory-2023", &inventory(TWO_TREES)).unwrap();
        store.write_layer("inventory-2024", &inventory(TWO_TREES)).unwrap();
        assert_eq!(
            store.layers().unwrap(),
            vec!["inventory-2023", "inventory-2024"]
        );
    }

    #[test]
    fn test_extra_columns_and_quoted_names() {
        let csv = "TreeID,Radius,X,Y,Height,Image,Species\n1,0.5,10,20,5,t1.png,Fagus\n";
        let mut store = InventoryStore::in_memory().unwrap();
        store.write_layer("my \"odd\" layer", &inventory(csv)).unwrap();

        let species: String = store
            .conn
            .query_row("SELECT species FROM \"my \"\"odd\"\" layer\"", [], |r| r.get(0))
            .unwrap();
        assert_eq!(species, "Fagus");
    }

    #[test]
    fn test_empty_inventory_has_no_extent() {
        let mut store = InventoryStore::in_memory().unwrap();
        let empty = inventory("TreeID,Radius,X,Y,Height,Image\n");
        store.write_layer("empty", &empty).unwrap();
        assert_eq!(store.extent("empty").unwrap(), None);
        assert!(store.read_points("empty").unwrap().is_empty());
    }

    #[test]
    fn test_list_layers_on_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data/inventory.gpkg");
        assert!(list_layers(&path).unwrap().is_empty());

        let mut store = InventoryStore::open(&path).unwrap();
        store.write_layer("inventory-2024", &inventory(TWO_TREES)).unwrap();
        drop(store);

        assert_eq!(list_layers(&path).unwrap(), vec!["inventory-2024"]);

        let app_id: i32 = Connection::open(&path)
            .unwrap()
            .query_row("PRAGMA application_id", [], |r| r.get(0))
            .unwrap();
        assert_eq!(app_id, GPKG_APPLICATION_ID);
    }
}
