//! Cross-check of inventory image names against archive members

use std::collections::HashSet;

use serde::Serialize;
use tracing::{info, warn};

/// Mismatches between the inventory and the image archive
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    /// Declared by the inventory but absent from the archive (inventory order)
    #[serde(rename = "Not in archive")]
    pub missing_in_archive: Vec<String>,

    /// Present in the archive but not referenced by any row (archive order)
    #[serde(rename = "Not in inventory")]
    pub missing_in_inventory: Vec<String>,
}

impl Reconciliation {
    /// Compare declared image names with archive member names
    pub fn check<'a, I, M>(inventory_images: I, archive_members: M) -> Self
    where
        I: IntoIterator<Item = &'a str>,
        M: IntoIterator<Item = &'a str>,
    {
        let declared: Vec<&str> = inventory_images.into_iter().collect();
        let members: Vec<&str> = archive_members.into_iter().collect();

        let declared_set: HashSet<&str> = declared.iter().copied().collect();
        let member_set: HashSet<&str> = members.iter().copied().collect();

        let missing_in_archive = declared
            .iter()
            .filter(|name| !member_set.contains(*name))
            .map(|name| name.to_string())
            .collect();
        let missing_in_inventory = members
            .iter()
            .filter(|name| !declared_set.contains(*name))
            .map(|name| name.to_string())
            .collect();

        let result = Self {
            missing_in_archive,
            missing_in_inventory,
        };

        if result.is_clean() {
            info!("All {} inventory images found in archive", declared.len());
        } else {
            warn!(
                "{} images are not in the archive, {} archive images are not linked in the inventory",
                result.missing_in_archive.len(),
                result.missing_in_inventory.len()
            );
        }

        result
    }

    /// True when both sides agree exactly
    pub fn is_clean(&self) -> bool {
        self.missing_in_archive.is_empty() && self.missing_in_inventory.is_empty()
    }
}
