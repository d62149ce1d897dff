//! Inventory upload session
//!
//! The operator supplies inputs one at a time. Each call to
//! [`InventorySession::advance`] either reports what is still missing
//! ([`Step::NeedsInput`]) or runs the whole write phase to completion.
//! Inputs already provided stay cached in the session until
//! [`InventorySession::drop_cache`] is called.

use tracing::{info, warn};

use crate::archive::{ExtractStats, ImageArchive};
use crate::checksum::{Category, ChecksumRecord, ChecksumTracker};
use crate::config::Environment;
use crate::error::{Result, UploadError};
use crate::gpkg::{self, InventoryStore, LayerWrite};
use crate::inventory::Inventory;
use crate::reconcile::Reconciliation;

/// Outcome of one pass through a workflow stage
#[derive(Debug)]
pub enum Step<T> {
    /// Suspended until the operator provides the prompted input
    NeedsInput(Prompt),
    Complete(T),
}

/// What the operator has to provide next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prompt {
    InventoryCsv,
    ImageArchive,
    /// Inventory and archive disagree; continue only on explicit confirmation
    ConfirmMismatches(Reconciliation),
    BaseRasters,
}

/// Result of a completed inventory upload
#[derive(Debug, Clone)]
pub struct InventoryOutcome {
    pub layer: LayerWrite,
    pub images: ExtractStats,
    pub reconciliation: Reconciliation,
    pub checksums: ChecksumRecord,
}

/// Default layer name for uploads made this year
pub fn default_layer_name() -> String {
    use chrono::Datelike;
    format!("inventory-{}", chrono::Local::now().year())
}

/// Session state for one operator working through an inventory upload
#[derive(Debug, Default)]
pub struct InventorySession {
    inventory: Option<Inventory>,
    archive: Option<ImageArchive>,
    reconciliation: Option<Reconciliation>,
    confirmed: bool,
}

impl InventorySession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and cache the inventory CSV
    pub fn provide_inventory(&mut self, csv: &[u8]) -> Result<()> {
        let inventory = Inventory::from_csv(csv)?;
        self.inventory = Some(inventory);
        self.reconciliation = None;
        self.confirmed = false;
        Ok(())
    }

    /// Open and cache the image archive, reconciling it against the inventory
    pub fn provide_archive(&mut self, zip: Vec<u8>) -> Result<Option<&Reconciliation>> {
        self.archive = Some(ImageArchive::from_bytes(zip)?);
        self.reconciliation = None;
        self.confirmed = false;
        Ok(self.reconcile())
    }

    /// Operator chose to continue despite mismatches
    pub fn confirm_mismatches(&mut self) {
        self.confirmed = true;
    }

    /// Forget every cached upload
    pub fn drop_cache(&mut self) {
        info!("Dropping cached inventory session data");
        *self = Self::default();
    }

    pub fn inventory(&self) -> Option<&Inventory> {
        self.inventory.as_ref()
    }

    pub fn archive(&self) -> Option<&ImageArchive> {
        self.archive.as_ref()
    }

    fn reconcile(&mut self) -> Option<&Reconciliation> {
        if self.reconciliation.is_none() {
            let (inventory, archive) = (self.inventory.as_ref()?, self.archive.as_ref()?);
            self.reconciliation = Some(Reconciliation::check(
                inventory.image_names(),
                archive.member_names().iter().map(String::as_str),
            ));
        }
        self.reconciliation.as_ref()
    }

    /// Cached inventory, or the wait condition as an error for callers that
    /// cannot suspend
    pub fn require_inventory(&self) -> Result<&Inventory> {
        self.inventory
            .as_ref()
            .ok_or(UploadError::MissingUpload("inventory CSV"))
    }

    /// Run the session as far as the provided inputs allow.
    ///
    /// Writes the layer, extracts the images and updates the inventory and
    /// image checksums once every input is present and confirmed.
    pub fn advance(&mut self, env: &Environment, layer: &str) -> Result<Step<InventoryOutcome>> {
        if self.inventory.is_none() {
            return Ok(Step::NeedsInput(Prompt::InventoryCsv));
        }
        if self.archive.is_none() {
            return Ok(Step::NeedsInput(Prompt::ImageArchive));
        }

        let reconciliation = match self.reconcile() {
            Some(r) => r.clone(),
            None => return Ok(Step::NeedsInput(Prompt::ImageArchive)),
        };
        if !reconciliation.is_clean() && !self.confirmed {
            return Ok(Step::NeedsInput(Prompt::ConfirmMismatches(reconciliation)));
        }
        if !reconciliation.is_clean() {
            warn!("Continuing with unreconciled images at operator request");
        }

        let (Some(inventory), Some(archive)) = (self.inventory.as_ref(), self.archive.as_mut())
        else {
            return Ok(Step::NeedsInput(Prompt::InventoryCsv));
        };

        let mut store = InventoryStore::open(&env.inventory_gpkg)?;
        let layer = store.write_layer(layer, inventory)?;
        drop(store);

        let images = archive.extract_to(&env.img_dir)?;

        let checksums = ChecksumTracker::new(env).update(&[Category::Baselayer])?;

        Ok(Step::Complete(InventoryOutcome {
            layer,
            images,
            reconciliation,
            checksums,
        }))
    }
}

/// Existing layers, and whether `layer` would overwrite one of them.
/// Layer names differing only in ASCII case are the same layer.
pub fn layer_collision(env: &Environment, layer: &str) -> Result<(Vec<String>, bool)> {
    let layers = gpkg::list_layers(&env.inventory_gpkg)?;
    let exists = layers.iter().any(|l| l.eq_ignore_ascii_case(layer));
    if exists {
        warn!("Layer '{}' already exists and will be overwritten", layer);
    }
    Ok((layers, exists))
}
