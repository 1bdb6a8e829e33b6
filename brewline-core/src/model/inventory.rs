use serde::{Deserialize, Serialize};

use crate::entity::{EntityKind, SyncEntity};
use crate::id::EntityIds;
use crate::image::ImageAttachment;

/// A stocked item: packaged beer, ingredients, supplies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryItem {
    #[serde(flatten)]
    ids: EntityIds,
    pub item_name: String,
    pub item_type: String,
    #[serde(default)]
    pub description: String,
    pub initial_quantity: f64,
    pub current_quantity: f64,
    #[serde(default)]
    pub stock_type: String,
    #[serde(default)]
    pub source_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_abv: Option<f64>,
    /// Batch this item was packaged from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_batch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_label_image: Option<ImageAttachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supplier_label_image: Option<ImageAttachment>,
}

impl InventoryItem {
    pub fn new(item_name: impl Into<String>, item_type: impl Into<String>, quantity: f64) -> Self {
        Self {
            ids: EntityIds::fresh(),
            item_name: item_name.into(),
            item_type: item_type.into(),
            description: String::new(),
            initial_quantity: quantity,
            current_quantity: quantity,
            stock_type: "bottle".to_string(),
            source_type: "self".to_string(),
            item_abv: None,
            source_batch_id: None,
            item_label_image: None,
            supplier_label_image: None,
        }
    }

    pub fn with_ids(mut self, ids: EntityIds) -> Self {
        self.ids = ids;
        self
    }

    pub fn is_depleted(&self) -> bool {
        self.current_quantity <= 0.0
    }
}

impl SyncEntity for InventoryItem {
    const KIND: EntityKind = EntityKind::Inventory;

    fn ids(&self) -> &EntityIds {
        &self.ids
    }

    fn ids_mut(&mut self) -> &mut EntityIds {
        &mut self.ids
    }

    fn images(&self) -> Vec<(&'static str, &ImageAttachment)> {
        let mut out = Vec::with_capacity(2);
        if let Some(img) = &self.item_label_image {
            out.push(("itemLabelImage", img));
        }
        if let Some(img) = &self.supplier_label_image {
            out.push(("supplierLabelImage", img));
        }
        out
    }

    fn images_mut(&mut self) -> Vec<(&'static str, &mut ImageAttachment)> {
        let mut out = Vec::with_capacity(2);
        if let Some(img) = self.item_label_image.as_mut() {
            out.push(("itemLabelImage", img));
        }
        if let Some(img) = self.supplier_label_image.as_mut() {
            out.push(("supplierLabelImage", img));
        }
        out
    }

    fn is_well_formed(&self) -> bool {
        !self.item_name.is_empty() && self.initial_quantity >= 0.0
    }
}
