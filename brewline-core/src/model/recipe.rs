use serde::{Deserialize, Serialize};

use crate::entity::{EntityKind, SyncEntity};
use crate::id::EntityIds;
use crate::image::ImageAttachment;

/// One measured ingredient line (grain bill, hop schedule, adjuncts).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngredientLine {
    pub name: String,
    pub quantity: f64,
    pub unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_at_minute: Option<u32>,
}

/// A recipe. Gravity, ABV, IBU and SRM values come from the brewing
/// calculator and are stored as computed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipe {
    #[serde(flatten)]
    ids: EntityIds,
    pub name: String,
    pub style: String,
    #[serde(default)]
    pub brewing_type: String,
    #[serde(default)]
    pub batch_volume: f64,
    #[serde(default)]
    pub boil_duration: u32,
    #[serde(default)]
    pub original_gravity: f64,
    #[serde(default)]
    pub final_gravity: f64,
    #[serde(default)]
    pub abv: f64,
    #[serde(default)]
    pub ibu: f64,
    #[serde(default)]
    pub srm: f64,
    #[serde(default)]
    pub grains: Vec<IngredientLine>,
    #[serde(default)]
    pub hops: Vec<IngredientLine>,
    #[serde(default)]
    pub notes: Vec<String>,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_image: Option<ImageAttachment>,
}

impl Recipe {
    pub fn new(name: impl Into<String>, style: impl Into<String>) -> Self {
        Self {
            ids: EntityIds::fresh(),
            name: name.into(),
            style: style.into(),
            brewing_type: "all grain".to_string(),
            batch_volume: 0.0,
            boil_duration: 60,
            original_gravity: 1.0,
            final_gravity: 1.0,
            abv: 0.0,
            ibu: 0.0,
            srm: 0.0,
            grains: Vec::new(),
            hops: Vec::new(),
            notes: Vec::new(),
            is_public: false,
            label_image: None,
        }
    }

    pub fn with_ids(mut self, ids: EntityIds) -> Self {
        self.ids = ids;
        self
    }
}

impl SyncEntity for Recipe {
    const KIND: EntityKind = EntityKind::Recipe;

    fn ids(&self) -> &EntityIds {
        &self.ids
    }

    fn ids_mut(&mut self) -> &mut EntityIds {
        &mut self.ids
    }

    fn images(&self) -> Vec<(&'static str, &ImageAttachment)> {
        self.label_image.iter().map(|img| ("labelImage", img)).collect()
    }

    fn images_mut(&mut self) -> Vec<(&'static str, &mut ImageAttachment)> {
        self.label_image.iter_mut().map(|img| ("labelImage", img)).collect()
    }

    fn is_well_formed(&self) -> bool {
        !self.name.is_empty()
    }
}
