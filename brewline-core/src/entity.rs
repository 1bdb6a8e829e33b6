//! The `SyncEntity` contract and merge rules shared by every domain type.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::id::{EntityIds, Identifier};
use crate::image::ImageAttachment;

/// Domain entity kinds. Each kind has its own collection, flag partition
/// and remote endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Recipe,
    Inventory,
    Batch,
    User,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Recipe,
        EntityKind::Inventory,
        EntityKind::Batch,
        EntityKind::User,
    ];

    /// Kinds held as lists (everything except the single user record).
    pub const COLLECTIONS: [EntityKind; 3] =
        [EntityKind::Recipe, EntityKind::Inventory, EntityKind::Batch];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Recipe => "recipe",
            EntityKind::Inventory => "inventory",
            EntityKind::Batch => "batch",
            EntityKind::User => "user",
        }
    }

    /// Path segment of the remote CRUD endpoint.
    pub fn collection_path(&self) -> &'static str {
        match self {
            EntityKind::Recipe => "recipes",
            EntityKind::Inventory => "inventory",
            EntityKind::Batch => "process/batch",
            EntityKind::User => "users/profile",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown entity kind: {0}")]
pub struct UnknownKind(pub String);

impl FromStr for EntityKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownKind(s.to_string()))
    }
}

#[derive(Error, Debug)]
pub enum MergeError {
    #[error("Partial update must be a JSON object")]
    NotAnObject,
    #[error("Merged value no longer matches the entity shape: {0}")]
    Shape(#[from] serde_json::Error),
}

/// An entity that can live in a state container and be synced.
pub trait SyncEntity:
    Serialize + DeserializeOwned + Clone + fmt::Debug + PartialEq + Send + Sync + 'static
{
    const KIND: EntityKind;

    fn ids(&self) -> &EntityIds;

    fn ids_mut(&mut self) -> &mut EntityIds;

    /// Image attachments by field name.
    fn images(&self) -> Vec<(&'static str, &ImageAttachment)> {
        Vec::new()
    }

    fn images_mut(&mut self) -> Vec<(&'static str, &mut ImageAttachment)> {
        Vec::new()
    }

    /// Structural guard applied to server payloads after decoding.
    fn is_well_formed(&self) -> bool {
        true
    }

    fn resolve(&self) -> Identifier {
        self.ids().resolve()
    }

    fn same_entity(&self, id: &Identifier) -> bool {
        self.ids().same_entity(id)
    }
}

/// Merge a server copy into the local entity. Server values win for every
/// field; the local client id and device-only image paths are kept.
///
/// Applying the same server copy twice yields the same result.
pub fn merge_server_copy<T: SyncEntity>(local: &T, mut server: T) -> T {
    server.ids_mut().adopt_missing(local.ids());

    let local_images: Vec<(&'static str, ImageAttachment)> = local
        .images()
        .into_iter()
        .map(|(name, img)| (name, img.clone()))
        .collect();
    for (name, img) in server.images_mut() {
        if let Some((_, local_img)) = local_images.iter().find(|(n, _)| *n == name) {
            img.adopt_local(local_img);
        }
    }
    server
}

/// Shallow-merge a JSON object into an entity.
///
/// Top-level keys of `partial` replace the entity's keys. Identifier keys
/// are ignored: ids change only through promotion.
pub fn apply_partial<T: SyncEntity>(entity: &T, partial: &serde_json::Value) -> Result<T, MergeError> {
    let patch = partial.as_object().ok_or(MergeError::NotAnObject)?;
    let mut current = serde_json::to_value(entity)?;
    let fields = current.as_object_mut().ok_or(MergeError::NotAnObject)?;

    for (key, value) in patch {
        if key == "cid" || key == "_id" {
            log::debug!("ignoring identifier key '{key}' in partial update");
            continue;
        }
        fields.insert(key.clone(), value.clone());
    }

    let mut merged: T = serde_json::from_value(current)?;
    *merged.ids_mut() = entity.ids().clone();
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{ClientId, ServerId};
    use crate::model::{InventoryItem, Recipe};
    use serde_json::json;

    #[test]
    fn test_kind_round_trip_through_str() {
        for kind in EntityKind::ALL {
            assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), kind);
        }
        assert!("widgets".parse::<EntityKind>().is_err());
    }

    #[test]
    fn test_apply_partial_is_shallow() {
        let recipe = Recipe::new("Pale Ale", "American Pale Ale");
        let updated = apply_partial(&recipe, &json!({ "name": "Session Pale", "ibu": 35.0 })).unwrap();

        assert_eq!(updated.name, "Session Pale");
        assert_eq!(updated.ibu, 35.0);
        assert_eq!(updated.style, "American Pale Ale");
        assert_eq!(updated.ids(), recipe.ids());
    }

    #[test]
    fn test_apply_partial_ignores_identifier_keys() {
        let recipe = Recipe::new("Stout", "Dry Stout");
        let updated = apply_partial(&recipe, &json!({ "cid": "hijack", "_id": "s9" })).unwrap();
        assert_eq!(updated.ids(), recipe.ids());
    }

    #[test]
    fn test_apply_partial_rejects_non_object_and_bad_shape() {
        let recipe = Recipe::new("Stout", "Dry Stout");
        assert!(matches!(apply_partial(&recipe, &json!([1, 2])), Err(MergeError::NotAnObject)));
        assert!(matches!(
            apply_partial(&recipe, &json!({ "ibu": "bitter" })),
            Err(MergeError::Shape(_))
        ));
    }

    #[test]
    fn test_merge_server_wins_and_keeps_client_id() {
        let mut local = InventoryItem::new("Hazy IPA", "beer", 24.0);
        local.item_label_image = Some(ImageAttachment::picked("/data/img/label.jpg"));

        let mut server = local.clone();
        server.current_quantity = 20.0;
        // Server copies carry no client-side fields.
        *server.ids_mut() = serde_json::from_value(json!({ "_id": "s1" })).unwrap();
        if let Some(img) = server.item_label_image.as_mut() {
            img.local_path = None;
            img.remote_path = Some("images/label.jpg".into());
        }

        let merged = merge_server_copy(&local, server.clone());
        assert_eq!(merged.ids().client_id(), local.ids().client_id());
        assert_eq!(merged.ids().server_id(), Some(&ServerId::new("s1")));
        assert_eq!(merged.current_quantity, 20.0);
        let img = merged.item_label_image.as_ref().unwrap();
        assert_eq!(img.local_path.as_deref(), Some("/data/img/label.jpg"));
        assert_eq!(img.remote_path.as_deref(), Some("images/label.jpg"));

        let again = merge_server_copy(&merged, server);
        assert_eq!(again, merged);
    }

    #[test]
    fn test_same_entity_through_trait() {
        let recipe = Recipe::new("Porter", "Robust Porter");
        let cid = recipe.ids().client_id().clone();
        assert!(recipe.same_entity(&Identifier::Client(cid)));
        assert!(!recipe.same_entity(&Identifier::Client(ClientId::new("other"))));
    }
}
