//! # brewline-core: domain model for the Brewline offline-first engine
//!
//! Holds the types every other crate agrees on:
//!
//! - [`id`]: `ClientId` / `ServerId` / tagged `Identifier`, and resolution
//! - [`entity`]: the `SyncEntity` trait, `EntityKind`, server-wins merge
//! - [`model`]: recipes, inventory items, batches, the user profile
//! - [`image`]: image attachment metadata
//! - [`sync`]: sync flags, collapsing rules, flush envelopes
//!
//! Brewing arithmetic and unit formatting are not part of this crate.

pub mod entity;
pub mod id;
pub mod image;
pub mod model;
pub mod sync;

pub use entity::{apply_partial, merge_server_copy, EntityKind, MergeError, SyncEntity};
pub use id::{generate_client_id, is_server_format, ClientId, EntityIds, IdError, Identifier, ServerId};
pub use image::ImageAttachment;
pub use model::{Batch, InventoryItem, Recipe, UserProfile};
pub use sync::{collapse, Collapse, SyncError, SyncFlag, SyncMethod, SyncResponse, SyncSuccess};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entities_round_trip_through_wire_shape() {
        let mut recipe = Recipe::new("Dubbel", "Belgian Dubbel");
        recipe.ids_mut().promote(ServerId::new("65a1f0c2e4b0a1b2c3d4e5f6"));

        let json = serde_json::to_value(&recipe).unwrap();
        assert_eq!(json["_id"], "65a1f0c2e4b0a1b2c3d4e5f6");
        assert_eq!(json["cid"], recipe.ids().client_id().as_str());
        assert_eq!(json["name"], "Dubbel");

        let back: Recipe = serde_json::from_value(json).unwrap();
        assert_eq!(back, recipe);
    }

    #[test]
    fn test_identifier_stability_across_promotion() {
        let mut item = InventoryItem::new("Saison", "beer", 6.0);
        let cid = item.ids().client_id().clone();
        assert_eq!(item.resolve(), Identifier::Client(cid.clone()));

        item.ids_mut().promote(ServerId::new("s1"));
        assert_eq!(item.resolve(), Identifier::Server(ServerId::new("s1")));
        assert_eq!(item.ids().client_id(), &cid);
        assert!(item.same_entity(&Identifier::Client(cid)));
    }
}
