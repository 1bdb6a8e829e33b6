//! Domain entities authored on the device.

mod batch;
mod inventory;
mod recipe;
mod user;

pub use batch::{Batch, BatchAnnotations, ProcessStep, StepKind};
pub use inventory::InventoryItem;
pub use recipe::{IngredientLine, Recipe};
pub use user::UserProfile;
