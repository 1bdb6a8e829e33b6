use serde::{Deserialize, Serialize};

use crate::entity::{EntityKind, SyncEntity};
use crate::id::EntityIds;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Manual,
    Timer,
    Calendar,
}

/// One step of a batch's process schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStep {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<u32>,
}

/// Measurements recorded while brewing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BatchAnnotations {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measured_original_gravity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measured_final_gravity: Option<f64>,
    #[serde(default)]
    pub notes: Vec<String>,
}

/// A brew in progress, instantiated from a recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    #[serde(flatten)]
    ids: EntityIds,
    pub recipe_id: String,
    #[serde(default)]
    pub schedule: Vec<ProcessStep>,
    #[serde(default)]
    pub current_step: usize,
    #[serde(default)]
    pub is_archived: bool,
    #[serde(default)]
    pub started_at: u64,
    #[serde(default)]
    pub annotations: BatchAnnotations,
}

impl Batch {
    pub fn new(recipe_id: impl Into<String>, schedule: Vec<ProcessStep>, started_at: u64) -> Self {
        Self {
            ids: EntityIds::fresh(),
            recipe_id: recipe_id.into(),
            schedule,
            current_step: 0,
            is_archived: false,
            started_at,
            annotations: BatchAnnotations::default(),
        }
    }

    /// Move to the next step. Returns false once the schedule is complete.
    pub fn advance(&mut self) -> bool {
        if self.current_step + 1 >= self.schedule.len() {
            return false;
        }
        self.current_step += 1;
        true
    }

    pub fn is_complete(&self) -> bool {
        self.schedule.is_empty() || self.current_step + 1 >= self.schedule.len()
    }
}

impl SyncEntity for Batch {
    const KIND: EntityKind = EntityKind::Batch;

    fn ids(&self) -> &EntityIds {
        &self.ids
    }

    fn ids_mut(&mut self) -> &mut EntityIds {
        &mut self.ids
    }

    fn is_well_formed(&self) -> bool {
        !self.recipe_id.is_empty() && self.current_step <= self.schedule.len()
    }
}
