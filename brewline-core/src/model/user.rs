use serde::{Deserialize, Serialize};

use crate::entity::{EntityKind, SyncEntity};
use crate::id::EntityIds;
use crate::image::ImageAttachment;

/// The signed-in user. `token` is an opaque credential issued elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(flatten)]
    ids: EntityIds,
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default = "default_units")]
    pub preferred_units_system: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_image: Option<ImageAttachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brewery_label_image: Option<ImageAttachment>,
}

fn default_units() -> String {
    "englishStandard".to_string()
}

impl UserProfile {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            ids: EntityIds::fresh(),
            username: username.into(),
            email: String::new(),
            first_name: String::new(),
            last_name: String::new(),
            preferred_units_system: default_units(),
            token: None,
            user_image: None,
            brewery_label_image: None,
        }
    }

    pub fn with_ids(mut self, ids: EntityIds) -> Self {
        self.ids = ids;
        self
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

impl SyncEntity for UserProfile {
    const KIND: EntityKind = EntityKind::User;

    fn ids(&self) -> &EntityIds {
        &self.ids
    }

    fn ids_mut(&mut self) -> &mut EntityIds {
        &mut self.ids
    }

    fn images(&self) -> Vec<(&'static str, &ImageAttachment)> {
        let mut out = Vec::with_capacity(2);
        if let Some(img) = &self.user_image {
            out.push(("userImage", img));
        }
        if let Some(img) = &self.brewery_label_image {
            out.push(("breweryLabelImage", img));
        }
        out
    }

    fn images_mut(&mut self) -> Vec<(&'static str, &mut ImageAttachment)> {
        let mut out = Vec::with_capacity(2);
        if let Some(img) = self.user_image.as_mut() {
            out.push(("userImage", img));
        }
        if let Some(img) = self.brewery_label_image.as_mut() {
            out.push(("breweryLabelImage", img));
        }
        out
    }

    fn is_well_formed(&self) -> bool {
        !self.username.is_empty()
    }
}
