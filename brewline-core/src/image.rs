//! Image attachments carried by entities.

use serde::{Deserialize, Serialize};

use crate::id::{generate_client_id, ClientId};

/// Image metadata attached to an entity field.
///
/// `local_path` points at the device copy, `remote_path` at the server
/// copy once uploaded. `has_pending_edit` is set when the user picks a new
/// image and cleared once it has been persisted to durable local storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageAttachment {
    pub cid: ClientId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_path: Option<String>,
    #[serde(default)]
    pub has_pending_edit: bool,
}

impl ImageAttachment {
    /// A freshly picked image that still lives at a temporary path.
    pub fn picked(path: impl Into<String>) -> Self {
        Self {
            cid: generate_client_id(),
            local_path: Some(path.into()),
            remote_path: None,
            has_pending_edit: true,
        }
    }

    /// Replace the image with a newly picked file.
    pub fn edit(&mut self, path: impl Into<String>) {
        self.local_path = Some(path.into());
        self.remote_path = None;
        self.has_pending_edit = true;
    }

    /// True when a local file exists that the server has not received.
    pub fn needs_upload(&self) -> bool {
        self.local_path.is_some() && self.remote_path.is_none()
    }

    /// Carry device-only fields over from the local copy of this image.
    ///
    /// The server never knows our file paths, so a server copy keeps
    /// its own `remote_path` and picks up `local_path` from `local`.
    pub fn adopt_local(&mut self, local: &ImageAttachment) {
        if self.local_path.is_none() {
            self.local_path = local.local_path.clone();
        }
        if self.cid.is_empty() {
            self.cid = local.cid.clone();
        }
        self.has_pending_edit = false;
    }
}
