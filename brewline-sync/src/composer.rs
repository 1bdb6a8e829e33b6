//! Background request composer.
//!
//! Turns one entity plus a [`SyncMethod`] into one remote call:
//!
//! ```text
//! entity ──► image store requests ──► upload descriptors ──► blobs
//!                                                             │
//!                  JSON ◄── no blobs ── payload ── blobs ──► multipart
//!                                         │
//!                                   RemoteApi::send
//!                                         │
//!                 server copy ──► type guard ──► merge (server wins)
//! ```
//!
//! The composer never writes durable storage. It returns the merged entity
//! and the owning domain service persists it.

use brewline_core::{merge_server_copy, EntityKind, ImageAttachment, ServerId, SyncEntity, SyncMethod};
use futures_util::future::{join_all, BoxFuture};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

use crate::connectivity::ConnectivityMonitor;
use crate::error::{Result, SyncEngineError};
use crate::images::ImageStore;
use crate::remote::{ImageBlob, RemoteApi, RemoteRequest, RequestPayload};
use crate::reporter::ErrorReporter;
use crate::session::Session;
use crate::storage::StoreError;

/// What to do when a call fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Return the error to the caller (foreground actions).
    Propagate,
    /// Report the error and resolve to "nothing changed" (background syncs).
    ResolveOnError,
}

/// One image that must travel with the next request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadDescriptor {
    pub image: ImageAttachment,
    pub field_name: &'static str,
}

pub struct RequestComposer {
    remote: Arc<dyn RemoteApi>,
    images: Arc<dyn ImageStore>,
    connectivity: ConnectivityMonitor,
    session: Session,
    reporter: Arc<dyn ErrorReporter>,
}

impl RequestComposer {
    pub fn new(
        remote: Arc<dyn RemoteApi>,
        images: Arc<dyn ImageStore>,
        connectivity: ConnectivityMonitor,
        session: Session,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        Self {
            remote,
            images,
            connectivity,
            session,
            reporter,
        }
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn reporter(&self) -> &dyn ErrorReporter {
        self.reporter.as_ref()
    }

    /// Online and signed in.
    pub fn is_ready(&self) -> bool {
        self.connectivity.is_online() && self.session.is_authenticated()
    }

    /// True only when online, authenticated, and the entity already has a
    /// `ServerId` unless this call is the `Create` that assigns one.
    pub fn can_send<T: SyncEntity>(&self, entity: &T, method: SyncMethod) -> bool {
        self.is_ready() && (method == SyncMethod::Create || entity.ids().server_id().is_some())
    }

    // ─── Images ──────────────────────────────────────────────

    /// One task per attachment with a pending edit. Each task persists the
    /// image and yields its field name with the updated metadata.
    pub fn compose_image_store_requests<'a, T: SyncEntity>(
        &'a self,
        entity: &'a T,
    ) -> Vec<BoxFuture<'a, Result<(&'static str, ImageAttachment)>>> {
        entity
            .images()
            .into_iter()
            .filter(|(_, image)| image.has_pending_edit)
            .map(|(field, image)| -> BoxFuture<'a, Result<(&'static str, ImageAttachment)>> {
                Box::pin(async move { Ok((field, self.images.persist(image).await?)) })
            })
            .collect()
    }

    /// Run every image store request and write the results back.
    pub async fn store_images<T: SyncEntity>(&self, entity: &T) -> Result<T> {
        let stored = join_all(self.compose_image_store_requests(entity)).await;
        let mut updated = entity.clone();
        for result in stored {
            let (field, image) = result?;
            if let Some((_, slot)) = updated.images_mut().into_iter().find(|(f, _)| *f == field) {
                *slot = image;
            }
        }
        Ok(updated)
    }

    /// Attachments the server has not received yet.
    pub fn compose_image_upload_requests<T: SyncEntity>(&self, entity: &T) -> Vec<UploadDescriptor> {
        entity
            .images()
            .into_iter()
            .filter(|(_, image)| image.needs_upload())
            .map(|(field_name, image)| UploadDescriptor {
                image: image.clone(),
                field_name,
            })
            .collect()
    }

    async fn blobify(&self, uploads: Vec<UploadDescriptor>) -> Result<Vec<ImageBlob>> {
        let mut blobs = Vec::with_capacity(uploads.len());
        for upload in uploads {
            let bytes = self.images.read_blob(&upload.image).await?;
            let file_name = upload
                .image
                .local_path
                .as_deref()
                .and_then(|p| Path::new(p).file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| upload.image.cid.to_string());
            blobs.push(ImageBlob {
                field_name: upload.field_name.to_string(),
                file_name,
                bytes,
            });
        }
        Ok(blobs)
    }

    // ─── Requests ────────────────────────────────────────────

    /// Send one entity and merge the server's copy into it.
    ///
    /// Returns `Ok(None)` only when `policy` is `ResolveOnError` and the call
    /// failed. A `Delete` resolves to the unchanged local entity.
    pub async fn send<T: SyncEntity>(
        &self,
        entity: &T,
        method: SyncMethod,
        policy: ErrorPolicy,
    ) -> Result<Option<T>> {
        let result = match method {
            SyncMethod::Delete => self.delete_entity(entity).await.map(|()| entity.clone()),
            SyncMethod::Create | SyncMethod::Update => self.push(entity, method).await,
        };
        self.apply_policy(result, policy)
    }

    /// Delete a document the server already knows.
    pub async fn send_delete(&self, kind: EntityKind, target: &ServerId, policy: ErrorPolicy) -> Result<bool> {
        let result = self.delete_remote(kind, target).await;
        Ok(self.apply_policy(result, policy)?.is_some())
    }

    fn apply_policy<V>(&self, result: Result<V>, policy: ErrorPolicy) -> Result<Option<V>> {
        match (result, policy) {
            (Ok(value), _) => Ok(Some(value)),
            (Err(e), ErrorPolicy::Propagate) => Err(e),
            (Err(e), ErrorPolicy::ResolveOnError) => {
                self.reporter.report(&e, e.severity());
                Ok(None)
            }
        }
    }

    fn ensure_ready(&self) -> Result<()> {
        if !self.connectivity.is_online() {
            return Err(SyncEngineError::Network("offline".into()));
        }
        if !self.session.is_authenticated() {
            return Err(SyncEngineError::Network("not signed in".into()));
        }
        Ok(())
    }

    async fn push<T: SyncEntity>(&self, entity: &T, method: SyncMethod) -> Result<T> {
        self.ensure_ready()?;
        let target = match method {
            SyncMethod::Update => Some(entity.ids().server_id().cloned().ok_or_else(|| {
                SyncEngineError::Network(format!("{} {} has no server id yet", T::KIND, entity.resolve()))
            })?),
            _ => None,
        };

        let data = serde_json::to_value(entity).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let blobs = self.blobify(self.compose_image_upload_requests(entity)).await?;
        let payload = if blobs.is_empty() {
            RequestPayload::Json(data)
        } else {
            RequestPayload::Multipart { data, images: blobs }
        };

        let response = self
            .remote
            .send(RemoteRequest {
                kind: T::KIND,
                method,
                target,
                payload,
                credential: self.session.credential(),
            })
            .await?;

        match decode::<T>(&response) {
            Ok(server) => Ok(merge_server_copy(entity, server)),
            Err(reason) => self.substitute_local(entity, method, &response, reason),
        }
    }

    /// The server answered with something that is not a `T`. Keep the local
    /// copy; a create still needs the server id or the flag would resend it.
    fn substitute_local<T: SyncEntity>(
        &self,
        entity: &T,
        method: SyncMethod,
        response: &Value,
        reason: String,
    ) -> Result<T> {
        let error = SyncEngineError::Decode { kind: T::KIND, reason };
        let salvaged = response
            .get("_id")
            .and_then(Value::as_str)
            .filter(|raw| !raw.is_empty())
            .map(ServerId::new);

        let mut local = entity.clone();
        match (method, salvaged) {
            (SyncMethod::Create, None) => Err(error),
            (SyncMethod::Create, Some(sid)) => {
                self.reporter.report(&error, error.severity());
                local.ids_mut().promote(sid);
                Ok(local)
            }
            _ => {
                self.reporter.report(&error, error.severity());
                Ok(local)
            }
        }
    }

    async fn delete_entity<T: SyncEntity>(&self, entity: &T) -> Result<()> {
        match entity.ids().server_id() {
            Some(sid) => self.delete_remote(T::KIND, sid).await,
            // Never reached the server; nothing to delete there.
            None => Ok(()),
        }
    }

    async fn delete_remote(&self, kind: EntityKind, target: &ServerId) -> Result<()> {
        self.ensure_ready()?;
        self.remote
            .send(RemoteRequest {
                kind,
                method: SyncMethod::Delete,
                target: Some(target.clone()),
                payload: RequestPayload::Empty,
                credential: self.session.credential(),
            })
            .await?;
        Ok(())
    }
}

/// Decode a server payload and apply the entity's structural guard.
fn decode<T: SyncEntity>(value: &Value) -> std::result::Result<T, String> {
    let entity: T = serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
    if entity.ids().server_id().is_none() {
        return Err("payload has no _id".into());
    }
    if !entity.is_well_formed() {
        return Err("payload failed the structural guard".into());
    }
    Ok(entity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::images::FsImageStore;
    use crate::remote::RemoteError;
    use crate::reporter::LogReporter;
    use async_trait::async_trait;
    use brewline_core::{InventoryItem, Recipe};
    use serde_json::json;
    use std::sync::Mutex;

    const SID: &str = "65a1f0c2e4b0a1b2c3d4e5f6";

    /// Answers every call with a fixed result and records requests.
    struct FixedRemote {
        answer: std::result::Result<Value, RemoteError>,
        seen: Mutex<Vec<RemoteRequest>>,
    }

    impl FixedRemote {
        fn new(answer: std::result::Result<Value, RemoteError>) -> Arc<Self> {
            Arc::new(Self {
                answer,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl RemoteApi for FixedRemote {
        async fn send(&self, request: RemoteRequest) -> std::result::Result<Value, RemoteError> {
            self.seen.lock().unwrap().push(request);
            self.answer.clone()
        }
    }

    fn composer(remote: Arc<FixedRemote>, online: bool) -> RequestComposer {
        let session = Session::new();
        session.sign_in("token");
        RequestComposer::new(
            remote,
            Arc::new(FsImageStore::new(std::env::temp_dir())),
            ConnectivityMonitor::new(online),
            session,
            Arc::new(LogReporter),
        )
    }

    fn server_copy(recipe: &Recipe) -> Value {
        let mut value = serde_json::to_value(recipe).unwrap();
        value["_id"] = json!(SID);
        value.as_object_mut().unwrap().remove("cid");
        value
    }

    #[test]
    fn test_can_send_rules() {
        let remote = FixedRemote::new(Ok(Value::Null));
        let mut recipe = Recipe::new("Kolsch", "Kolsch");

        let online = composer(remote.clone(), true);
        assert!(online.can_send(&recipe, SyncMethod::Create));
        assert!(!online.can_send(&recipe, SyncMethod::Update));

        recipe.ids_mut().promote(ServerId::new(SID));
        assert!(online.can_send(&recipe, SyncMethod::Update));

        let offline = composer(remote.clone(), false);
        assert!(!offline.can_send(&recipe, SyncMethod::Update));

        online.session().sign_out();
        assert!(!online.can_send(&recipe, SyncMethod::Update));
    }

    #[tokio::test]
    async fn test_create_merges_server_copy() {
        let recipe = Recipe::new("Helles", "Munich Helles");
        let mut answer = server_copy(&recipe);
        answer["ibu"] = json!(18.0);
        let remote = FixedRemote::new(Ok(answer));
        let composer = composer(remote.clone(), true);

        let merged = composer
            .send(&recipe, SyncMethod::Create, ErrorPolicy::Propagate)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(merged.ids().server_id(), Some(&ServerId::new(SID)));
        assert_eq!(merged.ids().client_id(), recipe.ids().client_id());
        assert_eq!(merged.ibu, 18.0);

        let seen = remote.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].target.is_none());
        assert!(!seen[0].payload.is_multipart());
        assert_eq!(seen[0].credential.as_deref(), Some("token"));
    }

    #[tokio::test]
    async fn test_error_policies() {
        let remote = FixedRemote::new(Err(RemoteError::Status {
            status: 422,
            body: "name required".into(),
        }));
        let composer = composer(remote, true);
        let recipe = Recipe::new("", "Bitter");

        let err = composer
            .send(&recipe, SyncMethod::Create, ErrorPolicy::Propagate)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncEngineError::Validation { status: 422, .. }));

        let resolved = composer
            .send(&recipe, SyncMethod::Create, ErrorPolicy::ResolveOnError)
            .await
            .unwrap();
        assert!(resolved.is_none());
    }

    #[tokio::test]
    async fn test_offline_is_transient_without_network_call() {
        let remote = FixedRemote::new(Ok(Value::Null));
        let composer = composer(remote.clone(), false);

        let err = composer
            .send(&Recipe::new("Dubbel", "Dubbel"), SyncMethod::Create, ErrorPolicy::Propagate)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(remote.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_update_keeps_local_copy() {
        let remote = FixedRemote::new(Ok(json!({ "unexpected": true })));
        let composer = composer(remote, true);
        let mut item = InventoryItem::new("Saison", "beer", 6.0);
        item.ids_mut().promote(ServerId::new(SID));

        let result = composer
            .send(&item, SyncMethod::Update, ErrorPolicy::Propagate)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, item);
    }

    #[tokio::test]
    async fn test_malformed_create() {
        let recipe = Recipe::new("Tripel", "Tripel");

        let composer_a = composer(FixedRemote::new(Ok(json!({ "nope": 1 }))), true);
        let err = composer_a
            .send(&recipe, SyncMethod::Create, ErrorPolicy::Propagate)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncEngineError::Decode { .. }));

        // The id alone is enough to stop the create being resent.
        let composer_b = composer(FixedRemote::new(Ok(json!({ "_id": SID, "name": 7 }))), true);
        let salvaged = composer_b
            .send(&recipe, SyncMethod::Create, ErrorPolicy::Propagate)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(salvaged.ids().server_id(), Some(&ServerId::new(SID)));
        assert_eq!(salvaged.name, "Tripel");

        // `_id` is a server id by position, whatever its shape.
        let composer_c = composer(FixedRemote::new(Ok(json!({ "_id": "s7", "name": 7 }))), true);
        let salvaged = composer_c
            .send(&recipe, SyncMethod::Create, ErrorPolicy::Propagate)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(salvaged.ids().server_id(), Some(&ServerId::new("s7")));
    }

    #[tokio::test]
    async fn test_delete_without_server_id_skips_network() {
        let remote = FixedRemote::new(Ok(Value::Null));
        let composer = composer(remote.clone(), true);
        let recipe = Recipe::new("Wit", "Witbier");

        let result = composer
            .send(&recipe, SyncMethod::Delete, ErrorPolicy::Propagate)
            .await
            .unwrap();
        assert_eq!(result, Some(recipe));
        assert!(remote.seen.lock().unwrap().is_empty());

        assert!(composer
            .send_delete(EntityKind::Recipe, &ServerId::new(SID), ErrorPolicy::Propagate)
            .await
            .unwrap());
        assert_eq!(remote.seen.lock().unwrap()[0].method, SyncMethod::Delete);
    }

    #[tokio::test]
    async fn test_images_stored_then_uploaded_as_multipart() {
        let dir = tempfile::tempdir().unwrap();
        let picked = dir.path().join("label.png");
        tokio::fs::write(&picked, b"png").await.unwrap();

        let mut item = InventoryItem::new("Cider", "cider", 4.0);
        item.item_label_image = Some(ImageAttachment::picked(picked.to_string_lossy()));

        let session = Session::new();
        session.sign_in("token");
        let remote = FixedRemote::new(Err(RemoteError::Transport("down".into())));
        let composer = RequestComposer::new(
            remote.clone(),
            Arc::new(FsImageStore::new(dir.path().join("durable"))),
            ConnectivityMonitor::new(true),
            session,
            Arc::new(LogReporter),
        );

        assert_eq!(composer.compose_image_store_requests(&item).len(), 1);
        let stored = composer.store_images(&item).await.unwrap();
        let image = stored.item_label_image.as_ref().unwrap();
        assert!(!image.has_pending_edit);
        assert!(composer.compose_image_store_requests(&stored).is_empty());

        let uploads = composer.compose_image_upload_requests(&stored);
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].field_name, "itemLabelImage");

        let _ = composer.send(&stored, SyncMethod::Create, ErrorPolicy::Propagate).await;
        let seen = remote.seen.lock().unwrap();
        match &seen[0].payload {
            RequestPayload::Multipart { images, .. } => {
                assert_eq!(images[0].field_name, "itemLabelImage");
                assert_eq!(images[0].bytes, b"png");
            }
            other => panic!("expected multipart, got {other:?}"),
        }
    }
}
