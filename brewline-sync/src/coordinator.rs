//! Reconciliation coordinator.
//!
//! Drives flushing on reconnect, login and signup, and merges results back
//! into the owning service's container. Per-flag state machine:
//!
//! ```text
//! Pending ──► InFlight ──┬──► Synced      (terminal)
//!    ▲                   ├──► Failed ───► Pending (next reconnect)
//!    │                   │      └──────► StuckFlag report after N failures
//!    └───────────────────┴──► Dismissed   (terminal, flag cleared)
//! ```

use async_trait::async_trait;
use brewline_core::{
    merge_server_copy, EntityKind, Identifier, ImageAttachment, SyncEntity, SyncFlag, SyncMethod,
    SyncResponse, SyncSuccess,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::composer::{ErrorPolicy, RequestComposer};
use crate::container::EntityContainer;
use crate::error::{Result, SyncEngineError};
use crate::queue::{Replayed, Settled, SyncQueue};

/// The only writer of one kind's durable state.
#[async_trait]
pub trait EntityOwner<T: SyncEntity>: Send + Sync {
    fn container(&self) -> &EntityContainer<T>;

    /// Write the container's current contents to durable storage.
    async fn persist(&self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlagStatus {
    Pending,
    InFlight,
    Synced,
    Failed { attempts: u32, message: String },
    Dismissed,
}

pub struct ReconciliationCoordinator {
    queue: Arc<SyncQueue>,
    composer: Arc<RequestComposer>,
    ledger: Mutex<HashMap<(EntityKind, Identifier), FlagStatus>>,
    stuck_after: u32,
    max_concurrent: usize,
}

impl ReconciliationCoordinator {
    pub fn new(
        queue: Arc<SyncQueue>,
        composer: Arc<RequestComposer>,
        stuck_after: u32,
        max_concurrent: usize,
    ) -> Self {
        Self {
            queue,
            composer,
            ledger: Mutex::new(HashMap::new()),
            stuck_after: stuck_after.max(1),
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    pub fn composer(&self) -> &RequestComposer {
        &self.composer
    }

    // ─── Reconnect path ──────────────────────────────────────

    /// Flush every pending flag of `T::KIND` and merge the results.
    ///
    /// Flags superseded by an edit made while their request was on the
    /// wire are flushed again in a further round.
    pub async fn sync_on_connection<T, S>(&self, owner: &S) -> Result<SyncResponse<T>>
    where
        T: SyncEntity,
        S: EntityOwner<T>,
    {
        let kind = T::KIND;
        let mut total = SyncResponse::empty();
        loop {
            let flags = self.queue.flags_for(kind).await;
            if flags.is_empty() {
                break;
            }
            if !self.composer.is_ready() {
                log::debug!("{kind}: {} flag(s) wait for connectivity and sign-in", flags.len());
                break;
            }
            if self.queue.is_flushing(kind) {
                return Err(SyncEngineError::FlushInProgress(kind));
            }

            let (round, resend) = self.flush_round(owner, &flags).await?;
            total.successes.extend(round.successes);
            total.failures.extend(round.failures);
            if resend == 0 {
                break;
            }
            log::debug!("{kind}: {resend} flag(s) edited while in flight, flushing again");
        }
        Ok(total)
    }

    /// One flush of `flags`. Returns the response and how many successes
    /// left a newer revision pending.
    async fn flush_round<T, S>(&self, owner: &S, flags: &[SyncFlag]) -> Result<(SyncResponse<T>, usize)>
    where
        T: SyncEntity,
        S: EntityOwner<T>,
    {
        let kind = T::KIND;
        for flag in flags {
            self.set_status(kind, &flag.doc_id, FlagStatus::InFlight);
        }
        let (response, sources) = match self
            .queue
            .flush_replayed(owner.container(), &self.composer, self.max_concurrent)
            .await
        {
            Ok(flushed) => flushed,
            Err(e) => {
                self.reset_in_flight(kind, flags);
                return Err(e);
            }
        };

        let mut resend = 0;
        for (success, source) in response.successes.iter().zip(&sources) {
            if let Some(server) = &success.entity {
                if let Err(e) = self.reconcile(owner, source.as_ref(), server.clone()).await {
                    self.composer.reporter().report(&e, e.severity());
                }
            }
            let status = if self.still_pending(kind, success).await {
                resend += 1;
                FlagStatus::Pending
            } else {
                FlagStatus::Synced
            };
            self.set_status(kind, &success.flag.doc_id, status);
        }
        for failure in &response.failures {
            let attempts = self.record_failure(&failure.flag, &failure.message);
            let error = if attempts >= self.stuck_after {
                SyncEngineError::StuckFlag {
                    flag: failure.flag.clone(),
                    attempts,
                }
            } else if failure.transient {
                SyncEngineError::Network(failure.message.clone())
            } else {
                SyncEngineError::Rejected {
                    flag: failure.flag.clone(),
                    message: failure.message.clone(),
                }
            };
            self.composer.reporter().report(&error, error.severity());
        }
        Ok((response, resend))
    }

    async fn still_pending<T: SyncEntity>(
        &self,
        kind: EntityKind,
        success: &SyncSuccess<T>,
    ) -> bool {
        match &success.entity {
            Some(entity) => self.queue.pending_for(kind, entity.ids()).await.is_some(),
            None => false,
        }
    }

    /// Merge a server copy into the owner's container and persist.
    ///
    /// If a newer local edit is still pending, only the server id and image
    /// remote paths are adopted. A second application of the same copy
    /// changes nothing.
    pub async fn apply_success<T, S>(&self, owner: &S, server: T) -> Result<()>
    where
        T: SyncEntity,
        S: EntityOwner<T>,
    {
        self.reconcile(owner, None, server).await
    }

    /// `apply_success` for a response to a request built from `source`.
    /// A local entity edited since `source` was read keeps its fields even
    /// when no flag records the edit yet.
    async fn reconcile<T, S>(&self, owner: &S, source: Option<&T>, server: T) -> Result<()>
    where
        T: SyncEntity,
        S: EntityOwner<T>,
    {
        let container = owner.container();
        let Some(id) = server
            .ids()
            .aliases()
            .into_iter()
            .find(|id| container.get_by_id(id).is_some())
        else {
            log::debug!("{} {}: removed locally, nothing to merge", T::KIND, server.resolve());
            return Ok(());
        };

        let superseded = self.queue.pending_for(T::KIND, server.ids()).await.is_some();
        let changed = container.modify(&id, |local| {
            if superseded || source.is_some_and(|source| edited_since(local, source)) {
                adopt_server_identity(local, &server)
            } else {
                merge_server_copy(local, server.clone())
            }
        });

        match changed {
            Ok(Some(_)) => owner.persist().await,
            Ok(None) => Ok(()),
            // Removed while the response was in flight.
            Err(SyncEngineError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // ─── Foreground path ─────────────────────────────────────

    /// Queue a local mutation and, when possible, send it right away.
    ///
    /// Offline or transient failures leave the flag queued and return
    /// `Ok`. Other failures follow `policy`.
    pub async fn submit<T, S>(&self, owner: &S, entity: &T, method: SyncMethod, policy: ErrorPolicy) -> Result<()>
    where
        T: SyncEntity,
        S: EntityOwner<T>,
    {
        let kind = T::KIND;
        // A response for an earlier request may have promoted the entity
        // since the caller read it.
        let current = match method {
            SyncMethod::Delete => entity.clone(),
            _ => owner
                .container()
                .get(&entity.resolve())
                .unwrap_or_else(|| entity.clone()),
        };
        let Some(flag) = self
            .queue
            .add_flag(SyncFlag::new(method, current.resolve(), kind))
            .await?
        else {
            return Ok(());
        };
        self.set_status(kind, &flag.doc_id, FlagStatus::Pending);

        if !self.composer.can_send(&current, flag.method) {
            log::debug!("queued {flag} for the next reconnect");
            return Ok(());
        }

        // `begin` yields nothing while another request for this doc is on
        // the wire; that request's settle sends the newer revision.
        let mut doc_id = flag.doc_id;
        while let Some(sent) = self.queue.begin(kind, &doc_id).await {
            self.set_status(kind, &sent.doc_id, FlagStatus::InFlight);
            let replayed = match self.queue.replay(&sent, owner.container(), &self.composer).await {
                Ok(replayed) => replayed,
                Err(e) => {
                    self.queue.release(&sent).await;
                    self.record_failure(&sent, &e.to_string());
                    if e.is_transient() {
                        log::debug!("{sent} deferred: {e}");
                        return Ok(());
                    }
                    return match policy {
                        ErrorPolicy::Propagate => Err(e),
                        ErrorPolicy::ResolveOnError => {
                            self.composer.reporter().report(&e, e.severity());
                            Ok(())
                        }
                    };
                }
            };

            let sid = replayed.as_ref().and_then(|r| r.merged.ids().server_id().cloned());
            let settled = self.queue.settle(&sent, sid.as_ref()).await?;
            if let Some(Replayed { source, merged }) = replayed {
                self.reconcile(owner, Some(&source), merged).await?;
            }
            match settled {
                Settled::Superseded(next) => {
                    self.set_status(kind, &sent.doc_id, FlagStatus::Pending);
                    if !self.composer.is_ready() {
                        break;
                    }
                    doc_id = next.doc_id;
                }
                Settled::Cleared | Settled::Gone => {
                    self.set_status(kind, &sent.doc_id, FlagStatus::Synced);
                    break;
                }
            }
        }
        Ok(())
    }

    // ─── Ledger ──────────────────────────────────────────────

    /// Accept local state as final: clear the flag without sending it.
    pub async fn dismiss(&self, kind: EntityKind, id: &Identifier) -> Result<bool> {
        let cleared = self.queue.clear(id, kind).await?;
        if cleared {
            log::info!("dismissed pending {kind} {id}");
            self.set_status(kind, id, FlagStatus::Dismissed);
        }
        Ok(cleared)
    }

    pub fn status_of(&self, kind: EntityKind, id: &Identifier) -> Option<FlagStatus> {
        self.ledger
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(kind, id.clone()))
            .cloned()
    }

    /// Every recorded status for one kind.
    pub fn ledger(&self, kind: EntityKind) -> Vec<(Identifier, FlagStatus)> {
        let mut entries: Vec<_> = self
            .ledger
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|((_, id), status)| (id.clone(), status.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
        entries
    }

    /// Forget every status of one kind (logout).
    pub fn forget(&self, kind: EntityKind) {
        self.ledger
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(k, _), _| *k != kind);
    }

    fn set_status(&self, kind: EntityKind, id: &Identifier, status: FlagStatus) {
        let mut ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
        let key = (kind, id.clone());
        // Failure counts survive a retry going back in flight.
        if let (FlagStatus::InFlight | FlagStatus::Pending, Some(FlagStatus::Failed { .. })) =
            (&status, ledger.get(&key))
        {
            return;
        }
        ledger.insert(key, status);
    }

    /// Undo `InFlight` marks for a round that never started.
    fn reset_in_flight(&self, kind: EntityKind, flags: &[SyncFlag]) {
        let mut ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
        for flag in flags {
            if let Some(status) = ledger.get_mut(&(kind, flag.doc_id.clone())) {
                if *status == FlagStatus::InFlight {
                    *status = FlagStatus::Pending;
                }
            }
        }
    }

    fn record_failure(&self, flag: &SyncFlag, message: &str) -> u32 {
        let mut ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
        let key = (flag.doc_type, flag.doc_id.clone());
        let attempts = match ledger.get(&key) {
            Some(FlagStatus::Failed { attempts, .. }) => attempts + 1,
            _ => 1,
        };
        ledger.insert(
            key,
            FlagStatus::Failed {
                attempts,
                message: message.to_string(),
            },
        );
        attempts
    }
}

/// True when `local` carries edits made after `source` was read.
fn edited_since<T: SyncEntity>(local: &T, source: &T) -> bool {
    let mut rebased = local.clone();
    *rebased.ids_mut() = source.ids().clone();
    rebased != *source
}

/// Keep every local field; take only the server id and the remote paths
/// of images that have not been replaced since the request was built.
fn adopt_server_identity<T: SyncEntity>(local: &T, server: &T) -> T {
    let mut out = local.clone();
    if out.ids().server_id().is_none() {
        if let Some(sid) = server.ids().server_id() {
            out.ids_mut().promote(sid.clone());
        }
    }

    let uploaded: Vec<(&'static str, ImageAttachment)> = server
        .images()
        .into_iter()
        .map(|(field, image)| (field, image.clone()))
        .collect();
    for (field, image) in out.images_mut() {
        let Some((_, remote)) = uploaded.iter().find(|(f, _)| *f == field) else {
            continue;
        };
        if image.remote_path.is_none() && image.local_path == remote.local_path {
            image.remote_path = remote.remote_path.clone();
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use brewline_core::{Recipe, ServerId};

    #[test]
    fn test_edited_since_ignores_promotion() {
        let source = Recipe::new("Amber", "American Amber");
        let mut local = source.clone();
        local.ids_mut().promote(ServerId::new("65a1f0c2e4b0a1b2c3d4e5f6"));
        assert!(!edited_since(&local, &source));

        local.ibu = 40.0;
        assert!(edited_since(&local, &source));
    }

    #[test]
    fn test_adopt_server_identity_keeps_local_fields() {
        let mut local = Recipe::new("Amber", "American Amber");
        local.ibu = 30.0;
        local.label_image = Some(ImageAttachment::picked("/img/a.png"));

        let mut server = local.clone();
        server.ibu = 25.0;
        server.ids_mut().promote(ServerId::new("65a1f0c2e4b0a1b2c3d4e5f6"));
        if let Some(img) = server.label_image.as_mut() {
            img.remote_path = Some("labels/a.png".into());
        }

        let adopted = adopt_server_identity(&local, &server);
        assert_eq!(adopted.ibu, 30.0);
        assert_eq!(adopted.ids().server_id(), server.ids().server_id());
        assert_eq!(adopted.ids().client_id(), local.ids().client_id());
        assert_eq!(
            adopted.label_image.as_ref().unwrap().remote_path.as_deref(),
            Some("labels/a.png")
        );

        // A label replaced after the request was built keeps waiting for upload.
        local.label_image.as_mut().unwrap().edit("/img/b.png");
        let adopted = adopt_server_identity(&local, &server);
        assert!(adopted.label_image.as_ref().unwrap().remote_path.is_none());
    }
}
