//! Durable sync queue: pending flags partitioned by entity kind.
//!
//! ```text
//!            add_flag ──► collapse ──► persist (Flags(kind))
//!                            │
//!   flush(kind) ── begin ──► InFlight ──► composer ──┬─► settle ──► cleared
//!        ▲                                           │       └────► superseded (re-keyed)
//!        └─ one flush per kind at a time             └─► release (flag stays)
//! ```
//!
//! Each flag carries a revision. A flag is cleared only when the request
//! that succeeded was built from its current revision, so a slow response
//! for edit A can never clear the flag that now stands for edit B.

use brewline_core::{
    collapse, ClientId, Collapse, EntityIds, EntityKind, Identifier, ServerId, SyncEntity, SyncError,
    SyncFlag, SyncMethod, SyncResponse, SyncSuccess,
};
use futures_util::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::composer::{ErrorPolicy, RequestComposer};
use crate::container::EntityContainer;
use crate::error::{Result, SyncEngineError};
use crate::storage::{read_record, write_record, LocalStore, StoreKey};

/// What `settle` did with a flag after its request succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settled {
    Cleared,
    /// A newer mutation arrived while the request was in flight. The flag
    /// stays, now addressed by the server id.
    Superseded(SyncFlag),
    /// The flag was cleared or dismissed meanwhile.
    Gone,
}

/// A create or update that reached the server.
#[derive(Debug, Clone, PartialEq)]
pub struct Replayed<T> {
    /// Local copy the request was built from.
    pub source: T,
    /// `source` with the server's copy merged in.
    pub merged: T,
}

#[derive(Debug, Default)]
struct Partition {
    flags: Vec<SyncFlag>,
    in_flight: HashSet<Identifier>,
    /// Client ids whose create has settled, so late edits still find them.
    promoted: HashMap<ClientId, ServerId>,
}

impl Partition {
    fn canonical(&self, id: &Identifier) -> Identifier {
        match id {
            Identifier::Client(cid) => match self.promoted.get(cid) {
                Some(sid) => Identifier::Server(sid.clone()),
                None => id.clone(),
            },
            Identifier::Server(_) => id.clone(),
        }
    }

    fn position(&self, id: &Identifier) -> Option<usize> {
        let id = self.canonical(id);
        self.flags.iter().position(|f| f.doc_id == id)
    }
}

/// Releases the per-kind flush slot when dropped.
struct FlushGuard<'a> {
    flushing: &'a std::sync::Mutex<HashSet<EntityKind>>,
    kind: EntityKind,
}

impl<'a> FlushGuard<'a> {
    fn acquire(flushing: &'a std::sync::Mutex<HashSet<EntityKind>>, kind: EntityKind) -> Result<Self> {
        let mut active = flushing.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(kind) {
            return Err(SyncEngineError::FlushInProgress(kind));
        }
        Ok(Self { flushing, kind })
    }
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.flushing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.kind);
    }
}

pub struct SyncQueue {
    store: Arc<dyn LocalStore>,
    partitions: Mutex<HashMap<EntityKind, Partition>>,
    flushing: std::sync::Mutex<HashSet<EntityKind>>,
    next_revision: AtomicU64,
}

impl SyncQueue {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self {
            store,
            partitions: Mutex::new(HashMap::new()),
            flushing: std::sync::Mutex::new(HashSet::new()),
            next_revision: AtomicU64::new(1),
        }
    }

    /// Load every partition from durable storage. Returns the number of
    /// pending flags.
    pub async fn load(&self) -> Result<usize> {
        let mut partitions = self.partitions.lock().await;
        let mut total = 0;
        let mut max_revision = 0;
        for kind in EntityKind::ALL {
            let flags: Vec<SyncFlag> = read_record(self.store.as_ref(), &StoreKey::Flags(kind))
                .await?
                .unwrap_or_default();
            total += flags.len();
            max_revision = flags.iter().map(|f| f.revision).fold(max_revision, u64::max);
            partitions.entry(kind).or_default().flags = flags;
        }
        self.next_revision.fetch_max(max_revision + 1, Ordering::SeqCst);
        log::debug!("loaded {total} pending flag(s)");
        Ok(total)
    }

    async fn persist(&self, kind: EntityKind, partition: &Partition) -> Result<()> {
        write_record(self.store.as_ref(), &StoreKey::Flags(kind), &partition.flags).await?;
        Ok(())
    }

    /// Enqueue a mutation, collapsing it into any pending flag for the
    /// same document. Returns the flag now pending, or `None` when the
    /// mutation needs no network call at all.
    pub async fn add_flag(&self, flag: SyncFlag) -> Result<Option<SyncFlag>> {
        let kind = flag.doc_type;
        let revision = self.next_revision.fetch_add(1, Ordering::SeqCst);
        let mut partitions = self.partitions.lock().await;
        let part = partitions.entry(kind).or_default();
        let doc_id = part.canonical(&flag.doc_id);

        let pending = match part.position(&doc_id) {
            None => {
                let method = match (flag.method, &doc_id) {
                    (SyncMethod::Update, Identifier::Client(_)) => SyncMethod::Create,
                    (SyncMethod::Delete, Identifier::Client(_)) => {
                        log::debug!("{kind} {doc_id} never reached the server; delete is local only");
                        return Ok(None);
                    }
                    (method, _) => method,
                };
                let pending = SyncFlag {
                    method,
                    doc_id,
                    doc_type: kind,
                    revision,
                };
                part.flags.push(pending.clone());
                pending
            }
            Some(index) => {
                let in_flight = part.in_flight.contains(&doc_id);
                let existing = &mut part.flags[index];
                match collapse(existing.method, flag.method) {
                    Collapse::Cancel if !in_flight => {
                        part.flags.remove(index);
                        self.persist(kind, part).await?;
                        log::debug!("{kind} {doc_id}: create and delete cancelled");
                        return Ok(None);
                    }
                    // The create is on the wire; delete whatever it produces.
                    Collapse::Cancel => existing.method = SyncMethod::Delete,
                    Collapse::Keep(method) => existing.method = method,
                }
                existing.revision = revision;
                existing.clone()
            }
        };

        self.persist(kind, part).await?;
        log::debug!("queued {pending}");
        Ok(Some(pending))
    }

    /// Snapshot of the pending flags for one kind.
    pub async fn flags_for(&self, kind: EntityKind) -> Vec<SyncFlag> {
        self.partitions
            .lock()
            .await
            .get(&kind)
            .map(|p| p.flags.clone())
            .unwrap_or_default()
    }

    /// The pending flag for an entity, looked up by either id.
    pub async fn pending_for(&self, kind: EntityKind, ids: &EntityIds) -> Option<SyncFlag> {
        let partitions = self.partitions.lock().await;
        let part = partitions.get(&kind)?;
        ids.aliases()
            .iter()
            .find_map(|id| part.position(id))
            .map(|index| part.flags[index].clone())
    }

    pub async fn len(&self) -> usize {
        self.partitions.lock().await.values().map(|p| p.flags.len()).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remove a flag regardless of revision. Returns false if none was pending.
    pub async fn clear(&self, doc_id: &Identifier, kind: EntityKind) -> Result<bool> {
        let mut partitions = self.partitions.lock().await;
        let Some(part) = partitions.get_mut(&kind) else {
            return Ok(false);
        };
        let Some(index) = part.position(doc_id) else {
            return Ok(false);
        };
        let removed = part.flags.remove(index);
        self.persist(kind, part).await?;
        log::debug!("cleared {removed}");
        Ok(true)
    }

    /// Drop every flag of one kind (logout).
    pub async fn clear_kind(&self, kind: EntityKind) -> Result<()> {
        let mut partitions = self.partitions.lock().await;
        let part = partitions.entry(kind).or_default();
        *part = Partition::default();
        self.persist(kind, part).await
    }

    /// Re-address a pending flag after its document got a server id.
    pub async fn rekey(&self, kind: EntityKind, from: &Identifier, to: ServerId) -> Result<bool> {
        let mut partitions = self.partitions.lock().await;
        let part = partitions.entry(kind).or_default();
        if let Identifier::Client(cid) = from {
            part.promoted.insert(cid.clone(), to.clone());
        }
        let Some(index) = part.flags.iter().position(|f| &f.doc_id == from) else {
            return Ok(false);
        };
        let flag = &mut part.flags[index];
        flag.doc_id = Identifier::Server(to);
        if flag.method == SyncMethod::Create {
            flag.method = SyncMethod::Update;
        }
        self.persist(kind, part).await?;
        Ok(true)
    }

    /// Mark the pending flag for `doc_id` as in flight and return the
    /// revision being sent. `None` if nothing is pending or it is already
    /// on the wire.
    pub async fn begin(&self, kind: EntityKind, doc_id: &Identifier) -> Option<SyncFlag> {
        let mut partitions = self.partitions.lock().await;
        let part = partitions.get_mut(&kind)?;
        let index = part.position(doc_id)?;
        let flag = part.flags[index].clone();
        if !part.in_flight.insert(flag.doc_id.clone()) {
            return None;
        }
        Some(flag)
    }

    /// Record the success of the request built from `sent`.
    pub async fn settle(&self, sent: &SyncFlag, server_id: Option<&ServerId>) -> Result<Settled> {
        let kind = sent.doc_type;
        let mut partitions = self.partitions.lock().await;
        let part = partitions.entry(kind).or_default();
        part.in_flight.remove(&sent.doc_id);
        if let (Identifier::Client(cid), Some(sid)) = (&sent.doc_id, server_id) {
            part.promoted.insert(cid.clone(), sid.clone());
        }

        let Some(index) = part.flags.iter().position(|f| f.doc_id == sent.doc_id) else {
            return Ok(Settled::Gone);
        };
        if part.flags[index].revision == sent.revision {
            part.flags.remove(index);
            self.persist(kind, part).await?;
            return Ok(Settled::Cleared);
        }

        let flag = &mut part.flags[index];
        if let (Identifier::Client(_), Some(sid)) = (&flag.doc_id, server_id) {
            flag.doc_id = Identifier::Server(sid.clone());
            if flag.method == SyncMethod::Create {
                flag.method = SyncMethod::Update;
            }
        }
        let flag = flag.clone();
        self.persist(kind, part).await?;
        log::debug!("{sent} superseded by {flag}");
        Ok(Settled::Superseded(flag))
    }

    /// The request built from `sent` failed; the flag stays pending.
    pub async fn release(&self, sent: &SyncFlag) {
        if let Some(part) = self.partitions.lock().await.get_mut(&sent.doc_type) {
            part.in_flight.remove(&sent.doc_id);
        }
    }

    pub fn is_flushing(&self, kind: EntityKind) -> bool {
        self.flushing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&kind)
    }

    // ─── Flush ───────────────────────────────────────────────

    /// Replay every pending flag of `T::KIND` through the composer, at most
    /// `max_concurrent` requests at a time, and settle each outcome.
    ///
    /// Fails with `FlushInProgress` if a flush of the same kind is running.
    pub async fn flush<T: SyncEntity>(
        &self,
        container: &EntityContainer<T>,
        composer: &RequestComposer,
        max_concurrent: usize,
    ) -> Result<SyncResponse<T>> {
        let (response, _) = self.flush_replayed(container, composer, max_concurrent).await?;
        Ok(response)
    }

    /// Like [`flush`](Self::flush), also returning the local copy each
    /// success was built from, index-aligned with `successes`.
    pub(crate) async fn flush_replayed<T: SyncEntity>(
        &self,
        container: &EntityContainer<T>,
        composer: &RequestComposer,
        max_concurrent: usize,
    ) -> Result<(SyncResponse<T>, Vec<Option<T>>)> {
        let kind = T::KIND;
        let _guard = FlushGuard::acquire(&self.flushing, kind)?;

        let mut batch = Vec::new();
        for flag in self.flags_for(kind).await {
            if let Some(sent) = self.begin(kind, &flag.doc_id).await {
                batch.push(sent);
            }
        }
        if batch.is_empty() {
            return Ok((SyncResponse::empty(), Vec::new()));
        }
        log::info!("flushing {} {kind} flag(s)", batch.len());

        let outcomes: Vec<(SyncFlag, Result<Option<Replayed<T>>>)> = stream::iter(batch)
            .map(|flag| async move {
                let outcome = self.replay(&flag, container, composer).await;
                (flag, outcome)
            })
            .buffer_unordered(max_concurrent.max(1))
            .collect()
            .await;

        let mut response = SyncResponse::empty();
        let mut sources = Vec::new();
        for (flag, outcome) in outcomes {
            match outcome {
                Ok(replayed) => {
                    let sid = replayed.as_ref().and_then(|r| r.merged.ids().server_id().cloned());
                    if let Err(e) = self.settle(&flag, sid.as_ref()).await {
                        log::error!("failed to persist settled {flag}: {e}");
                    }
                    let (source, entity) = match replayed {
                        Some(Replayed { source, merged }) => (Some(source), Some(merged)),
                        None => (None, None),
                    };
                    sources.push(source);
                    response.successes.push(SyncSuccess { flag, entity });
                }
                Err(e) => {
                    self.release(&flag).await;
                    log::warn!("{flag} failed: {e}");
                    response.failures.push(SyncError {
                        flag,
                        message: e.to_string(),
                        transient: e.is_transient(),
                    });
                }
            }
        }
        log::info!(
            "{kind} flush: {} synced, {} failed",
            response.successes.len(),
            response.failures.len()
        );
        Ok((response, sources))
    }

    pub(crate) async fn replay<T: SyncEntity>(
        &self,
        flag: &SyncFlag,
        container: &EntityContainer<T>,
        composer: &RequestComposer,
    ) -> Result<Option<Replayed<T>>> {
        match flag.method {
            SyncMethod::Delete => {
                if let Identifier::Server(sid) = &flag.doc_id {
                    composer.send_delete(flag.doc_type, sid, ErrorPolicy::Propagate).await?;
                }
                Ok(None)
            }
            SyncMethod::Create | SyncMethod::Update => {
                let Some(entity) = container.get(&flag.doc_id) else {
                    log::warn!("{flag}: entity no longer exists locally");
                    return Ok(None);
                };
                // The entity's ids decide: a known server id must never be created twice.
                let method = match entity.ids().server_id() {
                    Some(_) => SyncMethod::Update,
                    None => SyncMethod::Create,
                };
                let merged = composer.send(&entity, method, ErrorPolicy::Propagate).await?;
                Ok(merged.map(|merged| Replayed { source: entity, merged }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::ConnectivityMonitor;
    use crate::images::FsImageStore;
    use crate::remote::HttpRemote;
    use crate::reporter::LogReporter;
    use crate::session::Session;
    use crate::storage::MemoryStore;
    use brewline_core::Recipe;
    use std::time::Duration;

    const SID: &str = "65a1f0c2e4b0a1b2c3d4e5f6";

    fn queue() -> SyncQueue {
        SyncQueue::new(Arc::new(MemoryStore::new()))
    }

    fn flag(method: SyncMethod, id: &Identifier) -> SyncFlag {
        SyncFlag::new(method, id.clone(), EntityKind::Recipe)
    }

    fn client(raw: &str) -> Identifier {
        Identifier::Client(ClientId::new(raw))
    }

    fn server() -> Identifier {
        Identifier::Server(ServerId::new(SID))
    }

    #[tokio::test]
    async fn test_update_then_delete_yields_single_delete() {
        let q = queue();
        q.add_flag(flag(SyncMethod::Update, &server())).await.unwrap();
        q.add_flag(flag(SyncMethod::Delete, &server())).await.unwrap();

        let flags = q.flags_for(EntityKind::Recipe).await;
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].method, SyncMethod::Delete);
    }

    #[tokio::test]
    async fn test_create_then_updates_stay_create() {
        let q = queue();
        let id = client("c1");
        q.add_flag(flag(SyncMethod::Create, &id)).await.unwrap();
        q.add_flag(flag(SyncMethod::Update, &id)).await.unwrap();
        q.add_flag(flag(SyncMethod::Update, &id)).await.unwrap();

        let flags = q.flags_for(EntityKind::Recipe).await;
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].method, SyncMethod::Create);
    }

    #[tokio::test]
    async fn test_create_then_delete_cancels() {
        let q = queue();
        let id = client("c1");
        q.add_flag(flag(SyncMethod::Create, &id)).await.unwrap();
        assert!(q.add_flag(flag(SyncMethod::Delete, &id)).await.unwrap().is_none());
        assert!(q.is_empty().await);
    }

    #[tokio::test]
    async fn test_update_on_unsynced_doc_becomes_create() {
        let q = queue();
        let pending = q.add_flag(flag(SyncMethod::Update, &client("c9"))).await.unwrap().unwrap();
        assert_eq!(pending.method, SyncMethod::Create);

        assert!(q.add_flag(flag(SyncMethod::Delete, &client("c10"))).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_in_flight_create_then_delete_becomes_delete_of_server_doc() {
        let q = queue();
        let id = client("c1");
        q.add_flag(flag(SyncMethod::Create, &id)).await.unwrap();
        let sent = q.begin(EntityKind::Recipe, &id).await.unwrap();

        let pending = q.add_flag(flag(SyncMethod::Delete, &id)).await.unwrap().unwrap();
        assert_eq!(pending.method, SyncMethod::Delete);

        let settled = q.settle(&sent, Some(&ServerId::new(SID))).await.unwrap();
        let Settled::Superseded(flag) = settled else {
            panic!("expected superseded, got {settled:?}");
        };
        assert_eq!(flag.method, SyncMethod::Delete);
        assert_eq!(flag.doc_id, server());
    }

    #[tokio::test]
    async fn test_newer_edit_survives_slow_response() {
        let q = queue();
        q.add_flag(flag(SyncMethod::Update, &server())).await.unwrap();
        let sent_a = q.begin(EntityKind::Recipe, &server()).await.unwrap();
        assert!(q.begin(EntityKind::Recipe, &server()).await.is_none());

        // Edit B lands while A is on the wire.
        let pending_b = q.add_flag(flag(SyncMethod::Update, &server())).await.unwrap().unwrap();
        assert!(pending_b.revision > sent_a.revision);

        assert!(matches!(q.settle(&sent_a, None).await.unwrap(), Settled::Superseded(_)));
        assert_eq!(q.flags_for(EntityKind::Recipe).await, vec![pending_b.clone()]);

        let sent_b = q.begin(EntityKind::Recipe, &server()).await.unwrap();
        assert_eq!(q.settle(&sent_b, None).await.unwrap(), Settled::Cleared);
        assert!(q.is_empty().await);
    }

    #[tokio::test]
    async fn test_late_edit_by_client_id_finds_promoted_doc() {
        let q = queue();
        let id = client("c1");
        q.add_flag(flag(SyncMethod::Create, &id)).await.unwrap();
        let sent = q.begin(EntityKind::Recipe, &id).await.unwrap();
        q.settle(&sent, Some(&ServerId::new(SID))).await.unwrap();

        let pending = q.add_flag(flag(SyncMethod::Update, &id)).await.unwrap().unwrap();
        assert_eq!(pending.method, SyncMethod::Update);
        assert_eq!(pending.doc_id, server());
    }

    #[tokio::test]
    async fn test_flags_survive_reload() {
        let store: Arc<dyn LocalStore> = Arc::new(MemoryStore::new());
        let q = SyncQueue::new(store.clone());
        q.add_flag(flag(SyncMethod::Update, &server())).await.unwrap();
        q.add_flag(SyncFlag::new(SyncMethod::Create, ClientId::new("b1"), EntityKind::Batch))
            .await
            .unwrap();

        let reloaded = SyncQueue::new(store);
        assert_eq!(reloaded.load().await.unwrap(), 2);
        assert_eq!(reloaded.flags_for(EntityKind::Batch).await.len(), 1);

        let next = reloaded.add_flag(flag(SyncMethod::Update, &client("c2"))).await.unwrap().unwrap();
        assert!(next.revision > 2);
    }

    #[tokio::test]
    async fn test_clear_and_pending_lookup_by_either_id() {
        let q = queue();
        let mut ids = EntityIds::with_client_id(ClientId::new("c1"));
        q.add_flag(flag(SyncMethod::Create, &ids.resolve())).await.unwrap();
        let sent = q.begin(EntityKind::Recipe, &ids.resolve()).await.unwrap();
        q.add_flag(flag(SyncMethod::Update, &ids.resolve())).await.unwrap();
        q.settle(&sent, Some(&ServerId::new(SID))).await.unwrap();

        ids.promote(ServerId::new(SID));
        assert!(q.pending_for(EntityKind::Recipe, &ids).await.is_some());
        assert!(q.clear(&client("c1"), EntityKind::Recipe).await.unwrap());
        assert!(q.pending_for(EntityKind::Recipe, &ids).await.is_none());
    }

    #[test]
    fn test_flush_guard_is_per_kind() {
        let flushing = std::sync::Mutex::new(HashSet::new());
        let guard = FlushGuard::acquire(&flushing, EntityKind::Recipe).unwrap();
        assert!(matches!(
            FlushGuard::acquire(&flushing, EntityKind::Recipe),
            Err(SyncEngineError::FlushInProgress(EntityKind::Recipe))
        ));
        let other = FlushGuard::acquire(&flushing, EntityKind::Batch).unwrap();
        drop(guard);
        assert!(FlushGuard::acquire(&flushing, EntityKind::Recipe).is_ok());
        drop(other);
    }

    #[tokio::test]
    async fn test_offline_flush_keeps_flags_as_transient_failures() {
        let q = queue();
        let container = EntityContainer::new();
        let recipe = Recipe::new("Marzen", "Marzen");
        q.add_flag(flag(SyncMethod::Create, &recipe.resolve())).await.unwrap();
        q.add_flag(flag(SyncMethod::Update, &client("gone"))).await.unwrap();
        container.add(recipe);

        let session = Session::new();
        session.sign_in("token");
        let composer = RequestComposer::new(
            Arc::new(HttpRemote::new("http://127.0.0.1:9", Duration::from_millis(200)).unwrap()),
            Arc::new(FsImageStore::new(std::env::temp_dir())),
            ConnectivityMonitor::new(false),
            session,
            Arc::new(LogReporter),
        );

        let response = q.flush(&container, &composer, 4).await.unwrap();
        assert_eq!(response.failures.len(), 1);
        assert!(response.failures[0].transient);
        // The orphaned flag has nothing left to send and settles.
        assert_eq!(response.successes.len(), 1);
        assert_eq!(q.flags_for(EntityKind::Recipe).await.len(), 1);
        assert!(!q.is_flushing(EntityKind::Recipe));
    }
}
