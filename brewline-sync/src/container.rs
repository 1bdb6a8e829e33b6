//! Entity state container: observable in-memory collection for one kind.
//!
//! ```text
//!  EntityContainer<T>
//!  ├── list stream ─── emits on add / remove / clear / load only
//!  └── cells
//!      ├── EntityCell ── value + subscribers (emits on field edits)
//!      ├── EntityCell
//!      └── …
//! ```
//!
//! A cell is found by either of its entity's ids and stays the same cell
//! when its `ClientId` is joined by a `ServerId`. Values are replaced first
//! and subscribers notified afterwards; nobody observes a half-applied edit.

use brewline_core::{apply_partial, Identifier, SyncEntity};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;

use crate::error::{Result, SyncEngineError};

/// One observable entity.
pub struct EntityCell<T> {
    tx: Mutex<Option<watch::Sender<T>>>,
    rx: watch::Receiver<T>,
}

impl<T: SyncEntity> EntityCell<T> {
    fn new(value: T) -> Self {
        let (tx, rx) = watch::channel(value);
        Self {
            tx: Mutex::new(Some(tx)),
            rx,
        }
    }

    /// Current value.
    pub fn get(&self) -> T {
        self.rx.borrow().clone()
    }

    /// Receiver that observes every later edit to this entity. Once the
    /// entity is removed, `changed()` returns an error.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.rx.clone()
    }

    pub fn matches(&self, id: &Identifier) -> bool {
        self.rx.borrow().same_entity(id)
    }

    pub fn is_completed(&self) -> bool {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }

    /// Replace the value. Subscribers are notified only if it changed.
    /// Returns false once the cell has been completed.
    fn set(&self, value: T) -> bool {
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tx) => {
                tx.send_if_modified(|current| {
                    if *current == value {
                        return false;
                    }
                    *current = value;
                    true
                });
                true
            }
            None => false,
        }
    }

    /// Read-modify-write under the writer lock, so concurrent edits never
    /// start from the same stale value. Returns the new value and whether it
    /// changed, or `None` once the cell has been completed.
    fn modify<E>(&self, f: impl FnOnce(&T) -> std::result::Result<T, E>) -> std::result::Result<Option<(T, bool)>, E> {
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = guard.as_ref() else {
            return Ok(None);
        };
        let mut outcome = Ok(None);
        tx.send_if_modified(|current| match f(current) {
            Ok(next) => {
                let changed = *current != next;
                if changed {
                    *current = next.clone();
                }
                outcome = Ok(Some((next, changed)));
                changed
            }
            Err(e) => {
                outcome = Err(e);
                false
            }
        });
        outcome
    }

    /// Close the stream. Dropping the sender wakes every subscriber.
    fn complete(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

pub type CellList<T> = Vec<Arc<EntityCell<T>>>;

/// In-memory observable collection backing one domain kind.
pub struct EntityContainer<T> {
    cells: RwLock<CellList<T>>,
    list_tx: watch::Sender<CellList<T>>,
}

impl<T: SyncEntity> EntityContainer<T> {
    pub fn new() -> Self {
        let (list_tx, _) = watch::channel(Vec::new());
        Self {
            cells: RwLock::new(Vec::new()),
            list_tx,
        }
    }

    /// Insert an entity and notify list subscribers once. Adding an entity
    /// already present replaces its value in the existing cell.
    pub fn add(&self, entity: T) -> Arc<EntityCell<T>> {
        let id = entity.resolve();
        if let Some(existing) = self.get_by_id(&id) {
            existing.set(entity);
            return existing;
        }

        let cell = Arc::new(EntityCell::new(entity));
        let snapshot = {
            let mut cells = self.cells.write().unwrap_or_else(|e| e.into_inner());
            cells.push(cell.clone());
            cells.clone()
        };
        self.list_tx.send_replace(snapshot);
        cell
    }

    pub fn get_by_id(&self, id: &Identifier) -> Option<Arc<EntityCell<T>>> {
        self.cells
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|cell| cell.matches(id))
            .cloned()
    }

    pub fn get(&self, id: &Identifier) -> Option<T> {
        self.get_by_id(id).map(|cell| cell.get())
    }

    /// Shallow-merge `partial` into the entity. Only that cell's
    /// subscribers are notified.
    pub fn update(&self, id: &Identifier, partial: &serde_json::Value) -> Result<T> {
        let cell = self.require(id)?;
        match cell.modify(|current| apply_partial(current, partial))? {
            Some((merged, _)) => Ok(merged),
            None => Err(self.not_found(id)),
        }
    }

    /// Derive a new value from the current one atomically. Returns the new
    /// value if it differs from the old one.
    pub fn modify(&self, id: &Identifier, f: impl FnOnce(&T) -> T) -> Result<Option<T>> {
        let cell = self.require(id)?;
        match cell.modify(|current| Ok::<T, std::convert::Infallible>(f(current))) {
            Ok(Some((value, true))) => Ok(Some(value)),
            Ok(Some((_, false))) => Ok(None),
            Ok(None) => Err(self.not_found(id)),
            Err(never) => match never {},
        }
    }

    /// Replace the entity's whole value in place.
    pub fn replace(&self, id: &Identifier, value: T) -> Result<T> {
        let cell = self.require(id)?;
        cell.set(value.clone());
        Ok(value)
    }

    /// Complete the cell's stream, then evict it.
    pub fn remove(&self, id: &Identifier) -> Option<T> {
        let (removed, snapshot) = {
            let mut cells = self.cells.write().unwrap_or_else(|e| e.into_inner());
            let index = cells.iter().position(|cell| cell.matches(id))?;
            let removed = cells.remove(index);
            (removed, cells.clone())
        };
        let value = removed.get();
        removed.complete();
        self.list_tx.send_replace(snapshot);
        Some(value)
    }

    /// Replace the whole membership (initial load from storage).
    pub fn load(&self, entities: Vec<T>) {
        let fresh: CellList<T> = entities
            .into_iter()
            .map(|entity| Arc::new(EntityCell::new(entity)))
            .collect();
        let old = {
            let mut cells = self.cells.write().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *cells, fresh.clone())
        };
        for cell in old {
            cell.complete();
        }
        self.list_tx.send_replace(fresh);
    }

    /// Complete and drop every cell.
    pub fn clear(&self) {
        self.load(Vec::new());
    }

    pub fn all(&self) -> Vec<T> {
        self.cells
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|cell| cell.get())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.cells.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Membership stream. Emits on add/remove/load, never on field edits.
    pub fn subscribe_list(&self) -> watch::Receiver<CellList<T>> {
        self.list_tx.subscribe()
    }

    fn require(&self, id: &Identifier) -> Result<Arc<EntityCell<T>>> {
        self.get_by_id(id).ok_or_else(|| self.not_found(id))
    }

    fn not_found(&self, id: &Identifier) -> SyncEngineError {
        SyncEngineError::NotFound {
            kind: T::KIND,
            id: id.clone(),
        }
    }
}

impl<T: SyncEntity> Default for EntityContainer<T> {
    fn default() -> Self {
        Self::new()
    }
}
