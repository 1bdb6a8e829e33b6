//! Domain services: the only writers of each kind's durable state.
//!
//! ```text
//!  mutation ──► container (optimistic) ──► persist ──► coordinator.submit
//!                                                         ├── online  → send now
//!                                                         └── offline → flag
//!  EventBus ──► run() loop ──► handle_event
//!                               ├── init-<kind>            → init
//!                               ├── clear-data             → clear_data
//!                               ├── sync-<kind>-on-signup  → queue_unsynced + sync
//!                               └── connected              → sync
//! ```

use async_trait::async_trait;
use brewline_core::{
    apply_partial, Batch, EntityKind, Identifier, InventoryItem, Recipe, SyncEntity, SyncFlag, SyncMethod, SyncResponse,
    UserProfile,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::composer::{ErrorPolicy, RequestComposer};
use crate::container::EntityContainer;
use crate::coordinator::{EntityOwner, ReconciliationCoordinator};
use crate::error::{Result, SyncEngineError};
use crate::events::{EventBus, LifecycleEvent};
use crate::storage::{read_record, write_record, LocalStore, StoreError, StoreKey};

pub type RecipeService = DomainService<Recipe>;
pub type InventoryService = DomainService<InventoryItem>;
pub type BatchService = DomainService<Batch>;

/// Owns one entity kind: its container and its durable collection key.
pub struct DomainService<T> {
    container: EntityContainer<T>,
    store: Arc<dyn LocalStore>,
    coordinator: Arc<ReconciliationCoordinator>,
    /// Serialises writes of the collection key.
    write_lock: tokio::sync::Mutex<()>,
}

impl<T: SyncEntity> DomainService<T> {
    pub fn new(store: Arc<dyn LocalStore>, coordinator: Arc<ReconciliationCoordinator>) -> Self {
        Self {
            container: EntityContainer::new(),
            store,
            coordinator,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn kind(&self) -> EntityKind {
        T::KIND
    }

    fn key(&self) -> StoreKey {
        StoreKey::Collection(T::KIND)
    }

    /// Load the collection from durable storage.
    pub async fn init(&self) -> Result<usize> {
        let entities: Vec<T> = read_record(self.store.as_ref(), &self.key())
            .await?
            .unwrap_or_default();
        let count = entities.len();
        self.container.load(entities);
        log::info!("{}: loaded {count} entities", T::KIND);
        Ok(count)
    }

    pub fn get(&self, id: &Identifier) -> Option<T> {
        self.container.get(id)
    }

    pub fn list(&self) -> Vec<T> {
        self.container.all()
    }

    /// Add a new entity. Succeeds locally even when offline.
    pub async fn create(&self, entity: T) -> Result<T> {
        let entity = self.coordinator.composer().store_images(&entity).await?;
        let id = entity.resolve();
        self.container.add(entity.clone());
        self.persist().await?;
        self.coordinator
            .submit(self, &entity, SyncMethod::Create, ErrorPolicy::Propagate)
            .await?;
        Ok(self.container.get(&id).unwrap_or(entity))
    }

    /// Foreground update: validation errors reach the caller.
    pub async fn update(&self, id: &Identifier, partial: &Value) -> Result<T> {
        self.update_with(id, partial, ErrorPolicy::Propagate).await
    }

    pub async fn update_with(
        &self,
        id: &Identifier,
        partial: &Value,
        policy: ErrorPolicy,
    ) -> Result<T> {
        let partial = self.with_stored_images(id, partial).await?;
        let updated = self.container.update(id, &partial)?;
        self.persist().await?;
        self.coordinator
            .submit(self, &updated, SyncMethod::Update, policy)
            .await?;
        Ok(self.container.get(id).unwrap_or(updated))
    }

    async fn with_stored_images(&self, id: &Identifier, partial: &Value) -> Result<Value> {
        let current = self.container.get(id).ok_or_else(|| SyncEngineError::NotFound {
            kind: T::KIND,
            id: id.clone(),
        })?;
        stored_image_partial(self.coordinator.composer(), &current, partial).await
    }

    /// Remove locally and delete remotely when the server knows the entity.
    pub async fn remove(&self, id: &Identifier) -> Result<T> {
        let removed = self.container.remove(id).ok_or_else(|| SyncEngineError::NotFound {
            kind: T::KIND,
            id: id.clone(),
        })?;
        self.persist().await?;
        self.coordinator
            .submit(self, &removed, SyncMethod::Delete, ErrorPolicy::Propagate)
            .await?;
        Ok(removed)
    }

    /// Drop all local state of this kind, including pending flags.
    pub async fn clear_data(&self) -> Result<()> {
        let _write = self.write_lock.lock().await;
        self.container.clear();
        self.store.remove(&self.key()).await?;
        self.coordinator.queue().clear_kind(T::KIND).await?;
        self.coordinator.forget(T::KIND);
        log::info!("{}: local data cleared", T::KIND);
        Ok(())
    }

    /// Queue a `Create` for every entity the server has never seen. Used
    /// after signup, when entities authored anonymously gain an owner.
    pub async fn queue_unsynced(&self) -> Result<usize> {
        let mut queued = 0;
        for entity in self.container.all() {
            if entity.ids().server_id().is_some() {
                continue;
            }
            let flag = SyncFlag::new(SyncMethod::Create, entity.resolve(), T::KIND);
            if self.coordinator.queue().add_flag(flag).await?.is_some() {
                queued += 1;
            }
        }
        Ok(queued)
    }

    pub async fn sync(&self) -> Result<SyncResponse<T>> {
        self.coordinator.sync_on_connection(self).await
    }

    /// React to one lifecycle event.
    pub async fn handle_event(&self, event: LifecycleEvent) -> Result<()> {
        if !event.concerns(T::KIND) {
            return Ok(());
        }
        match event {
            LifecycleEvent::Init(_) => {
                self.init().await?;
            }
            LifecycleEvent::ClearData => self.clear_data().await?,
            LifecycleEvent::SyncOnSignup(_) => {
                let queued = self.queue_unsynced().await?;
                log::info!("{}: queued {queued} entities created before signup", T::KIND);
                self.sync().await?;
            }
            LifecycleEvent::Connected => {
                self.sync().await?;
            }
        }
        Ok(())
    }

    /// Consume lifecycle events until `shutdown` flips. An event being
    /// handled when shutdown arrives runs to completion.
    pub fn run(
        self: Arc<Self>,
        events: broadcast::Receiver<LifecycleEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let coordinator = self.coordinator.clone();
        tokio::spawn(event_loop(T::KIND, events, shutdown, move |event| {
            let service = self.clone();
            let coordinator = coordinator.clone();
            async move {
                if let Err(e) = service.handle_event(event).await {
                    report_event_error(&coordinator, event, e);
                }
            }
        }))
    }
}

#[async_trait]
impl<T: SyncEntity> EntityOwner<T> for DomainService<T> {
    fn container(&self) -> &EntityContainer<T> {
        &self.container
    }

    async fn persist(&self) -> Result<()> {
        let _write = self.write_lock.lock().await;
        write_record(self.store.as_ref(), &self.key(), &self.container.all()).await?;
        Ok(())
    }
}

// ─── User ───────────────────────────────────────────────────

/// Owns the single signed-in user record and the session credential.
pub struct UserService {
    container: EntityContainer<UserProfile>,
    store: Arc<dyn LocalStore>,
    coordinator: Arc<ReconciliationCoordinator>,
    bus: EventBus,
    write_lock: tokio::sync::Mutex<()>,
}

impl UserService {
    pub fn new(store: Arc<dyn LocalStore>, coordinator: Arc<ReconciliationCoordinator>, bus: EventBus) -> Self {
        Self {
            container: EntityContainer::new(),
            store,
            coordinator,
            bus,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Restore the stored user and its credential, if any.
    pub async fn init(&self) -> Result<Option<UserProfile>> {
        let user: Option<UserProfile> = read_record(self.store.as_ref(), &StoreKey::User).await?;
        match &user {
            Some(profile) => {
                if let Some(token) = profile.token.as_deref() {
                    self.coordinator.composer().session().sign_in(token);
                }
                self.container.load(vec![profile.clone()]);
            }
            None => self.container.clear(),
        }
        Ok(user)
    }

    pub fn current(&self) -> Option<UserProfile> {
        self.container.all().into_iter().next()
    }

    /// Adopt a profile whose credential was issued by the server, then
    /// tell every service to load its data and, if online, to sync.
    pub async fn login(&self, profile: UserProfile) -> Result<UserProfile> {
        self.adopt(profile.clone()).await?;
        for kind in EntityKind::COLLECTIONS {
            self.bus.emit(LifecycleEvent::Init(kind));
        }
        if self.coordinator.composer().connectivity().is_online() {
            self.bus.emit(LifecycleEvent::Connected);
        }
        log::info!("signed in as {}", profile.username);
        Ok(profile)
    }

    /// Like `login`, but pushes everything authored before the account
    /// existed.
    pub async fn signup(&self, profile: UserProfile) -> Result<UserProfile> {
        self.adopt(profile.clone()).await?;
        for kind in EntityKind::COLLECTIONS {
            self.bus.emit(LifecycleEvent::SyncOnSignup(kind));
        }
        log::info!("signed up as {}", profile.username);
        Ok(profile)
    }

    async fn adopt(&self, profile: UserProfile) -> Result<()> {
        let token = profile
            .token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| SyncEngineError::Validation {
                status: 401,
                message: format!("no credential for {}", profile.username),
            })?;
        self.container.load(vec![profile]);
        self.persist().await?;
        self.coordinator.composer().session().sign_in(token);
        Ok(())
    }

    /// Forget the user and broadcast `clear-data`.
    pub async fn logout(&self) -> Result<()> {
        self.coordinator.composer().session().sign_out();
        self.container.clear();
        {
            let _write = self.write_lock.lock().await;
            self.store.remove(&StoreKey::User).await?;
        }
        self.coordinator.queue().clear_kind(EntityKind::User).await?;
        self.coordinator.forget(EntityKind::User);
        self.bus.emit(LifecycleEvent::ClearData);
        log::info!("signed out");
        Ok(())
    }

    pub async fn update_profile(&self, partial: &Value) -> Result<UserProfile> {
        let current = self.current().ok_or_else(|| SyncEngineError::Validation {
            status: 401,
            message: "no user signed in".into(),
        })?;
        let id = current.resolve();
        let partial = stored_image_partial(self.coordinator.composer(), &current, partial).await?;
        let updated = self.container.update(&id, &partial)?;
        self.persist().await?;
        self.coordinator
            .submit(self, &updated, SyncMethod::Update, ErrorPolicy::Propagate)
            .await?;
        Ok(self.current().unwrap_or(updated))
    }

    pub async fn handle_event(&self, event: LifecycleEvent) -> Result<()> {
        match event {
            LifecycleEvent::Init(EntityKind::User) => {
                self.init().await?;
            }
            LifecycleEvent::Connected => {
                self.coordinator
                    .sync_on_connection::<UserProfile, _>(self)
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }

    pub fn run(
        self: Arc<Self>,
        events: broadcast::Receiver<LifecycleEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let coordinator = self.coordinator.clone();
        tokio::spawn(event_loop(EntityKind::User, events, shutdown, move |event| {
            let service = self.clone();
            let coordinator = coordinator.clone();
            async move {
                if let Err(e) = service.handle_event(event).await {
                    report_event_error(&coordinator, event, e);
                }
            }
        }))
    }
}

#[async_trait]
impl EntityOwner<UserProfile> for UserService {
    fn container(&self) -> &EntityContainer<UserProfile> {
        &self.container
    }

    async fn persist(&self) -> Result<()> {
        let _write = self.write_lock.lock().await;
        match self.current() {
            Some(profile) => write_record(self.store.as_ref(), &StoreKey::User, &profile).await?,
            None => self.store.remove(&StoreKey::User).await?,
        }
        Ok(())
    }
}

// ─── Partial updates ────────────────────────────────────────

/// Persist the images `partial` would set on `current` and point the
/// partial at the durable copies. The container is written once, from the
/// returned partial, so no await separates reading and writing it.
async fn stored_image_partial<T: SyncEntity>(
    composer: &RequestComposer,
    current: &T,
    partial: &Value,
) -> Result<Value> {
    let candidate = apply_partial(current, partial)?;
    let stored = composer.store_images(&candidate).await?;
    let mut partial = partial.clone();
    if let Some(fields) = partial.as_object_mut() {
        for (field, image) in stored.images() {
            if fields.contains_key(field) {
                let value =
                    serde_json::to_value(image).map_err(|e| StoreError::Serialization(e.to_string()))?;
                fields.insert(field.to_string(), value);
            }
        }
    }
    Ok(partial)
}

// ─── Event loop ─────────────────────────────────────────────

async fn event_loop<F, Fut>(
    kind: EntityKind,
    mut events: broadcast::Receiver<LifecycleEvent>,
    mut shutdown: watch::Receiver<bool>,
    mut handle: F,
) where
    F: FnMut(LifecycleEvent) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            received = events.recv() => match received {
                Ok(event) => handle(event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("{kind} service missed {skipped} lifecycle event(s)");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    log::debug!("{kind} service stopped reacting to events");
}

fn report_event_error(coordinator: &ReconciliationCoordinator, event: LifecycleEvent, error: SyncEngineError) {
    match error {
        // Another trigger is already flushing this kind.
        SyncEngineError::FlushInProgress(kind) => log::debug!("{event}: {kind} flush already running"),
        e => {
            log::warn!("{event} handling failed: {e}");
            coordinator.composer().reporter().report(&e, e.severity());
        }
    }
}
