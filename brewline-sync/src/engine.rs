//! Composition root.
//!
//! Builds every collaborator once. Fresh engines share no state, so tests
//! can run many side by side.

use brewline_core::{EntityKind, Identifier, SyncFlag, SyncResponse, UserProfile};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::composer::RequestComposer;
use crate::config::EngineConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::coordinator::ReconciliationCoordinator;
use crate::error::{Result, SyncEngineError};
use crate::events::{EventBus, LifecycleEvent};
use crate::images::{FsImageStore, ImageStore};
use crate::queue::SyncQueue;
use crate::remote::{HttpRemote, RemoteApi};
use crate::reporter::ErrorReporter;
use crate::service::{BatchService, InventoryService, RecipeService, UserService};
use crate::session::Session;
use crate::storage::{LocalStore, RocksStore};

/// Outcome counts of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub synced: usize,
    pub failed: usize,
}

pub struct SyncEngine {
    config: EngineConfig,
    bus: EventBus,
    connectivity: ConnectivityMonitor,
    session: Session,
    coordinator: Arc<ReconciliationCoordinator>,
    recipes: Arc<RecipeService>,
    inventory: Arc<InventoryService>,
    batches: Arc<BatchService>,
    user: Arc<UserService>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl SyncEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteApi>,
        images: Arc<dyn ImageStore>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        let bus = EventBus::new(config.event_capacity);
        let connectivity = ConnectivityMonitor::default();
        let session = Session::new();

        let composer = Arc::new(RequestComposer::new(
            remote,
            images,
            connectivity.clone(),
            session.clone(),
            reporter,
        ));
        let queue = Arc::new(SyncQueue::new(store.clone()));
        let coordinator = Arc::new(ReconciliationCoordinator::new(
            queue,
            composer,
            config.stuck_after_attempts,
            config.max_concurrent_requests,
        ));

        let (shutdown, _) = watch::channel(false);
        Self {
            recipes: Arc::new(RecipeService::new(store.clone(), coordinator.clone())),
            inventory: Arc::new(InventoryService::new(store.clone(), coordinator.clone())),
            batches: Arc::new(BatchService::new(store.clone(), coordinator.clone())),
            user: Arc::new(UserService::new(store, coordinator.clone(), bus.clone())),
            config,
            bus,
            connectivity,
            session,
            coordinator,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Engine backed by RocksDB, HTTP and the filesystem, as configured.
    pub fn open(config: EngineConfig, reporter: Arc<dyn ErrorReporter>) -> Result<Self> {
        let store = Arc::new(RocksStore::open(config.store.clone())?);
        let remote = HttpRemote::new(config.api_base_url.clone(), config.request_timeout())
            .map_err(|e| SyncEngineError::Config(e.to_string()))?;
        let images = Arc::new(FsImageStore::new(config.image_dir.clone()));
        Ok(Self::new(config, store, Arc::new(remote), images, reporter))
    }

    /// Load durable state and start reacting to lifecycle events and
    /// connectivity. Calling it twice is a no-op.
    pub async fn init(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let flags = match self.restore().await {
            Ok(flags) => flags,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let mut tasks = vec![
            self.recipes.clone().run(self.bus.subscribe(), self.shutdown.subscribe()),
            self.inventory.clone().run(self.bus.subscribe(), self.shutdown.subscribe()),
            self.batches.clone().run(self.bus.subscribe(), self.shutdown.subscribe()),
            self.user.clone().run(self.bus.subscribe(), self.shutdown.subscribe()),
        ];
        tasks.push(self.watch_connectivity());
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).extend(tasks);

        log::info!("sync engine started with {flags} pending flag(s)");
        if flags > 0 && self.connectivity.is_online() {
            self.bus.emit(LifecycleEvent::Connected);
        }
        Ok(())
    }

    /// Load durable state without reacting to events. Returns the number
    /// of pending flags.
    pub async fn restore(&self) -> Result<usize> {
        let flags = self.coordinator.queue().load().await?;
        self.user.init().await?;
        self.recipes.init().await?;
        self.inventory.init().await?;
        self.batches.init().await?;
        Ok(flags)
    }

    /// Emits `connected` on every offline → online transition.
    fn watch_connectivity(&self) -> JoinHandle<()> {
        let mut online = self.connectivity.subscribe();
        let mut shutdown = self.shutdown.subscribe();
        let bus = self.bus.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    changed = online.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if *online.borrow_and_update() {
                            bus.emit(LifecycleEvent::Connected);
                        }
                    }
                }
            }
        })
    }

    /// Stop reacting to events. Work already underway finishes first.
    pub async fn teardown(&self) {
        self.shutdown.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                log::error!("engine task ended abnormally: {e}");
            }
        }
        self.started.store(false, Ordering::SeqCst);
        self.shutdown.send_replace(false);
        log::info!("sync engine stopped");
    }

    // ─── Operator actions ────────────────────────────────────

    /// Flush one kind now, outside the event loop.
    pub async fn flush(&self, kind: EntityKind) -> Result<FlushSummary> {
        let (synced, failed) = match kind {
            EntityKind::Recipe => counts(self.recipes.sync().await?),
            EntityKind::Inventory => counts(self.inventory.sync().await?),
            EntityKind::Batch => counts(self.batches.sync().await?),
            EntityKind::User => counts(
                self.coordinator
                    .sync_on_connection::<UserProfile, _>(self.user.as_ref())
                    .await?,
            ),
        };
        Ok(FlushSummary { synced, failed })
    }

    pub async fn pending(&self, kind: EntityKind) -> Vec<SyncFlag> {
        self.coordinator.queue().flags_for(kind).await
    }

    pub async fn dismiss(&self, kind: EntityKind, id: &Identifier) -> Result<bool> {
        self.coordinator.dismiss(kind, id).await
    }

    // ─── Accessors ───────────────────────────────────────────

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn coordinator(&self) -> &ReconciliationCoordinator {
        &self.coordinator
    }

    pub fn recipes(&self) -> &RecipeService {
        &self.recipes
    }

    pub fn inventory(&self) -> &InventoryService {
        &self.inventory
    }

    pub fn batches(&self) -> &BatchService {
        &self.batches
    }

    pub fn user(&self) -> &UserService {
        &self.user
    }
}

fn counts<T>(response: SyncResponse<T>) -> (usize, usize) {
    (response.successes.len(), response.failures.len())
}
