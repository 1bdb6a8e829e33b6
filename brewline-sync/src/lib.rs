//! # brewline-sync: Offline-first sync engine for Brewline
//!
//! Lets recipes, inventory, batches and the user profile be edited while
//! disconnected and reconciles them with the server once connectivity
//! returns, without losing edits or submitting them twice.
//!
//! ## Architecture
//!
//! ```text
//!  ┌──────────────┐  mutation   ┌──────────────────┐  add_flag  ┌────────────┐
//!  │ DomainService│ ──────────► │ EntityContainer  │            │ SyncQueue  │
//!  │ (one / kind) │ ──persist─► │ (observable)     │ ◄──merge── │ (per kind) │
//!  └──────┬───────┘             └──────────────────┘            └─────┬──────┘
//!         │ submit / sync                                              │ flush
//!         ▼                                                            ▼
//!  ┌───────────────────────────┐   send   ┌─────────────────┐   ┌───────────┐
//!  │ ReconciliationCoordinator │ ───────► │ RequestComposer │──►│ RemoteApi │
//!  └─────────────▲─────────────┘          │ (images, guard) │   └───────────┘
//!                │                        └─────────────────┘
//!         ┌──────┴──────┐
//!         │  EventBus   │ ◄── login / signup / logout / connectivity
//!         └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`container`]: observable per-kind entity cells
//! - [`queue`]: durable sync flags with collapsing and a flush guard
//! - [`composer`]: builds JSON or multipart requests, merges responses
//! - [`coordinator`]: replays flags and reconciles results
//! - [`events`]: lifecycle event bus
//! - [`service`]: domain services, the only writers of durable state
//! - [`engine`]: composition root with `init` / `teardown`
//!
//! ## Error severity
//!
//! | Error | Severity | Surfaced |
//! |-------|----------|----------|
//! | Network | Low | no, flag retried |
//! | Decode | Moderate | logged |
//! | Validation / Rejected / StuckFlag | High | yes, dismissible |

pub mod composer;
pub mod config;
pub mod connectivity;
pub mod container;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod events;
pub mod images;
pub mod queue;
pub mod remote;
pub mod reporter;
pub mod service;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use composer::{ErrorPolicy, RequestComposer, UploadDescriptor};
pub use config::EngineConfig;
pub use connectivity::ConnectivityMonitor;
pub use container::{EntityCell, EntityContainer};
pub use coordinator::{EntityOwner, FlagStatus, ReconciliationCoordinator};
pub use engine::{FlushSummary, SyncEngine};
pub use error::{Result, Severity, SyncEngineError};
pub use events::{BusStats, EventBus, LifecycleEvent};
pub use images::{FsImageStore, ImageStore};
pub use queue::{Replayed, Settled, SyncQueue};
pub use remote::{HttpRemote, ImageBlob, RemoteApi, RemoteError, RemoteRequest, RequestPayload};
pub use reporter::{ChannelReporter, ErrorReporter, LogReporter, SurfacedError};
pub use service::{BatchService, DomainService, InventoryService, RecipeService, UserService};
pub use session::Session;
pub use storage::{
    read_record, write_record, LocalStore, MemoryStore, RocksStore, StoreConfig, StoreError, StoreKey,
};
