//! Lifecycle event bus.
//!
//! Decouples "start syncing now" triggers from the services that react:
//!
//! ```text
//! UserService ──login/signup/logout──┐
//!                                    ├──► EventBus ──► DomainService<Recipe>
//! connectivity watcher ──connected───┘      │     ──► DomainService<InventoryItem>
//!                                           │     ──► DomainService<Batch>
//!                                           └───────► UserService
//! ```
//!
//! Every subscriber gets its own receiver; services never call each other.

use brewline_core::EntityKind;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Named lifecycle triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// `init-<type>`: load the kind's state from local storage.
    Init(EntityKind),
    /// `clear-data`: drop all local state (logout).
    ClearData,
    /// `sync-<type>-on-signup`: push everything created before the account existed.
    SyncOnSignup(EntityKind),
    /// `connected`: flush pending flags.
    Connected,
}

impl LifecycleEvent {
    pub fn name(&self) -> String {
        match self {
            LifecycleEvent::Init(kind) => format!("init-{kind}"),
            LifecycleEvent::ClearData => "clear-data".to_string(),
            LifecycleEvent::SyncOnSignup(kind) => format!("sync-{kind}-on-signup"),
            LifecycleEvent::Connected => "connected".to_string(),
        }
    }

    /// True if the event concerns `kind` (kind-less events concern everyone).
    pub fn concerns(&self, kind: EntityKind) -> bool {
        match self {
            LifecycleEvent::Init(k) | LifecycleEvent::SyncOnSignup(k) => *k == kind,
            LifecycleEvent::ClearData | LifecycleEvent::Connected => true,
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown lifecycle event: {0}")]
pub struct UnknownEvent(pub String);

impl FromStr for LifecycleEvent {
    type Err = UnknownEvent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "clear-data" => return Ok(LifecycleEvent::ClearData),
            "connected" => return Ok(LifecycleEvent::Connected),
            _ => {}
        }
        if let Some(kind) = s.strip_prefix("init-") {
            return kind
                .parse()
                .map(LifecycleEvent::Init)
                .map_err(|_| UnknownEvent(s.to_string()));
        }
        if let Some(kind) = s.strip_prefix("sync-").and_then(|r| r.strip_suffix("-on-signup")) {
            return kind
                .parse()
                .map(LifecycleEvent::SyncOnSignup)
                .map_err(|_| UnknownEvent(s.to_string()));
        }
        Err(UnknownEvent(s.to_string()))
    }
}

/// Statistics for monitoring bus health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusStats {
    pub events_emitted: u64,
    /// Events emitted while nobody was subscribed.
    pub events_unheard: u64,
    pub subscribers: usize,
}

#[derive(Default)]
struct AtomicBusStats {
    events_emitted: AtomicU64,
    events_unheard: AtomicU64,
}

/// Broadcast bus for lifecycle events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<LifecycleEvent>,
    stats: Arc<AtomicBusStats>,
}

impl EventBus {
    /// `capacity` bounds how many events a slow subscriber may lag behind.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            stats: Arc::new(AtomicBusStats::default()),
        }
    }

    /// Emit an event. Returns the number of subscribers it reached.
    pub fn emit(&self, event: LifecycleEvent) -> usize {
        self.stats.events_emitted.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(event) {
            Ok(count) => {
                log::debug!("event {event} -> {count} subscribers");
                count
            }
            Err(_) => {
                self.stats.events_unheard.fetch_add(1, Ordering::Relaxed);
                log::debug!("event {event} had no subscribers");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            events_emitted: self.stats.events_emitted.load(Ordering::Relaxed),
            events_unheard: self.stats.events_unheard.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
        }
    }
}
