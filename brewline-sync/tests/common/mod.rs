//! Shared fixtures: an in-memory server and engine builders.

#![allow(dead_code)]

use async_trait::async_trait;
use brewline_core::{SyncMethod, UserProfile};
use brewline_sync::{
    ChannelReporter, EngineConfig, ErrorReporter, FsImageStore, LocalStore, LogReporter, MemoryStore,
    RemoteApi, RemoteError, RemoteRequest, RequestPayload, StoreError, StoreKey, SurfacedError, SyncEngine,
};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

// ─── Scripted server ─────────────────────────────────────────────────────────

/// Behaves like the real API: assigns ids (24-hex unless told otherwise), stores documents,
/// answers with the stored copy. Failures and latency can be scripted.
#[derive(Default)]
pub struct MockServer {
    docs: Mutex<HashMap<String, Value>>,
    requests: Mutex<Vec<RemoteRequest>>,
    failures: Mutex<VecDeque<RemoteError>>,
    latency_ms: AtomicU64,
    next_id: AtomicU64,
    plain_ids: AtomicBool,
}

impl MockServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next call fails with `error` instead of reaching the store.
    pub fn fail_next(&self, error: RemoteError) {
        self.failures.lock().unwrap().push_back(error);
    }

    pub fn reject_next(&self, status: u16, body: &str) {
        self.fail_next(RemoteError::Status {
            status,
            body: body.to_string(),
        });
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Mint ids like `s1`, `s2` instead of 24-hex object ids.
    pub fn use_plain_ids(&self) {
        self.plain_ids.store(true, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<RemoteRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn methods(&self) -> Vec<SyncMethod> {
        self.requests().iter().map(|r| r.method).collect()
    }

    pub fn doc(&self, sid: &str) -> Option<Value> {
        self.docs.lock().unwrap().get(sid).cloned()
    }

    pub fn doc_count(&self) -> usize {
        self.docs.lock().unwrap().len()
    }

    fn assign_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        if self.plain_ids.load(Ordering::SeqCst) {
            return format!("s{n}");
        }
        format!("65a1f0c2e4b0{n:012x}")
    }

    /// What the server keeps of a posted document: image paths on the
    /// device never reach it, uploaded parts get a remote path.
    fn accept(data: &Value, payload: &RequestPayload) -> Map<String, Value> {
        let mut doc = data.as_object().cloned().unwrap_or_default();
        let uploaded: Vec<String> = match payload {
            RequestPayload::Multipart { images, .. } => images.iter().map(|i| i.field_name.clone()).collect(),
            _ => Vec::new(),
        };
        for (field, value) in doc.iter_mut() {
            let Some(image) = value.as_object_mut().filter(|o| o.contains_key("cid")) else {
                continue;
            };
            image.remove("localPath");
            image.remove("hasPendingEdit");
            if uploaded.contains(field) {
                let cid = image.get("cid").and_then(Value::as_str).unwrap_or_default().to_string();
                image.insert("remotePath".into(), Value::String(format!("images/{cid}.png")));
            }
        }
        doc
    }
}

#[async_trait]
impl RemoteApi for MockServer {
    async fn send(&self, request: RemoteRequest) -> Result<Value, RemoteError> {
        self.requests.lock().unwrap().push(request.clone());

        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        if request.credential.is_none() {
            return Err(RemoteError::Status {
                status: 401,
                body: "missing credential".into(),
            });
        }

        let mut docs = self.docs.lock().unwrap();
        match request.method {
            SyncMethod::Create => {
                let data = request.payload.data().cloned().unwrap_or(Value::Null);
                let mut doc = Self::accept(&data, &request.payload);
                let sid = self.assign_id();
                doc.insert("_id".into(), Value::String(sid.clone()));
                let doc = Value::Object(doc);
                docs.insert(sid, doc.clone());
                Ok(doc)
            }
            SyncMethod::Update => {
                let sid = request.target.as_ref().map(|s| s.to_string()).unwrap_or_default();
                let data = request.payload.data().cloned().unwrap_or(Value::Null);
                let Some(Value::Object(stored)) = docs.get_mut(&sid) else {
                    return Err(RemoteError::Status {
                        status: 404,
                        body: format!("no document {sid}"),
                    });
                };
                for (key, value) in Self::accept(&data, &request.payload) {
                    if key != "_id" {
                        stored.insert(key, value);
                    }
                }
                Ok(Value::Object(stored.clone()))
            }
            SyncMethod::Delete => {
                let sid = request.target.as_ref().map(|s| s.to_string()).unwrap_or_default();
                docs.remove(&sid);
                Ok(Value::Null)
            }
        }
    }
}

// ─── Slow storage ────────────────────────────────────────────────────────────

/// Memory store whose entity collection writes take `delay`, widening the
/// window between an optimistic edit and its flag.
pub struct SlowStore {
    inner: MemoryStore,
    delay: Duration,
}

impl SlowStore {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::new(),
            delay,
        })
    }
}

#[async_trait]
impl LocalStore for SlowStore {
    async fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &StoreKey, value: Vec<u8>) -> Result<(), StoreError> {
        if matches!(key, StoreKey::Collection(_)) {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.set(key, value).await
    }

    async fn remove(&self, key: &StoreKey) -> Result<(), StoreError> {
        self.inner.remove(key).await
    }
}

// ─── Engine builders ─────────────────────────────────────────────────────────

pub fn config(dir: &Path) -> EngineConfig {
    EngineConfig::for_testing(dir)
}

pub fn engine_with(
    config: EngineConfig,
    store: Arc<dyn LocalStore>,
    server: Arc<MockServer>,
    reporter: Arc<dyn ErrorReporter>,
) -> SyncEngine {
    let images = Arc::new(FsImageStore::new(config.image_dir.clone()));
    SyncEngine::new(config, store, server, images, reporter)
}

/// Memory-backed engine that only logs surfaced errors.
pub fn engine(dir: &Path, server: Arc<MockServer>) -> SyncEngine {
    engine_with(config(dir), Arc::new(MemoryStore::new()), server, Arc::new(LogReporter))
}

/// Memory-backed engine whose high-severity errors land on a channel.
pub fn engine_with_channel(dir: &Path, server: Arc<MockServer>) -> (SyncEngine, mpsc::UnboundedReceiver<SurfacedError>) {
    let (reporter, rx) = ChannelReporter::channel();
    let engine = engine_with(config(dir), Arc::new(MemoryStore::new()), server, Arc::new(reporter));
    (engine, rx)
}

pub fn brewer() -> UserProfile {
    let mut profile = UserProfile::new("brewer");
    profile.email = "brewer@example.com".into();
    profile.token = Some("token-abc".into());
    profile
}

pub fn go_online(engine: &SyncEngine) {
    engine.session().sign_in("token-abc");
    engine.connectivity().set_online(true);
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

/// Write a small fake PNG and return its path.
pub fn picked_image(dir: &Path, name: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, [0x89, b'P', b'N', b'G', 0, 1, 2, 3]).unwrap();
    path.to_string_lossy().into_owned()
}
