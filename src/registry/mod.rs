//! Tracking of documents announced to the analysis server
//!
//! The server only knows about files we `didOpen`. [`ResourceRegistry`]
//! keeps that set bounded (evicting the least recently used entry), and
//! makes sure concurrent callers opening the same file produce a single
//! announcement: the first caller owns the open, the rest wait on its
//! completion signal and then re-check.

mod language;

pub use language::language_id;

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};
use serde_json::{json, Value as JsonValue};
use tokio::sync::watch;

use crate::supervisor::Supervisor;
use crate::transport::Session;
use crate::utils::{path_to_file_uri, validate_and_canonicalize_path};
use crate::Result;

pub const DID_OPEN: &str = "textDocument/didOpen";
pub const DID_CLOSE: &str = "textDocument/didClose";

/// Fire-and-forget channel the registry announces through
pub trait Notifier: Send + Sync {
    fn notify(&self, method: &str, params: JsonValue) -> impl Future<Output = Result<()>> + Send;

    /// Changes whenever the server behind the channel is replaced
    fn generation(&self) -> u64 {
        0
    }
}

impl Notifier for Session {
    async fn notify(&self, method: &str, params: JsonValue) -> Result<()> {
        Session::notify(self, method, params).await
    }
}

impl Notifier for Supervisor {
    async fn notify(&self, method: &str, params: JsonValue) -> Result<()> {
        Supervisor::notify(self, method, params).await
    }

    fn generation(&self) -> u64 {
        Supervisor::generation(self)
    }
}

/// Canonical identity of a document: the `file://` URI of its canonical path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(String);

impl ResourceId {
    /// Canonicalize `path` and derive its identifier
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let canonical = validate_and_canonicalize_path(path)?;
        Ok(Self::from_canonical(&canonical))
    }

    fn from_canonical(path: &Path) -> Self {
        Self(path_to_file_uri(path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug)]
struct OpenEntry {
    path: PathBuf,
    /// Logical clock value of the last access; orders LRU eviction
    last_access: u64,
    accessed_at: Instant,
}

#[derive(Default)]
struct RegistryState {
    open: HashMap<ResourceId, OpenEntry>,
    /// Completion signal per identifier currently being announced
    in_flight: HashMap<ResourceId, watch::Receiver<bool>>,
    clock: u64,
    generation: u64,
}

impl RegistryState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn least_recently_used(&self) -> Option<ResourceId> {
        self.open
            .iter()
            .min_by_key(|(_, entry)| entry.last_access)
            .map(|(id, _)| id.clone())
    }
}

/// Bounded set of documents open on the server
pub struct ResourceRegistry<N> {
    notifier: N,
    capacity: usize,
    state: Mutex<RegistryState>,
}

impl<N: Notifier> ResourceRegistry<N> {
    pub fn new(notifier: N, capacity: usize) -> Self {
        Self {
            notifier,
            capacity: capacity.max(1),
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Make sure the server knows about `path`, announcing it if needed
    pub async fn ensure_open(&self, path: impl AsRef<Path>) -> Result<ResourceId> {
        let canonical = validate_and_canonicalize_path(path)?;
        let id = ResourceId::from_canonical(&canonical);

        let in_flight = loop {
            let mut waiter = {
                let mut state = self.current();
                let tick = state.tick();
                if let Some(entry) = state.open.get_mut(&id) {
                    entry.last_access = tick;
                    entry.accessed_at = Instant::now();
                    return Ok(id);
                }

                match state.in_flight.get(&id) {
                    Some(waiter) => waiter.clone(),
                    None => {
                        let (done, waiter) = watch::channel(false);
                        state.in_flight.insert(id.clone(), waiter);
                        break InFlight {
                            state: &self.state,
                            id: id.clone(),
                            done,
                        };
                    }
                }
            };

            tracing::debug!("Waiting for in-flight open of {}", id);
            // A dropped sender also means the owner is finished
            let _ = waiter.wait_for(|done| *done).await;
        };

        let outcome = self.announce_open(&id, &canonical).await;
        drop(in_flight);
        outcome.map(|()| id)
    }

    async fn announce_open(&self, id: &ResourceId, path: &Path) -> Result<()> {
        let evicted = {
            let mut state = self.current();
            // Leave room for every open in flight, this one included
            let reserved = state.in_flight.len();
            self.evict_for(&mut state, reserved)
        };
        self.announce_evictions(evicted).await;

        let text = tokio::fs::read_to_string(path).await?;
        let params = json!({
            "textDocument": {
                "uri": id.as_str(),
                "languageId": language_id(path),
                "version": 1,
                "text": text,
            }
        });
        let generation = self.notifier.generation();
        self.notifier.notify(DID_OPEN, params).await?;

        let evicted = {
            let mut state = self.current();
            if state.generation != generation {
                tracing::debug!("Server replaced while opening {}; not tracking it", id);
                return Ok(());
            }

            // Concurrent opens may all have passed the first check
            let evicted = self.evict_for(&mut state, 1);
            let tick = state.tick();
            state.open.insert(
                id.clone(),
                OpenEntry {
                    path: path.to_path_buf(),
                    last_access: tick,
                    accessed_at: Instant::now(),
                },
            );
            tracing::debug!("Opened {} ({} open)", id, state.open.len());
            evicted
        };
        self.announce_evictions(evicted).await;
        Ok(())
    }

    /// Remove least recently used entries until `reserved` more fit
    fn evict_for(&self, state: &mut RegistryState, reserved: usize) -> Vec<ResourceId> {
        let mut evicted = Vec::new();
        while state.open.len() + reserved > self.capacity {
            let Some(victim) = state.least_recently_used() else {
                break;
            };
            state.open.remove(&victim);
            evicted.push(victim);
        }
        evicted
    }

    async fn announce_evictions(&self, evicted: Vec<ResourceId>) {
        for victim in evicted {
            tracing::debug!("Evicting {} to stay within {} open resources", victim, self.capacity);
            if let Err(e) = self.announce_close(&victim).await {
                tracing::warn!("Failed to announce close of evicted {}: {}", victim, e);
            }
        }
    }

    async fn announce_close(&self, id: &ResourceId) -> Result<()> {
        self.notifier
            .notify(DID_CLOSE, json!({ "textDocument": { "uri": id.as_str() } }))
            .await
    }

    /// Close a tracked resource; untracked ids are ignored
    pub async fn close(&self, id: &ResourceId) -> Result<()> {
        let removed = self.current().open.remove(id).is_some();
        if !removed {
            return Ok(());
        }
        self.announce_close(id).await
    }

    /// Close every tracked resource. Announcement failures are logged.
    pub async fn close_all(&self) {
        let ids: Vec<ResourceId> = {
            let mut state = self.current();
            state.open.drain().map(|(id, _)| id).collect()
        };

        for id in &ids {
            if let Err(e) = self.announce_close(id).await {
                tracing::warn!("Failed to announce close of {}: {}", id, e);
            }
        }

        if !ids.is_empty() {
            tracing::info!("Closed {} open resources", ids.len());
        }
    }

    pub fn is_open(&self, id: &ResourceId) -> bool {
        self.current().open.contains_key(id)
    }

    /// Open resources, most recently accessed first
    pub fn list_open(&self) -> Vec<ResourceId> {
        let state = self.current();
        let mut entries: Vec<(&ResourceId, &OpenEntry)> = state.open.iter().collect();
        entries.sort_by(|a, b| b.1.last_access.cmp(&a.1.last_access));
        entries.into_iter().map(|(id, _)| id.clone()).collect()
    }

    /// Filesystem path and last access time of a tracked resource
    pub fn entry(&self, id: &ResourceId) -> Option<(PathBuf, Instant)> {
        self.current()
            .open
            .get(id)
            .map(|entry| (entry.path.clone(), entry.accessed_at))
    }

    pub fn len(&self) -> usize {
        self.current().open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lock the state, first dropping tracking that belongs to a replaced server
    fn current(&self) -> MutexGuard<'_, RegistryState> {
        let mut state = self.state.lock();
        self.sync_generation(&mut state);
        state
    }

    /// A replaced server starts with no documents, so stale tracking is dropped
    fn sync_generation(&self, state: &mut RegistryState) {
        let generation = self.notifier.generation();
        if generation != state.generation {
            if !state.open.is_empty() {
                tracing::info!(
                    "Analysis server replaced; forgetting {} open resources",
                    state.open.len()
                );
            }
            state.open.clear();
            state.generation = generation;
        }
    }
}

/// Ownership of an in-flight open; clears the marker and wakes waiters on drop
struct InFlight<'a> {
    state: &'a Mutex<RegistryState>,
    id: ResourceId,
    done: watch::Sender<bool>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.state.lock().in_flight.remove(&self.id);
        self.done.send_replace(true);
    }
}
