use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::dispatch::{ConnectionManager, MessageHandler, MessageSource};

/// Stable identifier handed out when a handler is registered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

struct Entries<M: Send + Sync> {
    running: bool,
    managers: BTreeMap<HandlerId, ConnectionManager<M>>,
}

/// Registry of (filter, handle) pairs attached to one message stream.
///
/// Every entry reads the stream through its own subscription, so a slow or
/// failing handler never delays delivery to its siblings.
pub struct HandlerRegistry<M: Send + Sync> {
    owner: String,
    source: Arc<dyn MessageSource<M>>,
    next_id: AtomicU64,
    entries: Mutex<Entries<M>>,
}

impl<M> HandlerRegistry<M>
where
    M: Clone + Send + Sync + 'static,
{
    pub fn new(owner: impl Into<String>, source: Arc<dyn MessageSource<M>>) -> Self {
        Self {
            owner: owner.into(),
            source,
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Entries {
                running: false,
                managers: BTreeMap::new(),
            }),
        }
    }

    /// Register a handler, returning the id used to remove it later.
    /// A handler added while the registry is running starts immediately.
    pub async fn register(&self, handler: Arc<dyn MessageHandler<M>>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        log::debug!("[{}] registered handler '{}' as {:?}", self.owner, handler.name(), id);

        let manager = ConnectionManager::new(self.owner.clone(), self.source.clone(), handler);
        let mut entries = self.entries.lock().await;
        if entries.running {
            manager.start().await;
        }
        entries.managers.insert(id, manager);
        id
    }

    /// Remove a handler; returns false if the id was unknown
    pub async fn remove(&self, id: HandlerId) -> bool {
        let removed = self.entries.lock().await.managers.remove(&id);
        match removed {
            Some(manager) => {
                manager.stop().await;
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.managers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.managers.is_empty()
    }

    pub async fn is_running(&self) -> bool {
        self.entries.lock().await.running
    }

    /// Subscribe every entry to the stream
    pub async fn start(&self) {
        let mut entries = self.entries.lock().await;
        entries.running = true;
        for manager in entries.managers.values() {
            manager.start().await;
        }
    }

    /// Cancel every entry's subscription; registrations are kept
    pub async fn stop(&self) {
        let mut entries = self.entries.lock().await;
        entries.running = false;
        for manager in entries.managers.values() {
            manager.stop().await;
        }
    }
}
