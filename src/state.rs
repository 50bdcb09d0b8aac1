//! Shared application state and the registry of live boxes.

use crate::manager::BoxManager;
use crate::sandbox::BoxHandle;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

/// Live boxes keyed by box id.
pub type Boxes = Arc<RwLock<HashMap<u32, Arc<BoxHandle>>>>;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub manager: BoxManager,
    pub boxes: Boxes,
    /// Ids whose creation is in flight. Only touched under the `boxes` write lock.
    pending: Arc<Mutex<HashSet<u32>>>,
}

impl AppState {
    pub fn new(manager: BoxManager) -> Self {
        Self {
            manager,
            boxes: Arc::new(RwLock::new(HashMap::new())),
            pending: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub async fn get(&self, id: u32) -> Option<Arc<BoxHandle>> {
        self.boxes.read().await.get(&id).cloned()
    }

    /// Claims `id` for creation, or `None` if it is registered or being created.
    ///
    /// The registry lock is released before returning, so initializing the
    /// box does not hold up requests against other boxes.
    pub async fn reserve(&self, id: u32) -> Option<Reservation> {
        let boxes = self.boxes.write().await;
        if boxes.contains_key(&id) {
            return None;
        }
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if !pending.insert(id) {
            return None;
        }
        Some(Reservation {
            id,
            state: self.clone(),
        })
    }
}

/// A claimed box id. Dropping it without [`Reservation::register`] frees the id.
pub struct Reservation {
    id: u32,
    state: AppState,
}

impl Reservation {
    /// Adds the created box to the registry and releases the claim.
    pub async fn register(self, handle: BoxHandle) -> Arc<BoxHandle> {
        let handle = Arc::new(handle);
        self.state
            .boxes
            .write()
            .await
            .insert(self.id, handle.clone());
        handle
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.state
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}
