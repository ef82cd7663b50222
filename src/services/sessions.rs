//! Shared handle to the current engine session

use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, RwLock};

use crate::engine::EngineSession;

/// Holds the session new requests are served with.
///
/// Readers clone the `Arc` and release the lock at once, so a request keeps
/// the session it started with even if a newer one is swapped in meanwhile.
/// Writers take the update lock first so concurrent loads cannot lose each
/// other's additions.
#[derive(Debug)]
pub struct SessionHandle {
    current: RwLock<Arc<EngineSession>>,
    update: Mutex<()>,
}

impl SessionHandle {
    pub fn new(session: EngineSession) -> Self {
        Self {
            current: RwLock::new(Arc::new(session)),
            update: Mutex::new(()),
        }
    }

    /// The session new requests should use
    pub async fn current(&self) -> Arc<EngineSession> {
        self.current.read().await.clone()
    }

    /// Serialize derive-and-swap sequences
    pub async fn begin_update(&self) -> MutexGuard<'_, ()> {
        self.update.lock().await
    }

    /// Make `session` the one new requests see
    pub async fn replace(&self, session: EngineSession) {
        *self.current.write().await = Arc::new(session);
    }
}
