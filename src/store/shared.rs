//! Process-wide Redis store handle.
//!
//! Limiters built from configuration share one `RedisStore` per process. The
//! handle is created the first time it is asked for, under a write lock so
//! concurrent first callers agree on a single instance. Tests and embedders
//! can install their own handle or reset it.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use super::redis_store::{RedisStore, StoreOptions};

static SHARED: RwLock<Option<Arc<RedisStore>>> = parking_lot::const_rwlock(None);

/// Get the process-wide store, creating it from `options` on first use.
///
/// Once a store exists, later calls return it and ignore `options`.
pub fn shared_store(options: &StoreOptions) -> Arc<RedisStore> {
    if let Some(store) = SHARED.read().as_ref() {
        return Arc::clone(store);
    }

    let mut slot = SHARED.write();
    let store = slot.get_or_insert_with(|| {
        info!(url = %options.url, "Initializing shared counter store");
        Arc::new(RedisStore::new(options.clone()))
    });
    Arc::clone(store)
}

/// Replace the process-wide store, returning the previous one.
pub fn install_shared_store(store: Arc<RedisStore>) -> Option<Arc<RedisStore>> {
    debug!(url = %store.options().url, "Installing shared counter store");
    SHARED.write().replace(store)
}

/// Forget the process-wide store; the next `shared_store` call builds a new one.
pub fn reset_shared_store() -> Option<Arc<RedisStore>> {
    SHARED.write().take()
}
