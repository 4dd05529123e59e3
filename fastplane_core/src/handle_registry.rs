use crate::dataplane::Dataplane;
use crate::errors::ErrorCode;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Handle ID type - safer than raw pointers
pub type HandleId = u64;

/// Dataplanes opened through the C ABI
struct HandleRegistry {
    handles: DashMap<HandleId, Arc<Dataplane>>,
    next_id: AtomicU64,
}

impl HandleRegistry {
    fn new() -> Self {
        Self {
            handles: DashMap::new(),
            next_id: AtomicU64::new(1), // 0 is reserved for null/invalid
        }
    }

    fn register(&self, dataplane: Dataplane) -> HandleId {
        let handle_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.handles.insert(handle_id, Arc::new(dataplane));
        handle_id
    }

    fn get(&self, handle_id: HandleId) -> Result<Arc<Dataplane>, ErrorCode> {
        if handle_id == 0 {
            return Err(ErrorCode::InvalidHandle);
        }
        self.handles
            .get(&handle_id)
            .map(|d| Arc::clone(d.value()))
            .ok_or(ErrorCode::InvalidHandle)
    }

    fn unregister(&self, handle_id: HandleId) -> Result<(), ErrorCode> {
        if handle_id == 0 {
            return Err(ErrorCode::InvalidHandle);
        }
        self.handles
            .remove(&handle_id)
            .map(|_| ())
            .ok_or(ErrorCode::InvalidHandle)
    }
}

static REGISTRY: Lazy<HandleRegistry> = Lazy::new(HandleRegistry::new);

pub fn register_handle(dataplane: Dataplane) -> HandleId {
    REGISTRY.register(dataplane)
}

/// Run `f` against the dataplane behind `handle_id`. The registry shard is
/// not held while `f` runs, so `f` may close other handles.
pub fn with_handle<T, F>(handle_id: HandleId, f: F) -> Result<T, ErrorCode>
where
    F: FnOnce(&Dataplane) -> T,
{
    let dataplane = REGISTRY.get(handle_id)?;
    Ok(f(&dataplane))
}

/// Unregister a dataplane; it is dropped once the last in-flight call ends.
pub fn unregister_handle(handle_id: HandleId) -> Result<(), ErrorCode> {
    REGISTRY.unregister(handle_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataplaneConfig;

    #[test]
    fn handles_are_unique_and_closable() {
        let registry = HandleRegistry::new();
        assert!(registry.get(0).is_err());
        assert!(registry.unregister(999).is_err());

        let a = registry.register(Dataplane::new(DataplaneConfig::default()).unwrap());
        let b = registry.register(Dataplane::new(DataplaneConfig::default()).unwrap());
        assert_ne!(a, b);
        assert!(registry.get(a).is_ok());
        registry.unregister(a).unwrap();
        assert_eq!(registry.get(a).unwrap_err(), ErrorCode::InvalidHandle);
        assert!(registry.get(b).is_ok());
    }
}
