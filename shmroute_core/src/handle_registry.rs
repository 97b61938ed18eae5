use crate::{errors::ErrorCode, Registry, Segment};
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

/// Handle ID type - safer than raw pointers
pub type HandleId = u64;

/// Joined segments handed out across the C ABI.
struct HandleRegistry {
    handles: Mutex<HashMap<HandleId, Arc<Segment>>>,
    next_id: AtomicU64,
}

impl HandleRegistry {
    fn new() -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1), // 0 is never issued
        }
    }

    fn register(&self, seg: Segment) -> HandleId {
        let handle_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut handles = self.handles.lock().unwrap_or_else(|p| p.into_inner());
        handles.insert(handle_id, Arc::new(seg));
        handle_id
    }

    fn get(&self, handle_id: HandleId) -> Result<Arc<Segment>, ErrorCode> {
        if handle_id == 0 {
            return Err(ErrorCode::InvalidHandle);
        }
        let handles = self.handles.lock().map_err(|_| ErrorCode::InvalidHandle)?;
        handles.get(&handle_id).cloned().ok_or(ErrorCode::InvalidHandle)
    }

    fn unregister(&self, handle_id: HandleId) -> Result<Arc<Segment>, ErrorCode> {
        if handle_id == 0 {
            return Err(ErrorCode::InvalidHandle);
        }
        let mut handles = self.handles.lock().map_err(|_| ErrorCode::InvalidHandle)?;
        handles.remove(&handle_id).ok_or(ErrorCode::InvalidHandle)
    }
}

static REGISTRY: OnceLock<HandleRegistry> = OnceLock::new();

fn get_registry() -> &'static HandleRegistry {
    REGISTRY.get_or_init(HandleRegistry::new)
}

/// Backends and peer types used by the C ABI.
pub fn default_registry() -> Result<Arc<Registry>, ErrorCode> {
    static DEFAULT: OnceCell<Arc<Registry>> = OnceCell::new();
    DEFAULT
        .get_or_try_init(|| Registry::with_builtins().map(Arc::new))
        .cloned()
        .map_err(|e| crate::errors::map_error(&e))
}

/// Register a joined segment and return its handle ID
pub fn register_handle(seg: Segment) -> HandleId {
    get_registry().register(seg)
}

/// Run `f` on the segment behind `handle_id`. The registry lock is not held
/// while `f` runs, so blocking calls do not stall other handles.
pub fn with_handle<T, F>(handle_id: HandleId, f: F) -> Result<T, ErrorCode>
where
    F: FnOnce(&Segment) -> T,
{
    let seg = get_registry().get(handle_id)?;
    Ok(f(&seg))
}

/// Forget a handle. The segment is left once the last in-flight call ends.
pub fn unregister_handle(handle_id: HandleId) -> Result<(), ErrorCode> {
    get_registry().unregister(handle_id).map(drop)
}
