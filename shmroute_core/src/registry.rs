//! Process-local registry of segment backends and peer drivers.
//!
//! Lookups by name fall back to an optional [`PluginLoader`], which is
//! expected to register the named implementation and return. The registry
//! also keeps the per-process mapping table, so every join of the same
//! segment shares a single mapping.

use crate::backend::{LocalBackend, PosixBackend, SegmentBackend};
use crate::constants::{MAX_BACKEND_TYPES, MAX_PEER_TYPES, TYPE_NAME_LEN};
use crate::errors::{Error, Result};
use crate::peer::{EventPeer, PeerDriver, SpinPeer};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Resolves unknown backend or peer names at run time.
pub trait PluginLoader: Send + Sync {
    /// Register the implementation called `name` into `registry`.
    fn load(&self, name: &str, registry: &Registry) -> Result<()>;
}

struct Mapping {
    base: usize,
    size: u64,
    refs: usize,
}

#[derive(Default)]
pub struct Registry {
    backends: RwLock<Vec<Arc<dyn SegmentBackend>>>,
    peers: RwLock<Vec<Arc<dyn PeerDriver>>>,
    loader: RwLock<Option<Arc<dyn PluginLoader>>>,
    mappings: Mutex<HashMap<(String, String), Mapping>>,
}

fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(|p| p.into_inner())
}

fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(|p| p.into_inner())
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() >= TYPE_NAME_LEN {
        return Err(Error::invalid(format!("type name {name:?} must be 1..{} bytes", TYPE_NAME_LEN - 1)));
    }
    Ok(())
}

impl Registry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `posix` and `local` backends and the `posix` and
    /// `spin` peer drivers.
    pub fn with_builtins() -> Result<Self> {
        let r = Self::new();
        r.register_backend(Arc::new(PosixBackend::new()))?;
        r.register_backend(Arc::new(LocalBackend::new()))?;
        r.register_peer(Arc::new(EventPeer::new()))?;
        r.register_peer(Arc::new(SpinPeer::new()))?;
        Ok(r)
    }

    pub fn set_plugin_loader(&self, loader: Arc<dyn PluginLoader>) {
        *write(&self.loader) = Some(loader);
    }

    // ───────────────────────────── backends ───────────────────────────── //

    pub fn register_backend(&self, backend: Arc<dyn SegmentBackend>) -> Result<()> {
        check_name(backend.name())?;
        let mut list = write(&self.backends);
        if list.iter().any(|b| b.name() == backend.name()) {
            return Err(Error::invalid(format!("backend {:?} already registered", backend.name())));
        }
        if list.len() >= MAX_BACKEND_TYPES {
            return Err(Error::exhausted("backend table full"));
        }
        info!("[REGISTRY] backend {:?}", backend.name());
        list.push(backend);
        Ok(())
    }

    pub fn unregister_backend(&self, name: &str) -> Result<()> {
        let mut list = write(&self.backends);
        let idx = list
            .iter()
            .position(|b| b.name() == name)
            .ok_or_else(|| Error::not_found(format!("backend {name:?}")))?;
        list.remove(idx);
        Ok(())
    }

    pub fn find_backend(&self, name: &str) -> Option<Arc<dyn SegmentBackend>> {
        read(&self.backends).iter().find(|b| b.name() == name).cloned()
    }

    pub fn find_or_load_backend(&self, name: &str) -> Result<Arc<dyn SegmentBackend>> {
        if let Some(b) = self.find_backend(name) {
            return Ok(b);
        }
        self.load(name)?;
        self.find_backend(name)
            .ok_or_else(|| Error::not_found(format!("backend {name:?}")))
    }

    pub fn backend_names(&self) -> Vec<String> {
        read(&self.backends).iter().map(|b| b.name().to_owned()).collect()
    }

    // ───────────────────────────── peers ──────────────────────────────── //

    pub fn register_peer(&self, peer: Arc<dyn PeerDriver>) -> Result<()> {
        check_name(peer.name())?;
        {
            let list = read(&self.peers);
            if list.iter().any(|p| p.name() == peer.name()) {
                return Err(Error::invalid(format!("peer type {:?} already registered", peer.name())));
            }
            if list.len() >= MAX_PEER_TYPES {
                return Err(Error::exhausted("peer type table full"));
            }
        }
        peer.remote_signal_init()?;
        let mut list = write(&self.peers);
        if list.iter().any(|p| p.name() == peer.name()) {
            peer.remote_signal_quit();
            return Err(Error::invalid(format!("peer type {:?} already registered", peer.name())));
        }
        info!("[REGISTRY] peer type {:?}", peer.name());
        list.push(peer);
        Ok(())
    }

    pub fn unregister_peer(&self, name: &str) -> Result<()> {
        let peer = {
            let mut list = write(&self.peers);
            let idx = list
                .iter()
                .position(|p| p.name() == name)
                .ok_or_else(|| Error::not_found(format!("peer type {name:?}")))?;
            list.remove(idx)
        };
        peer.remote_signal_quit();
        Ok(())
    }

    pub fn find_peer(&self, name: &str) -> Option<Arc<dyn PeerDriver>> {
        read(&self.peers).iter().find(|p| p.name() == name).cloned()
    }

    pub fn find_or_load_peer(&self, name: &str) -> Result<Arc<dyn PeerDriver>> {
        if let Some(p) = self.find_peer(name) {
            return Ok(p);
        }
        self.load(name)?;
        self.find_peer(name)
            .ok_or_else(|| Error::not_found(format!("peer type {name:?}")))
    }

    pub fn peer_names(&self) -> Vec<String> {
        read(&self.peers).iter().map(|p| p.name().to_owned()).collect()
    }

    fn load(&self, name: &str) -> Result<()> {
        check_name(name)?;
        let loader = read(&self.loader).clone();
        match loader {
            Some(l) => {
                debug!("[REGISTRY] loading {name:?}");
                l.load(name, self)
            }
            None => Err(Error::not_found(format!("{name:?} is not registered and no loader is set"))),
        }
    }

    // ───────────────────────────── mappings ───────────────────────────── //

    /// Map `name` at `size` bytes, or share this process's existing mapping.
    pub(crate) fn acquire_mapping(
        &self,
        backend: &Arc<dyn SegmentBackend>,
        name: &str,
        size: u64,
    ) -> Result<NonNull<u8>> {
        let mut table = self.mappings.lock().unwrap_or_else(|p| p.into_inner());
        let key = (backend.name().to_owned(), name.to_owned());
        if let Some(m) = table.get_mut(&key) {
            if m.size != size {
                return Err(Error::corruption(format!(
                    "segment {name:?} already mapped at {} bytes, header says {size}",
                    m.size
                )));
            }
            m.refs += 1;
            return NonNull::new(m.base as *mut u8).ok_or_else(|| Error::corruption("null mapping"));
        }
        let base = backend.map(name, size, None)?;
        table.insert(key, Mapping { base: base.as_ptr() as usize, size, refs: 1 });
        debug!("[MAP] {}:{name} at {base:p}", backend.name());
        Ok(base)
    }

    /// Drop one reference; the last one unmaps.
    pub(crate) fn release_mapping(&self, backend: &Arc<dyn SegmentBackend>, name: &str) {
        let mut table = self.mappings.lock().unwrap_or_else(|p| p.into_inner());
        let key = (backend.name().to_owned(), name.to_owned());
        let Some(m) = table.get_mut(&key) else {
            warn!("[MAP] release of unmapped segment {}:{name}", backend.name());
            return;
        };
        m.refs -= 1;
        if m.refs > 0 {
            return;
        }
        if let Some(m) = table.remove(&key) {
            if let Some(base) = NonNull::new(m.base as *mut u8) {
                if let Err(e) = backend.unmap(base, m.size) {
                    warn!("[MAP] unmap of {}:{name} failed: {e}", backend.name());
                }
            }
        }
    }

    /// Joins of `name` currently live in this process.
    pub fn mapping_refs(&self, backend: &str, name: &str) -> usize {
        let table = self.mappings.lock().unwrap_or_else(|p| p.into_inner());
        table
            .get(&(backend.to_owned(), name.to_owned()))
            .map_or(0, |m| m.refs)
    }
}
