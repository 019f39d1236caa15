//! Shared pools keyed by identifier, with reference counting.
//!
//! A [`Registry`] is an explicit, process-scoped state object: construct one
//! with the provider that should manage its pools, hand clones of it to the
//! parts of the application that create clients, and call
//! [`Registry::shutdown`] during teardown.
//!
//! Every identifier has its own async lock. It is held across the whole
//! check-then-create and decrement-then-destroy sequences, so two creators
//! never both believe they are first, and a release never destroys a pool
//! that a concurrent lookup is about to reuse.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::config::{PoolConfig, PoolSettings};
use crate::lock::Mutex;
use crate::provider::PoolProvider;
use crate::Error;

/// The name used by `Client::create_default`.
pub const DEFAULT_POOL_NAME: &str = "DEFAULT_DS";

/// Identifies a pool within a registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PoolId {
    /// A caller-chosen name, shared by every client that uses it.
    Named(String),
    /// A generated identifier for a pool that is not shared.
    Anonymous(Uuid),
}

impl PoolId {
    /// A fresh identifier that cannot collide with any other.
    pub fn anonymous() -> Self {
        PoolId::Anonymous(Uuid::new_v4())
    }

    /// Whether this identifier was generated for a non-shared pool.
    pub fn is_anonymous(&self) -> bool {
        matches!(self, PoolId::Anonymous(_))
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolId::Named(name) => f.write_str(name),
            PoolId::Anonymous(id) => write!(f, "anonymous-{id}"),
        }
    }
}

impl From<&str> for PoolId {
    fn from(name: &str) -> Self {
        PoolId::Named(name.to_owned())
    }
}

impl From<String> for PoolId {
    fn from(name: String) -> Self {
        PoolId::Named(name)
    }
}

/// A live pool together with the configuration it was created from.
pub struct PoolEntry<P: PoolProvider> {
    id: PoolId,
    /// Distinguishes this pool from later pools registered under the same id.
    generation: u64,
    pool: Arc<P::Pool>,
    config: Arc<PoolConfig>,
    settings: Arc<PoolSettings>,
}

impl<P: PoolProvider> PoolEntry<P> {
    /// The identifier the entry is registered under.
    pub fn id(&self) -> &PoolId {
        &self.id
    }

    /// The provider's pool handle.
    pub fn pool(&self) -> &P::Pool {
        &self.pool
    }

    /// The configuration snapshot taken when the pool was created.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// The settings parsed from `config`.
    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }
}

impl<P: PoolProvider> Clone for PoolEntry<P> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            generation: self.generation,
            pool: self.pool.clone(),
            config: self.config.clone(),
            settings: self.settings.clone(),
        }
    }
}

impl<P: PoolProvider> fmt::Debug for PoolEntry<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolEntry")
            .field("id", &self.id)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Maps pool identifiers to live pools and their reference counts.
pub struct Registry<P: PoolProvider> {
    inner: Arc<RegistryInner<P>>,
}

struct RegistryInner<P: PoolProvider> {
    provider: P,
    slots: Mutex<HashMap<PoolId, Arc<Slot<P>>>>,
    next_generation: AtomicU64,
}

struct Slot<P: PoolProvider> {
    generation: u64,
    state: AsyncMutex<SlotState<P>>,
}

struct SlotState<P: PoolProvider> {
    entry: Option<PoolEntry<P>>,
    refs: usize,
    /// Set once the slot has been removed from the map; holders of a stale
    /// `Arc` must start over.
    retired: bool,
}

impl<P: PoolProvider> Slot<P> {
    fn new(generation: u64, entry: Option<PoolEntry<P>>, refs: usize) -> Self {
        Self {
            generation,
            state: AsyncMutex::new(SlotState {
                entry,
                refs,
                retired: false,
            }),
        }
    }
}

impl<P: PoolProvider> RegistryInner<P> {
    fn generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    fn slot(&self, id: &PoolId) -> Arc<Slot<P>> {
        self.slots
            .lock()
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Slot::new(self.generation(), None, 0)))
            .clone()
    }

    fn existing_slot(&self, id: &PoolId) -> Option<Arc<Slot<P>>> {
        self.slots.lock().get(id).cloned()
    }

    /// Removes `slot` from the map, unless it has already been replaced.
    fn remove(&self, id: &PoolId, slot: &Arc<Slot<P>>) {
        let mut slots = self.slots.lock();
        if slots.get(id).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            slots.remove(id);
        }
    }
}

impl<P: PoolProvider> Registry<P> {
    /// Creates an empty registry whose pools are managed by `provider`.
    pub fn new(provider: P) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                provider,
                slots: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// The provider managing this registry's pools.
    pub fn provider(&self) -> &P {
        &self.inner.provider
    }

    /// Returns the pool registered under `id`, creating it from `config` if
    /// there is none, and takes a reference to it.
    ///
    /// `config` is ignored when the pool already exists. If creation fails,
    /// the error is returned and nothing is registered.
    pub async fn get_or_create(
        &self,
        id: impl Into<PoolId>,
        config: &PoolConfig,
    ) -> Result<PoolEntry<P>, Error> {
        let id = id.into();
        loop {
            let slot = self.inner.slot(&id);
            let mut guard = slot.state.lock().await;
            let state = &mut *guard;
            if state.retired {
                continue;
            }

            if let Some(entry) = &state.entry {
                state.refs += 1;
                trace!(pool = %id, refs = state.refs, "reusing pool");
                return Ok(entry.clone());
            }

            // Unregisters the slot unless it ends up holding a pool, also
            // when this future is dropped mid-creation.
            let mut creating = Creating {
                inner: &self.inner,
                id: &id,
                slot: &slot,
                state: guard,
            };
            return match self.create(&id, slot.generation, config).await {
                Ok(entry) => {
                    creating.state.entry = Some(entry.clone());
                    creating.state.refs = 1;
                    Ok(entry)
                }
                Err(e) => {
                    debug!(pool = %id, error = %e, "failed to create pool");
                    Err(e)
                }
            };
        }
    }

    /// Creates a pool under a freshly generated identifier and takes a
    /// reference to it.
    pub async fn create_non_shared(&self, config: &PoolConfig) -> Result<PoolEntry<P>, Error> {
        self.get_or_create(PoolId::anonymous(), config).await
    }

    /// Registers a pool that was built outside the registry, under a fresh
    /// identifier with a single reference. It is destroyed through the
    /// provider like any other pool.
    pub fn adopt(&self, pool: P::Pool, config: &PoolConfig) -> Result<PoolEntry<P>, Error> {
        let entry = PoolEntry {
            id: PoolId::anonymous(),
            generation: self.inner.generation(),
            pool: Arc::new(pool),
            config: Arc::new(config.clone()),
            settings: Arc::new(config.settings()?),
        };
        let slot = Arc::new(Slot::new(entry.generation, Some(entry.clone()), 1));
        self.inner.slots.lock().insert(entry.id.clone(), slot);
        debug!(pool = %entry.id, "adopted pool");
        Ok(entry)
    }

    /// Drops a reference to the pool registered under `id`, destroying the
    /// pool when it was the last one.
    ///
    /// Returns `Error::NotFound` without touching any other entry if `id` is
    /// not registered.
    pub async fn release(&self, id: &PoolId) -> Result<(), Error> {
        let slot = self
            .inner
            .existing_slot(id)
            .ok_or_else(|| Error::NotFound(id.clone()))?;
        self.release_slot(id, slot).await
    }

    /// Drops a reference to the pool `entry` was handed out for.
    ///
    /// Unlike [`Registry::release`], this never touches a newer pool that was
    /// registered under the same identifier after `entry`'s pool was removed;
    /// `Error::NotFound` is returned instead.
    pub async fn release_entry(&self, entry: &PoolEntry<P>) -> Result<(), Error> {
        let id = entry.id();
        let slot = self
            .inner
            .existing_slot(id)
            .filter(|slot| slot.generation == entry.generation)
            .ok_or_else(|| Error::NotFound(id.clone()))?;
        self.release_slot(id, slot).await
    }

    async fn release_slot(&self, id: &PoolId, slot: Arc<Slot<P>>) -> Result<(), Error> {
        let mut state = slot.state.lock().await;
        if state.retired || state.refs == 0 {
            return Err(Error::NotFound(id.clone()));
        }

        state.refs -= 1;
        trace!(pool = %id, refs = state.refs, "released pool reference");
        if state.refs > 0 {
            return Ok(());
        }

        state.retired = true;
        let entry = state.entry.take();
        self.inner.remove(id, &slot);
        drop(state);

        match entry {
            Some(entry) => self.destroy(&entry).await,
            None => Ok(()),
        }
    }

    /// The number of references held on the pool registered under `id`,
    /// zero if there is none.
    pub async fn ref_count(&self, id: &PoolId) -> usize {
        match self.inner.existing_slot(id) {
            Some(slot) => {
                let state = slot.state.lock().await;
                if state.retired {
                    0
                } else {
                    state.refs
                }
            }
            None => 0,
        }
    }

    /// Whether a pool is registered (or being created) under `id`.
    pub fn contains(&self, id: &PoolId) -> bool {
        self.inner.slots.lock().contains_key(id)
    }

    /// The number of registered pools.
    pub fn len(&self) -> usize {
        self.inner.slots.lock().len()
    }

    /// Whether no pool is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every entry and destroys its pool, regardless of outstanding
    /// references. Clients still holding a removed pool see their `close`
    /// become a no-op.
    ///
    /// Returns the first error reported by the provider; every pool is
    /// destroyed even if some fail.
    pub async fn shutdown(&self) -> Result<(), Error> {
        let slots: Vec<_> = self.inner.slots.lock().drain().collect();
        let mut first_error = None;
        for (id, slot) in slots {
            let mut state = slot.state.lock().await;
            state.retired = true;
            state.refs = 0;
            let entry = state.entry.take();
            drop(state);

            let Some(entry) = entry else {
                continue;
            };
            if let Err(e) = self.destroy(&entry).await {
                warn!(pool = %id, error = %e, "failed to destroy pool during shutdown");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn create(
        &self,
        id: &PoolId,
        generation: u64,
        config: &PoolConfig,
    ) -> Result<PoolEntry<P>, Error> {
        let settings = config.settings()?;
        let provider = &self.inner.provider;
        if let Some(requested) = settings.provider_class.as_deref() {
            if requested != provider.name() {
                return Err(Error::Config(format!(
                    "provider `{requested}` requested, but this registry uses `{}`",
                    provider.name()
                )));
            }
        }

        let pool = provider.create_pool(config, &settings).await?;
        debug!(pool = %id, provider = provider.name(), "created pool");
        Ok(PoolEntry {
            id: id.clone(),
            generation,
            pool: Arc::new(pool),
            config: Arc::new(config.clone()),
            settings: Arc::new(settings),
        })
    }

    async fn destroy(&self, entry: &PoolEntry<P>) -> Result<(), Error> {
        self.inner.provider.destroy_pool(&entry.pool).await?;
        debug!(pool = %entry.id, "destroyed pool");
        Ok(())
    }
}

/// A slot whose pool is being created, with its lock held.
struct Creating<'a, P: PoolProvider> {
    inner: &'a RegistryInner<P>,
    id: &'a PoolId,
    slot: &'a Arc<Slot<P>>,
    state: AsyncMutexGuard<'a, SlotState<P>>,
}

impl<P: PoolProvider> Drop for Creating<'_, P> {
    fn drop(&mut self) {
        if self.state.entry.is_none() {
            self.state.retired = true;
            self.inner.remove(self.id, self.slot);
        }
    }
}

impl<P: PoolProvider> Clone for Registry<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: PoolProvider> fmt::Debug for Registry<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("provider", &self.inner.provider.name())
            .field("pools", &self.len())
            .finish()
    }
}
