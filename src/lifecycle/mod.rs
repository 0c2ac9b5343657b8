//! Model lifecycle management
//!
//! Keeps at most `max_loaded_models` models resident. Models are loaded on
//! first use, evicted by (priority weight, last use) when the pool is full,
//! and reaped after sitting idle past the configured timeout.
//!
//! Two levels of locking:
//! - one process-wide residency lock, held only for bookkeeping, which
//!   serializes every "who occupies a slot" decision
//! - one async lock per model, held across the (slow) load and unload calls
//!
//! A caller that reserves a slot takes its own model lock and the victim's
//! model lock with `try_lock` while still under the residency lock, so no
//! other caller can load into that slot before the victim is gone. Manual
//! unloads and the reaper keep their entry in the table as `Unloading` until
//! the loader's unload returns, so the slot stays counted until then.

mod lease;
mod loader;

pub use lease::ModelLease;
pub use loader::{FileModelLoader, ModelLoader, ResidentModel};

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{DType, Device, ModelsConfig};
use crate::error::{BerthError, Result};
use crate::registry::{ModelDescriptor, ModelRegistry};

use lease::{Claim, Phase, Resident, Residency};

/// Pool limits and timers
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_loaded_models: usize,
    pub idle_timeout: Duration,
    pub reaper_interval: Duration,
    /// Disables the idle reaper
    pub development_mode: bool,
}

impl PoolSettings {
    pub fn from_config(config: &ModelsConfig, development_mode: bool) -> Self {
        Self {
            max_loaded_models: config.max_loaded_models.max(1),
            idle_timeout: config.idle_timeout(),
            reaper_interval: config.reaper_interval(),
            development_mode,
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from_config(&ModelsConfig::default(), false)
    }
}

/// Per-call overrides for `get_model`
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    /// `Auto` falls back to the registry hint
    pub device: Device,
    /// `None` falls back to the registry hint
    pub dtype: Option<DType>,
}

/// Snapshot of a resident model
#[derive(Debug, Clone, Serialize)]
pub struct LoadedModelInfo {
    pub last_used: DateTime<Utc>,
    pub idle_secs: f64,
    pub load_count: u64,
    pub priority_weight: u32,
    /// Outstanding leases
    pub in_use: usize,
    pub device: Option<String>,
}

/// Residency state of a registered model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Residence {
    Unloaded,
    Loading,
    Loaded,
    Unloading,
}

/// Registry entry joined with its residency, for listings
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    #[serde(flatten)]
    pub descriptor: ModelDescriptor,
    pub state: Residence,
    pub load_count: u64,
    pub in_use: usize,
}

struct ModelRuntimeState<H> {
    handle: Option<Arc<H>>,
}

struct ModelSlot<H> {
    descriptor: Arc<ModelDescriptor>,
    state: Arc<AsyncMutex<ModelRuntimeState<H>>>,
    load_count: AtomicU64,
}

type SlotGuard<H> = OwnedMutexGuard<ModelRuntimeState<H>>;

enum ClaimOutcome<H> {
    /// Model already occupies a slot; wait on its lock
    Resident(Claim),
    /// Fresh slot reserved, own lock held, victim (if any) ready to unload
    Reserved {
        claim: Claim,
        guard: SlotGuard<H>,
        victim: Option<(String, SlotGuard<H>)>,
    },
    /// Model is mid-unload; retry once its lock frees up
    Busy,
    /// Pool is full only because another model is unloading; wait on that
    /// model's lock and retry
    Draining(Arc<AsyncMutex<ModelRuntimeState<H>>>),
}

struct Reaper {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Inner<L: ModelLoader> {
    registry: Arc<ModelRegistry>,
    loader: L,
    slots: HashMap<String, ModelSlot<L::Handle>>,
    residency: Arc<Residency>,
    settings: PoolSettings,
    reaper: parking_lot::Mutex<Option<Reaper>>,
    closed: AtomicBool,
}

/// Fixed-capacity pool of resident models
pub struct ModelManager<L: ModelLoader> {
    inner: Arc<Inner<L>>,
}

impl<L: ModelLoader> Clone for ModelManager<L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<L: ModelLoader> ModelManager<L> {
    pub fn new(registry: Arc<ModelRegistry>, loader: L, settings: PoolSettings) -> Self {
        let slots = registry
            .iter()
            .map(|descriptor| {
                let slot = ModelSlot {
                    descriptor: descriptor.clone(),
                    state: Arc::new(AsyncMutex::new(ModelRuntimeState { handle: None })),
                    load_count: AtomicU64::new(0),
                };
                (descriptor.name.clone(), slot)
            })
            .collect();

        Self {
            inner: Arc::new(Inner {
                registry,
                loader,
                slots,
                residency: Arc::new(Residency::default()),
                settings,
                reaper: parking_lot::Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.inner.registry
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    fn slot(&self, name: &str) -> Result<&ModelSlot<L::Handle>> {
        self.inner
            .slots
            .get(name)
            .ok_or_else(|| BerthError::UnknownModel(name.to_string()))
    }

    /// Lease a model, loading it (and evicting another) if necessary.
    ///
    /// Concurrent callers for the same model share a single load. Fails with
    /// `NoEvictableModel` when the pool is full and every resident model is
    /// leased or still loading.
    pub async fn get_model(&self, name: &str, options: LoadOptions) -> Result<ModelLease<L::Handle>> {
        let slot = self.slot(name)?;

        loop {
            match self.claim(name, slot)? {
                ClaimOutcome::Resident(claim) => {
                    let guard = slot.state.clone().lock_owned().await;
                    if let Some(handle) = &guard.handle {
                        return Ok(ModelLease::new(name, handle.clone(), claim));
                    }
                    // The reserving caller's load failed; load it ourselves
                    return self.load_into(slot, guard, claim, options).await;
                }
                ClaimOutcome::Reserved {
                    claim,
                    guard,
                    victim,
                } => {
                    if let Some((victim_name, mut victim_guard)) = victim {
                        info!(victim = %victim_name, model = name, "Evicting model");
                        self.unload_locked(&victim_name, &mut victim_guard).await;
                    }
                    return self.load_into(slot, guard, claim, options).await;
                }
                ClaimOutcome::Busy => {
                    debug!(model = name, "Waiting for in-progress unload");
                    drop(slot.state.lock().await);
                }
                ClaimOutcome::Draining(unloading) => {
                    debug!(model = name, "Pool full, waiting for an unload to free a slot");
                    drop(unloading.lock().await);
                }
            }
        }
    }

    fn claim(&self, name: &str, slot: &ModelSlot<L::Handle>) -> Result<ClaimOutcome<L::Handle>> {
        let residency = &self.inner.residency;
        let mut table = residency.table.lock();

        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BerthError::ModelLoad {
                model: name.to_string(),
                reason: "model manager is shut down".to_string(),
            });
        }

        if let Some(resident) = table.get_mut(name) {
            if resident.phase == Phase::Unloading {
                return Ok(ClaimOutcome::Busy);
            }
            resident.in_use += 1;
            resident.last_used = Instant::now();
            return Ok(ClaimOutcome::Resident(Claim::new(residency.clone(), name)));
        }

        let Ok(guard) = slot.state.clone().try_lock_owned() else {
            return Ok(ClaimOutcome::Busy);
        };

        let victim = if table.len() >= self.inner.settings.max_loaded_models {
            let victim = eviction_candidates(&table, name)
                .into_iter()
                .find_map(|candidate| {
                    let slot = self.inner.slots.get(&candidate)?;
                    let victim_guard = slot.state.clone().try_lock_owned().ok()?;
                    Some((candidate, victim_guard))
                });
            match victim {
                Some((victim_name, victim_guard)) => {
                    table.remove(&victim_name);
                    Some((victim_name, victim_guard))
                }
                None => {
                    let unloading = table
                        .iter()
                        .filter(|(_, r)| r.phase == Phase::Unloading)
                        .find_map(|(other, _)| self.inner.slots.get(other));
                    if let Some(other) = unloading {
                        return Ok(ClaimOutcome::Draining(other.state.clone()));
                    }
                    return Err(BerthError::NoEvictableModel {
                        requested: name.to_string(),
                        capacity: self.inner.settings.max_loaded_models,
                    })
                }
            }
        } else {
            None
        };

        table.insert(
            name.to_string(),
            Resident {
                phase: Phase::Loading,
                last_used: Instant::now(),
                in_use: 1,
                priority_weight: slot.descriptor.priority_weight,
                device: None,
            },
        );

        Ok(ClaimOutcome::Reserved {
            claim: Claim::new(residency.clone(), name),
            guard,
            victim,
        })
    }

    async fn load_into(
        &self,
        slot: &ModelSlot<L::Handle>,
        mut guard: SlotGuard<L::Handle>,
        claim: Claim,
        options: LoadOptions,
    ) -> Result<ModelLease<L::Handle>> {
        let descriptor = &slot.descriptor;
        let name = descriptor.name.as_str();

        if let Some(handle) = &guard.handle {
            return Ok(ModelLease::new(name, handle.clone(), claim));
        }

        let device = options.device.or(descriptor.device);
        let dtype = options.dtype.or(descriptor.dtype);
        info!(model = name, %device, "Loading model");
        let started = Instant::now();

        match self.inner.loader.load(descriptor, device, dtype).await {
            Ok(handle) => {
                let handle = Arc::new(handle);
                guard.handle = Some(handle.clone());
                let load_count = slot.load_count.fetch_add(1, Ordering::Relaxed) + 1;
                self.inner.residency.mark_loaded(name, device);
                info!(
                    model = name,
                    load_count,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Model loaded"
                );
                Ok(ModelLease::new(name, handle, claim))
            }
            Err(e) => {
                claim.abandon_load();
                drop(guard);
                warn!(model = name, error = %e, "Model load failed");
                Err(BerthError::ModelLoad {
                    model: name.to_string(),
                    reason: format!("{:#}", e),
                })
            }
        }
    }

    /// Release a model's resources. Caller holds the model's lock, and the
    /// model's table entry is either gone or marked `Unloading`.
    async fn unload_locked(&self, name: &str, guard: &mut SlotGuard<L::Handle>) {
        let Some(handle) = guard.handle.take() else {
            return;
        };
        let Some(slot) = self.inner.slots.get(name) else {
            return;
        };
        if let Err(e) = self.inner.loader.unload(&slot.descriptor, handle).await {
            warn!(model = name, error = %e, "Model unload reported an error");
        }
        info!(model = name, "Model unloaded");
    }

    /// Unload a model marked `Unloading`, then free its slot before
    /// releasing its lock
    async fn retire(&self, name: &str, mut guard: SlotGuard<L::Handle>) {
        self.unload_locked(name, &mut guard).await;
        self.inner.residency.finish_unload(name);
        drop(guard);
    }

    /// Unload a model on request.
    ///
    /// Returns `Ok(false)` when the model was not resident. Leased,
    /// still-loading or already-unloading models are refused with
    /// `ModelInUse`. The model keeps its slot until the unload returns.
    pub async fn unload_model(&self, name: &str) -> Result<bool> {
        let slot = self.slot(name)?;
        let guard = {
            let mut table = self.inner.residency.table.lock();
            if !table.contains_key(name) {
                return Ok(false);
            }
            let Ok(guard) = slot.state.clone().try_lock_owned() else {
                return Err(BerthError::ModelInUse(name.to_string()));
            };
            if !Residency::begin_unload(&mut table, name) {
                return Err(BerthError::ModelInUse(name.to_string()));
            }
            guard
        };
        self.retire(name, guard).await;
        Ok(true)
    }

    /// Evict every loaded, unleased model idle for longer than the timeout.
    /// Returns the names evicted.
    pub async fn reap_idle(&self) -> Vec<String> {
        let idle_timeout = self.inner.settings.idle_timeout;
        let victims: Vec<(String, SlotGuard<L::Handle>)> = {
            let mut table = self.inner.residency.table.lock();
            let expired: Vec<String> = table
                .iter()
                .filter(|(_, r)| {
                    r.phase == Phase::Loaded && r.in_use == 0 && r.last_used.elapsed() > idle_timeout
                })
                .map(|(name, _)| name.clone())
                .collect();

            let mut victims = Vec::with_capacity(expired.len());
            for name in expired {
                let Some(slot) = self.inner.slots.get(&name) else {
                    continue;
                };
                if let Ok(guard) = slot.state.clone().try_lock_owned() {
                    if Residency::begin_unload(&mut table, &name) {
                        victims.push((name, guard));
                    }
                }
            }
            victims
        };

        let mut reaped = Vec::with_capacity(victims.len());
        for (name, guard) in victims {
            info!(model = %name, "Reaping idle model");
            self.retire(&name, guard).await;
            reaped.push(name);
        }
        reaped
    }

    /// Start the periodic idle reaper. No-op (returns false) in development
    /// mode or when already running.
    pub fn start_reaper(&self) -> bool {
        if self.inner.settings.development_mode {
            info!("Development mode: idle reaper disabled");
            return false;
        }

        let mut slot = self.inner.reaper.lock();
        if slot.is_some() {
            return false;
        }

        let (stop, mut stop_rx) = watch::channel(false);
        let manager = self.clone();
        let period = self.inner.settings.reaper_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let reaped = manager.reap_idle().await;
                        if !reaped.is_empty() {
                            info!(count = reaped.len(), "Idle reaper evicted models");
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
            }
            debug!("Idle reaper stopped");
        });

        info!(
            interval_secs = period.as_secs(),
            idle_timeout_secs = self.inner.settings.idle_timeout.as_secs(),
            "Idle reaper started"
        );
        *slot = Some(Reaper { stop, task });
        true
    }

    /// Load the most important models, up to pool capacity.
    /// Failures are logged and skipped.
    pub async fn preload(&self) -> Vec<String> {
        let mut loaded = Vec::new();
        let capacity = self.inner.settings.max_loaded_models;
        for descriptor in self.inner.registry.by_importance().into_iter().take(capacity) {
            match self.get_model(&descriptor.name, LoadOptions::default()).await {
                Ok(lease) => {
                    drop(lease);
                    loaded.push(descriptor.name.clone());
                }
                Err(e) => warn!(model = %descriptor.name, error = %e, "Preload failed"),
            }
        }
        loaded
    }

    /// Stop the reaper and unload everything. Later `get_model` calls fail.
    pub async fn shutdown(&self) {
        let reaper = self.inner.reaper.lock().take();
        if let Some(reaper) = reaper {
            let _ = reaper.stop.send(true);
            if let Err(e) = reaper.task.await {
                warn!(error = %e, "Idle reaper task failed");
            }
        }

        let names: Vec<String> = {
            let mut table = self.inner.residency.table.lock();
            self.inner.closed.store(true, Ordering::Release);
            table.drain().map(|(name, _)| name).collect()
        };

        for name in names {
            let Some(slot) = self.inner.slots.get(&name) else {
                continue;
            };
            let mut guard = slot.state.clone().lock_owned().await;
            self.unload_locked(&name, &mut guard).await;
        }
        info!("Model manager shut down");
    }

    /// Loaded models (excluding in-progress loads)
    pub fn get_loaded_models(&self) -> BTreeMap<String, LoadedModelInfo> {
        let table = self.inner.residency.table.lock();
        table
            .iter()
            .filter(|(_, r)| r.phase == Phase::Loaded)
            .map(|(name, r)| {
                let idle = r.last_used.elapsed();
                let last_used = Utc::now()
                    - chrono::Duration::from_std(idle).unwrap_or_else(|_| chrono::Duration::zero());
                let slot = self.inner.slots.get(name);
                let info = LoadedModelInfo {
                    last_used,
                    idle_secs: idle.as_secs_f64(),
                    load_count: slot.map_or(0, |s| s.load_count.load(Ordering::Relaxed)),
                    priority_weight: r.priority_weight,
                    in_use: r.in_use,
                    device: r.device.map(|d| d.to_string()),
                };
                (name.clone(), info)
            })
            .collect()
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.inner
            .residency
            .table
            .lock()
            .get(name)
            .is_some_and(|r| r.phase == Phase::Loaded)
    }

    /// Every registered model with its residency state
    pub fn list_models(&self) -> Vec<ModelStatus> {
        let table = self.inner.residency.table.lock();
        self.inner
            .registry
            .iter()
            .map(|descriptor| {
                let resident = table.get(&descriptor.name);
                let state = match resident.map(|r| r.phase) {
                    None => Residence::Unloaded,
                    Some(Phase::Loading) => Residence::Loading,
                    Some(Phase::Loaded) => Residence::Loaded,
                    Some(Phase::Unloading) => Residence::Unloading,
                };
                ModelStatus {
                    descriptor: descriptor.as_ref().clone(),
                    state,
                    load_count: self
                        .inner
                        .slots
                        .get(&descriptor.name)
                        .map_or(0, |s| s.load_count.load(Ordering::Relaxed)),
                    in_use: resident.map_or(0, |r| r.in_use),
                }
            })
            .collect()
    }
}

/// Eviction order: loaded, unleased models other than `requested`, highest
/// priority weight first, least recently used among equals
fn eviction_candidates(table: &HashMap<String, Resident>, requested: &str) -> Vec<String> {
    let mut candidates: Vec<(&String, &Resident)> = table
        .iter()
        .filter(|(name, r)| name.as_str() != requested && r.phase == Phase::Loaded && r.in_use == 0)
        .collect();
    candidates.sort_by(|(_, a), (_, b)| {
        b.priority_weight
            .cmp(&a.priority_weight)
            .then_with(|| a.last_used.cmp(&b.last_used))
    });
    candidates.into_iter().map(|(name, _)| name.clone()).collect()
}
