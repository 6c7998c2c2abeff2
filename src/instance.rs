//! Instance Lifecycle & Shutdown Coordination
//!
//! An instance owns the page-size probe, the locked configuration, the
//! worker pool servicing fault events, and the set of live objects.
//! Teardown is two-phase: [`Instance::shutdown`] flips the state
//! machine to `ShuttingDown` without blocking (stop admitting faults,
//! raise the cooperative cancel flag), and [`Instance::await_shutdown`]
//! blocks until every worker has joined, every object is destroyed,
//! and the fault source is unbound.
//!
//! A populate function that is already executing is never preempted;
//! cancellation is advisory and checked at safe checkpoints only.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{ConfigError, InstanceConfig, ObjectConfig};
use crate::engine::{self, EngineStats, StatsSnapshot};
use crate::fault::{FaultSource, MemoryFaultSource};
use crate::object::{CreateError, DestroyError, Object, ObjectId, ObjectInner};

/// Error initializing an instance.
#[derive(Debug, Error)]
pub enum InitError {
    /// `init` was already called on this instance.
    #[error("instance is already initialized")]
    AlreadyInitialized,
    /// The locked configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The worker pool or fault-source binding could not be set up.
    /// The instance is left shut down.
    #[error("failed to bind instance resources: {0}")]
    Resource(String),
}

/// Usage error from [`Instance::await_shutdown`].
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ShutdownError {
    /// `await_shutdown` was called without a prior `shutdown`.
    #[error("await_shutdown called before shutdown")]
    NotShutDown,
    /// `await_shutdown` was already called once.
    #[error("await_shutdown called twice")]
    AlreadyAwaited,
    /// The instance was shut down with `free_on_complete`; it drains
    /// and frees itself and must not be awaited.
    #[error("instance drains itself; await_shutdown is not permitted")]
    Detached,
}

/// Instance lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InstancePhase {
    /// Allocated, not yet initialized.
    Created,
    /// Initialized and serving faults.
    Running,
    /// Shutdown signaled; draining.
    ShuttingDown,
    /// Workers joined, objects destroyed, fault source unbound.
    Drained,
    /// Drained and self-freed (`free_on_complete` shutdowns only).
    Freed,
}

/// Shared instance body.
pub(crate) struct InstanceInner {
    /// Locked configuration.
    config: InstanceConfig,
    /// System page size, probed at init. Zero until then.
    page_size: AtomicU32,
    /// Lifecycle phase.
    phase: Mutex<InstancePhase>,
    /// Cooperative cancellation flag for in-flight requests.
    cancel: AtomicBool,
    /// Fault source binding.
    source: MemoryFaultSource,
    /// Live objects by id.
    objects: Mutex<HashMap<ObjectId, Arc<ObjectInner>>>,
    /// Worker thread handles, taken on drain.
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Engine activity counters.
    stats: EngineStats,
    /// Whether `await_shutdown` has been called.
    awaited: AtomicBool,
    /// Whether the instance frees itself after draining.
    free_on_complete: AtomicBool,
}

impl InstanceInner {
    pub(crate) fn source(&self) -> &MemoryFaultSource {
        &self.source
    }

    pub(crate) fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub(crate) fn cancel_flag(&self) -> &AtomicBool {
        &self.cancel
    }

    pub(crate) fn is_cancelling(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    pub(crate) fn lookup_object(&self, id: ObjectId) -> Option<Arc<ObjectInner>> {
        self.objects.lock().get(&id).cloned()
    }

    /// Deregister, disarm, and drain one object.
    pub(crate) fn destroy_object_by_id(&self, id: ObjectId) -> Result<(), DestroyError> {
        let inner = self
            .objects
            .lock()
            .remove(&id)
            .ok_or(DestroyError::NotRegistered)?;
        self.source.unregister_region(id);
        inner.drain_for_destroy();
        debug!(object = %id, "object destroyed");
        Ok(())
    }

    /// Drain to quiescence: join workers, destroy remaining objects.
    /// Runs at most once, from `await_shutdown` or the detached
    /// drainer.
    fn drain(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            let _ = handle.join();
        }

        loop {
            let id = match self.objects.lock().keys().next() {
                Some(&id) => id,
                None => break,
            };
            let _ = self.destroy_object_by_id(id);
        }

        let mut phase = self.phase.lock();
        *phase = if self.free_on_complete.load(Ordering::Acquire) {
            InstancePhase::Freed
        } else {
            InstancePhase::Drained
        };
        debug!(phase = ?*phase, "instance drained");
    }
}

/// Handle to a population instance.
///
/// Cheap to clone; all clones refer to the same instance. Create with
/// [`Instance::new`], then call [`Instance::init`] before creating
/// objects.
#[derive(Clone)]
pub struct Instance {
    inner: Arc<InstanceInner>,
}

impl Instance {
    /// Allocate an unconfigured instance. No page-size probe and no
    /// worker threads yet; configuration stays mutable until
    /// [`Instance::init`] locks it in.
    pub fn new(config: InstanceConfig) -> Self {
        Self {
            inner: Arc::new(InstanceInner {
                config,
                page_size: AtomicU32::new(0),
                phase: Mutex::new(InstancePhase::Created),
                cancel: AtomicBool::new(false),
                source: MemoryFaultSource::new(),
                objects: Mutex::new(HashMap::new()),
                workers: Mutex::new(Vec::new()),
                stats: EngineStats::default(),
                awaited: AtomicBool::new(false),
                free_on_complete: AtomicBool::new(false),
            }),
        }
    }

    /// Allocate an instance with configuration from the environment.
    pub fn from_env() -> Self {
        Self::new(InstanceConfig::from_env())
    }

    /// Probe the page size, lock configuration, start the worker pool,
    /// and bind the fault source.
    ///
    /// Fails if already initialized or if the pool cannot be started;
    /// a resource failure leaves the instance shut down.
    pub fn init(&self) -> Result<(), InitError> {
        let inner = &self.inner;
        {
            let mut phase = inner.phase.lock();
            if *phase != InstancePhase::Created {
                return Err(InitError::AlreadyInitialized);
            }
            inner.config.validate()?;
            inner
                .page_size
                .store(probe_page_size(), Ordering::Release);
            *phase = InstancePhase::Running;
        }

        let mut handles = Vec::with_capacity(inner.config.num_workers);
        for i in 0..inner.config.num_workers {
            let worker_inner = Arc::clone(inner);
            let spawned = thread::Builder::new()
                .name(format!("pagefill-worker-{}", i))
                .spawn(move || engine::worker_loop(worker_inner, i));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    // Roll back: unbind so spawned workers exit, then
                    // leave the instance drained.
                    inner.cancel.store(true, Ordering::Release);
                    inner.source.unbind();
                    for handle in handles {
                        let _ = handle.join();
                    }
                    *inner.phase.lock() = InstancePhase::Drained;
                    return Err(InitError::Resource(err.to_string()));
                }
            }
        }
        *inner.workers.lock() = handles;

        debug!(
            workers = inner.config.num_workers,
            page_size = inner.page_size.load(Ordering::Relaxed),
            "instance initialized"
        );
        Ok(())
    }

    /// The instance-stable page size.
    ///
    /// Usually equals the system page size and never changes for this
    /// instance, but should not be assumed constant across runs.
    ///
    /// # Panics
    /// Panics if the instance has not been initialized.
    pub fn page_size(&self) -> u32 {
        self.try_page_size()
            .expect("page_size called before init")
    }

    /// The page size, or `None` before initialization.
    pub fn try_page_size(&self) -> Option<u32> {
        match self.inner.page_size.load(Ordering::Acquire) {
            0 => None,
            n => Some(n),
        }
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> InstancePhase {
        *self.inner.phase.lock()
    }

    /// Number of live objects.
    pub fn live_objects(&self) -> usize {
        self.inner.objects.lock().len()
    }

    /// Snapshot of engine activity counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Create a lazily populated object from `config`.
    ///
    /// The config is copied; the caller may reuse or drop it. On any
    /// error nothing is registered.
    pub fn create_object(&self, config: &ObjectConfig) -> Result<Object, CreateError> {
        let inner = &self.inner;
        if *inner.phase.lock() != InstancePhase::Running {
            return Err(CreateError::NotRunning);
        }
        let page_size = u64::from(inner.page_size.load(Ordering::Acquire));

        let object = ObjectInner::new(config, page_size)?;
        inner
            .source
            .register_region(object.id, object.spec.value_len)?;
        inner.objects.lock().insert(object.id, Arc::clone(&object));

        debug!(
            object = %object.id,
            elements = object.spec.element_count,
            stride = object.spec.stride,
            "object created"
        );
        Ok(Object {
            inner: object,
            instance: Arc::downgrade(inner),
        })
    }

    /// Destroy `object`: disarm interception, drain or evict in-flight
    /// work, release its regions, and deregister it.
    pub fn destroy_object(&self, object: &Object) -> Result<(), DestroyError> {
        self.inner.destroy_object_by_id(object.id())
    }

    /// Signal shutdown and return immediately.
    ///
    /// Transitions `Running -> ShuttingDown`, stops the fault source
    /// admitting new faults, and raises the cooperative cancel flag
    /// checked by workers between fault batches. In-flight populate
    /// calls run to completion.
    ///
    /// With `free_on_complete` the instance drains itself on a
    /// detached thread and frees its resources; the caller must not
    /// call [`Instance::await_shutdown`] afterwards.
    pub fn shutdown(&self, free_on_complete: bool) {
        let inner = &self.inner;
        {
            let mut phase = inner.phase.lock();
            match *phase {
                InstancePhase::Created | InstancePhase::Running => {
                    *phase = InstancePhase::ShuttingDown;
                }
                // Already shutting down or beyond.
                _ => return,
            }
        }
        inner
            .free_on_complete
            .store(free_on_complete, Ordering::Release);
        inner.cancel.store(true, Ordering::Release);
        inner.source.unbind();

        // Evict accesses parked on object condvars so they observe the
        // cancellation.
        let objects: Vec<Arc<ObjectInner>> =
            inner.objects.lock().values().cloned().collect();
        for object in objects {
            let _guard = object.state.lock();
            object.wake.notify_all();
        }
        debug!(free_on_complete, "shutdown signaled");

        if free_on_complete {
            let drain_inner = Arc::clone(inner);
            let spawned = thread::Builder::new()
                .name("pagefill-drain".into())
                .spawn(move || drain_inner.drain());
            if let Err(err) = spawned {
                warn!(%err, "failed to spawn drainer; draining inline");
                inner.drain();
            }
        }
    }

    /// Block until the instance is drained: all workers joined, all
    /// objects destroyed, the fault source fully unbound.
    ///
    /// Calling without a prior [`Instance::shutdown`], calling twice,
    /// or calling after a `free_on_complete` shutdown is a usage
    /// error.
    pub fn await_shutdown(&self) -> Result<(), ShutdownError> {
        let inner = &self.inner;
        if inner.free_on_complete.load(Ordering::Acquire) {
            return Err(ShutdownError::Detached);
        }
        if *inner.phase.lock() < InstancePhase::ShuttingDown {
            return Err(ShutdownError::NotShutDown);
        }
        if inner.awaited.swap(true, Ordering::AcqRel) {
            return Err(ShutdownError::AlreadyAwaited);
        }
        inner.drain();
        Ok(())
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("phase", &self.phase())
            .field("page_size", &self.try_page_size())
            .field("objects", &self.live_objects())
            .finish()
    }
}

/// Probe the system page size.
fn probe_page_size() -> u32 {
    #[cfg(unix)]
    {
        // Safety: sysconf is a pure query with no preconditions.
        let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if raw > 0 {
            return raw as u32;
        }
    }
    4096
}
