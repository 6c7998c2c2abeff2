//! Object Layout & Lifecycle
//!
//! An object is a virtual array whose bytes are produced on first
//! access. Creation reserves two stable allocations: a one-page header
//! region for caller-owned out-of-band metadata and a page-rounded
//! value region holding the elements themselves. The value region is
//! armed with the instance's fault source; its population state is
//! tracked per byte in a [`RangeTable`].
//!
//! Neither pointer moves for the object's lifetime. The value region is
//! only ever written by the population engine (and by populate code
//! through the engine's callout window), so committed bytes can be read
//! through [`Object::value_ptr`] without locking.
//!
//! [`RangeTable`]: crate::ranges::RangeTable

use std::alloc::{self, Layout};
use std::fmt;
use std::ops::Range;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::trace;

use crate::callout::Populator;
use crate::config::{ConfigError, ObjectConfig};
use crate::fault::{AccessError, FaultSourceError};
use crate::instance::InstanceInner;
use crate::ranges::{ByteState, RangeTable};

/// Unique object identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId(u64);

impl ObjectId {
    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        ObjectId(raw)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Object({})", self.0)
    }
}

/// Global object ID counter.
static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a new unique object ID.
pub(crate) fn next_object_id() -> ObjectId {
    ObjectId(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed))
}

/// Error creating an object.
#[derive(Debug, Error)]
pub enum CreateError {
    /// The config violated an invariant; nothing was registered.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Address space for the header or value region was unavailable.
    #[error("out of memory reserving object regions")]
    NoMemory,
    /// Fault interception could not be armed.
    #[error("failed to arm fault interception: {0}")]
    Interception(#[from] FaultSourceError),
    /// The instance is not running.
    #[error("instance is not running")]
    NotRunning,
}

/// Error destroying an object.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DestroyError {
    /// The object is not registered with this instance (already
    /// destroyed, or belongs to another instance).
    #[error("object is not registered with this instance")]
    NotRegistered,
}

/// Object lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ObjectLifecycle {
    /// Servicing requests.
    Active,
    /// Destruction has begun; waiters are being evicted.
    Destroying,
    /// Fully torn down.
    Destroyed,
}

/// Immutable per-object parameters, widened for offset arithmetic.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ObjectSpec {
    /// Element size in bytes.
    pub stride: u64,
    /// Number of elements.
    pub element_count: u64,
    /// Batching floor in elements.
    pub min_load: u64,
    /// Logical value-region length: `element_count * stride`.
    pub value_len: u64,
}

/// A page-aligned raw allocation with a stable address.
pub(crate) struct RegionAlloc {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl RegionAlloc {
    /// Reserve `len` bytes rounded up to whole pages, zero-filled.
    pub fn reserve(len: u64, page_size: u64) -> Result<Self, CreateError> {
        let size = round_up(len.max(1), page_size);
        let size = usize::try_from(size).map_err(|_| CreateError::NoMemory)?;
        let align = usize::try_from(page_size).map_err(|_| CreateError::NoMemory)?;
        let layout = Layout::from_size_align(size, align).map_err(|_| CreateError::NoMemory)?;

        // Safety: layout has non-zero size by construction.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(CreateError::NoMemory)?;
        Ok(Self { ptr, layout })
    }

    /// Stable base address of the region.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Reserved (page-rounded) size in bytes.
    pub fn reserved_len(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for RegionAlloc {
    fn drop(&mut self) {
        // Safety: ptr was returned by alloc_zeroed with this layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

// Safety: the region is raw bytes; all mutation goes through the
// engine's range-state protocol, which hands each byte range to at most
// one writer.
unsafe impl Send for RegionAlloc {}
unsafe impl Sync for RegionAlloc {}

/// Mutable object state guarded by the object mutex.
pub(crate) struct ObjectState {
    /// Lifecycle phase.
    pub lifecycle: ObjectLifecycle,
    /// Per-byte population state over the logical value region.
    pub ranges: RangeTable,
    /// Number of population requests currently executing.
    pub in_flight: u32,
}

/// Shared object body.
pub(crate) struct ObjectInner {
    /// Unique id.
    pub id: ObjectId,
    /// Immutable parameters.
    pub spec: ObjectSpec,
    /// Page size inherited from the instance.
    pub page_size: u64,
    /// Header region (one page, caller-owned content).
    pub header: RegionAlloc,
    /// Value region (page-rounded `value_len` bytes).
    pub value: RegionAlloc,
    /// Populate implementation invoked by the engine.
    pub populator: Arc<dyn Populator>,
    /// Guarded mutable state.
    pub state: Mutex<ObjectState>,
    /// Signaled whenever bytes become readable, a request ends, or the
    /// lifecycle advances; blocked accesses wait here.
    pub wake: Condvar,
}

impl ObjectInner {
    pub(crate) fn new(
        config: &ObjectConfig,
        page_size: u64,
    ) -> Result<Arc<Self>, CreateError> {
        let populator = config.require_populator()?;
        let spec = ObjectSpec {
            stride: u64::from(config.stride()),
            element_count: config.element_count(),
            min_load: u64::from(config.min_load_count()),
            value_len: config.value_len(),
        };

        let header = RegionAlloc::reserve(page_size, page_size)?;
        let value = RegionAlloc::reserve(spec.value_len, page_size)?;

        Ok(Arc::new(Self {
            id: next_object_id(),
            spec,
            page_size,
            header,
            value,
            populator,
            state: Mutex::new(ObjectState {
                lifecycle: ObjectLifecycle::Active,
                ranges: RangeTable::new(spec.value_len),
                in_flight: 0,
            }),
            wake: Condvar::new(),
        }))
    }

    /// Begin teardown: evict waiters, then wait for in-flight requests
    /// to finish. A populate function already executing is never
    /// preempted.
    pub(crate) fn drain_for_destroy(&self) {
        let mut st = self.state.lock();
        if st.lifecycle == ObjectLifecycle::Destroyed {
            return;
        }
        st.lifecycle = ObjectLifecycle::Destroying;
        self.wake.notify_all();
        while st.in_flight > 0 {
            self.wake.wait(&mut st);
        }
        st.lifecycle = ObjectLifecycle::Destroyed;
        self.wake.notify_all();
        trace!(object = %self.id, "object drained");
    }
}

/// Handle to a lazily populated virtual array.
///
/// Cheap to clone; the underlying regions live until the object is
/// destroyed through its instance (or the instance shuts down).
#[derive(Clone)]
pub struct Object {
    pub(crate) inner: Arc<ObjectInner>,
    pub(crate) instance: Weak<InstanceInner>,
}

impl Object {
    /// Unique id of this object.
    pub fn id(&self) -> ObjectId {
        self.inner.id
    }

    /// Number of elements.
    pub fn element_count(&self) -> u64 {
        self.inner.spec.element_count
    }

    /// Element size in bytes.
    pub fn stride(&self) -> u32 {
        self.inner.spec.stride as u32
    }

    /// Logical value-region length in bytes.
    pub fn value_len(&self) -> u64 {
        self.inner.spec.value_len
    }

    /// Stable pointer to the one-page header region.
    ///
    /// The header is caller-owned scratch space for out-of-band
    /// metadata; the engine never reads or writes it.
    pub fn header_ptr(&self) -> *mut u8 {
        self.inner.header.as_ptr()
    }

    /// Stable pointer to the value region.
    ///
    /// Bytes are valid to read once the covering access has returned
    /// from [`Object::touch`] (or a populate call committed them).
    pub fn value_ptr(&self) -> *mut u8 {
        self.inner.value.as_ptr()
    }

    /// Fault in a single element, blocking until its bytes commit.
    pub fn touch(&self, index: u64) -> Result<(), AccessError> {
        self.touch_range(index..index + 1)
    }

    /// Destroy this object through its owning instance.
    pub fn destroy(self) -> Result<(), DestroyError> {
        match self.instance.upgrade() {
            Some(instance) => instance.destroy_object_by_id(self.inner.id),
            // Instance already drained; the object went with it.
            None => Err(DestroyError::NotRegistered),
        }
    }

    /// Fault in a range of elements, blocking until every byte of the
    /// range commits.
    pub fn touch_range(&self, elements: Range<u64>) -> Result<(), AccessError> {
        let spec = &self.inner.spec;
        if elements.end > spec.element_count || elements.start > elements.end {
            return Err(AccessError::OutOfBounds {
                offset: elements.end.saturating_mul(spec.stride),
                len: spec.value_len,
            });
        }
        if elements.start == elements.end {
            return Ok(());
        }
        self.fault_in(elements.start * spec.stride..elements.end * spec.stride)
    }

    /// Read one element into a fresh buffer, faulting it in first.
    pub fn read_element(&self, index: u64) -> Result<Vec<u8>, AccessError> {
        self.touch(index)?;
        let stride = self.inner.spec.stride as usize;
        let mut out = vec![0u8; stride];
        // Safety: touch() returned, so the element's bytes are
        // committed and no writer will touch them again.
        unsafe {
            let src = self.value_ptr().add(index as usize * stride);
            std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), stride);
        }
        Ok(out)
    }

    /// Block until every byte of `bytes` is readable, raising faults
    /// page by page as unfilled spans are found.
    fn fault_in(&self, bytes: Range<u64>) -> Result<(), AccessError> {
        let instance = self
            .instance
            .upgrade()
            .ok_or(AccessError::ShuttingDown)?;
        let inner = &self.inner;
        let page = inner.page_size;
        let mut counted_overlap = false;

        let mut st = inner.state.lock();
        loop {
            match st.lifecycle {
                ObjectLifecycle::Active => {}
                ObjectLifecycle::Destroying | ObjectLifecycle::Destroyed => {
                    return Err(AccessError::ObjectDestroyed);
                }
            }

            // Committed data stays readable even during shutdown.
            let first_unready =
                st.ranges
                    .first_rejecting(bytes.clone(), ByteState::is_readable);
            let offset = match first_unready {
                None => return Ok(()),
                Some(offset) => offset,
            };

            match st.ranges.state_at(offset) {
                ByteState::Poisoned => return Err(AccessError::PopulateFailed),
                ByteState::Queued | ByteState::Filling => {
                    // Overlaps an in-flight or pending request: wait for
                    // its commit, no second populate invocation. During
                    // shutdown the covering request still completes (or
                    // the worker reverts the queue mark), so waiting
                    // here always terminates.
                    if !counted_overlap {
                        counted_overlap = true;
                        instance
                            .stats()
                            .overlap_waits
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    inner.wake.wait(&mut st);
                }
                ByteState::Unfilled => {
                    if instance.is_cancelling() {
                        return Err(AccessError::ShuttingDown);
                    }
                    // Queue the page containing the first unready byte
                    // and notify the fault source.
                    let pg_lo = offset / page * page;
                    let pg_hi = (pg_lo + page).min(inner.spec.value_len);
                    let unfilled =
                        st.ranges.collect_in_state(pg_lo..pg_hi, ByteState::Unfilled);
                    for sub in &unfilled {
                        st.ranges.paint(sub.clone(), ByteState::Queued);
                    }

                    if let Err(err) = instance.source().raise(inner.id, offset) {
                        // Undo the queue marks so a later access retries.
                        for sub in &unfilled {
                            st.ranges.paint(sub.clone(), ByteState::Unfilled);
                        }
                        return Err(err);
                    }
                    inner.wake.wait(&mut st);
                }
                ByteState::Resolved | ByteState::Committed => unreachable!("readable"),
            }
        }
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("id", &self.inner.id)
            .field("element_count", &self.inner.spec.element_count)
            .field("stride", &self.inner.spec.stride)
            .field("value_len", &self.inner.spec.value_len)
            .finish()
    }
}

/// Round `value` up to the next multiple of `to` (`to` nonzero).
pub(crate) fn round_up(value: u64, to: u64) -> u64 {
    value.div_ceil(to) * to
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_alloc_page_rounding() {
        let region = RegionAlloc::reserve(100, 4096).unwrap();
        assert_eq!(region.reserved_len(), 4096);
        assert!(!region.as_ptr().is_null());
        assert_eq!(region.as_ptr() as usize % 4096, 0);

        let region = RegionAlloc::reserve(4097, 4096).unwrap();
        assert_eq!(region.reserved_len(), 8192);
    }

    #[test]
    fn test_region_alloc_zeroed() {
        let region = RegionAlloc::reserve(4096, 4096).unwrap();
        // Safety: freshly reserved region, exclusively owned here.
        let bytes = unsafe { std::slice::from_raw_parts(region.as_ptr(), 4096) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_object_ids_unique() {
        let a = next_object_id();
        let b = next_object_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0, 4096), 0);
        assert_eq!(round_up(1, 4096), 4096);
        assert_eq!(round_up(4096, 4096), 4096);
        assert_eq!(round_up(4097, 4096), 8192);
    }
}
