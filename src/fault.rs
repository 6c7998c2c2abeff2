//! Fault Source Adapter
//!
//! The engine does not watch memory itself; it consumes fault events
//! from a [`FaultSource`], the capability that detects the first touch
//! of an unresolved page inside a registered region, suspends the
//! access, and stops notifying once it is unbound. Modeling the source
//! as a trait keeps the range computation and state tracking testable
//! against a simulated generator, independent of any real
//! memory-protection substrate.
//!
//! [`MemoryFaultSource`] is the built-in in-process implementation: an
//! accessing thread raises a fault explicitly (see `Object::touch`),
//! the event travels over an MPMC channel to the worker pool, and the
//! accessor blocks on the owning object until the covering range
//! commits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::object::ObjectId;

/// One fault notification: the first touch of an unresolved page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultEvent {
    /// Object whose value region was touched.
    pub object: ObjectId,
    /// Byte offset of the touch within the value region.
    pub offset: u64,
}

/// Error binding or arming a fault source.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FaultSourceError {
    /// The source has been unbound and admits no new regions.
    #[error("fault source is unbound")]
    Unbound,
    /// The region is already armed.
    #[error("object {0} is already registered with the fault source")]
    AlreadyRegistered(ObjectId),
}

/// Error surfaced to an access that could not be satisfied.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AccessError {
    /// The touched index lies outside the object.
    #[error("access at offset {offset} is outside the value region of length {len}")]
    OutOfBounds {
        /// Offending byte offset.
        offset: u64,
        /// Value region length.
        len: u64,
    },
    /// The object was destroyed while the access waited.
    #[error("object was destroyed")]
    ObjectDestroyed,
    /// The covering populate call failed; the range is permanently
    /// faulted.
    #[error("populate function failed for the covering range")]
    PopulateFailed,
    /// The owning instance is shutting down and admits no new faults.
    #[error("instance is shutting down")]
    ShuttingDown,
}

/// Capability that produces fault notifications for registered regions.
///
/// Contract toward the engine: (1) notify on first touch of an
/// unresolved page in a registered region, (2) keep the faulting access
/// suspended until the engine releases it, (3) accept an unbind request
/// and stop notifying once queued events drain.
pub trait FaultSource: Send + Sync {
    /// Arm fault interception over an object's value region.
    fn register_region(&self, object: ObjectId, len: u64) -> Result<(), FaultSourceError>;

    /// Disarm interception for an object. Idempotent.
    fn unregister_region(&self, object: ObjectId);

    /// Block until the next fault event, or return `None` once the
    /// source is unbound and all queued events have drained.
    fn next_fault(&self) -> Option<FaultEvent>;

    /// Stop admitting new faults. Events already queued are still
    /// delivered; afterwards [`FaultSource::next_fault`] returns `None`.
    fn unbind(&self);
}

/// In-process fault source backed by an MPMC channel.
pub struct MemoryFaultSource {
    /// Armed regions: object id to value-region length.
    armed: RwLock<HashMap<ObjectId, u64>>,
    /// Producer side; taken on unbind so the channel disconnects.
    tx: Mutex<Option<Sender<FaultEvent>>>,
    /// Consumer side, shared by all workers.
    rx: Receiver<FaultEvent>,
    /// Whether new faults are admitted.
    admitting: AtomicBool,
}

impl MemoryFaultSource {
    /// Create an unbound-from-nothing source ready to admit faults.
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            armed: RwLock::new(HashMap::new()),
            tx: Mutex::new(Some(tx)),
            rx,
            admitting: AtomicBool::new(true),
        }
    }

    /// Raise a fault for `offset` within `object`'s value region.
    ///
    /// This is the access side of the simulation: the real substrate
    /// would observe the touch itself. The caller is expected to block
    /// on the object until the covering range commits.
    pub fn raise(&self, object: ObjectId, offset: u64) -> Result<(), AccessError> {
        if !self.admitting.load(Ordering::Acquire) {
            return Err(AccessError::ShuttingDown);
        }
        let len = match self.armed.read().get(&object) {
            Some(&len) => len,
            None => return Err(AccessError::ObjectDestroyed),
        };
        if offset >= len {
            return Err(AccessError::OutOfBounds { offset, len });
        }

        let tx = self.tx.lock();
        match tx.as_ref() {
            Some(tx) => {
                // Send only fails on disconnect, which means unbind won.
                tx.send(FaultEvent { object, offset })
                    .map_err(|_| AccessError::ShuttingDown)
            }
            None => Err(AccessError::ShuttingDown),
        }
    }

    /// Whether the source still admits new faults.
    pub fn is_admitting(&self) -> bool {
        self.admitting.load(Ordering::Acquire)
    }

    /// Number of armed regions (diagnostic).
    pub fn armed_count(&self) -> usize {
        self.armed.read().len()
    }
}

impl Default for MemoryFaultSource {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultSource for MemoryFaultSource {
    fn register_region(&self, object: ObjectId, len: u64) -> Result<(), FaultSourceError> {
        if !self.admitting.load(Ordering::Acquire) {
            return Err(FaultSourceError::Unbound);
        }
        let mut armed = self.armed.write();
        if armed.contains_key(&object) {
            return Err(FaultSourceError::AlreadyRegistered(object));
        }
        armed.insert(object, len);
        Ok(())
    }

    fn unregister_region(&self, object: ObjectId) {
        self.armed.write().remove(&object);
    }

    fn next_fault(&self) -> Option<FaultEvent> {
        self.rx.recv().ok()
    }

    fn unbind(&self) {
        self.admitting.store(false, Ordering::Release);
        // Dropping the sender disconnects the channel once queued
        // events drain, which ends every worker's next_fault loop.
        self.tx.lock().take();
    }
}

impl std::fmt::Debug for MemoryFaultSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryFaultSource")
            .field("armed", &self.armed_count())
            .field("admitting", &self.is_admitting())
            .finish()
    }
}
