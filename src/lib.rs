//! # Pagefill
//!
//! Fault-driven lazily populated virtual arrays.
//!
//! ## Overview
//!
//! Pagefill exposes objects that look like ordinary addressable arrays
//! but whose contents are not produced until first accessed. The first
//! touch of an unresolved page raises a fault-style notification; a
//! worker turns it into an element window of at least `min_load_count`
//! elements and invokes the caller's populate function to fill that
//! window in place. Accesses overlapping an in-flight fill simply wait
//! for its commit. This lets a caller treat an arbitrarily large or
//! expensive-to-produce dataset as ordinary memory.
//!
//! ## Core Guarantees
//!
//! - **Batched fills**: no population request covers fewer than
//!   `min_load_count` elements, so expensive sources amortize
//! - **In-place population**: fills write directly into the value
//!   region, no staging buffer
//! - **Monotonic windows**: an expanded request window never shrinks
//!   and never drops below its original length
//! - **Append-only commits**: committed bytes are never re-populated
//!   and can be read without locks
//! - **Scoped failure**: a failed populate call poisons only its own
//!   unresolved window; sibling requests are unaffected
//! - **Cooperative shutdown**: cancellation is an advisory flag;
//!   executing populate functions are never preempted
//!
//! ## Module Structure
//!
//! - [`config`]: instance and object configuration
//! - [`fault`]: fault-source capability and the in-process simulation
//! - [`ranges`]: per-byte population state tracking
//! - [`object`]: object layout, lifecycle, and the access path
//! - [`engine`]: fault servicing, window computation, worker pool
//! - [`callout`]: the resolve/expand protocol for populate functions
//! - [`instance`]: instance lifecycle and two-phase teardown
//!
//! ## Example
//!
//! ```rust,ignore
//! use pagefill::{Instance, InstanceConfig, ObjectConfig};
//!
//! let instance = Instance::new(InstanceConfig::default());
//! instance.init()?;
//!
//! let config = ObjectConfig::for_type::<u64>(1_000_000, 64)?
//!     .with_populator(|start, end, chan: &mut pagefill::CalloutChannel<'_>| {
//!         for (i, chunk) in chan.target().chunks_exact_mut(8).enumerate() {
//!             chunk.copy_from_slice(&(start + i as u64).to_le_bytes());
//!         }
//!         Ok(())
//!     });
//! let object = instance.create_object(&config)?;
//!
//! object.touch(42)?; // faults in at least elements 42..106
//!
//! instance.shutdown(false);
//! instance.await_shutdown()?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod callout;
pub mod config;
pub mod engine;
pub mod fault;
pub mod instance;
pub mod object;
pub mod ranges;

// Re-exports for convenient access to the core surface.
pub use callout::{
    CalloutChannel, ExpandError, ExpandOutcome, PopulateError, Populator, ResolveError, Rounding,
};
pub use config::{ConfigError, InstanceConfig, ObjectConfig};
pub use engine::StatsSnapshot;
pub use fault::{AccessError, FaultEvent, FaultSource, FaultSourceError, MemoryFaultSource};
pub use instance::{InitError, Instance, InstancePhase, ShutdownError};
pub use object::{CreateError, DestroyError, Object, ObjectId};
pub use ranges::ByteState;
