//! Callout Channel
//!
//! The protocol a populate function uses mid-call to talk back to the
//! engine: [`CalloutChannel::resolve`] commits a sub-range of the
//! current window early so waiting accesses can be released before the
//! whole fill finishes, and [`CalloutChannel::expand`] grows the window
//! so one expensive operation (a disk seek, a network round trip) can
//! amortize across more elements than the fault asked for.
//!
//! Both calls take byte lengths; offsets are relative to the start of
//! the request window. Resolving whole multiples of the page size is
//! the most efficient shape, since released accesses are page-granular.
//!
//! The fill target is re-queried through [`CalloutChannel::target`]
//! after every `expand` call; the borrow rules make a stale window
//! slice impossible to hold across one.

use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::trace;

use crate::engine::EngineStats;
use crate::object::{round_up, ObjectInner};
use crate::ranges::ByteState;

/// Failure returned by a populate function.
///
/// Carries a caller-defined code (and optional context); the engine
/// scopes the failure to the single faulting request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("populate failed (code {code}){}", .message.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
pub struct PopulateError {
    /// Caller-defined failure code.
    pub code: i32,
    /// Optional human-readable context.
    pub message: Option<String>,
}

impl PopulateError {
    /// Create a failure with a bare code.
    pub fn new(code: i32) -> Self {
        Self {
            code,
            message: None,
        }
    }

    /// Attach a message.
    pub fn with_message(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }
}

/// User-supplied fill capability.
///
/// `populate` must have written every byte of
/// `target[0 .. (end - start) * stride)` before returning `Ok`, either
/// in one shot or incrementally paired with `resolve` calls. `start`
/// and `end` are the window's element bounds at invocation; a
/// successful `expand` obligates the caller to fill the grown window
/// instead.
///
/// Returning `Err` (or panicking) fails only this request: sub-ranges
/// already resolved stay readable, the rest of the window is
/// permanently faulted, and sibling requests are unaffected.
pub trait Populator: Send + Sync {
    /// Fill the requested element range.
    fn populate(
        &self,
        start: u64,
        end: u64,
        chan: &mut CalloutChannel<'_>,
    ) -> Result<(), PopulateError>;
}

impl<F> Populator for F
where
    F: Fn(u64, u64, &mut CalloutChannel<'_>) -> Result<(), PopulateError> + Send + Sync,
{
    fn populate(
        &self,
        start: u64,
        end: u64,
        chan: &mut CalloutChannel<'_>,
    ) -> Result<(), PopulateError> {
        self(start, end, chan)
    }
}

/// Error from [`CalloutChannel::resolve`].
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ResolveError {
    /// Some byte of the sub-range was already resolved earlier in this
    /// request.
    #[error("sub-range overlaps bytes already resolved in this request")]
    AlreadyResolved,
    /// Some byte of the sub-range lies outside the current window.
    #[error("sub-range extends outside the current request window")]
    OutOfBounds,
}

/// Error from [`CalloutChannel::expand`].
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ExpandError {
    /// The requested length is below the request's original length; no
    /// change was made.
    #[error("requested length would shrink the request window")]
    ShrinksRange,
    /// The arguments were malformed (zero length).
    #[error("bad expand arguments")]
    BadArgs,
}

/// Successful outcome of [`CalloutChannel::expand`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpandOutcome {
    /// The window grew; the new window length in bytes.
    Granted {
        /// Total window length after the grant, in bytes.
        granted_len: usize,
    },
    /// The engine declined growth this call. Refusal can be spurious
    /// and is not a permanent ceiling; a later call may succeed.
    NoChange,
}

/// Preferred rounding when the engine sizes a grant.
///
/// A preference only: grants are page-granular and the engine may
/// round either way, so the caller must be ready to fill whatever
/// length comes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rounding {
    /// Prefer rounding the grant up to the next page boundary.
    Up,
    /// Prefer rounding the grant down to the previous page boundary.
    Down,
}

/// Request-scoped channel handed to the populate function.
///
/// Valid only for the duration of one populate call; the lifetime ties
/// it to the request.
pub struct CalloutChannel<'req> {
    object: &'req ObjectInner,
    cancel: &'req AtomicBool,
    stats: &'req EngineStats,
    start_idx: u64,
    end_idx: u64,
    /// Window length in bytes at request start; expand can never take
    /// the window below this.
    original_len: usize,
    /// Window-relative byte ranges resolved so far, kept sorted and
    /// non-overlapping.
    resolved: Vec<Range<usize>>,
}

impl<'req> CalloutChannel<'req> {
    pub(crate) fn new(
        object: &'req ObjectInner,
        cancel: &'req AtomicBool,
        stats: &'req EngineStats,
        start_idx: u64,
        end_idx: u64,
    ) -> Self {
        let original_len = ((end_idx - start_idx) * object.spec.stride) as usize;
        Self {
            object,
            cancel,
            stats,
            start_idx,
            end_idx,
            original_len,
            resolved: Vec::new(),
        }
    }

    /// First element index of the window.
    pub fn start(&self) -> u64 {
        self.start_idx
    }

    /// One-past-last element index of the window (grows on expand).
    pub fn end(&self) -> u64 {
        self.end_idx
    }

    /// Current window length in bytes. Monotonically non-decreasing
    /// and never below the original requested length.
    pub fn granted_len(&self) -> usize {
        ((self.end_idx - self.start_idx) * self.object.spec.stride) as usize
    }

    /// The current fill window.
    ///
    /// Byte 0 is element `start()`. Must be re-queried after every
    /// [`CalloutChannel::expand`]; the mutable borrow enforces that.
    pub fn target(&mut self) -> &mut [u8] {
        let offset = (self.start_idx * self.object.spec.stride) as usize;
        let len = self.granted_len();
        // Safety: the engine painted [start, end) as Filling before the
        // populate call, so this request is the range's only writer;
        // readers are suspended until commit.
        unsafe {
            std::slice::from_raw_parts_mut(self.object.value.as_ptr().add(offset), len)
        }
    }

    /// Whether the owning instance has requested cooperative
    /// cancellation. Advisory: a populate function may finish normally
    /// or return early with partial results resolved.
    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Commit `window[offset .. offset + len)` early.
    ///
    /// On success those bytes must never be written again, even after
    /// this call returns; the engine releases accesses waiting on the
    /// sub-range immediately.
    pub fn resolve(&mut self, offset: usize, len: usize) -> Result<(), ResolveError> {
        if len == 0 {
            return Ok(());
        }
        let end = offset.checked_add(len).ok_or(ResolveError::OutOfBounds)?;
        if end > self.granted_len() {
            return Err(ResolveError::OutOfBounds);
        }
        let sub = offset..end;
        if self
            .resolved
            .iter()
            .any(|r| r.start < sub.end && sub.start < r.end)
        {
            return Err(ResolveError::AlreadyResolved);
        }

        let insert_at = self
            .resolved
            .partition_point(|r| r.start < sub.start);
        self.resolved.insert(insert_at, sub.clone());

        let base = self.start_idx * self.object.spec.stride;
        let abs = base + sub.start as u64..base + sub.end as u64;
        {
            let mut st = self.object.state.lock();
            st.ranges.paint(abs.clone(), ByteState::Resolved);
            self.object.wake.notify_all();
        }
        self.stats.resolves.fetch_add(1, Ordering::Relaxed);
        trace!(object = %self.object.id, range = ?abs, "sub-range resolved");
        Ok(())
    }

    /// Ask the engine to grow the window to `requested_len` bytes.
    ///
    /// The grant is page-granular, clipped where the window would
    /// collide with a neighbouring in-flight or committed range or the
    /// region end, and never shrinks. Repeated calls may keep growing
    /// the window.
    pub fn expand(
        &mut self,
        requested_len: usize,
        rounding: Rounding,
    ) -> Result<ExpandOutcome, ExpandError> {
        if requested_len == 0 {
            return Err(ExpandError::BadArgs);
        }
        if requested_len < self.original_len {
            return Err(ExpandError::ShrinksRange);
        }

        let spec = &self.object.spec;
        let page = self.object.page_size;
        let win_start = self.start_idx * spec.stride;
        let cur_end = self.end_idx * spec.stride;

        let desired = win_start.saturating_add(requested_len as u64);
        let mut aligned = match rounding {
            Rounding::Up => round_up(desired, page),
            Rounding::Down => desired / page * page,
        };
        aligned = aligned.clamp(cur_end, spec.value_len);

        let mut st = self.object.state.lock();
        // The window may only grow over bytes no other request owns.
        if let Some(limit) = st
            .ranges
            .first_rejecting(cur_end..aligned, ByteState::is_claimable)
        {
            aligned = limit;
        }

        let new_end_idx = if aligned >= spec.value_len {
            spec.element_count
        } else {
            aligned / spec.stride
        };

        if new_end_idx <= self.end_idx {
            drop(st);
            self.stats
                .expands_declined
                .fetch_add(1, Ordering::Relaxed);
            return Ok(ExpandOutcome::NoChange);
        }

        st.ranges
            .paint(cur_end..new_end_idx * spec.stride, ByteState::Filling);
        drop(st);

        self.end_idx = new_end_idx;
        self.stats.expands_granted.fetch_add(1, Ordering::Relaxed);
        trace!(
            object = %self.object.id,
            start = self.start_idx,
            end = self.end_idx,
            "request window expanded"
        );
        Ok(ExpandOutcome::Granted {
            granted_len: self.granted_len(),
        })
    }

    pub(crate) fn final_bounds(&self) -> Range<u64> {
        self.start_idx..self.end_idx
    }

    pub(crate) fn resolved_ranges(&self) -> &[Range<usize>] {
        &self.resolved
    }
}

impl fmt::Debug for CalloutChannel<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CalloutChannel")
            .field("object", &self.object.id)
            .field("start", &self.start_idx)
            .field("end", &self.end_idx)
            .field("resolved", &self.resolved.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ObjectConfig;
    use crate::engine::EngineStats;
    use std::sync::Arc;

    const PAGE: u64 = 4096;

    fn test_object(stride: u32, count: u64, min_load: u32) -> Arc<ObjectInner> {
        let config = ObjectConfig::new(stride, count, min_load)
            .unwrap()
            .with_populator(
                |_s: u64, _e: u64, _c: &mut CalloutChannel<'_>| -> Result<(), PopulateError> {
                    Ok(())
                },
            );
        ObjectInner::new(&config, PAGE).unwrap()
    }

    fn filling_channel<'a>(
        object: &'a ObjectInner,
        cancel: &'a AtomicBool,
        stats: &'a EngineStats,
        start: u64,
        end: u64,
    ) -> CalloutChannel<'a> {
        let stride = object.spec.stride;
        object
            .state
            .lock()
            .ranges
            .paint(start * stride..end * stride, ByteState::Filling);
        CalloutChannel::new(object, cancel, stats, start, end)
    }

    #[test]
    fn test_target_covers_window() {
        let object = test_object(8, 1024, 16);
        let cancel = AtomicBool::new(false);
        let stats = EngineStats::default();
        let mut chan = filling_channel(&object, &cancel, &stats, 0, 16);

        assert_eq!(chan.granted_len(), 128);
        let target = chan.target();
        assert_eq!(target.len(), 128);
        target[0] = 0xAB;
    }

    #[test]
    fn test_resolve_marks_bytes_readable() {
        let object = test_object(8, 1024, 16);
        let cancel = AtomicBool::new(false);
        let stats = EngineStats::default();
        let mut chan = filling_channel(&object, &cancel, &stats, 0, 16);

        chan.resolve(0, 64).unwrap();
        let st = object.state.lock();
        assert!(st.ranges.all_in(0..64, ByteState::is_readable));
        assert!(!st.ranges.any_in(64..128, ByteState::is_readable));
    }

    #[test]
    fn test_resolve_overlap_fails_and_leaves_state() {
        let object = test_object(8, 1024, 16);
        let cancel = AtomicBool::new(false);
        let stats = EngineStats::default();
        let mut chan = filling_channel(&object, &cancel, &stats, 0, 16);

        chan.resolve(0, 64).unwrap();
        assert_eq!(chan.resolve(32, 64), Err(ResolveError::AlreadyResolved));

        // Table unchanged by the failed call.
        let st = object.state.lock();
        assert!(!st.ranges.any_in(64..128, ByteState::is_readable));
        drop(st);

        // Disjoint remainder still resolves.
        assert!(chan.resolve(64, 64).is_ok());
    }

    #[test]
    fn test_resolve_out_of_bounds() {
        let object = test_object(8, 1024, 16);
        let cancel = AtomicBool::new(false);
        let stats = EngineStats::default();
        let mut chan = filling_channel(&object, &cancel, &stats, 0, 16);

        assert_eq!(chan.resolve(120, 16), Err(ResolveError::OutOfBounds));
        assert_eq!(chan.resolve(usize::MAX, 2), Err(ResolveError::OutOfBounds));
        assert!(chan.resolve(120, 8).is_ok());
    }

    #[test]
    fn test_expand_rejects_shrink_and_zero() {
        let object = test_object(8, 4096, 16);
        let cancel = AtomicBool::new(false);
        let stats = EngineStats::default();
        let mut chan = filling_channel(&object, &cancel, &stats, 0, 512);

        assert_eq!(chan.expand(0, Rounding::Up), Err(ExpandError::BadArgs));
        assert_eq!(
            chan.expand(chan.granted_len() - 1, Rounding::Up),
            Err(ExpandError::ShrinksRange)
        );
        assert_eq!(chan.granted_len(), 4096);
    }

    #[test]
    fn test_expand_grows_page_aligned() {
        let object = test_object(8, 4096, 16);
        let cancel = AtomicBool::new(false);
        let stats = EngineStats::default();
        let mut chan = filling_channel(&object, &cancel, &stats, 0, 512);

        let outcome = chan.expand(5000, Rounding::Up).unwrap();
        assert_eq!(
            outcome,
            ExpandOutcome::Granted {
                granted_len: 2 * PAGE as usize
            }
        );
        assert_eq!(chan.end(), 1024);
        assert_eq!(chan.target().len(), 8192);
    }

    #[test]
    fn test_expand_round_down() {
        let object = test_object(8, 4096, 16);
        let cancel = AtomicBool::new(false);
        let stats = EngineStats::default();
        let mut chan = filling_channel(&object, &cancel, &stats, 0, 512);

        // 5000 rounds down to one page: no growth past the window.
        let outcome = chan.expand(5000, Rounding::Down).unwrap();
        assert_eq!(outcome, ExpandOutcome::NoChange);
        assert_eq!(chan.granted_len(), 4096);
    }

    #[test]
    fn test_expand_monotonic_across_calls() {
        let object = test_object(8, 8192, 16);
        let cancel = AtomicBool::new(false);
        let stats = EngineStats::default();
        let mut chan = filling_channel(&object, &cancel, &stats, 0, 512);

        let mut last = chan.granted_len();
        for request in [8192usize, 12288, 12288, 20480] {
            match chan.expand(request, Rounding::Up).unwrap() {
                ExpandOutcome::Granted { granted_len } => {
                    assert!(granted_len >= last);
                    last = granted_len;
                }
                ExpandOutcome::NoChange => {}
            }
            assert!(chan.granted_len() >= last);
        }
    }

    #[test]
    fn test_expand_clipped_by_neighbouring_request() {
        let object = test_object(8, 4096, 16);
        let cancel = AtomicBool::new(false);
        let stats = EngineStats::default();

        // Another request owns the second page.
        object
            .state
            .lock()
            .ranges
            .paint(PAGE..2 * PAGE, ByteState::Committed);

        let mut chan = filling_channel(&object, &cancel, &stats, 0, 512);
        let outcome = chan.expand(3 * PAGE as usize, Rounding::Up).unwrap();
        assert_eq!(outcome, ExpandOutcome::NoChange);
        assert_eq!(chan.granted_len(), PAGE as usize);
    }

    #[test]
    fn test_expand_clipped_at_region_end() {
        let object = test_object(8, 600, 16);
        let cancel = AtomicBool::new(false);
        let stats = EngineStats::default();
        // Window covers the first page; region is 4800 bytes long.
        let mut chan = filling_channel(&object, &cancel, &stats, 0, 512);

        let outcome = chan.expand(4 * PAGE as usize, Rounding::Up).unwrap();
        assert_eq!(outcome, ExpandOutcome::Granted { granted_len: 4800 });
        assert_eq!(chan.end(), 600);
    }

    #[test]
    fn test_cancel_flag_visible() {
        let object = test_object(8, 1024, 16);
        let cancel = AtomicBool::new(false);
        let stats = EngineStats::default();
        let chan = filling_channel(&object, &cancel, &stats, 0, 16);

        assert!(!chan.cancel_requested());
        cancel.store(true, Ordering::Release);
        assert!(chan.cancel_requested());
    }
}
