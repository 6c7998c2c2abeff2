//! Population Engine
//!
//! The core algorithm: each fault event is turned into an element
//! window, the window is claimed in the object's range table, and the
//! user's populate function is invoked synchronously on the servicing
//! worker to fill it in place. On success the window commits and every
//! access waiting on it is released; on failure the unresolved
//! remainder is poisoned and only the triggering access fails.
//!
//! ## Window computation
//!
//! A fault at byte offset `A` anchors the window at the page containing
//! `A`. The window starts at the first element of that page not already
//! readable or owned by another request, covers at least
//! `min_load_count` elements and at least the faulted page, and is
//! clipped at the region end and at the first byte a neighbouring
//! request owns. Concurrent requests on disjoint ranges therefore never
//! share a byte, and an overlapping fault simply waits for the covering
//! commit instead of invoking populate a second time.

use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::callout::CalloutChannel;
use crate::fault::{FaultEvent, FaultSource};
use crate::instance::InstanceInner;
use crate::object::{ObjectInner, ObjectLifecycle, ObjectSpec};
use crate::ranges::{ByteState, RangeTable};

/// Counters describing engine activity since instance init.
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Fault events that led to a populate invocation.
    pub(crate) faults_serviced: AtomicU64,
    /// Populate calls that returned success.
    pub(crate) populates_ok: AtomicU64,
    /// Populate calls that returned failure.
    pub(crate) populates_failed: AtomicU64,
    /// Successful resolve callouts.
    pub(crate) resolves: AtomicU64,
    /// Expand callouts that grew a window.
    pub(crate) expands_granted: AtomicU64,
    /// Expand callouts declined with no change.
    pub(crate) expands_declined: AtomicU64,
    /// Accesses that waited on a request they overlapped.
    pub(crate) overlap_waits: AtomicU64,
}

impl EngineStats {
    /// Take a point-in-time copy of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            faults_serviced: self.faults_serviced.load(Ordering::Relaxed),
            populates_ok: self.populates_ok.load(Ordering::Relaxed),
            populates_failed: self.populates_failed.load(Ordering::Relaxed),
            resolves: self.resolves.load(Ordering::Relaxed),
            expands_granted: self.expands_granted.load(Ordering::Relaxed),
            expands_declined: self.expands_declined.load(Ordering::Relaxed),
            overlap_waits: self.overlap_waits.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Fault events that led to a populate invocation.
    pub faults_serviced: u64,
    /// Populate calls that returned success.
    pub populates_ok: u64,
    /// Populate calls that returned failure.
    pub populates_failed: u64,
    /// Successful resolve callouts.
    pub resolves: u64,
    /// Expand callouts that grew a window.
    pub expands_granted: u64,
    /// Expand callouts declined with no change.
    pub expands_declined: u64,
    /// Accesses that waited on a request they overlapped.
    pub overlap_waits: u64,
}

/// Worker thread body: drain fault events until the source unbinds.
pub(crate) fn worker_loop(instance: Arc<InstanceInner>, worker_id: usize) {
    debug!(worker = worker_id, "worker started");
    while let Some(event) = instance.source().next_fault() {
        service_fault(&instance, worker_id, event);
    }
    debug!(worker = worker_id, "worker exiting");
}

/// Service one fault event end to end.
fn service_fault(instance: &Arc<InstanceInner>, worker_id: usize, event: FaultEvent) {
    let object = match instance.lookup_object(event.object) {
        Some(object) => object,
        // Destroyed while the event was queued; its waiters were
        // already evicted.
        None => return,
    };

    let page = object.page_size;
    let pg_lo = event.offset / page * page;
    let pg_hi = (pg_lo + page).min(object.spec.value_len);

    let window = {
        let mut st = object.state.lock();
        if st.lifecycle != ObjectLifecycle::Active {
            object.wake.notify_all();
            return;
        }
        if instance.is_cancelling() {
            // Shutdown checkpoint between fault batches: revert the
            // queue marks so waiters observe the cancellation.
            revert_queued(&mut st.ranges, pg_lo..pg_hi);
            object.wake.notify_all();
            return;
        }

        match st.ranges.state_at(event.offset) {
            // Satisfied (or permanently failed) while queued.
            ByteState::Resolved | ByteState::Committed | ByteState::Poisoned => {
                object.wake.notify_all();
                return;
            }
            // Claimed by an overlapping request; its commit releases
            // the waiters. Leftover queue marks revert so later
            // accesses re-raise.
            ByteState::Filling => {
                revert_queued(&mut st.ranges, pg_lo..pg_hi);
                return;
            }
            ByteState::Unfilled | ByteState::Queued => {}
        }

        match compute_window(&object.spec, page, &st.ranges, event.offset) {
            None => {
                revert_queued(&mut st.ranges, pg_lo..pg_hi);
                object.wake.notify_all();
                return;
            }
            Some(window) => {
                let stride = object.spec.stride;
                st.ranges
                    .paint(window.start * stride..window.end * stride, ByteState::Filling);
                // Queue marks outside the claimed window (for example
                // beyond a clip point) revert so their accesses
                // re-raise after this request commits.
                revert_queued(&mut st.ranges, pg_lo..pg_hi);
                st.in_flight += 1;
                window
            }
        }
    };

    instance.stats().faults_serviced.fetch_add(1, Ordering::Relaxed);
    trace!(
        object = %object.id,
        worker = worker_id,
        start = window.start,
        end = window.end,
        "populating window"
    );

    let mut chan = CalloutChannel::new(
        &object,
        instance.cancel_flag(),
        instance.stats(),
        window.start,
        window.end,
    );
    // A panicking populate function is treated like a nonzero return:
    // its unresolved window poisons instead of stranding waiters.
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        object.populator.populate(window.start, window.end, &mut chan)
    }));
    let bounds = chan.final_bounds();
    let resolved: Vec<Range<usize>> = chan.resolved_ranges().to_vec();
    drop(chan);

    let ok = matches!(outcome, Ok(Ok(())));
    finish_request(instance, &object, bounds, &resolved, ok);
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(object = %object.id, %err, "populate function failed"),
        Err(_) => warn!(object = %object.id, "populate function panicked"),
    }
}

/// Commit or poison a finished request and release its waiters.
fn finish_request(
    instance: &Arc<InstanceInner>,
    object: &Arc<ObjectInner>,
    bounds: Range<u64>,
    resolved: &[Range<usize>],
    ok: bool,
) {
    let stride = object.spec.stride;
    let win = bounds.start * stride..bounds.end * stride;

    let mut st = object.state.lock();
    if ok {
        // Every not-yet-resolved byte commits alongside the resolved
        // ones; the whole window becomes readable.
        st.ranges.paint(win.clone(), ByteState::Committed);
        instance.stats().populates_ok.fetch_add(1, Ordering::Relaxed);
    } else {
        // Resolved sub-ranges stay committed and readable; the
        // remainder is permanently faulted.
        let mut cursor = win.start;
        for sub in resolved {
            let abs = win.start + sub.start as u64..win.start + sub.end as u64;
            if cursor < abs.start {
                st.ranges.paint(cursor..abs.start, ByteState::Poisoned);
            }
            st.ranges.paint(abs.clone(), ByteState::Committed);
            cursor = abs.end;
        }
        if cursor < win.end {
            st.ranges.paint(cursor..win.end, ByteState::Poisoned);
        }
        instance
            .stats()
            .populates_failed
            .fetch_add(1, Ordering::Relaxed);
    }
    st.in_flight -= 1;
    object.wake.notify_all();
}

/// Revert queue marks inside `range` to unfilled.
fn revert_queued(ranges: &mut RangeTable, range: Range<u64>) {
    for sub in ranges.collect_in_state(range, ByteState::Queued) {
        ranges.paint(sub, ByteState::Unfilled);
    }
}

/// Compute the element window for a fault at `offset`, or `None` when
/// nothing at the faulted page is claimable.
///
/// The window starts at the first element of the faulted page whose
/// bytes are all claimable, covers at least `min_load` elements and the
/// remainder of the faulted page, and is clipped at the region end and
/// at the first byte owned by another request.
pub(crate) fn compute_window(
    spec: &ObjectSpec,
    page: u64,
    ranges: &RangeTable,
    offset: u64,
) -> Option<Range<u64>> {
    let pg_lo = offset / page * page;
    let pg_hi = (pg_lo + page).min(spec.value_len);

    let mut start_idx = pg_lo / spec.stride;
    while start_idx < spec.element_count {
        let bytes = start_idx * spec.stride..(start_idx + 1) * spec.stride;
        if ranges.all_in(bytes, ByteState::is_claimable) {
            break;
        }
        start_idx += 1;
    }
    if start_idx >= spec.element_count || start_idx * spec.stride >= pg_hi {
        return None;
    }

    let min_end = (start_idx + spec.min_load).min(spec.element_count);
    let page_cover = pg_hi.div_ceil(spec.stride).min(spec.element_count);
    let mut end_idx = min_end.max(page_cover);

    let start_byte = start_idx * spec.stride;
    if let Some(limit) = ranges.first_rejecting(start_byte..end_idx * spec.stride, ByteState::is_claimable)
    {
        end_idx = limit / spec.stride;
    }
    if end_idx <= start_idx {
        return None;
    }
    Some(start_idx..end_idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: u64 = 4096;

    fn spec(stride: u64, count: u64, min_load: u64) -> ObjectSpec {
        ObjectSpec {
            stride,
            element_count: count,
            min_load,
            value_len: count * stride,
        }
    }

    #[test]
    fn test_window_covers_full_page() {
        let spec = spec(8, 1000, 16);
        let ranges = RangeTable::new(spec.value_len);

        // Page covering dominates min_load for small strides.
        let window = compute_window(&spec, PAGE, &ranges, 0).unwrap();
        assert_eq!(window, 0..512);
    }

    #[test]
    fn test_window_clipped_to_element_count() {
        let spec = spec(8, 1000, 16);
        let ranges = RangeTable::new(spec.value_len);

        // Fault in the last page: value_len 8000, second page is
        // 4096..8000.
        let window = compute_window(&spec, PAGE, &ranges, 4200).unwrap();
        assert_eq!(window, 512..1000);
    }

    #[test]
    fn test_min_load_floor_applies() {
        // One element per page; min_load forces a four-page window.
        let spec = spec(4096, 100, 4);
        let ranges = RangeTable::new(spec.value_len);

        let window = compute_window(&spec, PAGE, &ranges, 0).unwrap();
        assert_eq!(window, 0..4);
        assert!(window.end - window.start >= spec.min_load);
    }

    #[test]
    fn test_window_contains_faulted_index() {
        let spec = spec(8, 10_000, 16);
        let ranges = RangeTable::new(spec.value_len);

        for offset in [0u64, 4096, 5000, 40_000, 79_999] {
            let window = compute_window(&spec, PAGE, &ranges, offset).unwrap();
            let idx = offset / spec.stride;
            assert!(window.start <= idx && idx < window.end, "offset {offset}");
        }
    }

    #[test]
    fn test_window_clipped_by_in_flight_range() {
        let spec = spec(8, 1000, 16);
        let mut ranges = RangeTable::new(spec.value_len);
        ranges.paint(2048..4096, ByteState::Filling);

        let window = compute_window(&spec, PAGE, &ranges, 0).unwrap();
        assert_eq!(window, 0..256);
    }

    #[test]
    fn test_window_skips_readable_head() {
        let spec = spec(8, 1000, 16);
        let mut ranges = RangeTable::new(spec.value_len);
        ranges.paint(0..4096, ByteState::Committed);

        // A fault in the second page starts past the committed span.
        let window = compute_window(&spec, PAGE, &ranges, 4096).unwrap();
        assert_eq!(window, 512..1000);
    }

    #[test]
    fn test_window_skips_committed_elements_within_page() {
        let spec = spec(8, 1000, 16);
        let mut ranges = RangeTable::new(spec.value_len);
        // First eight elements of the second page already committed.
        ranges.paint(4096..4160, ByteState::Committed);

        let window = compute_window(&spec, PAGE, &ranges, 4200).unwrap();
        assert_eq!(window, 520..1000);
    }

    #[test]
    fn test_no_window_when_page_owned_elsewhere() {
        let spec = spec(8, 1000, 16);
        let mut ranges = RangeTable::new(spec.value_len);
        ranges.paint(0..4096, ByteState::Filling);

        assert_eq!(compute_window(&spec, PAGE, &ranges, 100), None);
    }

    #[test]
    fn test_no_window_when_fully_committed() {
        let spec = spec(8, 512, 16);
        let mut ranges = RangeTable::new(spec.value_len);
        ranges.paint(0..spec.value_len, ByteState::Committed);

        assert_eq!(compute_window(&spec, PAGE, &ranges, 0), None);
    }

    #[test]
    fn test_stats_snapshot_roundtrip() {
        let stats = EngineStats::default();
        stats.faults_serviced.fetch_add(3, Ordering::Relaxed);
        stats.populates_ok.fetch_add(2, Ordering::Relaxed);
        stats.populates_failed.fetch_add(1, Ordering::Relaxed);

        let snap = stats.snapshot();
        assert_eq!(snap.faults_serviced, 3);
        assert_eq!(snap.populates_ok, 2);
        assert_eq!(snap.populates_failed, 1);
        assert_eq!(snap.resolves, 0);
    }
}
