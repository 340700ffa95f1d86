use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;

use crate::tracker::{Site, Tracker};

thread_local! {
    /// Set while this thread runs tracker code. Allocations made by the
    /// tracker itself pass through untracked.
    static IN_TRACKER: Cell<bool> = const { Cell::new(false) };
}

/// Global allocator that reports every allocation to the active memtrail
/// session and forwards to `A`.
///
/// With the `global-alloc` feature the crate installs
/// `TrackingAllocator<System>` as the `#[global_allocator]`. Without it, a
/// binary can install its own:
///
/// ```rust,ignore
/// use memtrail::TrackingAllocator;
///
/// #[global_allocator]
/// static GLOBAL: TrackingAllocator = TrackingAllocator::system();
///
/// fn main() {
///     let _session = memtrail::GuardBuilder::new("main").build();
///     let _leak = Box::leak(Box::new([0u8; 32]));
/// }
/// ```
///
/// Nothing is recorded while no session guard is alive. Blocks allocated
/// before the session started are released silently, and resizes show up as
/// an acquire of the new block followed by a release of the old one.
pub struct TrackingAllocator<A = System> {
    inner: A,
}

impl TrackingAllocator<System> {
    pub const fn system() -> Self {
        Self { inner: System }
    }
}

impl<A> TrackingAllocator<A> {
    pub const fn new(inner: A) -> Self {
        Self { inner }
    }
}

unsafe impl<A: GlobalAlloc> GlobalAlloc for TrackingAllocator<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.inner.alloc(layout) };
        if !ptr.is_null() && !track_alloc(ptr, layout.size()) {
            unsafe { self.inner.dealloc(ptr, layout) };
            return std::ptr::null_mut();
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.inner.alloc_zeroed(layout) };
        if !ptr.is_null() && !track_alloc(ptr, layout.size()) {
            unsafe { self.inner.dealloc(ptr, layout) };
            return std::ptr::null_mut();
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        track_dealloc(ptr);
        unsafe { self.inner.dealloc(ptr, layout) }
    }
}

/// Runs `f` against the active tracker unless this thread is already inside
/// the tracker. Returns `None` when nothing ran.
fn with_tracker<R>(f: impl FnOnce(&Tracker) -> R) -> Option<R> {
    IN_TRACKER
        .try_with(|busy| {
            if busy.replace(true) {
                return None;
            }
            // The slot lookup may allocate on a thread's first use, so the
            // flag is already up here.
            let result = crate::guard::active().map(|tracker| f(&tracker));
            busy.set(false);
            result
        })
        .ok()
        .flatten()
}

/// Runs `f` with allocation tracking off on this thread. Every path that
/// holds the registry lock goes through here, so a sink that allocates never
/// re-enters the tracker.
pub(crate) fn untracked<R>(f: impl FnOnce() -> R) -> R {
    let previous = IN_TRACKER.try_with(|busy| busy.replace(true)).ok();
    let result = f();
    if let Some(previous) = previous {
        let _ = IN_TRACKER.try_with(|busy| busy.set(previous));
    }
    result
}

/// `false` when the session could not record the block.
///
/// This and [`track_dealloc`] are the allocator's entry points into the
/// tracker: caller chains start above the outermost of them.
#[inline(never)]
pub(crate) fn track_alloc(ptr: *mut u8, size: usize) -> bool {
    with_tracker(|tracker| {
        match tracker.record_acquire(ptr as usize, size, Site::Allocator) {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(error = %e, size, "memtrail refused an allocation");
                false
            }
        }
    })
    .unwrap_or(true)
}

#[inline(never)]
pub(crate) fn track_dealloc(ptr: *mut u8) {
    with_tracker(|tracker| tracker.record_release(ptr as usize, Site::Allocator, false));
}

#[cfg(all(test, not(feature = "global-alloc")))]
mod tests {
    use super::*;
    use crate::guard::{GuardBuilder, TEST_SESSION};
    use crate::output::Diagnostic;
    use crate::sinks::MemorySink;
    use crate::NoSymbolizer;

    fn session(sink: &MemorySink) -> crate::MemTrail {
        GuardBuilder::new("alloc")
            .sink(Box::new(sink.clone()))
            .symbolizer(Box::new(NoSymbolizer))
            .caller_frames(0)
            .build()
    }

    #[test]
    fn test_untracked_without_session() {
        let _serial = TEST_SESSION.lock().unwrap_or_else(|e| e.into_inner());
        assert!(with_tracker(|_| ()).is_none());

        let allocator = TrackingAllocator::system();
        let layout = Layout::from_size_align(32, 8).unwrap();
        unsafe {
            let ptr = allocator.alloc(layout);
            assert!(!ptr.is_null());
            allocator.dealloc(ptr, layout);
        }
    }

    #[test]
    fn test_session_records_alloc_and_dealloc() {
        let _serial = TEST_SESSION.lock().unwrap_or_else(|e| e.into_inner());
        let sink = MemorySink::new();
        let guard = session(&sink);

        let allocator = TrackingAllocator::system();
        let layout = Layout::from_size_align(48, 16).unwrap();
        let ptr = unsafe { allocator.alloc_zeroed(layout) };
        assert_eq!(guard.tracker().stats().active, 1);

        unsafe { allocator.dealloc(ptr, layout) };
        assert_eq!(guard.tracker().stats().active, 0);

        let diagnostics = sink.diagnostics();
        assert_eq!(diagnostics.len(), 2);
        assert!(matches!(diagnostics[0], Diagnostic::Acquire { size: 48, .. }));
        assert!(matches!(diagnostics[1], Diagnostic::Release { size: 48, .. }));
    }

    #[test]
    fn test_unknown_dealloc_is_silent() {
        let _serial = TEST_SESSION.lock().unwrap_or_else(|e| e.into_inner());
        let layout = Layout::from_size_align(8, 8).unwrap();
        let before = unsafe { System.alloc(layout) };

        let sink = MemorySink::new();
        let guard = session(&sink);
        unsafe { TrackingAllocator::system().dealloc(before, layout) };

        assert!(sink.diagnostics().is_empty());
        assert!(guard.finish().unwrap().is_clean());
    }

    #[test]
    fn test_refused_allocation_returns_null() {
        let _serial = TEST_SESSION.lock().unwrap_or_else(|e| e.into_inner());
        let sink = MemorySink::new();
        let guard = GuardBuilder::new("alloc")
            .sink(Box::new(sink.clone()))
            .caller_frames(0)
            .max_records(0)
            .build();

        let layout = Layout::from_size_align(8, 8).unwrap();
        let ptr = unsafe { TrackingAllocator::system().alloc(layout) };
        assert!(ptr.is_null());
        assert_eq!(guard.tracker().stats().total_allocated, 0);
    }

    #[inline(never)]
    fn allocate_lookup_table(allocator: &TrackingAllocator, layout: Layout) -> *mut u8 {
        unsafe { allocator.alloc(layout) }
    }

    #[test]
    fn test_allocator_frames_are_not_callers() {
        if !crate::resolver::tests::addr2line_available() {
            return;
        }

        let _serial = TEST_SESSION.lock().unwrap_or_else(|e| e.into_inner());
        let sink = MemorySink::new();
        let guard = GuardBuilder::new("alloc")
            .sink(Box::new(sink.clone()))
            .symbolizer(crate::default_symbolizer())
            .caller_frames(2)
            .build();

        let allocator = TrackingAllocator::system();
        let layout = Layout::from_size_align(64, 8).unwrap();
        let ptr = allocate_lookup_table(&allocator, layout);
        unsafe { allocator.dealloc(ptr, layout) };
        drop(guard);

        let diagnostics = sink.diagnostics();
        let caller = diagnostics[0].caller();
        assert_eq!(
            caller.innermost(),
            Some("tests::allocate_lookup_table"),
            "{caller}"
        );
        assert!(
            caller.frames().iter().all(|name| !name.contains("GlobalAlloc")),
            "{caller}"
        );
        assert_eq!(
            diagnostics[1].caller().innermost(),
            Some("tests::test_allocator_frames_are_not_callers")
        );
    }

    #[test]
    fn test_reentry_is_untracked() {
        let _serial = TEST_SESSION.lock().unwrap_or_else(|e| e.into_inner());
        let sink = MemorySink::new();
        let _guard = session(&sink);

        let nested = with_tracker(|_| with_tracker(|_| ()));
        assert_eq!(nested, Some(None));
        assert!(with_tracker(|_| ()).is_some());

        assert_eq!(untracked(|| with_tracker(|_| ())), None);
        assert!(with_tracker(|_| ()).is_some());
    }
}
