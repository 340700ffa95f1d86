//! The tracking allocator: raw primitive + registry + resolver + sink.

use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::alloc::untracked;
use crate::config::TrackerBuilder;
use crate::error::TrackError;
use crate::output::{Diagnostic, Sink};
use crate::raw::RawAlloc;
use crate::registry::{AllocationRecord, Registry, TrackerStats};
use crate::report::LeakReport;
use crate::resolver::{CallerChain, Resolver};
use crate::tid::current_tid;

/// What to do with the underlying block when a release names an address the
/// registry does not know.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InvalidRelease {
    /// Report it, then pass the pointer to the raw `release` anyway. A real
    /// double free therefore still reaches the wrapped allocator.
    #[default]
    Forward,
    /// Report it and leave the pointer alone.
    Skip,
}

/// Where a tracked call entered the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Site {
    /// `Tracker::acquire`/`Tracker::release` or the C entry points.
    Handle,
    /// The `GlobalAlloc` implementation.
    Allocator,
}

impl Site {
    fn skips_allocator_frames(self) -> bool {
        self == Site::Allocator
    }
}

/// Failures met while the registry lock is held. They are logged once the
/// lock is released: a subscriber writing to stderr must not run under it.
#[derive(Default)]
struct Deferred {
    symbolizer: Vec<io::Error>,
    sink: Vec<Box<dyn std::error::Error>>,
}

impl Deferred {
    fn log(self) {
        if let Some(first) = self.symbolizer.first() {
            tracing::debug!(
                error = %first,
                failures = self.symbolizer.len(),
                "memtrail symbolizer failed"
            );
        }
        for e in &self.sink {
            tracing::debug!(error = %e, "memtrail sink rejected a record");
        }
    }
}

/// Live allocation tracker.
///
/// Every tracked operation takes the registry lock, updates the registry,
/// resolves the caller and hands a [`Diagnostic`] to the sink before the lock
/// is released. Tracked traffic is therefore serialized process-wide and the
/// per-operation output of concurrent threads never interleaves.
///
/// The leak report runs once, on [`shutdown`](Tracker::shutdown) or on drop,
/// whichever comes first.
///
/// # Examples
///
/// ```rust
/// use memtrail::{MemorySink, Tracker};
///
/// let sink = MemorySink::new();
/// let tracker = Tracker::builder().sink(Box::new(sink.clone())).build();
///
/// let block = tracker.acquire(16).unwrap();
/// assert_eq!(tracker.stats().active, 1);
///
/// unsafe { tracker.release(block.as_ptr()) };
/// assert_eq!(tracker.stats().active, 0);
///
/// let report = tracker.shutdown().unwrap();
/// assert!(report.is_clean());
/// ```
pub struct Tracker {
    registry: Mutex<Registry>,
    resolver: Resolver,
    sink: Box<dyn Sink>,
    raw: Box<dyn RawAlloc>,
    invalid_release: InvalidRelease,
    quiet: bool,
    finished: AtomicBool,
}

impl Tracker {
    pub fn builder() -> TrackerBuilder {
        TrackerBuilder::new()
    }

    pub(crate) fn from_parts(
        registry: Registry,
        resolver: Resolver,
        sink: Box<dyn Sink>,
        raw: Box<dyn RawAlloc>,
        invalid_release: InvalidRelease,
        quiet: bool,
    ) -> Self {
        Self {
            registry: Mutex::new(registry),
            resolver,
            sink,
            raw,
            invalid_release,
            quiet,
            finished: AtomicBool::new(false),
        }
    }

    /// Allocates `size` bytes from the raw primitive and tracks the block.
    ///
    /// If the block cannot be recorded it is released again before the error
    /// is returned, so a tracking failure never leaks memory.
    #[inline(never)]
    pub fn acquire(&self, size: usize) -> Result<NonNull<u8>, TrackError> {
        let ptr = NonNull::new(self.raw.allocate(size)).ok_or(TrackError::OutOfMemory(size))?;

        match self.record_acquire(ptr.as_ptr() as usize, size, Site::Handle) {
            Ok(_) => Ok(ptr),
            Err(e) => {
                // SAFETY: `ptr` came from this allocator a moment ago.
                unsafe { self.raw.release(ptr.as_ptr()) };
                Err(e)
            }
        }
    }

    /// Stops tracking `ptr` and hands it back to the raw primitive.
    ///
    /// Null is ignored. An address the registry does not know is reported as
    /// an invalid or double free and, under [`InvalidRelease::Forward`],
    /// still released.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a block returned by [`acquire`](Tracker::acquire)
    /// on this tracker that has not been released yet. Under
    /// `InvalidRelease::Forward` any other pointer is passed to the raw
    /// primitive unchanged.
    #[inline(never)]
    pub unsafe fn release(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        let known = self.record_release(ptr as usize, Site::Handle, true).is_some();
        if known || self.invalid_release == InvalidRelease::Forward {
            // SAFETY: forwarded under the caller's contract.
            unsafe { self.raw.release(ptr) };
        }
    }

    /// Adds a block obtained elsewhere to the registry and reports it.
    pub(crate) fn record_acquire(
        &self,
        address: usize,
        size: usize,
        site: Site,
    ) -> Result<u64, TrackError> {
        untracked(|| {
            let mut deferred = Deferred::default();
            let mut registry = self.lock();
            let id = registry.insert(address, size)?;

            if !self.quiet {
                let stats = registry.stats();
                let caller = self.caller(site, &mut deferred);
                self.emit(
                    Diagnostic::Acquire {
                        id,
                        active: stats.active,
                        size,
                        total: stats.total_allocated,
                        address,
                        caller,
                        tid: current_tid(),
                    },
                    &mut deferred,
                );
            }

            drop(registry);
            deferred.log();
            Ok(id)
        })
    }

    /// Removes `address` from the registry and reports the outcome.
    ///
    /// `report_unknown` controls whether a miss produces an invalid release
    /// diagnostic.
    pub(crate) fn record_release(
        &self,
        address: usize,
        site: Site,
        report_unknown: bool,
    ) -> Option<AllocationRecord> {
        untracked(|| {
            let mut deferred = Deferred::default();
            let mut registry = self.lock();
            let removed = registry.remove(address);

            match removed {
                Some(record) if !self.quiet => {
                    let stats = registry.stats();
                    let caller = self.caller(site, &mut deferred);
                    self.emit(
                        Diagnostic::Release {
                            id: record.id,
                            active: stats.active,
                            size: record.size,
                            total: stats.total_allocated,
                            address,
                            caller,
                            tid: current_tid(),
                        },
                        &mut deferred,
                    );
                }
                None if report_unknown => {
                    let caller = self.caller(site, &mut deferred);
                    self.emit(
                        Diagnostic::InvalidRelease {
                            active: registry.len(),
                            address,
                            caller,
                            tid: current_tid(),
                        },
                        &mut deferred,
                    );
                }
                _ => {}
            }

            drop(registry);
            deferred.log();
            removed
        })
    }

    pub fn stats(&self) -> TrackerStats {
        untracked(|| self.lock().stats())
    }

    /// Live records, most recent first.
    pub fn live(&self) -> Vec<AllocationRecord> {
        untracked(|| self.lock().snapshot())
    }

    pub fn is_shut_down(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Runs the leak report. Only the first call reports; later calls return
    /// `None`. Outstanding blocks are listed, never freed.
    pub fn shutdown(&self) -> Option<LeakReport> {
        if self.finished.swap(true, Ordering::AcqRel) {
            return None;
        }

        untracked(|| {
            let mut deferred = Deferred::default();
            let registry = self.lock();
            let report = LeakReport::from_records(registry.snapshot());
            if let Err(e) = self.sink.leak_report(&report) {
                deferred.sink.push(e);
            }
            drop(registry);
            deferred.log();
            tracing::debug!(
                leaks = report.leak_count(),
                bytes = report.total_bytes(),
                "memtrail leak report done"
            );

            Some(report)
        })
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn caller(&self, site: Site, deferred: &mut Deferred) -> CallerChain {
        self.resolver.caller_chain(
            &entry_points(),
            site.skips_allocator_frames(),
            &mut deferred.symbolizer,
        )
    }

    fn emit(&self, diagnostic: Diagnostic, deferred: &mut Deferred) {
        if let Err(e) = self.sink.diagnostic(&diagnostic) {
            deferred.sink.push(e);
        }
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Function start addresses of every way into the tracker. The resolver keeps
/// only frames above the outermost of these.
fn entry_points() -> [usize; 6] {
    let [ffi_malloc, ffi_free] = ffi_entry_points();
    [
        Tracker::acquire as *const () as usize,
        Tracker::release as *const () as usize,
        crate::alloc::track_alloc as *const () as usize,
        crate::alloc::track_dealloc as *const () as usize,
        ffi_malloc,
        ffi_free,
    ]
}

#[cfg(feature = "ffi")]
fn ffi_entry_points() -> [usize; 2] {
    [
        crate::ffi::memtrail_malloc as *const () as usize,
        crate::ffi::memtrail_free as *const () as usize,
    ]
}

#[cfg(not(feature = "ffi"))]
fn ffi_entry_points() -> [usize; 2] {
    [0, 0]
}
