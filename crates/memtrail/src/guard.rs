use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwapOption;

use crate::alloc::untracked;
use crate::config::TrackerBuilder;
use crate::output::{Format, Sink};
use crate::report::LeakReport;
use crate::resolver::Symbolizer;
use crate::tracker::{InvalidRelease, Tracker};

/// Process-wide slot for the tracker of the live session, if any. Read on
/// every allocation in global allocator mode.
static ACTIVE: OnceLock<ArcSwapOption<Tracker>> = OnceLock::new();

/// Serializes tests that open a session.
#[cfg(test)]
pub(crate) static TEST_SESSION: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// The tracker of the live session.
pub fn active() -> Option<Arc<Tracker>> {
    untracked(|| ACTIVE.get()?.load_full())
}

/// Builder for a memtrail session guard.
///
/// The guard installs its tracker in a process-wide slot, where the global
/// allocator (feature `global-alloc`) picks it up, and runs the leak report
/// when it is dropped.
///
/// # Examples
///
/// ```rust
/// use memtrail::{Format, GuardBuilder};
///
/// let guard = GuardBuilder::new("main")
///     .format(Format::Table)
///     .caller_frames(2)
///     .build();
///
/// let block = guard.tracker().acquire(64).unwrap();
/// unsafe { guard.tracker().release(block.as_ptr()) };
/// ```
///
/// # Limitations
///
/// Only one guard can be alive at a time. Building a second one, directly or
/// through the [`main`](crate::main) macro, panics.
pub struct GuardBuilder {
    caller_name: &'static str,
    tracker: TrackerBuilder,
}

impl GuardBuilder {
    pub fn new(caller_name: &'static str) -> Self {
        Self {
            caller_name,
            tracker: TrackerBuilder::new(),
        }
    }

    pub fn format(mut self, format: Format) -> Self {
        self.tracker = self.tracker.format(format);
        self
    }

    pub fn sink(mut self, sink: Box<dyn Sink>) -> Self {
        self.tracker = self.tracker.sink(sink);
        self
    }

    pub fn symbolizer(mut self, symbolizer: Box<dyn Symbolizer>) -> Self {
        self.tracker = self.tracker.symbolizer(symbolizer);
        self
    }

    pub fn caller_frames(mut self, caller_frames: usize) -> Self {
        self.tracker = self.tracker.caller_frames(caller_frames);
        self
    }

    pub fn invalid_release(mut self, policy: InvalidRelease) -> Self {
        self.tracker = self.tracker.invalid_release(policy);
        self
    }

    pub fn max_records(mut self, max_records: usize) -> Self {
        self.tracker = self.tracker.max_records(max_records);
        self
    }

    pub fn quiet(mut self, quiet: bool) -> Self {
        self.tracker = self.tracker.quiet(quiet);
        self
    }

    /// Builds the tracker and makes it the active one.
    ///
    /// # Panics
    ///
    /// Panics if another guard is still alive.
    pub fn build(self) -> MemTrail {
        let slot = ACTIVE.get_or_init(|| ArcSwapOption::from(None));

        if slot.load().is_some() {
            panic!("More than one memtrail guard cannot be alive at the same time.");
        }

        let tracker = Arc::new(self.tracker.build());
        slot.store(Some(Arc::clone(&tracker)));
        tracing::info!(session = self.caller_name, "memtrail session started");

        MemTrail {
            caller_name: self.caller_name,
            tracker,
        }
    }
}

/// A live memtrail session. Dropping it deactivates the tracker and prints
/// the leak report.
pub struct MemTrail {
    caller_name: &'static str,
    tracker: Arc<Tracker>,
}

impl MemTrail {
    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub fn caller_name(&self) -> &'static str {
        self.caller_name
    }

    /// Ends the session now and returns the leak report.
    pub fn finish(self) -> Option<LeakReport> {
        self.stop()
    }

    fn stop(&self) -> Option<LeakReport> {
        if let Some(slot) = ACTIVE.get() {
            slot.store(None);
        }

        let report = self.tracker.shutdown()?;
        tracing::info!(
            session = self.caller_name,
            leaks = report.leak_count(),
            "memtrail session finished"
        );
        Some(report)
    }
}

impl Drop for MemTrail {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(all(test, not(feature = "global-alloc")))]
mod tests {
    use super::*;
    use crate::sinks::MemorySink;
    use crate::NoSymbolizer;

    fn guard(sink: &MemorySink) -> MemTrail {
        GuardBuilder::new("test")
            .sink(Box::new(sink.clone()))
            .symbolizer(Box::new(NoSymbolizer))
            .caller_frames(0)
            .build()
    }

    #[test]
    fn test_guard_activates_and_reports_on_drop() {
        let _serial = TEST_SESSION.lock().unwrap_or_else(|e| e.into_inner());
        let sink = MemorySink::new();

        let session = guard(&sink);
        let current = active().unwrap();
        assert!(Arc::ptr_eq(&current, &session.tracker));
        drop(current);

        let block = session.tracker().acquire(24).unwrap();
        drop(session);

        assert!(active().is_none());
        let reports = sink.leak_reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].total_bytes(), 24);

        unsafe { libc::free(block.as_ptr().cast()) };
    }

    #[test]
    fn test_finish_returns_report_once() {
        let _serial = TEST_SESSION.lock().unwrap_or_else(|e| e.into_inner());
        let sink = MemorySink::new();

        let report = guard(&sink).finish().unwrap();
        assert!(report.is_clean());
        assert_eq!(sink.leak_reports().len(), 1);
    }

    #[test]
    fn test_second_guard_panics() {
        let _serial = TEST_SESSION.lock().unwrap_or_else(|e| e.into_inner());
        let sink = MemorySink::new();

        let first = guard(&sink);
        let second = std::panic::catch_unwind(|| guard(&MemorySink::new()));
        assert!(second.is_err());
        drop(first);

        // the slot is free again
        drop(guard(&sink));
        assert_eq!(sink.leak_reports().len(), 2);
    }
}
