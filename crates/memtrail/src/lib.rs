//! Allocation tracking with caller attribution and a leak report at shutdown.
//!
//! Every tracked acquire and release updates a live registry, resolves a
//! short caller chain from the stack and is reported through a [`Sink`].
//! Whatever is still live when the tracker shuts down is reported as a leak.
//!
//! Three ways in:
//!
//! * a [`Tracker`] handle with explicit [`acquire`](Tracker::acquire) and
//!   [`release`](Tracker::release);
//! * a session guard ([`GuardBuilder`] or [`macro@main`]) with the
//!   `global-alloc` feature, which tracks every heap allocation of the
//!   program while the guard is alive;
//! * C entry points (`memtrail_malloc`, `memtrail_free`) with the `ffi`
//!   feature.
//!
//! ```rust
//! use memtrail::{InvalidRelease, MemorySink, Tracker};
//!
//! let sink = MemorySink::new();
//! let tracker = Tracker::builder()
//!     .sink(Box::new(sink.clone()))
//!     .invalid_release(InvalidRelease::Skip)
//!     .build();
//!
//! let a = tracker.acquire(16).unwrap();
//! let _b = tracker.acquire(32).unwrap();
//! unsafe {
//!     tracker.release(a.as_ptr());
//!     tracker.release(a.as_ptr()); // reported as an invalid release
//! }
//!
//! let report = tracker.shutdown().unwrap();
//! assert_eq!(report.leak_count(), 1);
//! assert_eq!(report.total_bytes(), 32);
//! ```

pub use memtrail_macros::main;

mod alloc;
mod config;
mod error;
#[cfg(feature = "ffi")]
pub mod ffi;
mod guard;
mod output;
mod raw;
mod registry;
mod report;
mod resolver;
pub mod sinks;
pub(crate) mod tid;
mod tracker;

pub use alloc::TrackingAllocator;
pub use config::TrackerBuilder;
pub use error::TrackError;
pub use guard::{active, GuardBuilder, MemTrail};
pub use output::{format_bytes, shorten_function_name, Diagnostic, Format, Sink};
pub use raw::{Malloc, RawAlloc};
pub use registry::{AllocationRecord, TrackerStats};
pub use report::LeakReport;
pub use resolver::{
    default_symbolizer, platform_symbolizer, Addr2Line, Atos, CallerChain, NoSymbolizer,
    Symbolizer,
};
pub use sinks::{JsonSink, MemorySink, TerminalSink};
pub use tracker::{InvalidRelease, Tracker};

#[cfg(feature = "global-alloc")]
#[global_allocator]
static GLOBAL: TrackingAllocator = TrackingAllocator::system();
