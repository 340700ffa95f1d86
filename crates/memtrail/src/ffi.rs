//! C entry points for tracking a C program's `malloc`/`free` traffic.
//!
//! Enable the `ffi` feature in a `staticlib` or `cdylib` crate that depends on
//! memtrail, link it into the C program and route its calls through these
//! symbols, e.g. with
//! `#define malloc(x) memtrail_malloc(x)` and `#define free(x) memtrail_free(x)`
//! in a debug build. Call `memtrail_init` first thing in `main` to get the leak
//! report at exit.
//!
//! The process-wide tracker is built on first use and reads the usual
//! `MEMTRAIL_*` environment variables.

use std::ffi::c_void;
use std::sync::{Once, OnceLock};

use libc::{c_int, size_t};

use crate::tracker::Tracker;

static TRACKER: OnceLock<Tracker> = OnceLock::new();
static AT_EXIT: Once = Once::new();

fn tracker() -> &'static Tracker {
    TRACKER.get_or_init(|| Tracker::builder().build())
}

/// Builds the tracker and registers the leak report with `atexit`. Returns 0
/// on success, -1 if the exit handler could not be registered. Calling it
/// again is a no-op.
#[no_mangle]
pub extern "C" fn memtrail_init() -> c_int {
    tracker();

    let mut status = 0;
    AT_EXIT.call_once(|| {
        // SAFETY: registers a plain `extern "C"` function without arguments.
        if unsafe { libc::atexit(report_at_exit) } != 0 {
            tracing::warn!("memtrail could not register its exit handler");
            status = -1;
        }
    });
    status
}

extern "C" fn report_at_exit() {
    memtrail_check_leaks();
}

/// Tracked `malloc`. Returns null when the block cannot be allocated or
/// recorded.
#[no_mangle]
#[inline(never)]
pub extern "C" fn memtrail_malloc(size: size_t) -> *mut c_void {
    match tracker().acquire(size) {
        Ok(ptr) => ptr.as_ptr().cast(),
        Err(e) => {
            tracing::debug!(error = %e, size, "memtrail_malloc failed");
            std::ptr::null_mut()
        }
    }
}

/// Tracked `free`.
///
/// # Safety
///
/// `ptr` must be null or come from `memtrail_malloc`. Unknown pointers are
/// reported and still passed to `free` unless `InvalidRelease::Skip` is in
/// effect.
#[no_mangle]
#[inline(never)]
pub unsafe extern "C" fn memtrail_free(ptr: *mut c_void) {
    unsafe { tracker().release(ptr.cast()) }
}

/// Prints the leak report and returns the number of leaked blocks. Only the
/// first call reports; later calls return 0.
#[no_mangle]
pub extern "C" fn memtrail_check_leaks() -> size_t {
    tracker()
        .shutdown()
        .map(|report| report.leak_count())
        .unwrap_or(0)
}
