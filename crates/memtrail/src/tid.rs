//! OS-level thread ids attached to every diagnostic.

use std::cell::Cell;

thread_local! {
    static CACHED_TID: Cell<u64> = const { Cell::new(0) };
}

/// Kernel thread id of the calling thread.
///
/// The value is cached per thread after the first lookup. Returns 0 while the
/// thread-local slot is unavailable (thread teardown).
#[inline]
pub fn current_tid() -> u64 {
    CACHED_TID
        .try_with(|cached| {
            if cached.get() == 0 {
                cached.set(os_tid());
            }
            cached.get()
        })
        .unwrap_or(0)
}

#[cfg(target_os = "linux")]
#[inline]
fn os_tid() -> u64 {
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

#[cfg(target_os = "macos")]
#[inline]
fn os_tid() -> u64 {
    unsafe {
        let pthread = libc::pthread_self();
        libc::pthread_mach_thread_np(pthread) as u64
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
#[inline]
fn os_tid() -> u64 {
    unsafe { libc::pthread_self() as usize as u64 }
}
