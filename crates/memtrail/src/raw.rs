//! The allocation primitives the tracker wraps.

/// A malloc/free style allocator.
///
/// # Safety
///
/// `allocate` must return null or a pointer that stays valid until passed to
/// `release`, and no two live blocks may share an address.
pub unsafe trait RawAlloc: Send + Sync {
    fn allocate(&self, size: usize) -> *mut u8;

    /// # Safety
    ///
    /// `ptr` must be non-null. Passing a pointer this allocator did not hand
    /// out, or one already released, is whatever the underlying allocator
    /// makes of it.
    unsafe fn release(&self, ptr: *mut u8);
}

/// The C library's `malloc`/`free`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Malloc;

// SAFETY: forwards to the platform allocator, which upholds the contract.
unsafe impl RawAlloc for Malloc {
    #[inline]
    fn allocate(&self, size: usize) -> *mut u8 {
        unsafe { libc::malloc(size).cast() }
    }

    #[inline]
    unsafe fn release(&self, ptr: *mut u8) {
        unsafe { libc::free(ptr.cast()) }
    }
}
