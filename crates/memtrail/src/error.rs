use thiserror::Error;

/// Reasons a tracked acquire can fail.
///
/// Every variant leaves the process exactly as it was before the call: if the
/// raw primitive succeeded but bookkeeping did not, the raw block has already
/// been handed back to the primitive.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TrackError {
    /// The wrapped primitive returned null.
    #[error("raw allocation of {0} bytes failed")]
    OutOfMemory(usize),
    /// The configured record cap was reached.
    #[error("registry is full ({0} live records)")]
    RegistryFull(usize),
    /// Storage for the allocation record itself could not be obtained.
    #[error("could not obtain storage for the allocation record")]
    MetadataExhausted,
}
