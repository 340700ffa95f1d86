use std::ptr::NonNull;

use eyre::Result;
use memtrail::{InvalidRelease, Tracker};
use tracing_subscriber::EnvFilter;

#[inline(never)]
fn load_header(tracker: &Tracker) -> Result<NonNull<u8>> {
    Ok(tracker.acquire(16)?)
}

#[inline(never)]
fn load_body(tracker: &Tracker) -> Result<NonNull<u8>> {
    Ok(tracker.acquire(32)?)
}

#[inline(never)]
fn discard(tracker: &Tracker, block: NonNull<u8>) {
    unsafe { tracker.release(block.as_ptr()) };
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    // A double free must not reach the real allocator.
    let tracker = Tracker::builder()
        .invalid_release(InvalidRelease::Skip)
        .build();

    let header = load_header(&tracker)?;
    let _body = load_body(&tracker)?;

    discard(&tracker, header);
    discard(&tracker, header);

    let stats = tracker.stats();
    tracing::info!(active = stats.active, total = stats.total_allocated, "before shutdown");

    // `_body` is still live and shows up in the report
    drop(tracker);
    Ok(())
}
