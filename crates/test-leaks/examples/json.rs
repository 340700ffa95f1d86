use eyre::{ensure, Result};
use memtrail::{Format, InvalidRelease, Tracker};

fn main() -> Result<()> {
    let tracker = Tracker::builder()
        .format(Format::Json)
        .invalid_release(InvalidRelease::Skip)
        .caller_frames(1)
        .build();

    let _kept = tracker.acquire(24)?;
    let freed = tracker.acquire(40)?;
    unsafe {
        tracker.release(freed.as_ptr());
        tracker.release(freed.as_ptr());
    }

    let leaks = tracker.shutdown().map(|report| report.leak_count());
    ensure!(leaks == Some(1), "expected one leak, got {leaks:?}");
    Ok(())
}
