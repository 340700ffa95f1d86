use eyre::{eyre, Result};

#[inline(never)]
fn churn(tracker: &memtrail::Tracker, rounds: usize) -> Result<()> {
    let mut blocks = Vec::with_capacity(rounds);
    for round in 0..rounds {
        blocks.push(tracker.acquire(8 << (round % 4))?);
    }
    for block in blocks {
        unsafe { tracker.release(block.as_ptr()) };
    }
    Ok(())
}

#[memtrail::main(caller_frames = 2)]
fn main() -> Result<()> {
    let tracker = memtrail::active().ok_or_else(|| eyre!("no memtrail session"))?;

    churn(&tracker, 6)?;
    // releasing null is a no-op
    unsafe { tracker.release(std::ptr::null_mut()) };

    Ok(())
}
