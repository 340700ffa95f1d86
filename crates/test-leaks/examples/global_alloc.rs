use std::hint::black_box;

#[inline(never)]
fn build_lookup() -> &'static mut [u8] {
    Box::leak(vec![7u8; 1000].into_boxed_slice())
}

#[inline(never)]
fn scratch_work() -> u64 {
    let scratch: Vec<u64> = (0..64).collect();
    scratch.iter().sum()
}

#[memtrail::main(quiet = true)]
fn main() {
    let lookup = build_lookup();
    black_box(scratch_work());
    black_box(lookup);
}
