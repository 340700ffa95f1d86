//! A small map-parsing scene whose buffers all come from a memtrail
//! [`Tracker`]. The examples use it to produce realistic acquire/release
//! traffic, leaks included.

use std::ffi::CStr;
use std::os::fd::RawFd;
use std::ptr::{self, NonNull};

use memtrail::{TrackError, Tracker};

/// Status returned by failed parsing steps.
pub const ERROR: i32 = 1;

/// Map rows as nul-terminated byte strings behind a tracked row table.
pub struct MapGrid {
    grid: *mut *mut u8,
    height: usize,
}

impl MapGrid {
    pub fn empty() -> Self {
        Self {
            grid: ptr::null_mut(),
            height: 0,
        }
    }

    /// Copies `lines` into tracked row buffers. On failure everything
    /// acquired so far is released again.
    pub fn from_lines(tracker: &Tracker, lines: &[&str]) -> Result<Self, TrackError> {
        let table_size = lines.len().max(1) * std::mem::size_of::<*mut u8>();
        let table = tracker.acquire(table_size)?.as_ptr().cast::<*mut u8>();
        for i in 0..lines.len() {
            // SAFETY: the table holds `lines.len()` pointer slots.
            unsafe { table.add(i).write(ptr::null_mut()) };
        }

        let mut map = Self {
            grid: table,
            height: lines.len(),
        };
        for (i, line) in lines.iter().enumerate() {
            match copy_string(tracker, line) {
                // SAFETY: `i < height`.
                Ok(row) => unsafe { map.grid.add(i).write(row.as_ptr()) },
                Err(e) => {
                    free_map(tracker, Some(&mut map));
                    return Err(e);
                }
            }
        }
        Ok(map)
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn is_released(&self) -> bool {
        self.grid.is_null()
    }

    pub fn row(&self, index: usize) -> Option<&str> {
        if self.grid.is_null() || index >= self.height {
            return None;
        }
        // SAFETY: `index < height`, and non-null rows are nul-terminated.
        let row = unsafe { self.grid.add(index).read() };
        read_string(row)
    }

    /// Drops one row early, leaving a hole.
    pub fn release_row(&mut self, tracker: &Tracker, index: usize) {
        if self.grid.is_null() || index >= self.height {
            return;
        }
        // SAFETY: `index < height`; the slot is nulled after the release.
        unsafe {
            let slot = self.grid.add(index);
            tracker.release(slot.read());
            slot.write(ptr::null_mut());
        }
    }
}

/// Releases every row, then the row table. A missing map, a released map or
/// holes in the grid are fine.
pub fn free_map(tracker: &Tracker, map: Option<&mut MapGrid>) {
    let Some(map) = map else {
        return;
    };
    if map.grid.is_null() {
        return;
    }

    for i in 0..map.height {
        // SAFETY: `i < height`; null rows are skipped by `release`.
        unsafe { tracker.release(map.grid.add(i).read()) };
    }
    // SAFETY: the table came from `tracker` and is released once.
    unsafe { tracker.release(map.grid.cast()) };
    map.grid = ptr::null_mut();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb {
    pub r: i32,
    pub g: i32,
    pub b: i32,
}

impl Rgb {
    pub const UNSET: Rgb = Rgb {
        r: -1,
        g: -1,
        b: -1,
    };

    pub fn new(r: i32, g: i32, b: i32) -> Self {
        Self { r, g, b }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    North,
    South,
    West,
    East,
}

/// Wall texture paths and the floor/ceiling colors.
pub struct Textures {
    paths: [Option<NonNull<u8>>; 4],
    pub floor: Rgb,
    pub ceiling: Rgb,
}

impl Textures {
    pub fn new() -> Self {
        Self {
            paths: [None; 4],
            floor: Rgb::UNSET,
            ceiling: Rgb::UNSET,
        }
    }

    /// Stores a tracked copy of `path`. A path set twice keeps the first copy
    /// alive, which is exactly the kind of leak memtrail reports.
    pub fn set_path(&mut self, tracker: &Tracker, side: Side, path: &str) -> Result<(), TrackError> {
        self.paths[side as usize] = Some(copy_string(tracker, path)?);
        Ok(())
    }

    pub fn path(&self, side: Side) -> Option<&str> {
        read_string(self.paths[side as usize]?.as_ptr())
    }
}

impl Default for Textures {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases the four paths, clears them and resets both colors to
/// [`Rgb::UNSET`].
pub fn free_textures(tracker: &Tracker, textures: &mut Textures) {
    for path in textures.paths.iter_mut() {
        if let Some(block) = path.take() {
            // SAFETY: every stored path came from `tracker`.
            unsafe { tracker.release(block.as_ptr()) };
        }
    }
    textures.floor = Rgb::UNSET;
    textures.ceiling = Rgb::UNSET;
}

/// Line reader over a file descriptor, one line per call.
#[derive(Debug, Default)]
pub struct LineReader {
    pending: Vec<u8>,
}

impl LineReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next line from `fd` without its newline. Passing `-1` drops whatever
    /// is buffered and returns `None`.
    pub fn next_line(&mut self, fd: RawFd) -> Option<String> {
        if fd < 0 {
            self.pending.clear();
            return None;
        }

        loop {
            if let Some(end) = self.pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.pending.drain(..=end).take(end).collect();
                return Some(String::from_utf8_lossy(&line).into_owned());
            }

            let mut chunk = [0u8; 64];
            // SAFETY: `chunk` is valid for its full length.
            let read = unsafe { libc::read(fd, chunk.as_mut_ptr().cast(), chunk.len()) };
            if read <= 0 {
                if self.pending.is_empty() {
                    return None;
                }
                let line = std::mem::take(&mut self.pending);
                return Some(String::from_utf8_lossy(&line).into_owned());
            }
            self.pending.extend_from_slice(&chunk[..read as usize]);
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Closes `fd`, resets `reader` and returns [`ERROR`].
pub fn cleanup_parsing(fd: RawFd, reader: &mut LineReader) -> i32 {
    // SAFETY: closing a descriptor we were handed; errors are irrelevant here.
    unsafe { libc::close(fd) };
    reader.next_line(-1);
    ERROR
}

pub struct Scene {
    pub map: MapGrid,
    pub textures: Textures,
}

/// Releases everything `scene` owns and, for a valid `fd`, closes it and
/// resets `reader`.
pub fn clean_all(tracker: &Tracker, scene: Option<&mut Scene>, fd: RawFd, reader: &mut LineReader) {
    if let Some(scene) = scene {
        free_map(tracker, Some(&mut scene.map));
        free_textures(tracker, &mut scene.textures);
    }
    if fd >= 0 {
        cleanup_parsing(fd, reader);
    }
}

fn copy_string(tracker: &Tracker, value: &str) -> Result<NonNull<u8>, TrackError> {
    let block = tracker.acquire(value.len() + 1)?;
    // SAFETY: the block holds `len + 1` bytes.
    unsafe {
        ptr::copy_nonoverlapping(value.as_ptr(), block.as_ptr(), value.len());
        block.as_ptr().add(value.len()).write(0);
    }
    Ok(block)
}

fn read_string<'a>(ptr: *const u8) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: non-null strings stored by this module are nul-terminated.
    unsafe { CStr::from_ptr(ptr.cast()) }.to_str().ok()
}
