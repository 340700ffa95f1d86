use std::ffi::CStr;

/// Frames captured per operation. Large enough to reach past the tracker's
/// own frames plus the kept callers.
pub(crate) const CAPTURE_DEPTH: usize = 32;

/// Frames dropped when no entry point shows up in the capture: the unwinder,
/// `Stack::capture`, the resolver and the recording call.
const FALLBACK_SKIP: usize = 4;

#[derive(Clone, Copy, Default)]
struct RawFrame {
    ip: usize,
    symbol: usize,
}

/// Fixed-size stack capture; taking it never allocates.
pub(crate) struct Stack {
    frames: [RawFrame; CAPTURE_DEPTH],
    len: usize,
}

impl Stack {
    #[inline(always)]
    pub(crate) fn capture() -> Self {
        let mut stack = Stack {
            frames: [RawFrame::default(); CAPTURE_DEPTH],
            len: 0,
        };

        // SAFETY: the unsynchronized walker only races with other walkers on
        // platforms using dbghelp. Taking backtrace's global lock here could
        // deadlock against a thread that holds it while allocating.
        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                stack.frames[stack.len] = RawFrame {
                    ip: frame.ip() as usize,
                    symbol: frame.symbol_address() as usize,
                };
                stack.len += 1;
                stack.len < CAPTURE_DEPTH
            });
        }

        stack
    }

    #[cfg(test)]
    fn from_frames(frames: &[(usize, usize)]) -> Self {
        let mut stack = Stack {
            frames: [RawFrame::default(); CAPTURE_DEPTH],
            len: frames.len().min(CAPTURE_DEPTH),
        };
        for (slot, &(ip, symbol)) in stack.frames.iter_mut().zip(frames) {
            *slot = RawFrame { ip, symbol };
        }
        stack
    }

    /// Frames above the outermost frame whose function start is one of
    /// `entry_points`, innermost first.
    pub(crate) fn callers(&self, entry_points: &[usize]) -> Vec<CallSite> {
        let frames = &self.frames[..self.len];
        let start = frames
            .iter()
            .rposition(|frame| frame.symbol != 0 && entry_points.contains(&frame.symbol))
            .map_or(FALLBACK_SKIP, |index| index + 1);

        frames
            .iter()
            .enumerate()
            .skip(start)
            .map(|(index, frame)| CallSite::new(frame.ip, index == 0))
            .collect()
    }
}

/// One caller frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CallSite {
    /// Return address as unwound.
    pub(crate) ip: usize,
    /// Address used for symbol lookup. For every frame but the innermost one
    /// `ip` points past the call instruction, possibly into the next inlined
    /// function, so the lookup steps back one byte.
    pub(crate) lookup: usize,
}

impl CallSite {
    fn new(ip: usize, innermost: bool) -> Self {
        let lookup = if innermost { ip } else { ip.saturating_sub(1) };
        Self { ip, lookup }
    }
}

/// Renders a frame the way the loader describes it:
/// `module(symbol+0xoff) [0xip]`, or `module(+0xoff) [0xip]` when the
/// address has no exported symbol. Offsets are taken from the lookup address.
pub(crate) fn symbol_text(site: CallSite) -> Option<String> {
    let CallSite { ip, lookup } = site;

    // SAFETY: Dl_info is plain data; all-zero is a valid "nothing found" value.
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };

    // SAFETY: dladdr only reads loader tables and writes into `info`.
    if unsafe { libc::dladdr(lookup as *const libc::c_void, &mut info) } == 0 {
        return None;
    }

    let module = if info.dli_fname.is_null() {
        String::new()
    } else {
        // SAFETY: dladdr returned a NUL-terminated path owned by the loader.
        unsafe { CStr::from_ptr(info.dli_fname) }
            .to_string_lossy()
            .into_owned()
    };

    if !info.dli_sname.is_null() && !info.dli_saddr.is_null() {
        // SAFETY: as above, for the symbol name.
        let symbol = unsafe { CStr::from_ptr(info.dli_sname) }.to_string_lossy();
        let offset = lookup.wrapping_sub(info.dli_saddr as usize);
        Some(format!("{module}({symbol}+{offset:#x}) [{ip:#x}]"))
    } else {
        let offset = lookup.wrapping_sub(info.dli_fbase as usize);
        Some(format!("{module}(+{offset:#x}) [{ip:#x}]"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENTRY: usize = 0xe000;

    fn ips(sites: Vec<CallSite>) -> Vec<usize> {
        sites.into_iter().map(|site| site.ip).collect()
    }

    #[test]
    fn test_callers_start_above_outermost_entry_point() {
        let stack = Stack::from_frames(&[
            (0x1, 0x100),
            (0xe010, ENTRY),
            (0x2, 0x200),
            (0xe020, ENTRY),
            (0x10, 0x1000),
            (0x20, 0x2000),
            (0x30, 0x3000),
        ]);
        assert_eq!(ips(stack.callers(&[ENTRY])), vec![0x10, 0x20, 0x30]);
    }

    #[test]
    fn test_callers_look_up_the_call_instruction() {
        let stack = Stack::from_frames(&[(0xe010, ENTRY), (0x1234, 0x1000)]);
        assert_eq!(
            stack.callers(&[ENTRY]),
            vec![CallSite {
                ip: 0x1234,
                lookup: 0x1233
            }]
        );

        assert_eq!(CallSite::new(0x50, true).lookup, 0x50);
        assert_eq!(CallSite::new(0, false).lookup, 0);
    }

    #[test]
    fn test_callers_fall_back_to_fixed_skip() {
        let frames: Vec<(usize, usize)> = (1..=8).map(|i| (i, 0)).collect();
        let stack = Stack::from_frames(&frames);
        assert_eq!(ips(stack.callers(&[ENTRY])), vec![5, 6, 7, 8]);
    }

    #[test]
    fn test_unknown_symbol_address_never_matches() {
        let stack = Stack::from_frames(&[(0x1, 0), (0x2, 0), (0x3, 0), (0x4, 0), (0x5, 0)]);
        assert_eq!(ips(stack.callers(&[0])), vec![0x5]);
    }

    #[test]
    fn test_capture_sees_frames() {
        let stack = Stack::capture();
        assert!(stack.len > 0);
        assert!(stack.len <= CAPTURE_DEPTH);
    }

    #[test]
    fn test_symbol_text_for_known_function() {
        let ip = test_symbol_text_for_known_function as *const () as usize;
        let text = symbol_text(CallSite::new(ip, true)).expect("own code is mapped");
        assert!(text.contains('('));
        assert!(text.ends_with(&format!("[{ip:#x}]")));
    }

    #[test]
    fn test_symbol_text_keeps_return_address() {
        let entry = test_symbol_text_keeps_return_address as *const () as usize;
        let site = CallSite::new(entry + 8, false);
        let text = symbol_text(site).expect("own code is mapped");
        assert!(text.ends_with(&format!("[{:#x}]", entry + 8)));
    }
}
