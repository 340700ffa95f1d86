//! Attributes an acquire or release to the functions that made it.
//!
//! Each kept stack frame is first rendered as a loader symbol line
//! (`module(symbol+0xoff) [0xip]` or `module(+0xoff) [0xip]`), then resolved
//! in order of preference:
//!
//! 1. the symbol name embedded in that line,
//! 2. the external [`Symbolizer`] fed with the module-relative offset,
//! 3. the basename of the module.
//!
//! Frames that yield nothing are dropped. Resolution never fails the calling
//! operation; the worst outcome is an empty chain, shown as `unknown`.
//!
//! For calls made through the global allocator, the allocator plumbing right
//! above the entry point (`__rust_alloc`, `alloc::`/`core::`/`std::`
//! internals, the allocator impl itself) is skipped so the chain starts at
//! the code that asked for memory.

mod frame;
mod symbolizer;

pub use symbolizer::{
    default_symbolizer, platform_symbolizer, Addr2Line, Atos, NoSymbolizer, Symbolizer,
};

use serde::Serialize;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use crate::output::shorten_function_name;

/// Outer caller frames kept per operation unless configured otherwise.
pub const DEFAULT_CALLER_FRAMES: usize = 3;

const CHAIN_SEPARATOR: &str = " → ";
const UNKNOWN_CALLER: &str = "unknown";

/// Leading path segments of frames that belong to the allocation path
/// between user code and the global allocator.
const ALLOCATOR_PLUMBING: &[&str] = &[
    "__rust_",
    "__rg_",
    "__rdl_",
    "__rustc::",
    "alloc::",
    "core::",
    "std::",
    "hashbrown::",
    "memtrail::alloc::TrackingAllocator",
];

/// Resolved function names, outermost caller first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CallerChain(Vec<String>);

impl CallerChain {
    pub fn new(outer_to_inner: Vec<String>) -> Self {
        Self(outer_to_inner)
    }

    pub fn frames(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The function that called into the tracker directly.
    pub fn innermost(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    pub fn separator() -> &'static str {
        CHAIN_SEPARATOR
    }
}

impl fmt::Display for CallerChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str(UNKNOWN_CALLER);
        }
        f.write_str(&self.0.join(CHAIN_SEPARATOR))
    }
}

pub struct Resolver {
    symbolizer: Box<dyn Symbolizer>,
    executable: Option<PathBuf>,
    caller_frames: usize,
}

impl Resolver {
    pub fn new(symbolizer: Box<dyn Symbolizer>, caller_frames: usize) -> Self {
        Self {
            symbolizer,
            executable: std::env::current_exe().ok(),
            caller_frames,
        }
    }

    /// Captures the current stack and resolves the callers sitting above the
    /// outermost tracker entry point.
    ///
    /// With `skip_allocator`, allocator plumbing frames directly above the
    /// entry point are not counted as callers. Symbolizer failures are pushed
    /// to `failures` for the caller to log once the registry lock is released.
    pub(crate) fn caller_chain(
        &self,
        entry_points: &[usize],
        skip_allocator: bool,
        failures: &mut Vec<io::Error>,
    ) -> CallerChain {
        if self.caller_frames == 0 {
            return CallerChain::default();
        }

        let stack = frame::Stack::capture();
        let names = stack.callers(entry_points).into_iter().map(|site| {
            frame::symbol_text(site).and_then(|text| self.resolve_frame(&text, failures))
        });
        let mut names = keep_callers(names, skip_allocator, self.caller_frames);

        // captured innermost first
        names.reverse();
        CallerChain(names)
    }

    /// Resolves one loader symbol line to a full, demangled function name.
    pub(crate) fn resolve_frame(
        &self,
        text: &str,
        failures: &mut Vec<io::Error>,
    ) -> Option<String> {
        if let Some(symbol) = parse_symbol(text) {
            return Some(full_name(symbol));
        }

        if let Some(offset) = parse_offset(text) {
            if let Some(binary) = self.binary_for(text) {
                match self.symbolizer.symbolize(&binary, offset) {
                    Ok(Some(name)) => return Some(full_name(&name)),
                    Ok(None) => {}
                    Err(e) => failures.push(e),
                }
            }
        }

        parse_module_basename(text).map(str::to_string)
    }

    fn binary_for(&self, text: &str) -> Option<PathBuf> {
        match parse_module(text) {
            Some(module) if Path::new(module).is_absolute() => Some(PathBuf::from(module)),
            _ => self.executable.clone(),
        }
    }
}

/// Name between the last `(` and the `+offset` marker that follows it.
fn parse_symbol(text: &str) -> Option<&str> {
    let open = text.rfind('(')?;
    let rest = &text[open + 1..];
    let name = &rest[..rest.find('+')?];
    (!name.is_empty()).then_some(name)
}

/// Hex offset of a frame that carries no symbol, e.g. `0x1a2b` in `app(+0x1a2b)`.
fn parse_offset(text: &str) -> Option<&str> {
    let start = text.find("(+0x")? + 2;
    let len = text[start..].find(')')?;
    Some(&text[start..start + len])
}

fn parse_module(text: &str) -> Option<&str> {
    let module = &text[..text.find('(')?];
    (!module.is_empty()).then_some(module)
}

fn parse_module_basename(text: &str) -> Option<&str> {
    let base = parse_module(text)?.rsplit('/').next()?;
    (!base.is_empty()).then_some(base)
}

/// Takes up to `max` resolved names, innermost first, and shortens them for
/// display. Unresolved frames are dropped. With `skip_allocator`, leading
/// allocator plumbing is dropped before counting.
fn keep_callers(
    names: impl Iterator<Item = Option<String>>,
    skip_allocator: bool,
    max: usize,
) -> Vec<String> {
    names
        .flatten()
        .skip_while(|name| skip_allocator && is_allocator_plumbing(name))
        .take(max)
        .map(|name| shorten_function_name(&name))
        .collect()
}

fn is_allocator_plumbing(name: &str) -> bool {
    let name = name.trim_start_matches('<');
    ALLOCATOR_PLUMBING
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

fn full_name(raw: &str) -> String {
    let demangled = format!("{:#}", backtrace::SymbolName::new(raw.as_bytes()));
    strip_hash(&demangled).to_string()
}

/// Drops a trailing `::h0123456789abcdef` disambiguator.
fn strip_hash(name: &str) -> &str {
    match name.rsplit_once("::") {
        Some((head, tail))
            if tail.len() == 17
                && tail.starts_with('h')
                && tail[1..].chars().all(|c| c.is_ascii_hexdigit()) =>
        {
            head
        }
        _ => name,
    }
}
