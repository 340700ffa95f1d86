use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Upper bound on bytes read from a symbolizer's stdout.
const OUTPUT_LIMIT: u64 = 256;

/// What symbolizers print when they cannot name an address.
const UNKNOWN_MARKER: &str = "??";

/// Maps a module-relative offset to a function name.
///
/// Implementations must not call back into the tracker or log: they run while
/// its lock is held. `Ok(None)` means the address has no name; an error means
/// the symbolizer itself could not run.
pub trait Symbolizer: Send + Sync {
    /// `offset` is hexadecimal with a `0x` prefix.
    fn symbolize(&self, binary: &Path, offset: &str) -> io::Result<Option<String>>;
}

/// `addr2line -f -C -e <binary> <offset>`, first output line.
#[derive(Debug, Clone)]
pub struct Addr2Line {
    program: PathBuf,
}

impl Addr2Line {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for Addr2Line {
    fn default() -> Self {
        Self::new("addr2line")
    }
}

impl Symbolizer for Addr2Line {
    fn symbolize(&self, binary: &Path, offset: &str) -> io::Result<Option<String>> {
        let mut command = Command::new(&self.program);
        command.args(["-f", "-C", "-e"]).arg(binary).arg(offset);
        first_line(command)
    }
}

/// `atos -o <binary> <offset>`; keeps the name before ` (in <module>)`.
#[derive(Debug, Clone)]
pub struct Atos {
    program: PathBuf,
}

impl Atos {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for Atos {
    fn default() -> Self {
        Self::new("atos")
    }
}

impl Symbolizer for Atos {
    fn symbolize(&self, binary: &Path, offset: &str) -> io::Result<Option<String>> {
        let mut command = Command::new(&self.program);
        command.arg("-o").arg(binary).arg(offset);
        let Some(line) = first_line(command)? else {
            return Ok(None);
        };
        let name = line.split(" (in ").next().unwrap_or(&line).trim();
        // atos echoes the address back when it has no answer
        if name.is_empty() || name.starts_with("0x") {
            Ok(None)
        } else {
            Ok(Some(name.to_string()))
        }
    }
}

/// Never resolves anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSymbolizer;

impl Symbolizer for NoSymbolizer {
    fn symbolize(&self, _binary: &Path, _offset: &str) -> io::Result<Option<String>> {
        Ok(None)
    }
}

/// The symbolizer shipped with the target platform's toolchain.
pub fn default_symbolizer() -> Box<dyn Symbolizer> {
    cfg_if::cfg_if! {
        if #[cfg(target_os = "macos")] {
            Box::new(Atos::default())
        } else {
            Box::new(Addr2Line::default())
        }
    }
}

/// The platform symbolizer, run from `program` instead of the `PATH` lookup.
pub fn platform_symbolizer(program: impl Into<PathBuf>) -> Box<dyn Symbolizer> {
    cfg_if::cfg_if! {
        if #[cfg(target_os = "macos")] {
            Box::new(Atos::new(program))
        } else {
            Box::new(Addr2Line::new(program))
        }
    }
}

/// Runs `command` to completion and returns its first meaningful output line.
///
/// There is no timeout: a symbolizer that never exits blocks the caller.
pub(crate) fn first_line(mut command: Command) -> io::Result<Option<String>> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = command.spawn().map_err(|e| {
        io::Error::new(
            e.kind(),
            format!("cannot run {}: {e}", command.get_program().to_string_lossy()),
        )
    })?;

    let mut output = Vec::with_capacity(OUTPUT_LIMIT as usize);
    let read = child
        .stdout
        .take()
        .map(|stdout| stdout.take(OUTPUT_LIMIT).read_to_end(&mut output));

    child.wait()?;
    match read {
        Some(Ok(_)) => Ok(parse_first_line(&output)),
        Some(Err(e)) => Err(e),
        None => Ok(None),
    }
}

fn parse_first_line(output: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(output);
    let line = text.lines().next()?.trim();
    if line.is_empty() || line == UNKNOWN_MARKER {
        None
    } else {
        Some(line.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_first_line() {
        assert_eq!(
            parse_first_line(b"game::load_map\n/src/map.rs:12\n").as_deref(),
            Some("game::load_map")
        );
        assert_eq!(parse_first_line(b"??\n??:0\n"), None);
        assert_eq!(parse_first_line(b""), None);
        assert_eq!(parse_first_line(b"\n"), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_first_line_reads_child_output() {
        let mut command = Command::new("sh");
        command.args(["-c", "printf 'render_frame\\nmain.c:4\\n'"]);
        assert_eq!(first_line(command).unwrap().as_deref(), Some("render_frame"));
    }

    #[cfg(unix)]
    #[test]
    fn test_first_line_rejects_unknown_marker() {
        let mut command = Command::new("sh");
        command.args(["-c", "echo '??'"]);
        assert_eq!(first_line(command).unwrap(), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_first_line_bounds_large_output() {
        let mut command = Command::new("sh");
        command.args(["-c", "yes long_function_name | head -c 100000"]);
        assert_eq!(
            first_line(command).unwrap().as_deref(),
            Some("long_function_name")
        );
    }

    #[test]
    fn test_missing_program_is_an_error() {
        let symbolizer = Addr2Line::new("/nonexistent/memtrail-addr2line");
        let err = symbolizer
            .symbolize(Path::new("/bin/sh"), "0x10")
            .unwrap_err();
        assert!(err.to_string().contains("memtrail-addr2line"));

        let symbolizer = Atos::new("/nonexistent/memtrail-atos");
        assert!(symbolizer.symbolize(Path::new("/bin/sh"), "0x10").is_err());
    }

    #[test]
    fn test_no_symbolizer() {
        assert_eq!(
            NoSymbolizer.symbolize(Path::new("/bin/sh"), "0x10").unwrap(),
            None
        );
    }
}
