//! Built-in [`Sink`] implementations.

use colored::*;
use prettytable::{Attr, Cell, Row, Table};
use std::error::Error;
use std::fmt::Write as _;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};

use crate::output::{format_bytes, Diagnostic, Format, Sink};
use crate::report::LeakReport;
use crate::resolver::CallerChain;

const SEPARATOR_WIDTH: usize = 96;
const ERROR_RULE_WIDTH: usize = 63;

/// Unbuffered writer on a raw file descriptor.
///
/// Sinks run inside the tracker lock, so they must not wait on std's
/// stdout/stderr locks: another thread may hold one of those while it
/// allocates and waits for the tracker.
pub(crate) struct FdWriter(libc::c_int);

impl FdWriter {
    pub(crate) fn stdout() -> Self {
        FdWriter(libc::STDOUT_FILENO)
    }

    pub(crate) fn stderr() -> Self {
        FdWriter(libc::STDERR_FILENO)
    }
}

impl Write for FdWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            // SAFETY: `buf` is valid for `buf.len()` bytes for the whole call.
            let written = unsafe { libc::write(self.0, buf.as_ptr().cast(), buf.len()) };
            if written >= 0 {
                return Ok(written as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Picks the built-in sink for `format`.
pub fn sink_for(format: Format) -> Box<dyn Sink> {
    match format {
        Format::Text => Box::new(TerminalSink::new()),
        Format::Table => Box::new(TerminalSink::with_table()),
        Format::Json => Box::new(JsonSink::new()),
        Format::JsonPretty => Box::new(JsonSink::pretty()),
    }
}

/// Colored human-readable output.
///
/// Operation records and the leak report go to stderr; decorative separators
/// go to stdout.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalSink {
    table: bool,
}

impl TerminalSink {
    pub fn new() -> Self {
        Self { table: false }
    }

    /// Lists leaks in a table instead of one line each.
    pub fn with_table() -> Self {
        Self { table: true }
    }
}

impl Sink for TerminalSink {
    fn diagnostic(&self, diagnostic: &Diagnostic) -> Result<(), Box<dyn Error>> {
        if !matches!(diagnostic, Diagnostic::InvalidRelease { .. }) {
            FdWriter::stdout().write_all(separator().as_bytes())?;
        }
        FdWriter::stderr().write_all(render_diagnostic(diagnostic).as_bytes())?;
        Ok(())
    }

    fn leak_report(&self, report: &LeakReport) -> Result<(), Box<dyn Error>> {
        let mut stdout = FdWriter::stdout();
        let mut stderr = FdWriter::stderr();

        if report.is_clean() {
            stderr.write_all(render_leak_summary(report).as_bytes())?;
            return Ok(());
        }

        stdout.write_all(separator().as_bytes())?;
        stderr.write_all(render_leak_summary(report).as_bytes())?;

        if self.table {
            stderr.write_all(render_leak_table(report)?.as_bytes())?;
            stdout.write_all(separator().as_bytes())?;
        } else {
            for leak in report.leaks() {
                writeln!(
                    stderr,
                    "Leak at [{:#x}] - {} bytes (id: {})",
                    leak.address, leak.size, leak.id
                )?;
                stdout.write_all(separator().as_bytes())?;
            }
        }
        Ok(())
    }
}

fn separator() -> String {
    format!("{}\n", "-".repeat(SEPARATOR_WIDTH).bright_black())
}

fn render_chain(chain: &CallerChain) -> String {
    if chain.is_empty() {
        return chain.to_string().yellow().to_string();
    }
    let arrow = CallerChain::separator().bright_black().to_string();
    chain
        .frames()
        .iter()
        .map(|name| name.yellow().to_string())
        .collect::<Vec<_>>()
        .join(&arrow)
}

pub(crate) fn render_diagnostic(diagnostic: &Diagnostic) -> String {
    let bar = "│".bright_black();
    let mut out = String::new();

    match diagnostic {
        Diagnostic::Acquire {
            id,
            active,
            size,
            total,
            address,
            caller,
            tid,
        }
        | Diagnostic::Release {
            id,
            active,
            size,
            total,
            address,
            caller,
            tid,
        } => {
            let acquire = matches!(diagnostic, Diagnostic::Acquire { .. });
            let (label, size_label) = if acquire {
                ("├ alloc".purple(), "alloc size ")
            } else {
                ("├ free ".green(), "freed size ")
            };
            let corner = if acquire { "╰".purple() } else { "╰".green() };
            let size_value = if acquire {
                format!("{size:>4}").red()
            } else {
                format!("{size:>4}").green()
            };

            let _ = writeln!(out, "{label} {}  {}", "⤑".bright_white(), render_chain(caller));
            let _ = writeln!(
                out,
                "{corner} {} {bar} Active allocation : {} {bar} {size_label}: {} {bar} Total memory : {} {bar} {address:#x} {bar} tid {tid}",
                format!("id : {id:>3}").magenta(),
                format!("{active:>3}").yellow(),
                size_value,
                format!("{total:>4}").red(),
            );
        }
        Diagnostic::InvalidRelease {
            active,
            address,
            caller,
            tid,
        } => {
            let rule = "-".repeat(ERROR_RULE_WIDTH);
            let _ = writeln!(out, "{}", rule.red());
            let _ = writeln!(
                out,
                "{} Invalid or double free detected : {address:#x} {bar} Active allocation : {active} {bar} {} {bar} tid {tid}",
                "Error :".red(),
                render_chain(caller),
            );
            let _ = writeln!(out, "{}", rule.red());
        }
    }

    out
}

pub(crate) fn render_leak_summary(report: &LeakReport) -> String {
    if report.is_clean() {
        return format!("\n{}\n", "No memory leaks detected".green());
    }

    let mut out = String::new();
    let _ = writeln!(out, "\n{}", "Memory leaks detected:".bright_red().bold());
    let _ = writeln!(out, "Total leaks: {}", report.leak_count());
    let _ = writeln!(out, "Total memory leaked: {} bytes\n", report.total_bytes());
    out
}

fn render_leak_table(report: &LeakReport) -> Result<String, Box<dyn Error>> {
    let mut table = Table::new();
    table.add_row(Row::new(
        ["Id", "Address", "Size"]
            .into_iter()
            .map(|header| Cell::new(header).with_style(Attr::Bold))
            .collect(),
    ));

    for leak in report.leaks() {
        table.add_row(Row::new(vec![
            Cell::new(&leak.id.to_string()),
            Cell::new(&format!("{:#x}", leak.address)),
            Cell::new(&format_bytes(leak.size as u64)),
        ]));
    }

    let mut out = Vec::new();
    table.print(&mut out)?;
    Ok(String::from_utf8(out)?)
}

/// One JSON object per record on stderr.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSink {
    pretty: bool,
}

impl JsonSink {
    pub fn new() -> Self {
        Self { pretty: false }
    }

    pub fn pretty() -> Self {
        Self { pretty: true }
    }

    fn write<T: serde::Serialize>(&self, value: &T) -> Result<(), Box<dyn Error>> {
        let mut line = if self.pretty {
            serde_json::to_string_pretty(value)?
        } else {
            serde_json::to_string(value)?
        };
        line.push('\n');
        FdWriter::stderr().write_all(line.as_bytes())?;
        Ok(())
    }
}

impl Sink for JsonSink {
    fn diagnostic(&self, diagnostic: &Diagnostic) -> Result<(), Box<dyn Error>> {
        self.write(diagnostic)
    }

    fn leak_report(&self, report: &LeakReport) -> Result<(), Box<dyn Error>> {
        self.write(report)
    }
}

#[derive(Debug, Default)]
struct MemoryLog {
    diagnostics: Vec<Diagnostic>,
    leak_reports: Vec<LeakReport>,
}

/// Keeps every record in memory. Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    log: Arc<Mutex<MemoryLog>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .diagnostics
            .clone()
    }

    pub fn leak_reports(&self) -> Vec<LeakReport> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .leak_reports
            .clone()
    }

    pub fn clear(&self) {
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        log.diagnostics.clear();
        log.leak_reports.clear();
    }
}

impl Sink for MemorySink {
    fn diagnostic(&self, diagnostic: &Diagnostic) -> Result<(), Box<dyn Error>> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .diagnostics
            .push(diagnostic.clone());
        Ok(())
    }

    fn leak_report(&self, report: &LeakReport) -> Result<(), Box<dyn Error>> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .leak_reports
            .push(report.clone());
        Ok(())
    }
}
