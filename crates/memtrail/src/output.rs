use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::report::LeakReport;
use crate::resolver::CallerChain;

/// Structured record of one tracked operation.
///
/// Sinks decide how a record is rendered; the tracker only builds it. Counter
/// fields are sampled after the operation was applied to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Diagnostic {
    Acquire {
        id: u64,
        active: usize,
        size: usize,
        total: u64,
        #[serde(serialize_with = "serialize_address")]
        address: usize,
        caller: CallerChain,
        tid: u64,
    },
    Release {
        id: u64,
        active: usize,
        size: usize,
        total: u64,
        #[serde(serialize_with = "serialize_address")]
        address: usize,
        caller: CallerChain,
        tid: u64,
    },
    /// Release of an address the registry does not know: never acquired
    /// through the tracker, or already released.
    InvalidRelease {
        active: usize,
        #[serde(serialize_with = "serialize_address")]
        address: usize,
        caller: CallerChain,
        tid: u64,
    },
}

impl Diagnostic {
    pub fn address(&self) -> usize {
        match self {
            Diagnostic::Acquire { address, .. }
            | Diagnostic::Release { address, .. }
            | Diagnostic::InvalidRelease { address, .. } => *address,
        }
    }

    /// Active allocation count right after the operation.
    pub fn active(&self) -> usize {
        match self {
            Diagnostic::Acquire { active, .. }
            | Diagnostic::Release { active, .. }
            | Diagnostic::InvalidRelease { active, .. } => *active,
        }
    }

    pub fn caller(&self) -> &CallerChain {
        match self {
            Diagnostic::Acquire { caller, .. }
            | Diagnostic::Release { caller, .. }
            | Diagnostic::InvalidRelease { caller, .. } => caller,
        }
    }
}

/// Output format for diagnostics and the leak report.
///
/// * `Text` - one colored line pair per operation, one line per leak (default)
/// * `Table` - same per-operation lines, leaks listed in a table
/// * `Json` - one compact JSON object per line
/// * `JsonPretty` - indented JSON objects
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Format {
    #[default]
    Text,
    Table,
    Json,
    JsonPretty,
}

impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Format::Text),
            "table" => Ok(Format::Table),
            "json" => Ok(Format::Json),
            "json-pretty" => Ok(Format::JsonPretty),
            other => Err(format!(
                "unknown format {other:?}, expected one of: text, table, json, json-pretty"
            )),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Format::Text => write!(f, "text"),
            Format::Table => write!(f, "table"),
            Format::Json => write!(f, "json"),
            Format::JsonPretty => write!(f, "json-pretty"),
        }
    }
}

/// Destination for diagnostics and the shutdown leak report.
///
/// Both methods run while the tracker lock is held, so records from different
/// threads never interleave. Implementations must not acquire or release
/// memory through the same [`Tracker`](crate::Tracker) they are attached to.
/// Errors are swallowed by the tracker.
///
/// # Examples
///
/// ```rust
/// use memtrail::{Diagnostic, LeakReport, Sink};
/// use std::error::Error;
///
/// struct LeakCounter;
///
/// impl Sink for LeakCounter {
///     fn diagnostic(&self, _diagnostic: &Diagnostic) -> Result<(), Box<dyn Error>> {
///         Ok(())
///     }
///
///     fn leak_report(&self, report: &LeakReport) -> Result<(), Box<dyn Error>> {
///         println!("{} leaks", report.leak_count());
///         Ok(())
///     }
/// }
/// ```
pub trait Sink: Send + Sync {
    fn diagnostic(&self, diagnostic: &Diagnostic) -> Result<(), Box<dyn std::error::Error>>;

    fn leak_report(&self, report: &LeakReport) -> Result<(), Box<dyn std::error::Error>>;
}

pub fn shorten_function_name(function_name: &str) -> String {
    let parts: Vec<&str> = function_name.split("::").collect();
    if parts.len() > 2 {
        parts[parts.len() - 2..].join("::")
    } else {
        function_name.to_string()
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    const THRESHOLD: f64 = 1024.0;

    if bytes == 0 {
        return "0 B".to_string();
    }

    let bytes_f = bytes as f64;
    let unit_index = (bytes_f.log(THRESHOLD).floor() as usize).min(UNITS.len() - 1);
    let unit_value = bytes_f / THRESHOLD.powi(unit_index as i32);

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", unit_value, UNITS[unit_index])
    }
}

pub(crate) fn serialize_address<S>(address: &usize, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_str(&format_args!("{address:#x}"))
}
