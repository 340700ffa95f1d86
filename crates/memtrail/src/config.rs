use crate::output::{Format, Sink};
use crate::raw::{Malloc, RawAlloc};
use crate::registry::Registry;
use crate::resolver::{
    default_symbolizer, platform_symbolizer, NoSymbolizer, Resolver, Symbolizer,
    DEFAULT_CALLER_FRAMES,
};
use crate::sinks::sink_for;
use crate::tracker::{InvalidRelease, Tracker};

/// Builder for a [`Tracker`].
///
/// Environment overrides are applied in [`build`](TrackerBuilder::build)
/// unless [`ignore_env`](TrackerBuilder::ignore_env) was called:
///
/// * `MEMTRAIL_FORMAT` - `text`, `table`, `json` or `json-pretty`
/// * `MEMTRAIL_QUIET` - `1`/`true` drops per-operation diagnostics
/// * `MEMTRAIL_SYMBOLIZER` - `off`, or the symbolizer program to run
/// * `MEMTRAIL_CALLER_FRAMES` - caller frames kept per operation
///
/// A custom [`sink`](TrackerBuilder::sink) wins over any format.
///
/// # Examples
///
/// ```rust
/// use memtrail::{Format, InvalidRelease, Tracker};
///
/// let tracker = Tracker::builder()
///     .format(Format::Json)
///     .invalid_release(InvalidRelease::Skip)
///     .caller_frames(2)
///     .max_records(1024)
///     .build();
/// # drop(tracker);
/// ```
pub struct TrackerBuilder {
    format: Format,
    sink: Option<Box<dyn Sink>>,
    symbolizer: Option<Box<dyn Symbolizer>>,
    raw: Option<Box<dyn RawAlloc>>,
    max_records: Option<usize>,
    invalid_release: InvalidRelease,
    caller_frames: usize,
    quiet: bool,
    read_env: bool,
}

impl TrackerBuilder {
    pub fn new() -> Self {
        Self {
            format: Format::default(),
            sink: None,
            symbolizer: None,
            raw: None,
            max_records: None,
            invalid_release: InvalidRelease::default(),
            caller_frames: DEFAULT_CALLER_FRAMES,
            quiet: false,
            read_env: true,
        }
    }

    /// Output format of the built-in sinks. Default: [`Format::Text`].
    pub fn format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    /// Sends diagnostics and the leak report to a custom sink instead.
    pub fn sink(mut self, sink: Box<dyn Sink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Default: `addr2line`, or `atos` on macOS.
    pub fn symbolizer(mut self, symbolizer: Box<dyn Symbolizer>) -> Self {
        self.symbolizer = Some(symbolizer);
        self
    }

    /// The primitive that hands out and takes back memory. Default: [`Malloc`].
    pub fn raw_allocator(mut self, raw: Box<dyn RawAlloc>) -> Self {
        self.raw = Some(raw);
        self
    }

    /// Caps the number of live records. Acquires past the cap fail with
    /// [`TrackError::RegistryFull`](crate::TrackError::RegistryFull).
    pub fn max_records(mut self, max_records: usize) -> Self {
        self.max_records = Some(max_records);
        self
    }

    pub fn invalid_release(mut self, policy: InvalidRelease) -> Self {
        self.invalid_release = policy;
        self
    }

    /// Outer caller frames kept per operation; `0` disables stack capture.
    pub fn caller_frames(mut self, caller_frames: usize) -> Self {
        self.caller_frames = caller_frames;
        self
    }

    /// Drops acquire/release diagnostics. Invalid releases and the leak
    /// report are still emitted.
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// Skips the `MEMTRAIL_*` environment overrides.
    pub fn ignore_env(mut self) -> Self {
        self.read_env = false;
        self
    }

    pub fn build(self) -> Tracker {
        let builder = if self.read_env {
            self.apply_env(|name| std::env::var(name).ok())
        } else {
            self
        };

        let sink = builder.sink.unwrap_or_else(|| sink_for(builder.format));
        let symbolizer = builder.symbolizer.unwrap_or_else(default_symbolizer);
        let raw = builder.raw.unwrap_or_else(|| Box::new(Malloc));

        tracing::debug!(
            format = %builder.format,
            caller_frames = builder.caller_frames,
            quiet = builder.quiet,
            policy = ?builder.invalid_release,
            "memtrail tracker built"
        );

        Tracker::from_parts(
            Registry::with_max_records(builder.max_records),
            Resolver::new(symbolizer, builder.caller_frames),
            sink,
            raw,
            builder.invalid_release,
            builder.quiet,
        )
    }

    fn apply_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(value) = lookup("MEMTRAIL_FORMAT") {
            match value.parse::<Format>() {
                Ok(format) => self.format = format,
                Err(e) => eprintln!("[memtrail] Warning: ignoring MEMTRAIL_FORMAT: {e}"),
            }
        }

        if let Some(value) = lookup("MEMTRAIL_QUIET") {
            self.quiet = env_flag(&value);
        }

        if let Some(value) = lookup("MEMTRAIL_SYMBOLIZER") {
            let symbolizer: Box<dyn Symbolizer> = match value.trim() {
                "" | "off" | "none" | "0" => Box::new(NoSymbolizer),
                program => platform_symbolizer(program),
            };
            self.symbolizer = Some(symbolizer);
        }

        if let Some(value) = lookup("MEMTRAIL_CALLER_FRAMES") {
            match value.trim().parse::<usize>() {
                Ok(frames) => self.caller_frames = frames,
                Err(_) => eprintln!(
                    "[memtrail] Warning: MEMTRAIL_CALLER_FRAMES must be a number, got '{value}'"
                ),
            }
        }

        self
    }
}

impl Default for TrackerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn env_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
