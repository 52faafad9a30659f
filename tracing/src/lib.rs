//! Log and progress output for mediafs.
//!
//! Everything goes to stderr, so stdout stays free for command output.
//! Progress bars are drawn for spans carrying an `indicatif.pb_show` field,
//! and log lines are interleaved with them without tearing.
use indicatif::ProgressStyle;
use lazy_static::lazy_static;
use tracing::Level;
use tracing_indicatif::{filter::IndicatifFilter, writer, IndicatifLayer, IndicatifWriter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

lazy_static! {
    /// For scans: a bar over the directories discovered so far.
    pub static ref PB_SCAN_STYLE: ProgressStyle = ProgressStyle::with_template(
        "{span_child_prefix} {wide_msg} {bar:10} ({elapsed}) {pos:>7}/{len:7} dirs"
    )
    .expect("invalid progress template");

    /// Used for spans that don't pick a style themselves.
    static ref PB_DEFAULT_STYLE: ProgressStyle =
        ProgressStyle::with_template("{span_child_prefix}{spinner} {wide_msg} ({elapsed})")
            .expect("invalid progress template");
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unable to install the subscriber: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),

    #[error("invalid RUST_LOG: {0}")]
    Filter(#[from] tracing_subscriber::filter::FromEnvError),
}

/// How log lines are rendered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One short human-readable line per event.
    #[default]
    Compact,
    /// One JSON object per event, for the service manager's journal.
    Json,
}

/// Returned by [TracingBuilder::build]. Writing through its writers keeps
/// active progress bars intact.
#[derive(Clone)]
pub struct TracingHandle {
    stdout: IndicatifWriter<writer::Stdout>,
}

impl TracingHandle {
    /// Prefer `writeln!(handle.stdout(), ...)` over `println!(...)`.
    pub fn stdout(&self) -> IndicatifWriter<writer::Stdout> {
        self.stdout.clone()
    }
}

#[derive(Debug)]
pub struct TracingBuilder {
    level: Level,
    format: LogFormat,
    progress: bool,
}

impl Default for TracingBuilder {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Compact,
            progress: false,
        }
    }
}

impl TracingBuilder {
    /// The default level. RUST_LOG, if set, takes precedence.
    pub fn level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Draw progress bars. Only useful on a terminal.
    pub fn progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    /// Installs the global subscriber. Fails if one is installed already.
    pub fn build(self) -> Result<TracingHandle, Error> {
        let indicatif_layer =
            IndicatifLayer::new().with_progress_style(PB_DEFAULT_STYLE.clone());
        let stdout = indicatif_layer.get_stdout_writer();

        let filter = EnvFilter::builder()
            .with_default_directive(self.level.into())
            .from_env()?;

        let events = tracing_subscriber::fmt::Layer::new()
            .with_writer(indicatif_layer.get_stderr_writer());
        let events = match self.format {
            LogFormat::Compact => events.compact().boxed(),
            LogFormat::Json => events.json().boxed(),
        };

        let progress = self
            .progress
            .then(|| indicatif_layer.with_filter(IndicatifFilter::new(false)));

        tracing_subscriber::registry()
            .with(filter)
            .with(events)
            .with(progress)
            .try_init()?;

        Ok(TracingHandle { stdout })
    }
}

/// Middleware for reqwest_middleware clients, giving every request a span
/// with its url in `http.url`.
#[cfg(feature = "reqwest")]
pub fn http_tracing_middleware(
) -> reqwest_tracing::TracingMiddleware<reqwest_tracing::SpanBackendWithUrl> {
    reqwest_tracing::TracingMiddleware::new()
}
