// Copyright (c) The scenario-relay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use clap::{Args, ValueEnum};
use owo_colors::{OwoColorize, Style, style};
use std::fmt;
use tracing::{
    Event, Level, Subscriber,
    field::{Field, Visit},
    level_filters::LevelFilter,
};
use tracing_subscriber::{
    Layer,
    filter::Targets,
    fmt::{FmtContext, FormatEvent, FormatFields, format},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
};

/// Environment variable holding a log filter in `tracing-subscriber`'s
/// `Targets` syntax, e.g. `info,scenario_relay_runner::delivery=debug`.
pub(crate) const LOG_ENV: &str = "SCENARIO_RELAY_LOG";

/// Events logged with this target are printed without a level prefix.
pub(crate) const NO_HEADING_TARGET: &str = "scenario_relay::no_heading";

pub(crate) mod clap_styles {
    use clap::builder::{
        Styles,
        styling::{AnsiColor, Effects, Style},
    };

    const HEADER: Style = AnsiColor::Green.on_default().effects(Effects::BOLD);
    const LITERAL: Style = AnsiColor::Cyan.on_default().effects(Effects::BOLD);
    const PLACEHOLDER: Style = AnsiColor::Cyan.on_default();
    const ERROR: Style = AnsiColor::Red.on_default().effects(Effects::BOLD);

    pub(crate) const fn style() -> Styles {
        Styles::styled()
            .header(HEADER)
            .usage(HEADER)
            .literal(LITERAL)
            .placeholder(PLACEHOLDER)
            .error(ERROR)
            .valid(LITERAL)
            .invalid(ERROR)
    }
}

#[derive(Copy, Clone, Debug, Args)]
#[must_use]
pub(crate) struct OutputOpts {
    /// Verbose output
    #[arg(long, short, global = true, env = "SCENARIO_RELAY_VERBOSE")]
    pub(crate) verbose: bool,

    /// Produce color output: auto, always, never
    #[arg(
        long,
        value_enum,
        default_value_t,
        hide_possible_values = true,
        global = true,
        value_name = "WHEN",
        env = "SCENARIO_RELAY_COLOR"
    )]
    pub(crate) color: Color,
}

impl OutputOpts {
    pub(crate) fn init(self) -> OutputContext {
        let OutputOpts { verbose, color } = self;
        color.init(verbose);
        OutputContext { color }
    }
}

/// Output settings, once logging is set up.
#[derive(Copy, Clone, Debug)]
#[must_use]
pub struct OutputContext {
    color: Color,
}

impl OutputContext {
    /// Returns general stderr styles for the current output context.
    pub fn stderr_styles(&self) -> StderrStyles {
        let mut styles = StderrStyles::default();
        if self.color.should_colorize(supports_color::Stream::Stderr) {
            styles.colorize();
        }
        styles
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
#[must_use]
pub(crate) enum Color {
    #[default]
    Auto,
    Always,
    Never,
}

static INIT_LOGGER: std::sync::Once = std::sync::Once::new();

impl Color {
    fn init(self, verbose: bool) {
        let mut log_styles = LogStyles::default();
        if self.should_colorize(supports_color::Stream::Stderr) {
            log_styles.colorize();
        }

        INIT_LOGGER.call_once(|| {
            let default_level = if verbose {
                LevelFilter::DEBUG
            } else {
                LevelFilter::INFO
            };
            let (targets, invalid) = parse_log_filter(std::env::var(LOG_ENV).ok(), default_level);

            let layer = tracing_subscriber::fmt::layer()
                .event_format(SimpleFormatter { styles: log_styles })
                .with_writer(std::io::stderr)
                .with_filter(targets);
            tracing_subscriber::registry().with(layer).init();

            if let Some(invalid) = invalid {
                tracing::warn!("ignoring invalid {LOG_ENV} value `{invalid}`");
            }
        });
    }

    pub(crate) fn should_colorize(self, stream: supports_color::Stream) -> bool {
        match self {
            Color::Auto => supports_color::on_cached(stream).is_some(),
            Color::Always => true,
            Color::Never => false,
        }
    }
}

/// Parses the log filter, falling back to `default_level` if it's unset or
/// invalid. Returns the invalid value, if any, so it can be reported once
/// logging is up.
fn parse_log_filter(value: Option<String>, default_level: LevelFilter) -> (Targets, Option<String>) {
    let default = Targets::new().with_default(default_level);
    match value {
        None => (default, None),
        Some(value) if value.trim().is_empty() => (default, None),
        Some(value) => match value.parse() {
            Ok(targets) => (targets, None),
            Err(_) => (default, Some(value)),
        },
    }
}

struct SimpleFormatter {
    styles: LogStyles,
}

impl<S, N> FormatEvent<S, N> for SimpleFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        if metadata.target() != NO_HEADING_TARGET {
            let (label, style) = match *metadata.level() {
                Level::ERROR => ("error", self.styles.error),
                Level::WARN => ("warning", self.styles.warning),
                Level::INFO => ("info", self.styles.info),
                Level::DEBUG => ("debug", self.styles.debug),
                Level::TRACE => ("trace", self.styles.trace),
            };
            write!(writer, "{}: ", label.style(style))?;
        }

        let mut visitor = MessageVisitor {
            writer: &mut writer,
            fields: Vec::new(),
            error: None,
        };
        event.record(&mut visitor);
        if let Some(error) = visitor.error {
            return Err(error);
        }
        let fields = visitor.fields;
        if !fields.is_empty() {
            write!(
                writer,
                " {}",
                fields.join(" ").style(self.styles.fields)
            )?;
        }

        writeln!(writer)
    }
}

static MESSAGE_FIELD: &str = "message";

/// Writes the message directly and collects other fields as `key=value`.
struct MessageVisitor<'writer, 'a> {
    writer: &'a mut format::Writer<'writer>,
    fields: Vec<String>,
    error: Option<fmt::Error>,
}

impl Visit for MessageVisitor<'_, '_> {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == MESSAGE_FIELD {
            if let Err(error) = write!(self.writer, "{value:?}") {
                self.error = Some(error);
            }
        } else {
            self.fields.push(format!("{}={value:?}", field.name()));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == MESSAGE_FIELD {
            if let Err(error) = self.writer.write_str(value) {
                self.error = Some(error);
            }
        } else {
            self.fields.push(format!("{}={value}", field.name()));
        }
    }
}

#[derive(Debug, Default)]
struct LogStyles {
    error: Style,
    warning: Style,
    info: Style,
    debug: Style,
    trace: Style,
    fields: Style,
}

impl LogStyles {
    fn colorize(&mut self) {
        self.error = style().red().bold();
        self.warning = style().yellow().bold();
        self.info = style().bold();
        self.debug = style().bold();
        self.trace = style().dimmed();
        self.fields = style().dimmed();
    }
}

/// Styles for messages printed directly to stderr.
#[derive(Debug, Default)]
pub struct StderrStyles {
    pub(crate) bold: Style,
    pub(crate) failed: Style,
    pub(crate) passed: Style,
}

impl StderrStyles {
    fn colorize(&mut self) {
        self.bold = style().bold();
        self.failed = style().red().bold();
        self.passed = style().green().bold();
    }
}
