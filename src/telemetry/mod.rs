//! Rendering of [`crate::event_bus::Event`]s and [`crate::diagnostics::ErrorEvent`]s
//! into human-readable text, with optional ANSI color.

use std::io::IsTerminal;

use crate::diagnostics::ErrorEvent;
use crate::event_bus::Event;

pub const CONTEXT_COLOR: &str = "\x1b[32m"; // green
pub const LINE_COLOR: &str = "\x1b[35m"; // magenta / dark pink
pub const RESET_COLOR: &str = "\x1b[0m";

/// Controls whether rendered output carries ANSI color escapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormatterMode {
    /// Auto-detect based on whether stderr is a TTY.
    #[default]
    Auto,
    Colored,
    Plain,
}

impl FormatterMode {
    fn colorize(self) -> bool {
        match self {
            FormatterMode::Auto => std::io::stderr().is_terminal(),
            FormatterMode::Colored => true,
            FormatterMode::Plain => false,
        }
    }
}

/// Rendered output for a telemetry item that can be consumed by sinks.
#[derive(Clone, Debug, Default)]
pub struct EventRender {
    pub context: Option<String>,
    pub lines: Vec<String>,
}

impl EventRender {
    pub fn join_lines(&self) -> String {
        self.lines.join("")
    }
}

pub trait TelemetryFormatter: Send + Sync {
    fn render_event(&self, event: &Event) -> EventRender;
    fn render_errors(&self, errors: &[ErrorEvent]) -> Vec<EventRender>;
}

/// Plain-text formatter with optional ANSI coloring, gated by [`FormatterMode`].
pub struct PlainFormatter {
    colorize: bool,
}

impl Default for PlainFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl PlainFormatter {
    /// Construct a formatter that auto-detects color support from stderr.
    pub fn new() -> Self {
        Self::with_mode(FormatterMode::Auto)
    }

    pub fn with_mode(mode: FormatterMode) -> Self {
        Self {
            colorize: mode.colorize(),
        }
    }

    fn wrap(&self, color: &str, body: &str) -> String {
        if self.colorize {
            format!("{color}{body}{RESET_COLOR}")
        } else {
            body.to_string()
        }
    }
}

fn format_error_chain(formatter: &PlainFormatter, error: &crate::diagnostics::LadderError, indent: usize) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(cause) = &error.cause {
        let indent_str = "  ".repeat(indent);
        lines.push(format!(
            "{}\n",
            formatter.wrap(LINE_COLOR, &format!("{indent_str}cause: {}", cause.message))
        ));
        lines.extend(format_error_chain(formatter, cause, indent + 1));
    }
    lines
}

impl TelemetryFormatter for PlainFormatter {
    fn render_event(&self, event: &Event) -> EventRender {
        let line = format!("{}\n", self.wrap(LINE_COLOR, &event.to_string()));
        EventRender {
            context: event.scope_label().map(|s| s.to_string()),
            lines: vec![line],
        }
    }

    fn render_errors(&self, errors: &[ErrorEvent]) -> Vec<EventRender> {
        errors
            .iter()
            .enumerate()
            .map(|(i, e)| {
                let mut lines = Vec::new();
                let scope_str = self.wrap(CONTEXT_COLOR, &format!("{:?}", e.scope));
                lines.push(format!("[{}] {} | {}\n", i, e.when, scope_str));
                lines.push(format!(
                    "{}\n",
                    self.wrap(LINE_COLOR, &format!("  error: {}", e.error.message))
                ));
                lines.extend(format_error_chain(self, &e.error, 1));
                if !e.tags.is_empty() {
                    lines.push(format!(
                        "{}\n",
                        self.wrap(LINE_COLOR, &format!("  tags: {:?}", e.tags))
                    ));
                }
                if !e.context.is_null() {
                    lines.push(format!(
                        "{}\n",
                        self.wrap(LINE_COLOR, &format!("  context: {}", e.context))
                    ));
                }
                EventRender {
                    context: Some(format!("{:?}", e.scope)),
                    lines,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::LadderError;

    #[test]
    fn plain_mode_never_emits_ansi() {
        let formatter = PlainFormatter::with_mode(FormatterMode::Plain);
        let errors = vec![ErrorEvent::engine(LadderError::msg("boom"))];
        let rendered = formatter.render_errors(&errors);
        assert!(!rendered[0].join_lines().contains("\x1b["));
    }

    #[test]
    fn colored_mode_emits_ansi() {
        let formatter = PlainFormatter::with_mode(FormatterMode::Colored);
        let errors = vec![ErrorEvent::engine(LadderError::msg("boom"))];
        let rendered = formatter.render_errors(&errors);
        assert!(rendered[0].join_lines().contains("\x1b["));
    }
}
