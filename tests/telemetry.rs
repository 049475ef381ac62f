use orchestra_core::diagnostics::{pretty_print_with_mode, ErrorEvent, LadderError};
use orchestra_core::event_bus::Event;
use orchestra_core::telemetry::{FormatterMode, PlainFormatter, TelemetryFormatter};

#[test]
fn plain_mode_renders_step_events_without_ansi_codes() {
    let formatter = PlainFormatter::with_mode(FormatterMode::Plain);
    let event = Event::step_message("fetch_invoice", "fetched 3 rows");

    let render = formatter.render_event(&event);
    let joined = render.join_lines();

    assert!(!joined.contains('\x1b'));
    assert!(joined.contains("fetched 3 rows"));
}

#[test]
fn colored_mode_renders_with_ansi_escapes() {
    let formatter = PlainFormatter::with_mode(FormatterMode::Colored);
    let event = Event::step_message("fetch_invoice", "fetched 3 rows");

    let render = formatter.render_event(&event);
    assert!(render.join_lines().contains('\x1b'));
}

#[test]
fn render_errors_walks_the_cause_chain() {
    let chained = LadderError::msg("checkpoint persist failed")
        .with_cause(LadderError::msg("disk write failed").with_cause(LadderError::msg("no space left on device")));
    let event = ErrorEvent::state_manager("exec-1", chained);

    let plain = pretty_print_with_mode(&[event], FormatterMode::Plain);

    assert!(plain.contains("checkpoint persist failed"));
    assert!(plain.contains("disk write failed"));
    assert!(plain.contains("no space left on device"));
    assert!(!plain.contains('\x1b'));
}

#[test]
fn pretty_print_handles_an_empty_event_list() {
    let plain = pretty_print_with_mode(&[], FormatterMode::Plain);
    assert!(plain.is_empty());
}
