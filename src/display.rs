use std::io::{self, Write};

use crate::reporter::Report;

pub const LISTEN_LABEL: &str = "Listen";
pub const STOP_LABEL: &str = "Stop";

/// Enabled state of the user-facing controls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Controls {
    /// Per-class collect buttons and the train trigger
    pub buttons_enabled: bool,
    pub listen_enabled: bool,
    pub listen_label: &'static str,
}

impl Controls {
    pub fn idle() -> Self {
        Self {
            buttons_enabled: true,
            listen_enabled: true,
            listen_label: LISTEN_LABEL,
        }
    }

    pub fn training() -> Self {
        Self {
            buttons_enabled: false,
            listen_enabled: false,
            listen_label: LISTEN_LABEL,
        }
    }

    /// Only the listen toggle stays usable, relabelled to stop.
    pub fn inferring() -> Self {
        Self {
            buttons_enabled: false,
            listen_enabled: true,
            listen_label: STOP_LABEL,
        }
    }
}

impl Default for Controls {
    fn default() -> Self {
        Self::idle()
    }
}

/// Where user-facing progress and results go.
pub trait DisplaySink {
    fn status(&mut self, message: &str);

    fn result(&mut self, report: &Report);

    fn controls(&mut self, controls: &Controls);
}

/// Everything a sink was sent, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum DisplayEvent {
    Status(String),
    Result(Report),
    Controls(Controls),
}

/// Sink that keeps every event, for headless runs and tests.
#[derive(Debug, Clone, Default)]
pub struct RecordingDisplay {
    pub events: Vec<DisplayEvent>,
}

impl RecordingDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statuses(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|e| match e {
                DisplayEvent::Status(s) => Some(s.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn last_status(&self) -> Option<&str> {
        self.statuses().last().copied()
    }

    pub fn reports(&self) -> Vec<&Report> {
        self.events
            .iter()
            .filter_map(|e| match e {
                DisplayEvent::Result(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    pub fn last_controls(&self) -> Option<&Controls> {
        self.events.iter().rev().find_map(|e| match e {
            DisplayEvent::Controls(c) => Some(c),
            _ => None,
        })
    }
}

impl DisplaySink for RecordingDisplay {
    fn status(&mut self, message: &str) {
        self.events.push(DisplayEvent::Status(message.to_string()));
    }

    fn result(&mut self, report: &Report) {
        self.events.push(DisplayEvent::Result(report.clone()));
    }

    fn controls(&mut self, controls: &Controls) {
        self.events.push(DisplayEvent::Controls(controls.clone()));
    }
}

/// Prints to a terminal, one line per event.
pub struct ConsoleDisplay<W: Write = io::Stdout> {
    out: W,
}

impl ConsoleDisplay {
    pub fn stdout() -> Self {
        Self { out: io::stdout() }
    }
}

impl<W: Write> ConsoleDisplay<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

// Display output is best effort; a closed terminal must not abort the session.
impl<W: Write> DisplaySink for ConsoleDisplay<W> {
    fn status(&mut self, message: &str) {
        let _ = writeln!(self.out, "{message}");
    }

    fn result(&mut self, report: &Report) {
        let values: Vec<String> = report
            .readings
            .iter()
            .map(|r| {
                let mark = if r.active { "*" } else { " " };
                format!("{}{}={}", mark, r.name, r.display_value())
            })
            .collect();
        let _ = writeln!(self.out, ">>> {} | {}", report.winner_label, values.join(" "));
    }

    fn controls(&mut self, controls: &Controls) {
        let state = |on: bool| if on { "on" } else { "off" };
        let _ = writeln!(
            self.out,
            "[buttons {}] [{} {}]",
            state(controls.buttons_enabled),
            controls.listen_label,
            state(controls.listen_enabled)
        );
    }
}
