//! Decorating UIs.

use super::{Ui, UiColor};
use chrono::{SecondsFormat, Utc};
use std::sync::Arc;

/// Colours status lines with a job colour and errors in red.
pub struct ColoredUi {
    color: UiColor,
    error_color: UiColor,
    inner: Arc<dyn Ui>,
}

impl ColoredUi {
    /// Wraps `inner`, colouring status lines with `color`.
    #[must_use]
    pub fn new(color: UiColor, inner: Arc<dyn Ui>) -> Self {
        Self {
            color,
            error_color: UiColor::Red,
            inner,
        }
    }
}

impl Ui for ColoredUi {
    fn say(&self, message: &str) {
        self.inner.say(&self.color.paint(message, true));
    }

    fn message(&self, message: &str) {
        self.inner.message(&self.color.paint(message, false));
    }

    fn error(&self, message: &str) {
        self.inner.error(&self.error_color.paint(message, true));
    }

    fn machine(&self, category: &str, args: &[&str]) {
        self.inner.machine(category, args);
    }
}

/// Prefixes every line with the job it belongs to.
pub struct TargetedUi {
    target: String,
    inner: Arc<dyn Ui>,
}

impl TargetedUi {
    /// Wraps `inner` for output of `target`.
    #[must_use]
    pub fn new(target: impl Into<String>, inner: Arc<dyn Ui>) -> Self {
        Self {
            target: target.into(),
            inner,
        }
    }

    fn prefix_lines(&self, arrow: bool, message: &str) -> String {
        let marker = if arrow { "==>" } else { "   " };
        let mut out = String::new();
        for line in message.split('\n') {
            out.push_str(&format!("{marker} {}: {line}\n", self.target));
        }
        out.trim_end().to_string()
    }
}

impl Ui for TargetedUi {
    fn say(&self, message: &str) {
        self.inner.say(&self.prefix_lines(true, message));
    }

    fn message(&self, message: &str) {
        self.inner.message(&self.prefix_lines(false, message));
    }

    fn error(&self, message: &str) {
        self.inner.error(&self.prefix_lines(true, message));
    }

    fn machine(&self, category: &str, args: &[&str]) {
        self.inner.machine(&format!("{},{category}", self.target), args);
    }
}

/// Prefixes human-readable output with an RFC 3339 timestamp.
pub struct TimestampedUi {
    inner: Arc<dyn Ui>,
}

impl TimestampedUi {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn Ui>) -> Self {
        Self { inner }
    }

    fn stamp(message: &str) -> String {
        format!("{}: {message}", Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true))
    }
}

impl Ui for TimestampedUi {
    fn say(&self, message: &str) {
        self.inner.say(&Self::stamp(message));
    }

    fn message(&self, message: &str) {
        self.inner.message(&Self::stamp(message));
    }

    fn error(&self, message: &str) {
        self.inner.error(&Self::stamp(message));
    }

    fn machine(&self, category: &str, args: &[&str]) {
        self.inner.machine(category, args);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CollectingUi, UiLine};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_targeted_prefixes_each_line() {
        let sink = Arc::new(CollectingUi::new());
        let ui = TargetedUi::new("docker.a", sink.clone());

        ui.say("one\ntwo");
        ui.message("detail");
        ui.machine("artifact-count", &["1"]);

        assert_eq!(
            sink.lines(),
            vec![
                UiLine::Say("==> docker.a: one\n==> docker.a: two".into()),
                UiLine::Message("    docker.a: detail".into()),
                UiLine::Machine("docker.a,artifact-count".into(), vec!["1".into()]),
            ]
        );
    }

    #[test]
    fn test_colored_uses_red_for_errors() {
        let sink = Arc::new(CollectingUi::new());
        let ui = ColoredUi::new(UiColor::Green, sink.clone());

        ui.say("ok");
        ui.error("bad");

        assert_eq!(
            sink.lines(),
            vec![
                UiLine::Say("\x1b[1;32mok\x1b[0m".into()),
                UiLine::Error("\x1b[1;31mbad\x1b[0m".into()),
            ]
        );
    }

    #[test]
    fn test_timestamped_prefix() {
        let sink = Arc::new(CollectingUi::new());
        let ui = TimestampedUi::new(sink.clone());
        ui.say("hello");

        let said = sink.said();
        let (stamp, rest) = said[0].split_once(": ").unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok());
        assert_eq!(rest, "hello");
    }
}
