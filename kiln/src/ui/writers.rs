//! Terminal writers.

use super::Ui;
use crate::redact::RedactionRegistry;
use chrono::Utc;
use parking_lot::Mutex;
use std::io::{self, Write};
use std::sync::Arc;
use tracing::{debug, warn};

type Sink = Mutex<Box<dyn Write + Send>>;

fn write_line(sink: &Sink, line: &str) {
    let mut writer = sink.lock();
    if let Err(e) = writeln!(writer, "{line}").and_then(|()| writer.flush()) {
        warn!(error = %e, "Failed to write UI output");
    }
}

/// Human-readable writer.
pub struct BasicUi {
    out: Sink,
    err: Sink,
    redactor: Arc<RedactionRegistry>,
}

impl BasicUi {
    /// Writes status to `out` and errors to `err`.
    #[must_use]
    pub fn new(
        out: Box<dyn Write + Send>,
        err: Box<dyn Write + Send>,
        redactor: Arc<RedactionRegistry>,
    ) -> Self {
        Self {
            out: Mutex::new(out),
            err: Mutex::new(err),
            redactor,
        }
    }

    /// Writes to the process's stdout and stderr.
    #[must_use]
    pub fn stdio(redactor: Arc<RedactionRegistry>) -> Self {
        Self::new(Box::new(io::stdout()), Box::new(io::stderr()), redactor)
    }
}

impl Ui for BasicUi {
    fn say(&self, message: &str) {
        write_line(&self.out, &self.redactor.filter(message));
    }

    fn message(&self, message: &str) {
        write_line(&self.out, &self.redactor.filter(message));
    }

    fn error(&self, message: &str) {
        write_line(&self.err, &self.redactor.filter(message));
    }

    fn machine(&self, category: &str, args: &[&str]) {
        let args: Vec<String> = args.iter().map(|a| self.redactor.filter(a)).collect();
        debug!(category, args = ?args, "Machine-readable output");
    }
}

impl std::fmt::Debug for BasicUi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicUi").finish_non_exhaustive()
    }
}

/// Writer emitting `timestamp,target,type,data...` records.
pub struct MachineReadableUi {
    out: Sink,
    redactor: Arc<RedactionRegistry>,
}

impl MachineReadableUi {
    /// Writes records to `out`.
    #[must_use]
    pub fn new(out: Box<dyn Write + Send>, redactor: Arc<RedactionRegistry>) -> Self {
        Self {
            out: Mutex::new(out),
            redactor,
        }
    }

    /// Writes records to stdout.
    #[must_use]
    pub fn stdout(redactor: Arc<RedactionRegistry>) -> Self {
        Self::new(Box::new(io::stdout()), redactor)
    }

    /// Escapes a field so records stay one line with comma-separated fields.
    #[must_use]
    pub fn escape(field: &str) -> String {
        field
            .replace(',', "%!(KILN_COMMA)")
            .replace('\r', "\\r")
            .replace('\n', "\\n")
    }
}

impl Ui for MachineReadableUi {
    fn say(&self, message: &str) {
        self.machine("ui", &["say", message]);
    }

    fn message(&self, message: &str) {
        self.machine("ui", &["message", message]);
    }

    fn error(&self, message: &str) {
        self.machine("ui", &["error", message]);
    }

    fn machine(&self, category: &str, args: &[&str]) {
        let (target, kind) = category.split_once(',').unwrap_or(("", category));
        let mut line = format!("{},{target},{kind}", Utc::now().timestamp());
        for arg in args {
            line.push(',');
            line.push_str(&Self::escape(&self.redactor.filter(arg)));
        }
        write_line(&self.out, &line);
    }
}

impl std::fmt::Debug for MachineReadableUi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineReadableUi").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SharedBuffer;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_basic_ui_redacts_and_splits_streams() {
        let redactor = Arc::new(RedactionRegistry::new());
        redactor.register("s3cret");
        let out = SharedBuffer::new();
        let err = SharedBuffer::new();
        let ui = BasicUi::new(Box::new(out.clone()), Box::new(err.clone()), redactor);

        ui.say("token s3cret");
        ui.error("failed with s3cret");

        assert_eq!(out.contents(), "token <sensitive>\n");
        assert_eq!(err.contents(), "failed with <sensitive>\n");
    }

    #[test]
    fn test_machine_readable_format() {
        let out = SharedBuffer::new();
        let ui = MachineReadableUi::new(Box::new(out.clone()), Arc::new(RedactionRegistry::new()));

        ui.machine("docker.a,artifact", &["0", "id", "a,b\nc"]);
        ui.say("hello");

        let contents = out.contents();
        let lines: Vec<&str> = contents.lines().collect();
        let first: Vec<&str> = lines[0].splitn(2, ',').collect();
        assert!(first[0].parse::<i64>().is_ok());
        assert_eq!(first[1], "docker.a,artifact,0,id,a%!(KILN_COMMA)b\\nc");
        assert!(lines[1].ends_with(",,ui,say,hello"));
    }
}
