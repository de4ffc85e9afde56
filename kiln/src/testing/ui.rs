//! Recording UI and in-memory writers.

use crate::ui::Ui;
use parking_lot::{Mutex, RwLock};
use std::io::{self, Write};
use std::sync::Arc;

/// One line received by a [`CollectingUi`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiLine {
    /// From `say`.
    Say(String),
    /// From `message`.
    Message(String),
    /// From `error`.
    Error(String),
    /// From `machine`: category and arguments.
    Machine(String, Vec<String>),
}

/// A UI that stores every call for later assertions.
#[derive(Debug, Default)]
pub struct CollectingUi {
    lines: RwLock<Vec<UiLine>>,
}

impl CollectingUi {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded lines in order.
    #[must_use]
    pub fn lines(&self) -> Vec<UiLine> {
        self.lines.read().clone()
    }

    /// Text of `say` calls.
    #[must_use]
    pub fn said(&self) -> Vec<String> {
        self.lines
            .read()
            .iter()
            .filter_map(|l| match l {
                UiLine::Say(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    /// Text of `error` calls.
    #[must_use]
    pub fn errors(&self) -> Vec<String> {
        self.lines
            .read()
            .iter()
            .filter_map(|l| match l {
                UiLine::Error(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    /// Arguments of `machine` calls whose category is `category`.
    #[must_use]
    pub fn machine(&self, category: &str) -> Vec<Vec<String>> {
        self.lines
            .read()
            .iter()
            .filter_map(|l| match l {
                UiLine::Machine(c, args) if c == category => Some(args.clone()),
                _ => None,
            })
            .collect()
    }

    /// Returns true if any human-readable line contains `needle`.
    #[must_use]
    pub fn contains(&self, needle: &str) -> bool {
        self.lines.read().iter().any(|l| match l {
            UiLine::Say(s) | UiLine::Message(s) | UiLine::Error(s) => s.contains(needle),
            UiLine::Machine(..) => false,
        })
    }
}

impl Ui for CollectingUi {
    fn say(&self, message: &str) {
        self.lines.write().push(UiLine::Say(message.to_string()));
    }

    fn message(&self, message: &str) {
        self.lines.write().push(UiLine::Message(message.to_string()));
    }

    fn error(&self, message: &str) {
        self.lines.write().push(UiLine::Error(message.to_string()));
    }

    fn machine(&self, category: &str, args: &[&str]) {
        self.lines.write().push(UiLine::Machine(
            category.to_string(),
            args.iter().map(|a| (*a).to_string()).collect(),
        ));
    }
}

/// A cloneable in-memory writer.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, lossily decoded.
    #[must_use]
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
