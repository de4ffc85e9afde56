//! User-facing output.
//!
//! Every run writes through a [`Ui`]. Wrappers add colour, per-job prefixes
//! or timestamps on top of a writer; the writers scrub registered secrets
//! before anything reaches the terminal.

mod wrappers;
mod writers;

pub use wrappers::{ColoredUi, TargetedUi, TimestampedUi};
pub use writers::{BasicUi, MachineReadableUi};

/// Output sink shared by the scheduler, the runner and plugins.
pub trait Ui: Send + Sync {
    /// Prominent status line.
    fn say(&self, message: &str);

    /// Secondary output, such as plugin logs.
    fn message(&self, message: &str);

    /// Error output.
    fn error(&self, message: &str);

    /// Machine-readable record of `category` with `args`.
    fn machine(&self, category: &str, args: &[&str]);
}

/// ANSI colour codes used for per-job output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiColor {
    /// 31
    Red = 31,
    /// 32
    Green = 32,
    /// 33
    Yellow = 33,
    /// 34
    Blue = 34,
    /// 35
    Magenta = 35,
    /// 36
    Cyan = 36,
}

impl UiColor {
    /// Colours assigned to jobs in dispatch order, cycling.
    pub const PALETTE: [Self; 5] = [Self::Green, Self::Cyan, Self::Magenta, Self::Yellow, Self::Blue];

    /// Palette entry for the `index`-th job.
    #[must_use]
    pub fn for_index(index: usize) -> Self {
        Self::PALETTE[index % Self::PALETTE.len()]
    }

    /// Wraps `message` in this colour's escape sequence.
    #[must_use]
    pub fn paint(self, message: &str, bold: bool) -> String {
        let attr = u8::from(bold);
        format!("\x1b[{attr};{}m{message}\x1b[0m", self as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_palette_cycles() {
        assert_eq!(UiColor::for_index(0), UiColor::Green);
        assert_eq!(UiColor::for_index(4), UiColor::Blue);
        assert_eq!(UiColor::for_index(5), UiColor::Green);
    }

    #[test]
    fn test_paint() {
        assert_eq!(UiColor::Cyan.paint("hi", true), "\x1b[1;36mhi\x1b[0m");
        assert_eq!(UiColor::Red.paint("hi", false), "\x1b[0;31mhi\x1b[0m");
    }
}
