//! User-visible status of the recognition controller.

use std::fmt;

use crate::system::EngineProgress;

pub const CANCELLED_TEXT: &str = "Cancelled";
pub const EXPIRED_TEXT: &str = "Region data expired, please try again";

/// What happened to the recognized text on its way to the clipboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipboardOutcome {
    Copied,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Status {
    #[default]
    Idle,
    SelectingRegion,
    Capturing,
    Preparing,
    /// Engine progress, `percent` in `0..=100`.
    Progress { stage: String, percent: u8 },
    Done {
        word_count: usize,
        character_count: usize,
        clipboard: ClipboardOutcome,
    },
    NoText,
    Cancelled,
    Expired,
    Error(String),
}

impl Status {
    pub fn from_progress(progress: &EngineProgress) -> Self {
        Status::Progress {
            stage: progress.status.clone(),
            percent: (progress.progress * 100.0).round().clamp(0.0, 100.0) as u8,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Status::Error(_))
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Idle => f.write_str("Ready"),
            Status::SelectingRegion => f.write_str("Select a region on the page"),
            Status::Capturing => f.write_str("Capturing screenshot..."),
            Status::Preparing => f.write_str("Preparing image..."),
            Status::Progress { stage, percent } => write!(f, "{} {percent}%", capitalize(stage)),
            Status::Done {
                word_count,
                character_count,
                clipboard,
            } => {
                write!(f, "Done: {word_count} words, {character_count} characters")?;
                match clipboard {
                    ClipboardOutcome::Copied => f.write_str(" (copied to clipboard)"),
                    ClipboardOutcome::Failed => f.write_str(" (copy to clipboard failed)"),
                    ClipboardOutcome::Skipped => Ok(()),
                }
            }
            Status::NoText => f.write_str("No text found"),
            Status::Cancelled => f.write_str(CANCELLED_TEXT),
            Status::Expired => f.write_str(EXPIRED_TEXT),
            Status::Error(message) => write!(f, "Error: {message}"),
        }
    }
}
