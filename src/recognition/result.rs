//! Recognized text and the counts derived from it.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognitionResult {
    pub text: String,
    pub character_count: usize,
    pub word_count: usize,
}

impl RecognitionResult {
    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            character_count: text.chars().count(),
            word_count: count_words(&text),
            text,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Number of whitespace-delimited tokens; 0 for empty or blank text.
pub fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}
