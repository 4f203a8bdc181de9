//! Streaming-merge protocol for generated stories
//!
//! The generation backend emits raw text fragments. [`StreamAssembler`]
//! accumulates them and re-parses the whole buffer on every push, so each
//! snapshot is the latest full reconstruction of the story, never a delta.
//! The structured (non-streaming) flavor parses one JSON payload instead.

use regex::Regex;
use serde::Deserialize;

use crate::error::{StoryError, StoryResult};
use crate::prompt::{PLOT_MARKER, TITLE_MARKER};

/// Shown while the stream has produced text but no title line yet.
pub const PROVISIONAL_TITLE: &str = "Волшебная история...";

static TITLE_RE: once_cell::sync::Lazy<Regex> = once_cell::sync::Lazy::new(|| {
    Regex::new(&format!(r"(?s){}\s*(.*?)(?:\n|{}|$)", TITLE_MARKER, PLOT_MARKER))
        .expect("title pattern")
});
static PLOT_RE: once_cell::sync::Lazy<Regex> = once_cell::sync::Lazy::new(|| {
    Regex::new(&format!(r"(?s){}\s*(.*)", PLOT_MARKER)).expect("plot pattern")
});

/// Latest full reconstruction of the story being streamed.
#[derive(Debug, Clone, PartialEq)]
pub struct StorySnapshot {
    pub title: String,
    pub content: String,
    /// Set on the final, authoritative snapshot.
    pub complete: bool,
}

impl StorySnapshot {
    pub fn has_text(&self) -> bool {
        !self.title.is_empty() || !self.content.is_empty()
    }
}

/// Accumulates raw fragments and extracts title/content by marker.
#[derive(Debug, Default)]
pub struct StreamAssembler {
    buffer: String,
    title: String,
    content: String,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one raw fragment and re-derive the current snapshot.
    /// Empty fragments produce no new snapshot.
    pub fn push(&mut self, fragment: &str) -> Option<StorySnapshot> {
        if fragment.is_empty() {
            return None;
        }
        self.buffer.push_str(fragment);

        if let Some(found) = TITLE_RE
            .captures(&self.buffer)
            .and_then(|caps| caps.get(1))
        {
            let found = found.as_str().trim();
            if !found.is_empty() {
                self.title = found.to_string();
            }
        }
        if let Some(found) = PLOT_RE.captures(&self.buffer).and_then(|caps| caps.get(1)) {
            self.content = found.as_str().trim().to_string();
        }

        Some(StorySnapshot {
            title: if self.title.is_empty() {
                PROVISIONAL_TITLE.to_string()
            } else {
                self.title.clone()
            },
            content: self.content.clone(),
            complete: false,
        })
    }

    /// The authoritative final snapshot, without the provisional title
    /// substitution.
    pub fn finalize(self) -> StorySnapshot {
        StorySnapshot {
            title: self.title,
            content: self.content,
            complete: true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StructuredStory {
    title: String,
    content: String,
}

/// Parse one structured JSON payload, tolerant of surrounding code-fence
/// markup: the object is taken from the first `{` to the last `}`. Malformed
/// JSON or missing fields are hard failures of the attempt.
pub fn parse_structured_payload(raw: &str) -> StoryResult<StorySnapshot> {
    let start = raw
        .find('{')
        .ok_or_else(|| StoryError::MalformedPayload("no JSON object in response".into()))?;
    let end = raw
        .rfind('}')
        .filter(|&end| end > start)
        .ok_or_else(|| StoryError::MalformedPayload("unterminated JSON object".into()))?;
    let body: StructuredStory = serde_json::from_str(&raw[start..=end])?;
    Ok(StorySnapshot {
        title: body.title.trim().to_string(),
        content: body.content.trim().to_string(),
        complete: true,
    })
}
