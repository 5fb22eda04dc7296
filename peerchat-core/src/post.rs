//! Chat post and its line frame: one JSON object per line, newline-terminated.
//!
//! Field names are `Username` and `Message` on the wire (lower-case spellings are
//! accepted on decode). JSON string escaping keeps embedded newlines out of the frame,
//! so one frame is always exactly one line.

use serde::{Deserialize, Serialize};

/// Frame terminator.
pub const LINE_TERMINATOR: u8 = b'\n';

/// A single chat message. Timestamped by whoever displays it, not on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatPost {
    #[serde(rename = "Username", alias = "username")]
    pub username: String,
    #[serde(rename = "Message", alias = "message")]
    pub message: String,
}

/// Error decoding a line into a post.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame is not valid UTF-8")]
    NotUtf8,
}

impl ChatPost {
    pub fn new(username: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            message: message.into(),
        }
    }

    /// Encode into a single newline-terminated frame.
    pub fn encode(&self) -> Vec<u8> {
        // Two string fields cannot fail to serialize.
        let mut out = serde_json::to_vec(self).unwrap_or_default();
        out.push(LINE_TERMINATOR);
        out
    }

    /// Decode one line (terminator optional). Malformed input is an error.
    pub fn try_decode(line: &[u8]) -> Result<Self, CodecError> {
        let text = std::str::from_utf8(strip_terminator(line)).map_err(|_| CodecError::NotUtf8)?;
        Ok(serde_json::from_str(text)?)
    }

    /// Lenient decode: malformed input yields a post with empty fields instead of an error.
    pub fn decode(line: &[u8]) -> Self {
        Self::try_decode(line).unwrap_or_default()
    }

    /// True when both fields are empty, as produced by a lenient decode of garbage.
    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.message.is_empty()
    }
}

/// Strip a trailing `\n` or `\r\n`.
pub fn strip_terminator(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// True when a frame carries no content (just the line terminator).
pub fn is_blank_frame(line: &[u8]) -> bool {
    strip_terminator(line).is_empty()
}
