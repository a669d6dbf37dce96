//! Error types for key parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating resource keys.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// The key string is empty.
    #[error("resource key cannot be empty")]
    Empty,

    /// The key does not have exactly three `/`-separated segments.
    #[error("resource key must be 'kind/namespace/name', got {segments} segment(s)")]
    WrongSegmentCount { segments: usize },

    /// One of the segments is empty.
    #[error("resource key has an empty {segment} segment")]
    EmptySegment { segment: &'static str },

    /// A segment contains characters outside the allowed set.
    #[error("invalid character {ch:?} in {segment} segment")]
    InvalidCharacter { segment: &'static str, ch: char },
}

impl KeyError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, KeyError::Empty)
    }

    /// Returns true if the key was structurally malformed (wrong shape, not bad characters).
    pub fn is_shape_error(&self) -> bool {
        matches!(
            self,
            KeyError::WrongSegmentCount { .. } | KeyError::EmptySegment { .. }
        )
    }
}
