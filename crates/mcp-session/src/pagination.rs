//! Opaque pagination cursors.
//!
//! The client-visible contract is minimal: a present `nextCursor` means
//! "fetch the next page with it", an absent one means "no more pages". Any
//! non-null cursor — including the empty string — must be treated by a
//! client as "more data may exist", so the server side here guarantees it
//! never emits an empty-string cursor: a genuinely final page carries
//! `None`, and every encoded cursor is non-empty by construction.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Server-chosen opaque cursor string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wrap a client-supplied cursor string without interpreting it.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CursorError {
    #[error("cursor is not valid base64")]
    Encoding,
    #[error("cursor token is malformed")]
    Token,
}

/// Encode a page offset into an opaque cursor. The result is never empty.
pub fn encode_cursor(offset: u64) -> Cursor {
    Cursor(URL_SAFE_NO_PAD.encode(offset.to_string()))
}

/// Decode a cursor produced by [`encode_cursor`].
///
/// Clients that send back something the server never produced get a
/// [`CursorError`], which callers surface as an invalid-params protocol
/// error rather than guessing a position.
pub fn decode_cursor(cursor: &Cursor) -> Result<u64, CursorError> {
    let raw = URL_SAFE_NO_PAD
        .decode(cursor.as_str())
        .map_err(|_| CursorError::Encoding)?;
    let text = std::str::from_utf8(&raw).map_err(|_| CursorError::Token)?;
    text.parse::<u64>().map_err(|_| CursorError::Token)
}

/// One page of results plus the forward-only continuation.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Present iff more data may exist. Never the empty string.
    #[serde(rename = "nextCursor", skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<Cursor>,
}

impl<T> Page<T> {
    /// A page followed by more data at `next_offset`.
    pub fn with_more(items: Vec<T>, next_offset: u64) -> Self {
        Self {
            items,
            next_cursor: Some(encode_cursor(next_offset)),
        }
    }

    /// The final page.
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_cursor: None,
        }
    }
}
