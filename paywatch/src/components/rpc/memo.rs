//! Shielded memo codec.
//!
//! The memo field of a shielded output is a fixed 512-byte payload, padded
//! with NUL bytes. The node reports it hex-encoded; merchants read it as
//! UTF-8 text. A leading `0xF6` byte is the protocol's "no memo" marker.

use std::fmt;

/// Memo field capacity in bytes.
pub(crate) const MAX_MEMO_BYTES: usize = 512;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum MemoError {
    /// The memo exceeds [`MAX_MEMO_BYTES`].
    TooLong(usize),
    /// The node-reported memo was not valid hex.
    InvalidHex,
    /// The memo bytes were not valid UTF-8.
    NotUtf8,
}

impl fmt::Display for MemoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoError::TooLong(len) => {
                write!(f, "memo is {len} bytes, limit is {MAX_MEMO_BYTES}")
            }
            MemoError::InvalidHex => write!(f, "memo is not valid hex"),
            MemoError::NotUtf8 => write!(f, "memo is not valid UTF-8"),
        }
    }
}

impl std::error::Error for MemoError {}

/// Hex-encodes a UTF-8 memo for submission to the node.
pub(crate) fn encode(text: &str) -> Result<String, MemoError> {
    let bytes = text.as_bytes();
    if bytes.len() > MAX_MEMO_BYTES {
        return Err(MemoError::TooLong(bytes.len()));
    }
    Ok(hex::encode(bytes))
}

/// Decodes a node-reported hex memo into text.
///
/// Returns `None` for an empty memo and for the `0xF6` no-memo marker.
pub(crate) fn decode(hex_memo: &str) -> Result<Option<String>, MemoError> {
    let mut bytes = hex::decode(hex_memo).map_err(|_| MemoError::InvalidHex)?;
    if bytes.len() > MAX_MEMO_BYTES {
        return Err(MemoError::TooLong(bytes.len()));
    }

    while bytes.last() == Some(&0) {
        bytes.pop();
    }
    if bytes.is_empty() || bytes == [0xF6] {
        return Ok(None);
    }

    let text = String::from_utf8(bytes).map_err(|_| MemoError::NotUtf8)?;
    Ok(Some(text))
}
