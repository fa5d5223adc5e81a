use std::fmt;

use bytes::Bytes;
use futures::stream::BoxStream;

use crate::model::{
    error::Result,
    response::FileListEntry,
};

/// Lazy, finite, non-restartable sequence of byte chunks.
///
/// Errors arrive as items; the stream ends after the first error.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Lazy listing produced by `flat_list`. Dropping it stops pagination.
pub type ListStream = BoxStream<'static, Result<FileListEntry>>;

/// The three shapes accepted by `put`, `append` and `prepend`.
pub enum Content {
    Bytes(Bytes),
    Text(String),
    Stream(ByteStream),
}

impl Content {
    /// Buffered content as one chunk, or the stream handed back untouched.
    pub fn into_buffered(self) -> std::result::Result<Bytes, ByteStream> {
        match self {
            Self::Bytes(bytes) => Ok(bytes),
            Self::Text(text) => Ok(Bytes::from(text)),
            Self::Stream(stream) => Err(stream),
        }
    }
}

impl fmt::Debug for Content {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(bytes) => write!(f, "Content::Bytes({} bytes)", bytes.len()),
            Self::Text(text) => write!(f, "Content::Text({} bytes)", text.len()),
            Self::Stream(_) => f.write_str("Content::Stream(..)"),
        }
    }
}

impl From<Bytes> for Content {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Content {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(bytes))
    }
}

impl From<&'static [u8]> for Content {
    fn from(bytes: &'static [u8]) -> Self {
        Self::Bytes(Bytes::from_static(bytes))
    }
}

impl From<String> for Content {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Content {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<ByteStream> for Content {
    fn from(stream: ByteStream) -> Self {
        Self::Stream(stream)
    }
}
