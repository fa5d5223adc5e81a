use std::{any::Any, fmt};

use time::OffsetDateTime;

/// The backend's own result for an operation, kept as an escape hatch.
///
/// Drivers store whatever the native client returned (an SDK output struct,
/// `std::fs::Metadata`, ...); callers that know the backend can downcast it.
#[derive(Default)]
pub struct Raw(Option<Box<dyn Any + Send + Sync>>);

impl Raw {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Some(Box::new(value)))
    }

    pub fn none() -> Self {
        Self(None)
    }

    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.as_ref().and_then(|raw| raw.downcast_ref::<T>())
    }

    pub fn downcast<T: Any>(self) -> Option<T> {
        self.0
            .and_then(|raw| raw.downcast::<T>().ok())
            .map(|raw| *raw)
    }
}

impl fmt::Debug for Raw {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(_) => f.write_str("Raw(..)"),
            None => f.write_str("Raw(None)"),
        }
    }
}

#[derive(Debug, Default)]
pub struct Response {
    pub raw: Raw,
}

impl Response {
    pub fn new(raw: Raw) -> Self {
        Self { raw }
    }
}

#[derive(Debug)]
pub struct ExistsResponse {
    pub exists: bool,
    pub raw: Raw,
}

#[derive(Debug)]
pub struct DeleteResponse {
    /// `None` when the backend cannot tell whether anything was removed.
    pub was_deleted: Option<bool>,
    pub raw: Raw,
}

#[derive(Debug)]
pub struct ContentResponse<T> {
    pub content: T,
    pub raw: Raw,
}

#[derive(Debug)]
pub struct StatResponse {
    /// Size in bytes.
    pub size: u64,
    pub modified: OffsetDateTime,
    pub raw: Raw,
}

#[derive(Debug)]
pub struct SignedUrlResponse {
    pub signed_url: String,
    pub raw: Raw,
}

/// One entry of a flat listing; `path` is relative to the driver's root.
#[derive(Debug)]
pub struct FileListEntry {
    pub path: String,
    pub raw: Raw,
}
