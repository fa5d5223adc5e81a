use bytes::Bytes;
use futures::{channel::mpsc, future::BoxFuture, stream::BoxStream};
use time::OffsetDateTime;

use crate::model::{
    error::{Cause, NativeError},
    response::Raw,
};

pub type NativeResult<T> = Result<T, NativeError>;

pub type NativeFuture<'a, T> = BoxFuture<'a, NativeResult<T>>;

/// Body of a download as produced by a native client.
pub type NativeBody = BoxStream<'static, NativeResult<Bytes>>;

/// Receiving half of the channel a streamed upload reads from.
///
/// The driver pumps the caller's stream into the sending half; an `Err`
/// item tells the native upload to abort.
pub type UploadBody = mpsc::Receiver<Result<Bytes, Cause>>;

/// Metadata of a single object as reported by a head/properties call.
#[derive(Debug)]
pub struct ObjectHead {
    pub size: u64,
    pub modified: Option<OffsetDateTime>,
    pub raw: Raw,
}

#[derive(Debug)]
pub struct ListedObject {
    pub key: String,
    pub raw: Raw,
}

/// One page of a native listing.
#[derive(Debug, Default)]
pub struct ListPage {
    pub objects: Vec<ListedObject>,
    /// Cursor for the next page, `None` on the last one.
    pub next_token: Option<String>,
}

/// Part of a multipart upload that the backend acknowledged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadedPart {
    pub part_number: i32,
    pub e_tag: Option<String>,
}
