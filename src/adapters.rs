use std::{future::Future, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{
    stream::{self, BoxStream},
    TryStreamExt,
};
use tracing::error;

use crate::{
    model::{
        content::{ByteStream, Content, ListStream},
        error::{NativeError, Result, StorageError},
        native::{ListPage, NativeBody, NativeResult},
        response::{
            ContentResponse, DeleteResponse, ExistsResponse, FileListEntry, Response,
            SignedUrlResponse, StatResponse,
        },
    },
    util,
};

pub mod azure;
pub mod gcs;
pub mod local;
#[cfg(test)]
pub mod mock;
pub mod s3;

pub use azure::AzureBlobStorage;
pub use gcs::GoogleCloudStorage;
pub use local::LocalFileSystem;
pub use s3::AmazonWebServicesS3Storage;

/// Default lifetime of a signed url.
pub const DEFAULT_SIGNED_URL_EXPIRY: Duration = Duration::from_secs(900);

/// Upper bound on entries requested per listing round trip.
pub const LIST_PAGE_SIZE: usize = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SignedUrlOptions {
    pub expiry: Duration,
}

impl Default for SignedUrlOptions {
    fn default() -> Self {
        Self {
            expiry: DEFAULT_SIGNED_URL_EXPIRY,
        }
    }
}

impl SignedUrlOptions {
    pub fn expires_in(expiry: Duration) -> Self {
        Self { expiry }
    }

    pub(crate) fn validate(&self, location: &str) -> Result<()> {
        if self.expiry.is_zero() {
            return Err(StorageError::invalid_input(
                location,
                "signed url expiry must be positive",
            ));
        }

        Ok(())
    }
}

/// Operations every storage driver exposes.
///
/// Locations are always relative to the driver's root (directory, bucket or
/// container). A driver holds nothing but an immutable handle to its
/// backend, so one instance can serve concurrent calls without locking.
///
/// Operations a backend cannot perform fail with
/// [`StorageError::MethodNotSupported`]; none of them silently no-op.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Short driver name used in logs and errors.
    fn driver(&self) -> &'static str;

    /// Never fails for a missing object, only for access or connectivity
    /// problems.
    async fn exists(&self, location: &str) -> Result<ExistsResponse>;

    /// Reads the whole object and decodes it as UTF-8.
    async fn get(&self, location: &str) -> Result<ContentResponse<String>> {
        let ContentResponse { content, raw } = self.get_buffer(location).await?;
        let content = util::stream::decode_text(location, content)?;

        Ok(ContentResponse { content, raw })
    }

    /// Reads the whole object into memory.
    async fn get_buffer(&self, location: &str) -> Result<ContentResponse<Bytes>>;

    /// Hands back a lazy stream over the object.
    ///
    /// Nothing is checked up front: a missing object surfaces as the first
    /// item of the stream. Dropping the stream releases the native handle.
    fn get_stream(&self, location: &str) -> ByteStream;

    /// Writes `content`, creating whatever intermediate namespace is needed.
    ///
    /// Stream content is piped into the backend and the call only resolves
    /// once the destination is fully committed. A failure on either side
    /// of the pipe fails the call and leaves no partial object behind.
    async fn put(&self, location: &str, content: Content) -> Result<Response>;

    async fn append(&self, _location: &str, _content: Content) -> Result<Response> {
        Err(StorageError::not_supported("append", self.driver()))
    }

    async fn prepend(&self, _location: &str, _content: Content) -> Result<Response> {
        Err(StorageError::not_supported("prepend", self.driver()))
    }

    /// Server-side copy; bytes never pass through this process for the
    /// object store drivers.
    async fn copy(&self, src: &str, dest: &str) -> Result<Response>;

    /// `copy` followed by `delete` of `src`.
    ///
    /// This is NOT atomic. When the delete fails after a successful copy the
    /// object exists at both locations and the delete error is returned.
    ///
    /// Moving an object onto itself is rejected before anything is touched.
    async fn move_file(&self, src: &str, dest: &str) -> Result<Response> {
        distinct_locations(src, dest)?;
        self.copy(src, dest).await?;
        let deleted = self.delete(src).await?;

        Ok(Response::new(deleted.raw))
    }

    /// See each driver for how an absent object is reported.
    async fn delete(&self, location: &str) -> Result<DeleteResponse>;

    async fn get_stat(&self, location: &str) -> Result<StatResponse>;

    async fn get_signed_url(
        &self,
        _location: &str,
        _options: SignedUrlOptions,
    ) -> Result<SignedUrlResponse> {
        Err(StorageError::not_supported("get_signed_url", self.driver()))
    }

    /// Pure url construction: no existence check, no network call.
    fn get_url(&self, _location: &str) -> Result<String> {
        Err(StorageError::not_supported("get_url", self.driver()))
    }

    /// Lazily lists every object whose key starts with `prefix`.
    ///
    /// Pages are only requested while the stream is polled, so a consumer
    /// may stop at any point without triggering further round trips.
    fn flat_list(&self, prefix: &str) -> ListStream;
}

/// Logs a failure that is about to reach the caller.
pub(crate) fn report(error_group: &'static str, err: StorageError) -> StorageError {
    error!(error_message = %err, error_group = error_group, kind = ?err.kind());
    err
}

/// Fails when `src` and `dest` resolve to the same object.
pub(crate) fn distinct_locations(src: &str, dest: &str) -> Result<()> {
    if util::location::normalize(src) == util::location::normalize(dest) {
        return Err(StorageError::invalid_input(
            dest,
            format!("`{}` and `{}` name the same object", src, dest),
        ));
    }

    Ok(())
}

/// Translation from a native failure to the storage taxonomy.
pub(crate) type Translate = fn(NativeError, &str) -> StorageError;

/// Turns a native download body into a driver stream, translating every
/// failure against `location`.
pub(crate) fn translated_body(body: NativeBody, location: String, translate: Translate) -> ByteStream {
    Box::pin(body.map_err(move |err| translate(err, &location)))
}

/// Lazy pagination over a token based native listing.
///
/// `fetch` runs only when the stream is polled past the previous page, and
/// never again once a page came back without a continuation token.
pub(crate) fn paginate<F, Fut>(fetch: F) -> BoxStream<'static, NativeResult<ListPage>>
where
    F: FnMut(Option<String>) -> Fut + Send + 'static,
    Fut: Future<Output = NativeResult<ListPage>> + Send + 'static,
{
    // `None` once done, `Some(None)` before the first page.
    let start: Option<Option<String>> = Some(None);

    let pages = stream::try_unfold((fetch, start), |(mut fetch, cursor)| async move {
        let Some(token) = cursor else {
            return Ok::<_, NativeError>(None);
        };

        let page = fetch(token).await?;
        let next = page
            .next_token
            .clone()
            .filter(|token| !token.is_empty())
            .map(Some);

        Ok(Some((page, (fetch, next))))
    });

    Box::pin(pages)
}

/// Flattens listing pages into entries; errors are reported against the
/// requested prefix.
pub(crate) fn list_entries(
    pages: BoxStream<'static, NativeResult<ListPage>>,
    prefix: String,
    translate: Translate,
) -> ListStream {
    let entries = pages
        .map_ok(|page| {
            stream::iter(page.objects.into_iter().map(|obj| {
                Ok::<_, NativeError>(FileListEntry {
                    path: obj.key,
                    raw: obj.raw,
                })
            }))
        })
        .try_flatten()
        .map_err(move |err| translate(err, &prefix));

    Box::pin(entries)
}

/// Builds a public url for `key` under `base`, percent-encoding each
/// segment of the key.
pub(crate) fn join_url(base: &str, key: &str, location: &str) -> Result<String> {
    let mut url = url::Url::parse(base).map_err(|err| {
        StorageError::invalid_input(location, format!("invalid base url {}: {}", base, err))
    })?;

    url.path_segments_mut()
        .map_err(|_| StorageError::invalid_input(location, format!("cannot-be-a-base url: {}", base)))?
        .pop_if_empty()
        .extend(key.split('/'));

    Ok(url.to_string())
}
