use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use azure_storage_blobs::prelude::BlobServiceClient;
use bytes::Bytes;
use futures::{stream, TryStreamExt};
use time::OffsetDateTime;
use tracing::{debug, instrument};

use crate::{
    adapters::{self, SignedUrlOptions, Storage, LIST_PAGE_SIZE},
    config::AzureConfig,
    model::{
        azure::{self as azure_model, AzureApi, CopyProgress},
        content::{ByteStream, Content, ListStream},
        error::{ErrorKind, NativeError, Result, StorageError},
        response::{
            ContentResponse, DeleteResponse, ExistsResponse, Raw, Response, SignedUrlResponse,
            StatResponse,
        },
    },
    util::{
        location,
        stream::{self as stream_util, PartBuffer},
    },
};

const DRIVER: &str = "azure";

/// Size of every staged block but the last.
pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Wait between two looks at a pending server-side copy.
pub const DEFAULT_COPY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How long a copy may stay pending before `copy` gives up on it.
pub const DEFAULT_COPY_TIMEOUT: Duration = Duration::from_secs(600);

static UPLOAD_SEQ: AtomicU64 = AtomicU64::new(0);

pub fn error_kind(err: &NativeError) -> ErrorKind {
    match err.code.as_str() {
        "BlobNotFound" => ErrorKind::FileNotFound,
        "ContainerNotFound" => ErrorKind::NoSuchBucket,
        "AuthorizationFailure"
        | "AuthorizationPermissionMismatch"
        | "InsufficientAccountPermissions" => ErrorKind::PermissionMissing,
        "AuthenticationFailed" | "NoAuthenticationInformation" => {
            ErrorKind::AuthorizationRequired
        }
        _ => err.kind_from_status(),
    }
}

pub fn translate(err: NativeError, location: &str) -> StorageError {
    let kind = error_kind(&err);
    let code = err.code.clone();
    StorageError::from_kind(kind, location, code, Some(Box::new(err)))
}

/// Block ids of one blob must all have the same length; the prefix keeps
/// blocks of concurrent uploads to the same blob apart.
fn block_id(upload: &str, index: usize) -> String {
    format!("{}-{:06}", upload, index)
}

fn upload_prefix() -> String {
    let seq = UPLOAD_SEQ.fetch_add(1, Ordering::Relaxed);
    let now = OffsetDateTime::now_utc().unix_timestamp_nanos() as u64;
    format!("{:016x}{:08x}", now, seq as u32)
}

/// Driver over one Azure blob container.
pub struct AzureBlobStorage<C: AzureApi = BlobServiceClient> {
    client: Arc<C>,
    container: String,
    block_size: usize,
    copy_poll_interval: Duration,
    copy_timeout: Duration,
}

impl AzureBlobStorage<BlobServiceClient> {
    pub fn connect(config: &AzureConfig) -> Result<Self> {
        let client = azure_model::service_client(&config.connection_string).map_err(|err| {
            adapters::report(
                "connect",
                StorageError::invalid_input(
                    &config.container,
                    format!("invalid connection string: {}", err.code),
                ),
            )
        })?;

        debug!(container = %config.container, "azure client ready");
        Ok(Self::new(client, &config.container))
    }
}

impl<C: AzureApi> AzureBlobStorage<C> {
    pub fn new(client: C, container: impl Into<String>) -> Self {
        Self {
            client: Arc::new(client),
            container: container.into(),
            block_size: DEFAULT_BLOCK_SIZE,
            copy_poll_interval: DEFAULT_COPY_POLL_INTERVAL,
            copy_timeout: DEFAULT_COPY_TIMEOUT,
        }
    }

    pub fn with_copy_polling(mut self, interval: Duration, timeout: Duration) -> Self {
        self.copy_poll_interval = interval;
        self.copy_timeout = timeout;
        self
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    /// A new driver on another container, sharing this one's client.
    pub fn container(&self, name: &str) -> Self {
        Self {
            client: self.client.clone(),
            container: name.to_string(),
            block_size: self.block_size,
            copy_poll_interval: self.copy_poll_interval,
            copy_timeout: self.copy_timeout,
        }
    }

    pub fn container_name(&self) -> &str {
        &self.container
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Stages the stream as blocks and commits them with one block list.
    /// A stream that fits in one block is uploaded in a single request.
    ///
    /// Nothing is committed on failure; staged blocks expire service side.
    async fn put_stream(&self, key: &str, location: &str, mut source: ByteStream) -> Result<Raw> {
        let upload = upload_prefix();
        let mut buffer = PartBuffer::new(self.block_size);
        let mut block_ids = Vec::new();

        while let Some(chunk) = source.try_next().await? {
            for block in buffer.push(&chunk) {
                let id = self.put_block(key, location, &upload, block_ids.len(), block).await?;
                block_ids.push(id);
            }
        }

        if block_ids.is_empty() {
            return self
                .client
                .put_block_blob(&self.container, key, buffer.finish())
                .await
                .map_err(|err| translate(err, location));
        }

        if !buffer.is_empty() {
            let id = self
                .put_block(key, location, &upload, block_ids.len(), buffer.finish())
                .await?;
            block_ids.push(id);
        }

        self.client
            .put_block_list(&self.container, key, block_ids)
            .await
            .map_err(|err| translate(err, location))
    }

    /// Polls the copy into `dest_key` until the service settles it. Only a
    /// successful copy returns `Ok`, so the source may then be removed.
    async fn await_copy(&self, dest_key: &str, dest: &str, mut progress: CopyProgress) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.copy_timeout;

        loop {
            match progress {
                CopyProgress::Success => return Ok(()),
                CopyProgress::Failed(reason) => {
                    let err = NativeError::new("CopyFailed", None, reason);
                    return Err(translate(err, dest));
                }
                CopyProgress::Pending if tokio::time::Instant::now() >= deadline => {
                    let err = NativeError::new(
                        "CopyPending",
                        None,
                        format!("copy still pending after {:?}", self.copy_timeout),
                    );
                    return Err(translate(err, dest));
                }
                CopyProgress::Pending => {
                    debug!(dest = %dest, "copy pending");
                    tokio::time::sleep(self.copy_poll_interval).await;
                    progress = self
                        .client
                        .copy_progress(&self.container, dest_key)
                        .await
                        .map_err(|err| translate(err, dest))?;
                }
            }
        }
    }

    async fn put_block(
        &self,
        key: &str,
        location: &str,
        upload: &str,
        index: usize,
        body: Bytes,
    ) -> Result<String> {
        let id = block_id(upload, index);

        self.client
            .put_block(&self.container, key, id.clone(), body)
            .await
            .map_err(|err| translate(err, location))?;

        Ok(id)
    }
}

#[async_trait]
impl<C: AzureApi> Storage for AzureBlobStorage<C> {
    fn driver(&self) -> &'static str {
        DRIVER
    }

    #[instrument(skip(self), fields(driver = DRIVER, container = %self.container))]
    async fn exists(&self, location: &str) -> Result<ExistsResponse> {
        let key = location::object_key(location)?;

        match self.client.get_properties(&self.container, &key).await {
            Ok(head) => Ok(ExistsResponse {
                exists: true,
                raw: head.raw,
            }),
            Err(err) => match translate(err, location) {
                err if err.is_not_found() => Ok(ExistsResponse {
                    exists: false,
                    raw: Raw::none(),
                }),
                err => Err(adapters::report("exists", err)),
            },
        }
    }

    #[instrument(skip(self), fields(driver = DRIVER, container = %self.container))]
    async fn get_buffer(&self, location: &str) -> Result<ContentResponse<Bytes>> {
        let key = location::object_key(location)?;

        let body = self.client.get_blob(&self.container, &key);
        let content = stream_util::read_to_bytes(adapters::translated_body(
            body,
            location.to_string(),
            translate,
        ))
        .await
        .map_err(|err| adapters::report("get_buffer", err))?;

        Ok(ContentResponse {
            content,
            raw: Raw::none(),
        })
    }

    fn get_stream(&self, location: &str) -> ByteStream {
        debug!(driver = DRIVER, location = %location, "get_stream");

        match location::object_key(location) {
            Ok(key) => adapters::translated_body(
                self.client.get_blob(&self.container, &key),
                location.to_string(),
                translate,
            ),
            Err(err) => Box::pin(stream::once(async move { Err::<Bytes, _>(err) })),
        }
    }

    #[instrument(skip(self, content), fields(driver = DRIVER, container = %self.container))]
    async fn put(&self, location: &str, content: Content) -> Result<Response> {
        let key = location::object_key(location)?;

        let raw = match content.into_buffered() {
            Ok(body) => self
                .client
                .put_block_blob(&self.container, &key, body)
                .await
                .map_err(|err| translate(err, location)),
            Err(source) => self.put_stream(&key, location, source).await,
        }
        .map_err(|err| adapters::report("put", err))?;

        Ok(Response::new(raw))
    }

    /// Resolves only once the service reports the copy as done.
    #[instrument(skip(self), fields(driver = DRIVER, container = %self.container))]
    async fn copy(&self, src: &str, dest: &str) -> Result<Response> {
        adapters::distinct_locations(src, dest).map_err(|err| adapters::report("copy", err))?;
        let src_key = location::object_key(src)?;
        let dest_key = location::object_key(dest)?;

        let progress = self
            .client
            .copy_blob(&self.container, &src_key, &dest_key)
            .await
            .map_err(|err| adapters::report("copy", translate(err, src)))?;

        self.await_copy(&dest_key, dest, progress)
            .await
            .map_err(|err| adapters::report("copy", err))?;

        Ok(Response::default())
    }

    /// `BlobNotFound` is reported as `was_deleted: Some(false)`.
    #[instrument(skip(self), fields(driver = DRIVER, container = %self.container))]
    async fn delete(&self, location: &str) -> Result<DeleteResponse> {
        let key = location::object_key(location)?;

        match self.client.delete_blob(&self.container, &key).await {
            Ok(raw) => Ok(DeleteResponse {
                was_deleted: Some(true),
                raw,
            }),
            Err(err) => match translate(err, location) {
                err if err.is_not_found() => Ok(DeleteResponse {
                    was_deleted: Some(false),
                    raw: Raw::none(),
                }),
                err => Err(adapters::report("delete", err)),
            },
        }
    }

    #[instrument(skip(self), fields(driver = DRIVER, container = %self.container))]
    async fn get_stat(&self, location: &str) -> Result<StatResponse> {
        let key = location::object_key(location)?;

        let head = self
            .client
            .get_properties(&self.container, &key)
            .await
            .map_err(|err| adapters::report("get_stat", translate(err, location)))?;

        Ok(StatResponse {
            size: head.size,
            modified: head.modified.unwrap_or(OffsetDateTime::UNIX_EPOCH),
            raw: head.raw,
        })
    }

    /// Read only SAS token appended to the blob url.
    #[instrument(skip(self), fields(driver = DRIVER, container = %self.container))]
    async fn get_signed_url(
        &self,
        location: &str,
        options: SignedUrlOptions,
    ) -> Result<SignedUrlResponse> {
        options.validate(location)?;
        let key = location::object_key(location)?;
        let expiry = OffsetDateTime::now_utc() + options.expiry;

        let signed_url = self
            .client
            .signed_blob_url(&self.container, &key, expiry)
            .await
            .map_err(|err| adapters::report("get_signed_url", translate(err, location)))?;

        Ok(SignedUrlResponse {
            signed_url,
            raw: Raw::none(),
        })
    }

    fn get_url(&self, location: &str) -> Result<String> {
        let key = location::object_key(location)?;

        self.client
            .blob_url(&self.container, &key)
            .map_err(|err| translate(err, location))
    }

    fn flat_list(&self, prefix: &str) -> ListStream {
        let key_prefix = location::normalize_prefix(prefix);
        debug!(driver = DRIVER, prefix = %key_prefix, "flat_list");

        let pages = self
            .client
            .list_blobs(&self.container, &key_prefix, LIST_PAGE_SIZE as u32);

        adapters::list_entries(pages, prefix.to_string(), translate)
    }
}
