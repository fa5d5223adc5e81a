use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Region;
use bytes::Bytes;
use futures::{stream, TryStreamExt};
use time::OffsetDateTime;
use tracing::{debug, instrument, warn};

use crate::{
    adapters::{self, SignedUrlOptions, Storage, LIST_PAGE_SIZE},
    config::S3Config,
    model::{
        content::{ByteStream, Content, ListStream},
        error::{ErrorKind, NativeError, Result, StorageError},
        native::UploadedPart,
        response::{
            ContentResponse, DeleteResponse, ExistsResponse, Raw, Response, SignedUrlResponse,
            StatResponse,
        },
        s3::S3Api,
    },
    util::{
        location,
        stream::{self as stream_util, PartBuffer},
    },
};

const DRIVER: &str = "s3";

/// Size of every multipart upload part but the last.
pub const DEFAULT_PART_SIZE: usize = 8 * 1024 * 1024;

/// SigV4 presigned urls expire after a week at most.
pub const MAX_SIGNED_URL_EXPIRY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const DEFAULT_REGION: &str = "us-east-1";

pub fn error_kind(err: &NativeError) -> ErrorKind {
    match err.code.as_str() {
        "NoSuchKey" | "NotFound" => ErrorKind::FileNotFound,
        "NoSuchBucket" => ErrorKind::NoSuchBucket,
        "AccessDenied" | "AllAccessDisabled" => ErrorKind::PermissionMissing,
        "InvalidAccessKeyId" | "SignatureDoesNotMatch" | "ExpiredToken" | "InvalidToken" => {
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

#[derive(Clone, Debug, PartialEq, Eq)]
enum Endpoint {
    Aws { region: String },
    Custom { url: String },
}

/// Driver over one bucket of an S3 compatible object store.
pub struct AmazonWebServicesS3Storage<C: S3Api = aws_sdk_s3::Client> {
    client: Arc<C>,
    bucket: String,
    endpoint: Endpoint,
    part_size: usize,
}

impl AmazonWebServicesS3Storage<aws_sdk_s3::Client> {
    /// Loads the AWS environment chain, overridden by whatever `config` sets.
    pub async fn connect(config: &S3Config) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }

        let shared = loader.load().await;
        let region = shared
            .region()
            .map(|region| region.to_string())
            .unwrap_or_else(|| DEFAULT_REGION.to_string());

        let s3_config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(config.force_path_style)
            .build();
        let client = aws_sdk_s3::Client::from_conf(s3_config);

        debug!(bucket = %config.bucket, region = %region, "s3 client ready");

        let storage = Self::new(client, &config.bucket, region);
        match &config.endpoint {
            Some(url) => storage.with_endpoint(url),
            None => storage,
        }
    }
}

impl<C: S3Api> AmazonWebServicesS3Storage<C> {
    pub fn new(client: C, bucket: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            client: Arc::new(client),
            bucket: bucket.into(),
            endpoint: Endpoint::Aws {
                region: region.into(),
            },
            part_size: DEFAULT_PART_SIZE,
        }
    }

    /// Public urls are built under `url` instead of the AWS virtual host.
    pub fn with_endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoint = Endpoint::Custom { url: url.into() };
        self
    }

    /// AWS rejects parts under 5 MiB; smaller sizes only suit test doubles.
    pub fn with_part_size(mut self, part_size: usize) -> Self {
        self.part_size = part_size.max(1);
        self
    }

    /// A new driver on another bucket, sharing this one's client.
    pub fn bucket(&self, name: &str) -> Self {
        Self {
            client: self.client.clone(),
            bucket: name.to_string(),
            endpoint: self.endpoint.clone(),
            part_size: self.part_size,
        }
    }

    pub fn bucket_name(&self) -> &str {
        &self.bucket
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Single `PutObject` when the stream fits in one part, multipart
    /// upload otherwise.
    async fn put_stream(&self, key: &str, location: &str, mut source: ByteStream) -> Result<Raw> {
        let mut buffer = PartBuffer::new(self.part_size);
        let mut ready = Vec::new();

        while ready.is_empty() {
            match source.try_next().await? {
                Some(chunk) => ready = buffer.push(&chunk),
                None => {
                    return self
                        .client
                        .put_object(&self.bucket, key, buffer.finish())
                        .await
                        .map_err(|err| translate(err, location));
                }
            }
        }

        let upload_id = self
            .client
            .create_multipart_upload(&self.bucket, key)
            .await
            .map_err(|err| translate(err, location))?;
        debug!(upload_id = %upload_id, "multipart upload started");

        let result = self
            .upload_parts(key, location, &upload_id, ready, buffer, source)
            .await;

        if result.is_err() {
            if let Err(err) = self
                .client
                .abort_multipart_upload(&self.bucket, key, &upload_id)
                .await
            {
                warn!(error_message = %err, upload_id = %upload_id, "abort_multipart_upload failed");
            }
        }

        result
    }

    async fn upload_parts(
        &self,
        key: &str,
        location: &str,
        upload_id: &str,
        mut ready: Vec<Bytes>,
        mut buffer: PartBuffer,
        mut source: ByteStream,
    ) -> Result<Raw> {
        let mut uploaded = Vec::new();

        loop {
            for body in ready.drain(..) {
                let part = self.upload_part(key, location, upload_id, uploaded.len(), body).await?;
                uploaded.push(part);
            }

            match source.try_next().await? {
                Some(chunk) => ready = buffer.push(&chunk),
                None => break,
            }
        }

        if !buffer.is_empty() {
            let part = self
                .upload_part(key, location, upload_id, uploaded.len(), buffer.finish())
                .await?;
            uploaded.push(part);
        }

        self.client
            .complete_multipart_upload(&self.bucket, key, upload_id, uploaded)
            .await
            .map_err(|err| translate(err, location))
    }

    async fn upload_part(
        &self,
        key: &str,
        location: &str,
        upload_id: &str,
        index: usize,
        body: Bytes,
    ) -> Result<UploadedPart> {
        let part_number = i32::try_from(index + 1)
            .map_err(|_| StorageError::invalid_input(location, "too many upload parts"))?;

        self.client
            .upload_part(&self.bucket, key, upload_id, part_number, body)
            .await
            .map_err(|err| translate(err, location))
    }
}

#[async_trait]
impl<C: S3Api> Storage for AmazonWebServicesS3Storage<C> {
    fn driver(&self) -> &'static str {
        DRIVER
    }

    #[instrument(skip(self), fields(driver = DRIVER, bucket = %self.bucket))]
    async fn exists(&self, location: &str) -> Result<ExistsResponse> {
        let key = location::object_key(location)?;

        match self.client.head_object(&self.bucket, &key).await {
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

    #[instrument(skip(self), fields(driver = DRIVER, bucket = %self.bucket))]
    async fn get_buffer(&self, location: &str) -> Result<ContentResponse<Bytes>> {
        let key = location::object_key(location)?;

        let body = self
            .client
            .get_object(&self.bucket, &key)
            .await
            .map_err(|err| adapters::report("get_buffer", translate(err, location)))?;

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
        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let location = location.to_string();
        debug!(driver = DRIVER, location = %location, "get_stream");

        let body = stream::once(async move {
            let key = location::object_key(&location)?;
            let body = client
                .get_object(&bucket, &key)
                .await
                .map_err(|err| translate(err, &location))?;

            Ok::<_, StorageError>(adapters::translated_body(body, location, translate))
        })
        .try_flatten();

        Box::pin(body)
    }

    #[instrument(skip(self, content), fields(driver = DRIVER, bucket = %self.bucket))]
    async fn put(&self, location: &str, content: Content) -> Result<Response> {
        let key = location::object_key(location)?;

        let raw = match content.into_buffered() {
            Ok(body) => self
                .client
                .put_object(&self.bucket, &key, body)
                .await
                .map_err(|err| translate(err, location)),
            Err(source) => self.put_stream(&key, location, source).await,
        }
        .map_err(|err| adapters::report("put", err))?;

        Ok(Response::new(raw))
    }

    #[instrument(skip(self), fields(driver = DRIVER, bucket = %self.bucket))]
    async fn copy(&self, src: &str, dest: &str) -> Result<Response> {
        adapters::distinct_locations(src, dest).map_err(|err| adapters::report("copy", err))?;
        let src_key = location::object_key(src)?;
        let dest_key = location::object_key(dest)?;

        let raw = self
            .client
            .copy_object(&self.bucket, &src_key, &dest_key)
            .await
            .map_err(|err| adapters::report("copy", translate(err, src)))?;

        Ok(Response::new(raw))
    }

    /// `DeleteObject` succeeds whether or not the key existed, so
    /// `was_deleted` is always `None`.
    #[instrument(skip(self), fields(driver = DRIVER, bucket = %self.bucket))]
    async fn delete(&self, location: &str) -> Result<DeleteResponse> {
        let key = location::object_key(location)?;

        let raw = self
            .client
            .delete_object(&self.bucket, &key)
            .await
            .map_err(|err| adapters::report("delete", translate(err, location)))?;

        Ok(DeleteResponse {
            was_deleted: None,
            raw,
        })
    }

    #[instrument(skip(self), fields(driver = DRIVER, bucket = %self.bucket))]
    async fn get_stat(&self, location: &str) -> Result<StatResponse> {
        let key = location::object_key(location)?;

        let head = self
            .client
            .head_object(&self.bucket, &key)
            .await
            .map_err(|err| adapters::report("get_stat", translate(err, location)))?;

        Ok(StatResponse {
            size: head.size,
            modified: head.modified.unwrap_or(OffsetDateTime::UNIX_EPOCH),
            raw: head.raw,
        })
    }

    /// Presigned locally, no request is sent.
    #[instrument(skip(self), fields(driver = DRIVER, bucket = %self.bucket))]
    async fn get_signed_url(
        &self,
        location: &str,
        options: SignedUrlOptions,
    ) -> Result<SignedUrlResponse> {
        options.validate(location)?;
        if options.expiry > MAX_SIGNED_URL_EXPIRY {
            return Err(StorageError::invalid_input(
                location,
                "signed url expiry must not exceed 7 days",
            ));
        }
        let key = location::object_key(location)?;

        let signed_url = self
            .client
            .presign_get_object(&self.bucket, &key, options.expiry)
            .await
            .map_err(|err| adapters::report("get_signed_url", translate(err, location)))?;

        Ok(SignedUrlResponse {
            signed_url,
            raw: Raw::none(),
        })
    }

    fn get_url(&self, location: &str) -> Result<String> {
        let key = location::object_key(location)?;

        match &self.endpoint {
            Endpoint::Custom { url } => {
                adapters::join_url(url, &format!("{}/{}", self.bucket, key), location)
            }
            Endpoint::Aws { region } => adapters::join_url(
                &format!("https://{}.s3.{}.amazonaws.com", self.bucket, region),
                &key,
                location,
            ),
        }
    }

    fn flat_list(&self, prefix: &str) -> ListStream {
        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let key_prefix = location::normalize_prefix(prefix);
        debug!(driver = DRIVER, prefix = %key_prefix, "flat_list");

        let pages = adapters::paginate(move |token| {
            let client = client.clone();
            let bucket = bucket.clone();
            let key_prefix = key_prefix.clone();

            async move {
                client
                    .list_objects_v2(&bucket, &key_prefix, token, LIST_PAGE_SIZE as i32)
                    .await
            }
        });

        adapters::list_entries(pages, prefix.to_string(), translate)
    }
}
