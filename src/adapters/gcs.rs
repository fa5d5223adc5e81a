use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{channel::mpsc, future, stream, TryStreamExt};
use google_cloud_storage::client::{
    google_cloud_auth::credentials::CredentialsFile, Client, ClientConfig,
};
use time::OffsetDateTime;
use tracing::{debug, instrument};

use crate::{
    adapters::{self, local, SignedUrlOptions, Storage, LIST_PAGE_SIZE},
    config::GcsConfig,
    model::{
        content::{ByteStream, Content, ListStream},
        error::{ErrorKind, NativeError, Result, StorageError},
        gcs::GcsApi,
        response::{
            ContentResponse, DeleteResponse, ExistsResponse, Raw, Response, SignedUrlResponse,
            StatResponse,
        },
    },
    util::{location, stream as stream_util},
};

const DRIVER: &str = "gcs";

const PUBLIC_URL_BASE: &str = "https://storage.googleapis.com";

/// Chunks in flight between the caller's stream and a streamed upload.
const UPLOAD_CHANNEL_CAPACITY: usize = 8;

/// GCS reports a missing bucket with the same 404 as a missing object.
fn is_missing_bucket(err: &NativeError) -> bool {
    err.source
        .to_string()
        .to_lowercase()
        .contains("bucket does not exist")
}

pub fn error_kind(err: &NativeError) -> ErrorKind {
    match err.code.as_str() {
        "404" if is_missing_bucket(err) => ErrorKind::NoSuchBucket,
        "404" => ErrorKind::FileNotFound,
        "401" => ErrorKind::AuthorizationRequired,
        "403" => ErrorKind::PermissionMissing,
        "ENOENT" => ErrorKind::WrongKeyPath,
        _ => err.kind_from_status(),
    }
}

pub fn translate(err: NativeError, location: &str) -> StorageError {
    let kind = error_kind(&err);
    let code = err.code.clone();
    StorageError::from_kind(kind, location, code, Some(Box::new(err)))
}

/// Driver over one Google Cloud Storage bucket.
pub struct GoogleCloudStorage<C: GcsApi = Client> {
    client: Arc<C>,
    bucket: String,
}

impl GoogleCloudStorage<Client> {
    /// Authenticates with the configured key file, or with the ambient
    /// credentials when there is none.
    pub async fn connect(config: &GcsConfig) -> Result<Self> {
        let client_config = match &config.key_filename {
            Some(path) => {
                let key_path = path.display().to_string();
                match tokio::fs::metadata(path).await {
                    Ok(_) => {}
                    Err(err) if local::error_kind(err.kind()) == ErrorKind::FileNotFound => {
                        let err = NativeError::new(
                            "ENOENT",
                            None,
                            format!("key file not found: {}", key_path),
                        );
                        return Err(adapters::report("connect", translate(err, &key_path)));
                    }
                    Err(err) => {
                        return Err(adapters::report("connect", local::translate(err, &key_path)));
                    }
                }

                let credentials = CredentialsFile::new_from_file(key_path.clone())
                    .await
                    .map_err(|err| {
                        let err = NativeError::new("InvalidKeyFile", None, err);
                        adapters::report("connect", translate(err, &key_path))
                    })?;

                ClientConfig::default().with_credentials(credentials).await
            }
            None => ClientConfig::default().with_auth().await,
        }
        .map_err(|err| {
            let err = NativeError::new("AuthError", None, err);
            adapters::report("connect", translate(err, &config.bucket))
        })?;

        debug!(bucket = %config.bucket, "gcs client ready");
        Ok(Self::new(Client::new(client_config), &config.bucket))
    }
}

impl<C: GcsApi> GoogleCloudStorage<C> {
    pub fn new(client: C, bucket: impl Into<String>) -> Self {
        Self {
            client: Arc::new(client),
            bucket: bucket.into(),
        }
    }

    /// A new driver on another bucket, sharing this one's client.
    pub fn bucket(&self, name: &str) -> Self {
        Self {
            client: self.client.clone(),
            bucket: name.to_string(),
        }
    }

    pub fn bucket_name(&self) -> &str {
        &self.bucket
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Runs the native streamed upload and the pump feeding it side by side
    /// in this task. The first failure of either ends both, and a source
    /// failure is returned as is.
    async fn put_stream(&self, key: &str, location: &str, source: ByteStream) -> Result<Raw> {
        let (tx, rx) = mpsc::channel(UPLOAD_CHANNEL_CAPACITY);

        let upload = async {
            self.client
                .upload_streamed_object(&self.bucket, key, rx)
                .await
                .map_err(|err| translate(err, location))
        };

        let ((), raw) = future::try_join(stream_util::pump(source, tx), upload).await?;
        Ok(raw)
    }
}

#[async_trait]
impl<C: GcsApi> Storage for GoogleCloudStorage<C> {
    fn driver(&self) -> &'static str {
        DRIVER
    }

    #[instrument(skip(self), fields(driver = DRIVER, bucket = %self.bucket))]
    async fn exists(&self, location: &str) -> Result<ExistsResponse> {
        let key = location::object_key(location)?;

        match self.client.get_object(&self.bucket, &key).await {
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

        let content = self
            .client
            .download_object(&self.bucket, &key)
            .await
            .map_err(|err| adapters::report("get_buffer", translate(err, location)))?;

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
                .download_streamed_object(&bucket, &key)
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
                .upload_object(&self.bucket, &key, body)
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

    /// A missing object is reported as `was_deleted: Some(false)`; a
    /// missing bucket is still an error.
    #[instrument(skip(self), fields(driver = DRIVER, bucket = %self.bucket))]
    async fn delete(&self, location: &str) -> Result<DeleteResponse> {
        let key = location::object_key(location)?;

        match self.client.delete_object(&self.bucket, &key).await {
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

    #[instrument(skip(self), fields(driver = DRIVER, bucket = %self.bucket))]
    async fn get_stat(&self, location: &str) -> Result<StatResponse> {
        let key = location::object_key(location)?;

        let head = self
            .client
            .get_object(&self.bucket, &key)
            .await
            .map_err(|err| adapters::report("get_stat", translate(err, location)))?;

        Ok(StatResponse {
            size: head.size,
            modified: head.modified.unwrap_or(OffsetDateTime::UNIX_EPOCH),
            raw: head.raw,
        })
    }

    /// V4 signing; without a private key in the credentials the client
    /// fetches one signature from IAM.
    #[instrument(skip(self), fields(driver = DRIVER, bucket = %self.bucket))]
    async fn get_signed_url(
        &self,
        location: &str,
        options: SignedUrlOptions,
    ) -> Result<SignedUrlResponse> {
        options.validate(location)?;
        let key = location::object_key(location)?;

        let signed_url = self
            .client
            .signed_url(&self.bucket, &key, options.expiry)
            .await
            .map_err(|err| adapters::report("get_signed_url", translate(err, location)))?;

        Ok(SignedUrlResponse {
            signed_url,
            raw: Raw::none(),
        })
    }

    fn get_url(&self, location: &str) -> Result<String> {
        let key = location::object_key(location)?;
        adapters::join_url(
            &format!("{}/{}", PUBLIC_URL_BASE, self.bucket),
            &key,
            location,
        )
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
                    .list_objects(&bucket, &key_prefix, token, LIST_PAGE_SIZE as i32)
                    .await
            }
        });

        adapters::list_entries(pages, prefix.to_string(), translate)
    }
}
