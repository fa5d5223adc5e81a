use std::time::Duration;

use aws_sdk_s3::{
    config::http::HttpResponse,
    error::{ProvideErrorMetadata, SdkError},
    presigning::PresigningConfig,
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart},
};
use bytes::Bytes;
use futures::stream;
use time::OffsetDateTime;

use crate::model::{
    error::NativeError,
    native::{ListPage, ListedObject, NativeBody, NativeFuture, ObjectHead, UploadedPart},
    response::Raw,
};

/// The calls the S3 driver makes, and nothing more.
pub trait S3Api: Send + Sync + 'static {
    fn head_object(&self, bucket: &str, key: &str) -> NativeFuture<'_, ObjectHead>;

    fn get_object(&self, bucket: &str, key: &str) -> NativeFuture<'_, NativeBody>;

    fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> NativeFuture<'_, Raw>;

    /// Returns the upload id.
    fn create_multipart_upload(&self, bucket: &str, key: &str) -> NativeFuture<'_, String>;

    fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> NativeFuture<'_, UploadedPart>;

    fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<UploadedPart>,
    ) -> NativeFuture<'_, Raw>;

    fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> NativeFuture<'_, ()>;

    fn copy_object(&self, bucket: &str, src: &str, dest: &str) -> NativeFuture<'_, Raw>;

    fn delete_object(&self, bucket: &str, key: &str) -> NativeFuture<'_, Raw>;

    fn list_objects_v2(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<String>,
        max_keys: i32,
    ) -> NativeFuture<'_, ListPage>;

    /// Signs a GET request locally; no round trip.
    fn presign_get_object(
        &self,
        bucket: &str,
        key: &str,
        expiry: Duration,
    ) -> NativeFuture<'_, String>;
}

/// Keeps the service error code (or the failure class when the request
/// never got a service answer) and the HTTP status.
pub fn native_error<E>(err: SdkError<E, HttpResponse>) -> NativeError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let status = err.raw_response().map(|res| res.status().as_u16());
    let code = match err.code() {
        Some(code) => code.to_string(),
        None => match &err {
            SdkError::ConstructionFailure(_) => "ConstructionFailure".to_string(),
            SdkError::TimeoutError(_) => "TimeoutError".to_string(),
            SdkError::DispatchFailure(_) => "DispatchFailure".to_string(),
            SdkError::ResponseError(_) => "ResponseError".to_string(),
            _ => "ServiceError".to_string(),
        },
    };

    NativeError::new(code, status, err)
}

fn to_offset(dt: &aws_sdk_s3::primitives::DateTime) -> Option<OffsetDateTime> {
    let nanos = i128::from(dt.secs()) * 1_000_000_000 + i128::from(dt.subsec_nanos());
    OffsetDateTime::from_unix_timestamp_nanos(nanos).ok()
}

/// `x-amz-copy-source` value: bucket plus the url-encoded key.
pub fn copy_source(bucket: &str, key: &str) -> String {
    let key = key
        .split('/')
        .map(|segment| {
            url::form_urlencoded::byte_serialize(segment.as_bytes())
                .collect::<String>()
                .replace('+', "%20")
        })
        .collect::<Vec<_>>()
        .join("/");

    format!("{}/{}", bucket, key)
}

impl S3Api for aws_sdk_s3::Client {
    fn head_object(&self, bucket: &str, key: &str) -> NativeFuture<'_, ObjectHead> {
        let req = self.head_object().bucket(bucket).key(key);

        Box::pin(async move {
            let ho = req.send().await.map_err(native_error)?;

            Ok(ObjectHead {
                size: ho.content_length().unwrap_or(0).max(0) as u64,
                modified: ho.last_modified().and_then(to_offset),
                raw: Raw::new(ho),
            })
        })
    }

    fn get_object(&self, bucket: &str, key: &str) -> NativeFuture<'_, NativeBody> {
        let req = self.get_object().bucket(bucket).key(key);

        Box::pin(async move {
            let o = req.send().await.map_err(native_error)?;

            let body = stream::try_unfold(o.body, |mut body: ByteStream| async move {
                match body.try_next().await {
                    Ok(Some(chunk)) => Ok(Some((chunk, body))),
                    Ok(None) => Ok(None),
                    Err(err) => Err(NativeError::new("ByteStreamError", None, err)),
                }
            });

            Ok(Box::pin(body) as NativeBody)
        })
    }

    fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> NativeFuture<'_, Raw> {
        let req = self
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body));

        Box::pin(async move {
            let po = req.send().await.map_err(native_error)?;
            Ok(Raw::new(po))
        })
    }

    fn create_multipart_upload(&self, bucket: &str, key: &str) -> NativeFuture<'_, String> {
        let req = self.create_multipart_upload().bucket(bucket).key(key);

        Box::pin(async move {
            let cmu = req.send().await.map_err(native_error)?;

            cmu.upload_id().map(str::to_string).ok_or_else(|| {
                NativeError::new("MissingUploadId", None, "no upload id in response")
            })
        })
    }

    fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> NativeFuture<'_, UploadedPart> {
        let req = self
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body));

        Box::pin(async move {
            let up = req.send().await.map_err(native_error)?;

            Ok(UploadedPart {
                part_number,
                e_tag: up.e_tag().map(str::to_string),
            })
        })
    }

    fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<UploadedPart>,
    ) -> NativeFuture<'_, Raw> {
        let completed = parts
            .into_iter()
            .map(|part| {
                CompletedPart::builder()
                    .part_number(part.part_number)
                    .set_e_tag(part.e_tag)
                    .build()
            })
            .collect();

        let req = self
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            );

        Box::pin(async move {
            let cmu = req.send().await.map_err(native_error)?;
            Ok(Raw::new(cmu))
        })
    }

    fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> NativeFuture<'_, ()> {
        let req = self
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id);

        Box::pin(async move {
            req.send().await.map_err(native_error)?;
            Ok(())
        })
    }

    fn copy_object(&self, bucket: &str, src: &str, dest: &str) -> NativeFuture<'_, Raw> {
        let req = self
            .copy_object()
            .bucket(bucket)
            .copy_source(copy_source(bucket, src))
            .key(dest);

        Box::pin(async move {
            let co = req.send().await.map_err(native_error)?;
            Ok(Raw::new(co))
        })
    }

    fn delete_object(&self, bucket: &str, key: &str) -> NativeFuture<'_, Raw> {
        let req = self.delete_object().bucket(bucket).key(key);

        Box::pin(async move {
            let dobj = req.send().await.map_err(native_error)?;
            Ok(Raw::new(dobj))
        })
    }

    fn list_objects_v2(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<String>,
        max_keys: i32,
    ) -> NativeFuture<'_, ListPage> {
        let req = self
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .max_keys(max_keys)
            .set_continuation_token(continuation_token);

        Box::pin(async move {
            let lo = req.send().await.map_err(native_error)?;

            let objects = lo
                .contents()
                .iter()
                .filter_map(|o| {
                    o.key().map(|key| ListedObject {
                        key: key.to_string(),
                        raw: Raw::new(o.clone()),
                    })
                })
                .collect();

            Ok(ListPage {
                objects,
                next_token: lo.next_continuation_token().map(str::to_string),
            })
        })
    }

    fn presign_get_object(
        &self,
        bucket: &str,
        key: &str,
        expiry: Duration,
    ) -> NativeFuture<'_, String> {
        let req = self.get_object().bucket(bucket).key(key);

        Box::pin(async move {
            let config = PresigningConfig::expires_in(expiry)
                .map_err(|err| NativeError::new("InvalidPresigningConfig", None, err))?;
            let presigned = req.presigned(config).await.map_err(native_error)?;

            Ok(presigned.uri().to_string())
        })
    }
}
