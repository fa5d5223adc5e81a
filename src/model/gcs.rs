use std::time::Duration;

use bytes::Bytes;
use futures::TryStreamExt;
use google_cloud_storage::{
    http::{
        objects::{
            copy::CopyObjectRequest,
            delete::DeleteObjectRequest,
            download::Range,
            get::GetObjectRequest,
            list::ListObjectsRequest,
            upload::{Media, UploadObjectRequest, UploadType},
            Object,
        },
        Error,
    },
    sign::{SignedURLMethod, SignedURLOptions},
};

use crate::model::{
    error::NativeError,
    native::{ListPage, ListedObject, NativeBody, NativeFuture, ObjectHead, UploadBody},
    response::Raw,
};

/// The calls the GCS driver makes, and nothing more.
///
/// The real client shares these method names with the SDK's own
/// `StorageClient`, reached through `Deref`; the impl below calls the SDK
/// as `(**self)` so it never resolves back to the trait.
pub trait GcsApi: Send + Sync + 'static {
    fn get_object(&self, bucket: &str, key: &str) -> NativeFuture<'_, ObjectHead>;

    fn download_object(&self, bucket: &str, key: &str) -> NativeFuture<'_, Bytes>;

    fn download_streamed_object(&self, bucket: &str, key: &str) -> NativeFuture<'_, NativeBody>;

    fn upload_object(&self, bucket: &str, key: &str, body: Bytes) -> NativeFuture<'_, Raw>;

    /// Uploads whatever arrives on `body` until the channel closes; an `Err`
    /// item must abort the upload without committing an object.
    fn upload_streamed_object(
        &self,
        bucket: &str,
        key: &str,
        body: UploadBody,
    ) -> NativeFuture<'_, Raw>;

    fn copy_object(&self, bucket: &str, src: &str, dest: &str) -> NativeFuture<'_, Raw>;

    fn delete_object(&self, bucket: &str, key: &str) -> NativeFuture<'_, Raw>;

    fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        page_token: Option<String>,
        max_results: i32,
    ) -> NativeFuture<'_, ListPage>;

    /// May need a round trip to fetch a signing token.
    fn signed_url(&self, bucket: &str, key: &str, expiry: Duration) -> NativeFuture<'_, String>;
}

/// HTTP failures keep their status as code; client-side failures get a
/// short class name.
///
/// Error bodies that are not JSON, like the plain text 404 of a media
/// download, arrive as a transport error that still carries the status.
pub fn native_error(err: Error) -> NativeError {
    let status = match &err {
        Error::Response(res) => u16::try_from(res.code).ok(),
        Error::HttpClient(cause) => cause.status().map(|status| status.as_u16()),
        _ => None,
    };

    match status {
        Some(status) => NativeError::new(status.to_string(), Some(status), err),
        None => NativeError::new("ClientError", None, err),
    }
}

fn head(obj: Object) -> ObjectHead {
    ObjectHead {
        size: obj.size.max(0) as u64,
        modified: obj.updated,
        raw: Raw::new(obj),
    }
}

impl GcsApi for google_cloud_storage::client::Client {
    fn get_object(&self, bucket: &str, key: &str) -> NativeFuture<'_, ObjectHead> {
        let req = GetObjectRequest {
            bucket: bucket.to_string(),
            object: key.to_string(),
            ..Default::default()
        };

        Box::pin(async move {
            let obj = (**self).get_object(&req).await.map_err(native_error)?;
            Ok(head(obj))
        })
    }

    fn download_object(&self, bucket: &str, key: &str) -> NativeFuture<'_, Bytes> {
        let req = GetObjectRequest {
            bucket: bucket.to_string(),
            object: key.to_string(),
            ..Default::default()
        };

        Box::pin(async move {
            let bytes = (**self)
                .download_object(&req, &Range::default())
                .await
                .map_err(native_error)?;

            Ok(Bytes::from(bytes))
        })
    }

    fn download_streamed_object(&self, bucket: &str, key: &str) -> NativeFuture<'_, NativeBody> {
        let req = GetObjectRequest {
            bucket: bucket.to_string(),
            object: key.to_string(),
            ..Default::default()
        };

        Box::pin(async move {
            let body = (**self)
                .download_streamed_object(&req, &Range::default())
                .await
                .map_err(native_error)?;

            Ok(Box::pin(body.map_err(native_error)) as NativeBody)
        })
    }

    fn upload_object(&self, bucket: &str, key: &str, body: Bytes) -> NativeFuture<'_, Raw> {
        let req = UploadObjectRequest {
            bucket: bucket.to_string(),
            ..Default::default()
        };
        let upload_type = UploadType::Simple(Media::new(key.to_string()));

        Box::pin(async move {
            let obj = (**self)
                .upload_object(&req, body, &upload_type)
                .await
                .map_err(native_error)?;

            Ok(Raw::new(obj))
        })
    }

    fn upload_streamed_object(
        &self,
        bucket: &str,
        key: &str,
        body: UploadBody,
    ) -> NativeFuture<'_, Raw> {
        let req = UploadObjectRequest {
            bucket: bucket.to_string(),
            ..Default::default()
        };
        let upload_type = UploadType::Simple(Media::new(key.to_string()));

        Box::pin(async move {
            let obj = (**self)
                .upload_streamed_object(&req, body, &upload_type)
                .await
                .map_err(native_error)?;

            Ok(Raw::new(obj))
        })
    }

    fn copy_object(&self, bucket: &str, src: &str, dest: &str) -> NativeFuture<'_, Raw> {
        let req = CopyObjectRequest {
            source_bucket: bucket.to_string(),
            source_object: src.to_string(),
            destination_bucket: bucket.to_string(),
            destination_object: dest.to_string(),
            ..Default::default()
        };

        Box::pin(async move {
            let obj = (**self).copy_object(&req).await.map_err(native_error)?;
            Ok(Raw::new(obj))
        })
    }

    fn delete_object(&self, bucket: &str, key: &str) -> NativeFuture<'_, Raw> {
        let req = DeleteObjectRequest {
            bucket: bucket.to_string(),
            object: key.to_string(),
            ..Default::default()
        };

        Box::pin(async move {
            (**self).delete_object(&req).await.map_err(native_error)?;
            Ok(Raw::none())
        })
    }

    fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        page_token: Option<String>,
        max_results: i32,
    ) -> NativeFuture<'_, ListPage> {
        let req = ListObjectsRequest {
            bucket: bucket.to_string(),
            prefix: Some(prefix.to_string()),
            page_token,
            max_results: Some(max_results),
            ..Default::default()
        };

        Box::pin(async move {
            let lo = (**self).list_objects(&req).await.map_err(native_error)?;

            let objects = lo
                .items
                .unwrap_or_default()
                .into_iter()
                .map(|obj| ListedObject {
                    key: obj.name.clone(),
                    raw: Raw::new(obj),
                })
                .collect();

            Ok(ListPage {
                objects,
                next_token: lo.next_page_token,
            })
        })
    }

    fn signed_url(&self, bucket: &str, key: &str, expiry: Duration) -> NativeFuture<'_, String> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        let opts = SignedURLOptions {
            method: SignedURLMethod::GET,
            expires: expiry,
            ..Default::default()
        };

        Box::pin(async move {
            self.signed_url(&bucket, &key, None, None, opts)
                .await
                .map_err(|err| NativeError::new("SignedURLError", None, err))
        })
    }
}
