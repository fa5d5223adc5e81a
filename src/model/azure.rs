use std::num::NonZeroU32;

use azure_core::error::ErrorKind;
use azure_storage_blobs::blob::CopyStatus;
use azure_storage::{shared_access_signature::service_sas::BlobSasPermissions, ConnectionString};
use azure_storage_blobs::prelude::*;
use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use time::OffsetDateTime;

use crate::model::{
    error::NativeError,
    native::{ListPage, ListedObject, NativeBody, NativeFuture, NativeResult, ObjectHead},
    response::Raw,
};

/// The calls the Azure driver makes, and nothing more. Every call names
/// its container so one service client can back several drivers.
pub trait AzureApi: Send + Sync + 'static {
    fn get_properties(&self, container: &str, key: &str) -> NativeFuture<'_, ObjectHead>;

    /// Lazy download; the first request is sent on first poll.
    fn get_blob(&self, container: &str, key: &str) -> NativeBody;

    fn put_block_blob(&self, container: &str, key: &str, body: Bytes) -> NativeFuture<'_, Raw>;

    fn put_block(
        &self,
        container: &str,
        key: &str,
        block_id: String,
        body: Bytes,
    ) -> NativeFuture<'_, ()>;

    /// Commits the given uncommitted blocks, in order, as the blob content.
    fn put_block_list(
        &self,
        container: &str,
        key: &str,
        block_ids: Vec<String>,
    ) -> NativeFuture<'_, Raw>;

    /// Starts a server-side copy. The service may still be copying when
    /// this resolves.
    fn copy_blob(&self, container: &str, src: &str, dest: &str) -> NativeFuture<'_, CopyProgress>;

    /// State of the last copy into `key`.
    fn copy_progress(&self, container: &str, key: &str) -> NativeFuture<'_, CopyProgress>;

    fn delete_blob(&self, container: &str, key: &str) -> NativeFuture<'_, Raw>;

    /// Pages of the listing, each requested only when polled.
    fn list_blobs(
        &self,
        container: &str,
        prefix: &str,
        max_results: u32,
    ) -> BoxStream<'static, NativeResult<ListPage>>;

    fn blob_url(&self, container: &str, key: &str) -> NativeResult<String>;

    /// Blob url carrying a read-only SAS token.
    fn signed_blob_url(
        &self,
        container: &str,
        key: &str,
        expiry: OffsetDateTime,
    ) -> NativeFuture<'_, String>;
}

/// Where a server-side copy stands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CopyProgress {
    Pending,
    Success,
    /// Aborted or failed, with the service's description.
    Failed(String),
}

impl CopyProgress {
    /// A blob that never was a copy target carries no copy status.
    pub fn from_status(status: Option<CopyStatus>, description: Option<String>) -> Self {
        match status {
            None | Some(CopyStatus::Success) => Self::Success,
            Some(CopyStatus::Pending) => Self::Pending,
            Some(status) => {
                Self::Failed(description.unwrap_or_else(|| format!("{:?}", status).to_lowercase()))
            }
        }
    }
}

/// Keeps the `x-ms-error-code` (or the bare status when the service sent
/// none) for HTTP failures, the error kind name otherwise.
pub fn native_error(err: azure_core::Error) -> NativeError {
    let (code, status) = match err.kind() {
        ErrorKind::HttpResponse { status, error_code } => {
            let status = u16::from(*status);
            let code = error_code.clone().unwrap_or_else(|| status.to_string());
            (code, Some(status))
        }
        kind => (format!("{:?}", kind), None),
    };

    NativeError::new(code, status, err)
}

/// Builds a service client from an account connection string.
pub fn service_client(connection_string: &str) -> NativeResult<BlobServiceClient> {
    let parsed = ConnectionString::new(connection_string).map_err(native_error)?;
    let account = parsed.account_name.ok_or_else(|| {
        NativeError::new(
            "MissingAccountName",
            None,
            "connection string has no AccountName",
        )
    })?;
    let credentials = parsed.storage_credentials().map_err(native_error)?;

    Ok(ClientBuilder::new(account, credentials).blob_service_client())
}

impl AzureApi for BlobServiceClient {
    fn get_properties(&self, container: &str, key: &str) -> NativeFuture<'_, ObjectHead> {
        let blob = self.container_client(container).blob_client(key);

        Box::pin(async move {
            let props = blob.get_properties().await.map_err(native_error)?;
            let size = props.blob.properties.content_length;
            let modified = props.blob.properties.last_modified;

            Ok(ObjectHead {
                size,
                modified: Some(modified),
                raw: Raw::new(props),
            })
        })
    }

    fn get_blob(&self, container: &str, key: &str) -> NativeBody {
        let pages = self
            .container_client(container)
            .blob_client(key)
            .get()
            .into_stream();

        Box::pin(
            pages
                .map_ok(|res| res.data)
                .try_flatten()
                .map_err(native_error),
        )
    }

    fn put_block_blob(&self, container: &str, key: &str, body: Bytes) -> NativeFuture<'_, Raw> {
        let blob = self.container_client(container).blob_client(key);

        Box::pin(async move {
            let res = blob.put_block_blob(body).await.map_err(native_error)?;
            Ok(Raw::new(res))
        })
    }

    fn put_block(
        &self,
        container: &str,
        key: &str,
        block_id: String,
        body: Bytes,
    ) -> NativeFuture<'_, ()> {
        let blob = self.container_client(container).blob_client(key);

        Box::pin(async move {
            blob.put_block(BlockId::new(block_id), body)
                .await
                .map_err(native_error)?;
            Ok(())
        })
    }

    fn put_block_list(
        &self,
        container: &str,
        key: &str,
        block_ids: Vec<String>,
    ) -> NativeFuture<'_, Raw> {
        let blob = self.container_client(container).blob_client(key);
        let block_list = BlockList {
            blocks: block_ids
                .into_iter()
                .map(|id| BlobBlockType::Uncommitted(BlockId::new(id)))
                .collect(),
        };

        Box::pin(async move {
            let res = blob.put_block_list(block_list).await.map_err(native_error)?;
            Ok(Raw::new(res))
        })
    }

    fn copy_blob(&self, container: &str, src: &str, dest: &str) -> NativeFuture<'_, CopyProgress> {
        let container = self.container_client(container);
        let src = container.blob_client(src);
        let dest = container.blob_client(dest);

        Box::pin(async move {
            let src_url = src.url().map_err(native_error)?;
            let res = dest.copy(src_url).await.map_err(native_error)?;
            Ok(CopyProgress::from_status(Some(res.copy_status), None))
        })
    }

    fn copy_progress(&self, container: &str, key: &str) -> NativeFuture<'_, CopyProgress> {
        let blob = self.container_client(container).blob_client(key);

        Box::pin(async move {
            let props = blob.get_properties().await.map_err(native_error)?;
            let properties = props.blob.properties;

            Ok(CopyProgress::from_status(
                properties.copy_status,
                properties.copy_status_description,
            ))
        })
    }

    fn delete_blob(&self, container: &str, key: &str) -> NativeFuture<'_, Raw> {
        let blob = self.container_client(container).blob_client(key);

        Box::pin(async move {
            let res = blob.delete().await.map_err(native_error)?;
            Ok(Raw::new(res))
        })
    }

    fn list_blobs(
        &self,
        container: &str,
        prefix: &str,
        max_results: u32,
    ) -> BoxStream<'static, NativeResult<ListPage>> {
        let pages = self
            .container_client(container)
            .list_blobs()
            .prefix(prefix.to_string())
            .max_results(NonZeroU32::new(max_results).unwrap_or(NonZeroU32::MIN))
            .into_stream();

        Box::pin(pages.map(|page| {
            let page = page.map_err(native_error)?;

            let objects = page
                .blobs
                .blobs()
                .map(|blob| ListedObject {
                    key: blob.name.clone(),
                    raw: Raw::new(blob.clone()),
                })
                .collect();

            Ok(ListPage {
                objects,
                next_token: page.next_marker.map(|marker| marker.as_str().to_string()),
            })
        }))
    }

    fn blob_url(&self, container: &str, key: &str) -> NativeResult<String> {
        self.container_client(container)
            .blob_client(key)
            .url()
            .map(|url| url.to_string())
            .map_err(native_error)
    }

    fn signed_blob_url(
        &self,
        container: &str,
        key: &str,
        expiry: OffsetDateTime,
    ) -> NativeFuture<'_, String> {
        let blob = self.container_client(container).blob_client(key);
        let permissions = BlobSasPermissions {
            read: true,
            ..Default::default()
        };

        Box::pin(async move {
            let sas = blob
                .shared_access_signature(permissions, expiry)
                .await
                .map_err(native_error)?;
            let url = blob.generate_signed_blob_url(&sas).map_err(native_error)?;

            Ok(url.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_progress_from_status() {
        let cases = vec![
            (None, None, CopyProgress::Success),
            (Some(CopyStatus::Success), None, CopyProgress::Success),
            (Some(CopyStatus::Pending), None, CopyProgress::Pending),
            (Some(CopyStatus::Aborted), None, CopyProgress::Failed("aborted".to_string())),
            (
                Some(CopyStatus::Failed),
                Some("500 InternalError".to_string()),
                CopyProgress::Failed("500 InternalError".to_string()),
            ),
        ];

        for (status, description, expected) in cases {
            assert_eq!(
                CopyProgress::from_status(status, description),
                expected,
                "failed for case: {:?}",
                status
            );
        }
    }
}
