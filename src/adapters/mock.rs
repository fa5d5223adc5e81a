use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use bytes::Bytes;
use futures::{
    stream::{self, BoxStream},
    TryStreamExt,
};
use time::OffsetDateTime;

use crate::model::{
    azure::{AzureApi, CopyProgress},
    error::NativeError,
    gcs::GcsApi,
    native::{
        ListPage, ListedObject, NativeBody, NativeFuture, NativeResult, ObjectHead, UploadBody,
        UploadedPart,
    },
    response::Raw,
    s3::S3Api,
};

#[derive(Default)]
struct State {
    objects: BTreeMap<(String, String), Bytes>,
    failures: HashMap<String, NativeFailure>,
    calls: HashMap<String, usize>,
    page_size: Option<usize>,
    uploads: BTreeMap<String, BTreeMap<i32, Bytes>>,
    next_upload: u64,
    blocks: HashMap<String, Bytes>,
    copy_polls: usize,
    copies_fail: bool,
    pending_copies: HashMap<(String, String), PendingCopy>,
}

/// An Azure copy the service has not finished yet. The source is read
/// when it completes.
struct PendingCopy {
    src: String,
    polls_left: usize,
}

#[derive(Clone)]
struct NativeFailure {
    code: String,
    status: Option<u16>,
    message: String,
}

/// In-memory object store speaking the S3, GCS and Azure client traits,
/// each with that backend's own error codes.
///
/// Calls are counted per trait method and any method can be made to fail.
#[derive(Clone, Default)]
pub struct MockClient {
    state: Arc<Mutex<State>>,
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every later call of `op` fails with the given native code.
    pub fn fail(&self, op: &str, code: &str, status: Option<u16>) {
        self.fail_with(op, code, status, "injected failure");
    }

    pub fn fail_with(&self, op: &str, code: &str, status: Option<u16>, message: &str) {
        self.state().failures.insert(
            op.to_string(),
            NativeFailure {
                code: code.to_string(),
                status,
                message: message.to_string(),
            },
        );
    }

    pub fn calls(&self, op: &str) -> usize {
        self.state().calls.get(op).copied().unwrap_or(0)
    }

    /// Caps every listing page, whatever the driver asks for.
    pub fn set_page_size(&self, page_size: usize) {
        self.state().page_size = Some(page_size);
    }

    /// Azure copies stay pending for `polls` progress checks before they
    /// settle.
    pub fn set_copy_polls(&self, polls: usize) {
        self.state().copy_polls = polls;
    }

    /// Pending Azure copies settle as failed instead of copying.
    pub fn fail_pending_copies(&self) {
        self.state().copies_fail = true;
    }

    /// Multipart uploads neither completed nor aborted.
    pub fn open_uploads(&self) -> usize {
        self.state().uploads.len()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn enter(&self, op: &str) -> NativeResult<()> {
        let mut state = self.state();
        *state.calls.entry(op.to_string()).or_default() += 1;

        match state.failures.get(op) {
            Some(failure) => Err(NativeError::new(
                failure.code.clone(),
                failure.status,
                failure.message.clone(),
            )),
            None => Ok(()),
        }
    }

    fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.state()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    fn insert(&self, bucket: &str, key: &str, body: Bytes) {
        self.state()
            .objects
            .insert((bucket.to_string(), key.to_string()), body);
    }

    fn remove(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.state()
            .objects
            .remove(&(bucket.to_string(), key.to_string()))
    }

    fn head(&self, bucket: &str, key: &str) -> Option<ObjectHead> {
        self.object(bucket, key).map(|body| ObjectHead {
            size: body.len() as u64,
            modified: Some(OffsetDateTime::now_utc()),
            raw: Raw::none(),
        })
    }

    /// Keys are listed in order; the token is the last key of the previous
    /// page.
    fn list(&self, bucket: &str, prefix: &str, token: Option<String>, max: usize) -> ListPage {
        let state = self.state();
        let limit = state.page_size.unwrap_or(max).min(max).max(1);

        let mut matching = Vec::new();
        for ((b, key), body) in &state.objects {
            if b != bucket || !key.starts_with(prefix) {
                continue;
            }
            if let Some(token) = &token {
                if key <= token {
                    continue;
                }
            }
            matching.push((key.clone(), body.len()));
        }

        let more = matching.len() > limit;
        let objects: Vec<ListedObject> = matching
            .into_iter()
            .take(limit)
            .map(|(key, size)| ListedObject {
                key,
                raw: Raw::new(size),
            })
            .collect();

        let next_token = if more {
            objects.last().map(|obj| obj.key.clone())
        } else {
            None
        };

        ListPage {
            objects,
            next_token,
        }
    }

    fn body(bytes: Bytes) -> NativeBody {
        Box::pin(stream::iter(vec![Ok(bytes)]))
    }
}

fn s3_missing_key() -> NativeError {
    NativeError::new("NoSuchKey", Some(404), "The specified key does not exist.")
}

fn gcs_missing(bucket: &str, key: &str) -> NativeError {
    NativeError::new("404", Some(404), format!("No such object: {}/{}", bucket, key))
}

fn azure_missing() -> NativeError {
    NativeError::new("BlobNotFound", Some(404), "The specified blob does not exist.")
}

impl S3Api for MockClient {
    fn head_object(&self, bucket: &str, key: &str) -> NativeFuture<'_, ObjectHead> {
        let head = self.enter("head_object").and_then(|()| {
            self.head(bucket, key)
                .ok_or_else(|| NativeError::new("NotFound", Some(404), "head: not found"))
        });

        Box::pin(async move { head })
    }

    fn get_object(&self, bucket: &str, key: &str) -> NativeFuture<'_, NativeBody> {
        let body = self.enter("get_object").and_then(|()| {
            self.object(bucket, key)
                .map(Self::body)
                .ok_or_else(s3_missing_key)
        });

        Box::pin(async move { body })
    }

    fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> NativeFuture<'_, Raw> {
        let res = self.enter("put_object").map(|()| {
            self.insert(bucket, key, body);
            Raw::none()
        });

        Box::pin(async move { res })
    }

    fn create_multipart_upload(&self, _bucket: &str, _key: &str) -> NativeFuture<'_, String> {
        let res = self.enter("create_multipart_upload").map(|()| {
            let mut state = self.state();
            state.next_upload += 1;
            let upload_id = format!("upload-{}", state.next_upload);
            state.uploads.insert(upload_id.clone(), BTreeMap::new());
            upload_id
        });

        Box::pin(async move { res })
    }

    fn upload_part(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> NativeFuture<'_, UploadedPart> {
        let res = self.enter("upload_part").and_then(|()| {
            let mut state = self.state();
            let parts = state
                .uploads
                .get_mut(upload_id)
                .ok_or_else(|| NativeError::new("NoSuchUpload", Some(404), "no such upload"))?;
            parts.insert(part_number, body);

            Ok(UploadedPart {
                part_number,
                e_tag: Some(format!("\"etag-{}\"", part_number)),
            })
        });

        Box::pin(async move { res })
    }

    fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<UploadedPart>,
    ) -> NativeFuture<'_, Raw> {
        let res = self.enter("complete_multipart_upload").and_then(|()| {
            let stored = self
                .state()
                .uploads
                .remove(upload_id)
                .ok_or_else(|| NativeError::new("NoSuchUpload", Some(404), "no such upload"))?;

            let mut content = Vec::new();
            for part in parts {
                let body = stored.get(&part.part_number).ok_or_else(|| {
                    NativeError::new("InvalidPart", Some(400), "part was never uploaded")
                })?;
                content.extend_from_slice(body);
            }

            self.insert(bucket, key, Bytes::from(content));
            Ok(Raw::none())
        });

        Box::pin(async move { res })
    }

    fn abort_multipart_upload(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
    ) -> NativeFuture<'_, ()> {
        let res = self.enter("abort_multipart_upload").map(|()| {
            self.state().uploads.remove(upload_id);
        });

        Box::pin(async move { res })
    }

    fn copy_object(&self, bucket: &str, src: &str, dest: &str) -> NativeFuture<'_, Raw> {
        let res = self.enter("copy_object").and_then(|()| {
            let body = self.object(bucket, src).ok_or_else(s3_missing_key)?;
            self.insert(bucket, dest, body);
            Ok(Raw::none())
        });

        Box::pin(async move { res })
    }

    fn delete_object(&self, bucket: &str, key: &str) -> NativeFuture<'_, Raw> {
        let res = self.enter("delete_object").map(|()| {
            self.remove(bucket, key);
            Raw::none()
        });

        Box::pin(async move { res })
    }

    fn list_objects_v2(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<String>,
        max_keys: i32,
    ) -> NativeFuture<'_, ListPage> {
        let res = self
            .enter("list_objects_v2")
            .map(|()| self.list(bucket, prefix, continuation_token, max_keys.max(1) as usize));

        Box::pin(async move { res })
    }

    fn presign_get_object(
        &self,
        bucket: &str,
        key: &str,
        expiry: Duration,
    ) -> NativeFuture<'_, String> {
        let res = self.enter("presign_get_object").map(|()| {
            format!(
                "https://{}.s3.amazonaws.com/{}?X-Amz-Expires={}&X-Amz-Signature=mock",
                bucket,
                key,
                expiry.as_secs()
            )
        });

        Box::pin(async move { res })
    }
}

impl GcsApi for MockClient {
    fn get_object(&self, bucket: &str, key: &str) -> NativeFuture<'_, ObjectHead> {
        let res = self.enter("get_object").and_then(|()| {
            self.head(bucket, key)
                .ok_or_else(|| gcs_missing(bucket, key))
        });

        Box::pin(async move { res })
    }

    fn download_object(&self, bucket: &str, key: &str) -> NativeFuture<'_, Bytes> {
        let res = self.enter("download_object").and_then(|()| {
            self.object(bucket, key)
                .ok_or_else(|| gcs_missing(bucket, key))
        });

        Box::pin(async move { res })
    }

    fn download_streamed_object(&self, bucket: &str, key: &str) -> NativeFuture<'_, NativeBody> {
        let res = self.enter("download_streamed_object").and_then(|()| {
            self.object(bucket, key)
                .map(Self::body)
                .ok_or_else(|| gcs_missing(bucket, key))
        });

        Box::pin(async move { res })
    }

    fn upload_object(&self, bucket: &str, key: &str, body: Bytes) -> NativeFuture<'_, Raw> {
        let res = self.enter("upload_object").map(|()| {
            self.insert(bucket, key, body);
            Raw::none()
        });

        Box::pin(async move { res })
    }

    /// Commits only once the channel closed without an `Err` item.
    fn upload_streamed_object(
        &self,
        bucket: &str,
        key: &str,
        body: UploadBody,
    ) -> NativeFuture<'_, Raw> {
        let bucket = bucket.to_string();
        let key = key.to_string();

        Box::pin(async move {
            self.enter("upload_streamed_object")?;

            let chunks: Vec<Bytes> = body
                .try_collect()
                .await
                .map_err(|cause| NativeError::new("UploadAborted", None, cause))?;

            self.insert(&bucket, &key, Bytes::from(chunks.concat()));
            Ok(Raw::none())
        })
    }

    fn copy_object(&self, bucket: &str, src: &str, dest: &str) -> NativeFuture<'_, Raw> {
        let res = self.enter("copy_object").and_then(|()| {
            let body = self
                .object(bucket, src)
                .ok_or_else(|| gcs_missing(bucket, src))?;
            self.insert(bucket, dest, body);
            Ok(Raw::none())
        });

        Box::pin(async move { res })
    }

    fn delete_object(&self, bucket: &str, key: &str) -> NativeFuture<'_, Raw> {
        let res = self.enter("delete_object").and_then(|()| {
            self.remove(bucket, key)
                .map(|_| Raw::none())
                .ok_or_else(|| gcs_missing(bucket, key))
        });

        Box::pin(async move { res })
    }

    fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        page_token: Option<String>,
        max_results: i32,
    ) -> NativeFuture<'_, ListPage> {
        let res = self
            .enter("list_objects")
            .map(|()| self.list(bucket, prefix, page_token, max_results.max(1) as usize));

        Box::pin(async move { res })
    }

    fn signed_url(&self, bucket: &str, key: &str, expiry: Duration) -> NativeFuture<'_, String> {
        let res = self.enter("signed_url").map(|()| {
            format!(
                "https://storage.googleapis.com/{}/{}?X-Goog-Expires={}&X-Goog-Signature=mock",
                bucket,
                key,
                expiry.as_secs()
            )
        });

        Box::pin(async move { res })
    }
}

impl AzureApi for MockClient {
    fn get_properties(&self, container: &str, key: &str) -> NativeFuture<'_, ObjectHead> {
        let res = self
            .enter("get_properties")
            .and_then(|()| self.head(container, key).ok_or_else(azure_missing));

        Box::pin(async move { res })
    }

    fn get_blob(&self, container: &str, key: &str) -> NativeBody {
        let client = self.clone();
        let container = container.to_string();
        let key = key.to_string();

        Box::pin(stream::once(async move {
            client.enter("get_blob")?;
            client.object(&container, &key).ok_or_else(azure_missing)
        }))
    }

    fn put_block_blob(&self, container: &str, key: &str, body: Bytes) -> NativeFuture<'_, Raw> {
        let res = self.enter("put_block_blob").map(|()| {
            self.insert(container, key, body);
            Raw::none()
        });

        Box::pin(async move { res })
    }

    fn put_block(
        &self,
        container: &str,
        key: &str,
        block_id: String,
        body: Bytes,
    ) -> NativeFuture<'_, ()> {
        let res = self.enter("put_block").map(|()| {
            self.state()
                .blocks
                .insert(format!("{}/{}/{}", container, key, block_id), body);
        });

        Box::pin(async move { res })
    }

    fn put_block_list(
        &self,
        container: &str,
        key: &str,
        block_ids: Vec<String>,
    ) -> NativeFuture<'_, Raw> {
        let res = self.enter("put_block_list").and_then(|()| {
            let mut content = Vec::new();
            {
                let mut state = self.state();
                for id in block_ids {
                    let block = state
                        .blocks
                        .remove(&format!("{}/{}/{}", container, key, id))
                        .ok_or_else(|| {
                            NativeError::new("InvalidBlockList", Some(400), "unknown block id")
                        })?;
                    content.extend_from_slice(&block);
                }
            }

            self.insert(container, key, Bytes::from(content));
            Ok(Raw::none())
        });

        Box::pin(async move { res })
    }

    fn copy_blob(&self, container: &str, src: &str, dest: &str) -> NativeFuture<'_, CopyProgress> {
        let res = self.enter("copy_blob").and_then(|()| {
            let body = self.object(container, src).ok_or_else(|| {
                NativeError::new(
                    "CannotVerifyCopySource",
                    Some(404),
                    "The specified blob does not exist.",
                )
            })?;

            let mut state = self.state();
            if state.copy_polls == 0 {
                state
                    .objects
                    .insert((container.to_string(), dest.to_string()), body);
                return Ok(CopyProgress::Success);
            }

            let polls_left = state.copy_polls;
            state.pending_copies.insert(
                (container.to_string(), dest.to_string()),
                PendingCopy {
                    src: src.to_string(),
                    polls_left,
                },
            );
            Ok(CopyProgress::Pending)
        });

        Box::pin(async move { res })
    }

    fn copy_progress(&self, container: &str, key: &str) -> NativeFuture<'_, CopyProgress> {
        let res = self.enter("copy_progress").and_then(|()| {
            let mut state = self.state();
            let target = (container.to_string(), key.to_string());

            let Some(copy) = state.pending_copies.get_mut(&target) else {
                if state.objects.contains_key(&target) {
                    return Ok(CopyProgress::Success);
                }
                return Err(azure_missing());
            };

            copy.polls_left = copy.polls_left.saturating_sub(1);
            if copy.polls_left > 0 {
                return Ok(CopyProgress::Pending);
            }

            let src = (container.to_string(), copy.src.clone());
            state.pending_copies.remove(&target);
            if state.copies_fail {
                return Ok(CopyProgress::Failed("copy aborted".to_string()));
            }

            match state.objects.get(&src).cloned() {
                Some(body) => {
                    state.objects.insert(target, body);
                    Ok(CopyProgress::Success)
                }
                None => Ok(CopyProgress::Failed("copy source was deleted".to_string())),
            }
        });

        Box::pin(async move { res })
    }

    fn delete_blob(&self, container: &str, key: &str) -> NativeFuture<'_, Raw> {
        let res = self.enter("delete_blob").and_then(|()| {
            self.remove(container, key)
                .map(|_| Raw::none())
                .ok_or_else(azure_missing)
        });

        Box::pin(async move { res })
    }

    fn list_blobs(
        &self,
        container: &str,
        prefix: &str,
        max_results: u32,
    ) -> BoxStream<'static, NativeResult<ListPage>> {
        let client = self.clone();
        let container = container.to_string();
        let prefix = prefix.to_string();
        let start: Option<Option<String>> = Some(None);

        Box::pin(stream::try_unfold(start, move |cursor| {
            let client = client.clone();
            let container = container.clone();
            let prefix = prefix.clone();

            async move {
                let Some(marker) = cursor else {
                    return Ok::<_, NativeError>(None);
                };

                client.enter("list_blobs")?;
                let page = client.list(&container, &prefix, marker, max_results as usize);
                let next = page.next_token.clone().map(Some);

                Ok(Some((page, next)))
            }
        }))
    }

    fn blob_url(&self, container: &str, key: &str) -> NativeResult<String> {
        Ok(format!(
            "https://mock.blob.core.windows.net/{}/{}",
            container, key
        ))
    }

    fn signed_blob_url(
        &self,
        container: &str,
        key: &str,
        expiry: OffsetDateTime,
    ) -> NativeFuture<'_, String> {
        let res = self
            .enter("signed_blob_url")
            .and_then(|()| self.blob_url(container, key))
            .map(|url| {
                format!(
                    "{}?se={}&sp=r&sv=2022-11-02&sig=mock",
                    url,
                    expiry.unix_timestamp()
                )
            });

        Box::pin(async move { res })
    }
}
