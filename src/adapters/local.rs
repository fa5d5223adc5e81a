use std::{
    io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, TryStreamExt};
use time::OffsetDateTime;
use tokio::{
    fs::{self, File, ReadDir},
    io::AsyncWriteExt,
};
use tracing::{debug, instrument};

use crate::{
    adapters::{self, Storage},
    model::{
        content::{ByteStream, Content, ListStream},
        error::{ErrorKind, Result, StorageError},
        response::{
            ContentResponse, DeleteResponse, ExistsResponse, FileListEntry, Raw, Response,
            StatResponse,
        },
    },
    util::{self, location},
};

const DRIVER: &str = "local";

static PARTIAL_SEQ: AtomicU64 = AtomicU64::new(0);

/// Maps a filesystem error onto the storage taxonomy.
pub fn error_kind(kind: io::ErrorKind) -> ErrorKind {
    match kind {
        // A location below a regular file names nothing.
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory => ErrorKind::FileNotFound,
        io::ErrorKind::PermissionDenied => ErrorKind::PermissionMissing,
        _ => ErrorKind::UnknownException,
    }
}

pub fn translate(err: io::Error, location: &str) -> StorageError {
    let code = match err.raw_os_error() {
        Some(errno) => format!("{:?} (os error {})", err.kind(), errno),
        None => format!("{:?}", err.kind()),
    };

    StorageError::from_kind(error_kind(err.kind()), location, code, Some(Box::new(err)))
}

/// How a staged write combines with what is already at the target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Merge {
    Replace,
    Append,
    Prepend,
}

/// Driver over a directory of the local filesystem.
///
/// Every location is resolved lexically under `root`; `..` segments can
/// never climb out of it.
#[derive(Clone, Debug)]
pub struct LocalFileSystem {
    root: PathBuf,
}

impl LocalFileSystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path a location resolves to.
    pub fn full_path(&self, location: &str) -> PathBuf {
        let key = location::normalize(location);
        if key.is_empty() {
            return self.root.clone();
        }

        self.root.join(key)
    }

    /// Path for a write target; the root directory itself is not a file.
    fn file_path(&self, location: &str) -> Result<PathBuf> {
        Ok(self.root.join(location::object_key(location)?))
    }

    async fn ensure_parent(path: &Path, location: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| translate(err, location))?;
        }

        Ok(())
    }

    /// Sibling path that a write is staged into before being renamed over
    /// its target.
    fn partial_path(path: &Path) -> PathBuf {
        let seq = PARTIAL_SEQ.fetch_add(1, Ordering::Relaxed);
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();

        path.with_file_name(format!(".{}.{}-{}.partial", name, std::process::id(), seq))
    }

    /// Writes every chunk of `content` to `file` and flushes it.
    ///
    /// Source errors and sink errors end up on the same path: the first one
    /// aborts the pipe and is returned.
    async fn pipe(file: &mut File, content: Content, location: &str) -> Result<()> {
        match content {
            Content::Bytes(bytes) => file
                .write_all(&bytes)
                .await
                .map_err(|err| translate(err, location))?,
            Content::Text(text) => file
                .write_all(text.as_bytes())
                .await
                .map_err(|err| translate(err, location))?,
            Content::Stream(mut stream) => {
                while let Some(chunk) = stream.try_next().await? {
                    file.write_all(&chunk)
                        .await
                        .map_err(|err| translate(err, location))?;
                }
            }
        }

        file.flush().await.map_err(|err| translate(err, location))
    }

    /// Copies the current contents of `path`, if any, into `file`.
    async fn copy_existing(path: &Path, file: &mut File, location: &str) -> Result<()> {
        match File::open(path).await {
            Ok(mut existing) => {
                tokio::io::copy(&mut existing, file)
                    .await
                    .map_err(|err| translate(err, location))?;
                file.flush().await.map_err(|err| translate(err, location))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(translate(err, location)),
        }
    }

    /// Stages the new contents of `path` in a partial file, then renames it
    /// over `path`. On failure the partial file is removed and `path` is
    /// left untouched.
    async fn write_staged(
        &self,
        path: &Path,
        location: &str,
        content: Content,
        merge: Merge,
    ) -> Result<()> {
        Self::ensure_parent(path, location).await?;

        let partial = Self::partial_path(path);
        let result = async {
            let mut file = File::create(&partial)
                .await
                .map_err(|err| translate(err, location))?;

            match merge {
                Merge::Replace => Self::pipe(&mut file, content, location).await?,
                Merge::Append => {
                    Self::copy_existing(path, &mut file, location).await?;
                    Self::pipe(&mut file, content, location).await?;
                }
                Merge::Prepend => {
                    Self::pipe(&mut file, content, location).await?;
                    Self::copy_existing(path, &mut file, location).await?;
                }
            }

            drop(file);
            fs::rename(&partial, path)
                .await
                .map_err(|err| translate(err, location))
        }
        .await;

        if result.is_err() {
            if let Err(err) = fs::remove_file(&partial).await {
                debug!(error_message = %err, partial = %partial.display(), "partial file not removed");
            }
        }

        result
    }
}

#[async_trait]
impl Storage for LocalFileSystem {
    fn driver(&self) -> &'static str {
        DRIVER
    }

    #[instrument(skip(self), fields(driver = DRIVER))]
    async fn exists(&self, location: &str) -> Result<ExistsResponse> {
        let exists = match fs::try_exists(self.full_path(location)).await {
            Ok(exists) => exists,
            Err(err) if error_kind(err.kind()) == ErrorKind::FileNotFound => false,
            Err(err) => return Err(adapters::report("exists", translate(err, location))),
        };

        Ok(ExistsResponse {
            exists,
            raw: Raw::none(),
        })
    }

    #[instrument(skip(self), fields(driver = DRIVER))]
    async fn get_buffer(&self, location: &str) -> Result<ContentResponse<Bytes>> {
        let content = fs::read(self.full_path(location))
            .await
            .map_err(|err| adapters::report("get_buffer", translate(err, location)))?;

        Ok(ContentResponse {
            content: Bytes::from(content),
            raw: Raw::none(),
        })
    }

    fn get_stream(&self, location: &str) -> ByteStream {
        let path = self.full_path(location);
        let location = location.to_string();
        debug!(driver = DRIVER, location = %location, "get_stream");

        let chunks = stream::once(async move { File::open(path).await })
            .map_ok(|file| util::stream::read_chunks(file, util::stream::READ_CHUNK_SIZE))
            .try_flatten()
            .map_err(move |err| translate(err, &location));

        Box::pin(chunks)
    }

    #[instrument(skip(self, content), fields(driver = DRIVER))]
    async fn put(&self, location: &str, content: Content) -> Result<Response> {
        let path = self.file_path(location)?;

        self.write_staged(&path, location, content, Merge::Replace)
            .await
            .map_err(|err| adapters::report("put", err))?;

        debug!(path = %path.display(), "written");
        Ok(Response::default())
    }

    /// Rewrites the whole file through a staged copy, so a failing stream
    /// leaves the previous content in place.
    #[instrument(skip(self, content), fields(driver = DRIVER))]
    async fn append(&self, location: &str, content: Content) -> Result<Response> {
        let path = self.file_path(location)?;

        self.write_staged(&path, location, content, Merge::Append)
            .await
            .map_err(|err| adapters::report("append", err))?;

        Ok(Response::default())
    }

    #[instrument(skip(self, content), fields(driver = DRIVER))]
    async fn prepend(&self, location: &str, content: Content) -> Result<Response> {
        let path = self.file_path(location)?;

        self.write_staged(&path, location, content, Merge::Prepend)
            .await
            .map_err(|err| adapters::report("prepend", err))?;

        Ok(Response::default())
    }

    #[instrument(skip(self), fields(driver = DRIVER))]
    async fn copy(&self, src: &str, dest: &str) -> Result<Response> {
        adapters::distinct_locations(src, dest).map_err(|err| adapters::report("copy", err))?;

        let dest_path = self.file_path(dest)?;
        Self::ensure_parent(&dest_path, dest).await?;

        let copied = fs::copy(self.full_path(src), &dest_path)
            .await
            .map_err(|err| adapters::report("copy", translate(err, src)))?;

        Ok(Response::new(Raw::new(copied)))
    }

    #[instrument(skip(self), fields(driver = DRIVER))]
    async fn delete(&self, location: &str) -> Result<DeleteResponse> {
        let path = self
            .file_path(location)
            .map_err(|err| adapters::report("delete", err))?;

        match fs::remove_file(path).await {
            Ok(()) => Ok(DeleteResponse {
                was_deleted: Some(true),
                raw: Raw::none(),
            }),
            Err(err) if error_kind(err.kind()) == ErrorKind::FileNotFound => Ok(DeleteResponse {
                was_deleted: Some(false),
                raw: Raw::none(),
            }),
            Err(err) => Err(adapters::report("delete", translate(err, location))),
        }
    }

    #[instrument(skip(self), fields(driver = DRIVER))]
    async fn get_stat(&self, location: &str) -> Result<StatResponse> {
        let metadata = fs::metadata(self.full_path(location))
            .await
            .map_err(|err| adapters::report("get_stat", translate(err, location)))?;

        let modified = metadata
            .modified()
            .map(OffsetDateTime::from)
            .map_err(|err| adapters::report("get_stat", translate(err, location)))?;

        Ok(StatResponse {
            size: metadata.len(),
            modified,
            raw: Raw::new(metadata),
        })
    }

    fn flat_list(&self, prefix: &str) -> ListStream {
        let walker = Walker::new(self.root.clone(), location::normalize_prefix(prefix));
        let prefix = prefix.to_string();
        debug!(driver = DRIVER, prefix = %prefix, "flat_list");

        let entries = stream::try_unfold(walker, |mut walker| async move {
            Ok(walker.next_file().await?.map(|path| (path, walker)))
        })
        .map_ok(|path| FileListEntry {
            path,
            raw: Raw::none(),
        })
        .map_err(move |err: io::Error| translate(err, &prefix));

        Box::pin(entries)
    }
}

/// Depth-first walk below the deepest directory of a prefix, yielding the
/// root-relative key of every regular file that starts with the prefix.
/// Directories are opened one at a time as the walk reaches them.
struct Walker {
    root: PathBuf,
    prefix: String,
    stack: Vec<(String, ReadDir)>,
    started: bool,
}

impl Walker {
    fn new(root: PathBuf, prefix: String) -> Self {
        Self {
            root,
            prefix,
            stack: Vec::new(),
            started: false,
        }
    }

    /// Opens a directory, treating one that vanished (or is a file) as
    /// empty.
    async fn open(&mut self, key: String) -> io::Result<()> {
        match fs::read_dir(self.root.join(&key)).await {
            Ok(dir) => {
                self.stack.push((key, dir));
                Ok(())
            }
            Err(err) if error_kind(err.kind()) == ErrorKind::FileNotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn next_file(&mut self) -> io::Result<Option<String>> {
        if !self.started {
            self.started = true;
            let start = location::prefix_directory(&self.prefix).to_string();
            self.open(start).await?;
        }

        loop {
            let Some((dir_key, dir)) = self.stack.last_mut() else {
                return Ok(None);
            };

            let Some(entry) = dir.next_entry().await? else {
                self.stack.pop();
                continue;
            };

            let name = entry.file_name().to_string_lossy().to_string();
            let key = if dir_key.is_empty() {
                name
            } else {
                format!("{}/{}", dir_key, name)
            };

            if !key.starts_with(&self.prefix) {
                continue;
            }

            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                self.open(key).await?;
            } else if file_type.is_file() {
                return Ok(Some(key));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use futures::StreamExt;
    use tempfile::TempDir;

    use super::*;
    use crate::util::stream::read_to_string;

    fn storage() -> (TempDir, LocalFileSystem) {
        let dir = TempDir::new().unwrap();
        let storage = LocalFileSystem::new(dir.path());
        (dir, storage)
    }

    fn chunked(parts: Vec<&'static str>) -> ByteStream {
        let items: Vec<Result<Bytes>> = parts
            .into_iter()
            .map(|p| Ok(Bytes::from_static(p.as_bytes())))
            .collect();
        Box::pin(stream::iter(items))
    }

    #[test]
    fn test_full_path_is_clamped_to_root() {
        let storage = LocalFileSystem::new("/srv/root");

        let cases = vec![
            ("dummy_file", "/srv/root/dummy_file"),
            ("../../../dummy_file", "/srv/root/dummy_file"),
            ("fake_dir/../dummy_file", "/srv/root/dummy_file"),
            ("/etc/passwd", "/srv/root/etc/passwd"),
            ("..", "/srv/root"),
        ];

        for (input, expected) in cases {
            assert_eq!(
                storage.full_path(input),
                PathBuf::from(expected),
                "failed for case: {}",
                input
            );
        }
    }

    #[test]
    fn test_error_kind() {
        let cases = vec![
            (io::ErrorKind::NotFound, ErrorKind::FileNotFound),
            (io::ErrorKind::NotADirectory, ErrorKind::FileNotFound),
            (io::ErrorKind::PermissionDenied, ErrorKind::PermissionMissing),
            (io::ErrorKind::AlreadyExists, ErrorKind::UnknownException),
        ];

        for (input, expected) in cases {
            assert_eq!(error_kind(input), expected, "failed for case: {:?}", input);
        }
    }

    #[tokio::test]
    async fn test_put_each_content_shape_round_trips() {
        let (_dir, storage) = storage();

        let cases: Vec<(&str, Content)> = vec![
            ("bytes", Content::from(b"Foo".to_vec())),
            ("text", Content::from("Foo")),
            ("stream", Content::from(chunked(vec!["F", "o", "o"]))),
        ];

        for (location, content) in cases {
            storage.put(location, content).await.unwrap();

            let buffer = storage.get_buffer(location).await.unwrap();
            assert_eq!(&buffer.content[..], b"Foo", "failed buffer for case: {}", location);

            let text = read_to_string(location, storage.get_stream(location)).await.unwrap();
            assert_eq!(text, "Foo", "failed stream for case: {}", location);
        }
    }

    #[tokio::test]
    async fn test_put_creates_directories_and_stat() {
        let (dir, storage) = storage();

        storage.put("a/b/c/foo", "Foo".into()).await.unwrap();

        assert!(dir.path().join("a/b/c/foo").is_file());
        let stat = storage.get_stat("a/b/c/foo").await.unwrap();
        assert_eq!(stat.size, 3);
        assert!(stat.raw.downcast_ref::<std::fs::Metadata>().is_some());
    }

    #[tokio::test]
    async fn test_put_never_escapes_root() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");
        let storage = LocalFileSystem::new(&root);

        storage.put("../../../dummy_file", "X".into()).await.unwrap();
        storage.put("fake_dir/../other_file", "Y".into()).await.unwrap();

        assert!(root.join("dummy_file").is_file());
        assert!(root.join("other_file").is_file());
        assert!(!dir.path().join("dummy_file").exists());
        assert!(!root.join("fake_dir").exists());
    }

    #[tokio::test]
    async fn test_put_rejects_root_location() {
        let (_dir, storage) = storage();

        let err = storage.put("..", "X".into()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let err = storage.delete("a/..").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_failed_stream_put_leaves_previous_content() {
        let (dir, storage) = storage();
        storage.put("foo", "old".into()).await.unwrap();

        let items: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"new")),
            Err(StorageError::invalid_input("source", "upstream broke")),
        ];
        let err = storage
            .put("foo", Content::Stream(Box::pin(stream::iter(items))))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(storage.get("foo").await.unwrap().content, "old");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers.len(), 1, "partial file left behind: {:?}", leftovers);
    }

    #[tokio::test]
    async fn test_exists() {
        let (_dir, storage) = storage();
        storage.put("present", "x".into()).await.unwrap();

        let cases = vec![
            ("present", true),
            ("absent", false),
            ("dir/absent", false),
            ("present/below", false),
        ];

        for (location, expected) in cases {
            let res = storage.exists(location).await.unwrap();
            assert_eq!(res.exists, expected, "failed for case: {}", location);
        }
    }

    #[tokio::test]
    async fn test_missing_object_errors() {
        let (_dir, storage) = storage();

        let err = storage.get_buffer("missing").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileNotFound);
        assert_eq!(err.location(), Some("missing"));

        let err = storage.get_stat("missing").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileNotFound);

        let mut stream = storage.get_stream("missing");
        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileNotFound);
        assert_eq!(err.location(), Some("missing"));
    }

    #[tokio::test]
    async fn test_location_below_a_file() {
        let (_dir, storage) = storage();
        storage.put("present", "x".into()).await.unwrap();

        let err = storage.get_buffer("present/below").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileNotFound);

        let err = storage.get_stat("present/below").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileNotFound);

        let res = storage.delete("present/below").await.unwrap();
        assert_eq!(res.was_deleted, Some(false));

        let listed: Vec<_> = storage.flat_list("present/below").try_collect().await.unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn test_delete() {
        let (_dir, storage) = storage();
        storage.put("foo", "x".into()).await.unwrap();

        assert_eq!(storage.delete("foo").await.unwrap().was_deleted, Some(true));
        assert!(!storage.exists("foo").await.unwrap().exists);
        assert_eq!(storage.delete("foo").await.unwrap().was_deleted, Some(false));
    }

    #[tokio::test]
    async fn test_copy_and_move() {
        let (_dir, storage) = storage();
        storage.put("src", "Foo".into()).await.unwrap();

        storage.copy("src", "copies/dest").await.unwrap();
        assert_eq!(storage.get("src").await.unwrap().content, "Foo");
        assert_eq!(storage.get("copies/dest").await.unwrap().content, "Foo");

        storage.move_file("src", "moved/dest").await.unwrap();
        assert!(!storage.exists("src").await.unwrap().exists);
        assert_eq!(storage.get("moved/dest").await.unwrap().content, "Foo");

        let err = storage.copy("src", "other").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileNotFound);
        assert_eq!(err.location(), Some("src"));
    }

    #[tokio::test]
    async fn test_copy_onto_itself_is_rejected() {
        let (_dir, storage) = storage();
        storage.put("bar", "Bar".into()).await.unwrap();

        let cases = vec![("bar", "x/../bar"), ("bar", "./bar"), ("/bar", "bar")];
        for (src, dest) in cases {
            let err = storage.copy(src, dest).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidInput, "failed for case: {}", dest);

            let err = storage.move_file(src, dest).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidInput, "failed for case: {}", dest);
        }

        assert_eq!(storage.get("bar").await.unwrap().content, "Bar");
    }

    #[tokio::test]
    async fn test_append_and_prepend() {
        let (_dir, storage) = storage();

        storage.append("log/file", "b".into()).await.unwrap();
        storage.append("log/file", "c".into()).await.unwrap();
        storage.prepend("log/file", chunked(vec!["a"]).into()).await.unwrap();

        assert_eq!(storage.get("log/file").await.unwrap().content, "abc");

        storage.prepend("fresh", "only".into()).await.unwrap();
        assert_eq!(storage.get("fresh").await.unwrap().content, "only");
    }

    #[tokio::test]
    async fn test_failed_stream_append_leaves_previous_content() {
        let (dir, storage) = storage();
        storage.put("log", "old".into()).await.unwrap();

        let items: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"new")),
            Err(StorageError::invalid_input("source", "upstream broke")),
        ];
        let err = storage
            .append("log", Content::Stream(Box::pin(stream::iter(items))))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(storage.get("log").await.unwrap().content, "old");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_urls_not_supported() {
        let (_dir, storage) = storage();

        let err = storage.get_url("foo").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MethodNotSupported);

        let err = storage
            .get_signed_url("foo", Default::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MethodNotSupported);
    }

    #[tokio::test]
    async fn test_flat_list() {
        let (_dir, storage) = storage();
        for location in ["root.txt", "dir/a", "dir/sub/b", "dir/sub/deeper/c", "dirty/d", "other/e"] {
            storage.put(location, "x".into()).await.unwrap();
        }

        let cases = vec![
            ("", vec!["root.txt", "dir/a", "dir/sub/b", "dir/sub/deeper/c", "dirty/d", "other/e"]),
            ("dir/", vec!["dir/a", "dir/sub/b", "dir/sub/deeper/c"]),
            ("dir", vec!["dir/a", "dir/sub/b", "dir/sub/deeper/c", "dirty/d"]),
            ("dir/sub/b", vec!["dir/sub/b"]),
            ("/dir/sub/../sub/d", vec!["dir/sub/deeper/c"]),
            ("missing/", vec![]),
        ];

        for (prefix, expected) in cases {
            let listed: BTreeSet<String> = storage
                .flat_list(prefix)
                .map_ok(|entry| entry.path)
                .try_collect()
                .await
                .unwrap();
            let expected: BTreeSet<String> = expected.into_iter().map(String::from).collect();

            assert_eq!(listed, expected, "failed for prefix: {}", prefix);
        }
    }

    #[tokio::test]
    async fn test_flat_list_can_stop_early() {
        let (_dir, storage) = storage();
        for i in 0..10 {
            storage.put(&format!("many/{}", i), "x".into()).await.unwrap();
        }

        let first: Vec<_> = storage.flat_list("many/").take(3).collect().await;
        assert_eq!(first.len(), 3);
        assert!(first.iter().all(|entry| entry.is_ok()));
    }
}
