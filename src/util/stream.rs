use bytes::{Bytes, BytesMut};
use futures::{channel::mpsc, stream, SinkExt, Stream, TryStreamExt};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::model::{
    content::ByteStream,
    error::{Cause, Result, StorageError},
};

pub const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Drains a stream into one contiguous buffer.
pub async fn read_to_bytes(mut stream: ByteStream) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.try_next().await? {
        buf.extend_from_slice(&chunk);
    }

    Ok(buf.freeze())
}

/// Drains a stream and decodes it as UTF-8.
pub async fn read_to_string(location: &str, stream: ByteStream) -> Result<String> {
    decode_text(location, read_to_bytes(stream).await?)
}

pub fn decode_text(location: &str, bytes: Bytes) -> Result<String> {
    String::from_utf8(bytes.to_vec()).map_err(|err| {
        StorageError::invalid_input(location, format!("content is not valid utf-8: {}", err))
    })
}

/// Reads `reader` in chunks of at most `chunk_size` bytes.
///
/// The reader (an open file, stdin) is owned by the stream and closed when
/// the stream is dropped, whether it was drained or not.
pub fn read_chunks<R>(
    reader: R,
    chunk_size: usize,
) -> impl Stream<Item = std::io::Result<Bytes>> + Send + 'static
where
    R: AsyncRead + Unpin + Send + 'static,
{
    stream::try_unfold(reader, move |mut reader| async move {
        let mut buf = BytesMut::with_capacity(chunk_size);
        let read = reader.read_buf(&mut buf).await?;
        if read == 0 {
            return Ok(None);
        }

        Ok(Some((buf.freeze(), reader)))
    })
}

/// Forwards every chunk of `source` into `sink`, closing it at the end.
///
/// A source failure is passed on as an `Err` item, so the reading side can
/// abort, and then returned. A receiver that hung up ends the pump without
/// error; the reading side reports why it stopped.
pub async fn pump(
    mut source: ByteStream,
    mut sink: mpsc::Sender<std::result::Result<Bytes, Cause>>,
) -> Result<()> {
    loop {
        match source.try_next().await {
            Ok(Some(chunk)) => {
                if sink.send(Ok(chunk)).await.is_err() {
                    return Ok(());
                }
            }
            Ok(None) => return Ok(()),
            Err(err) => {
                let cause: Cause = format!("source stream failed: {}", err).into();
                let _ = sink.send(Err(cause)).await;
                return Err(err);
            }
        }
    }
}

/// Regroups arbitrary chunks into parts of exactly `part_size` bytes, the
/// last one possibly shorter. Backs multipart and block uploads.
pub struct PartBuffer {
    buf: BytesMut,
    part_size: usize,
}

impl PartBuffer {
    pub fn new(part_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(part_size),
            part_size,
        }
    }

    /// Appends a chunk and returns every part it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(chunk);

        let mut parts = Vec::new();
        while self.buf.len() >= self.part_size {
            parts.push(self.buf.split_to(self.part_size).freeze());
        }

        parts
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Whatever is left after the source ended.
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}
