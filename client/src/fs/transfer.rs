//! Bulk movement of whole files between the store and the cache, one bounded
//! chunk at a time.

use std::io::{self, SeekFrom};
use std::path::Path;

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use super::session::fill;
use crate::api_client::{Chunk, RemoteStore};
use crate::error::FsError;

/// Zero-length chunks tolerated in a row before a download is abandoned.
pub const MAX_EMPTY_CHUNKS: u32 = 16;

/// Pulls `path` from the store into a fresh file at `dest`.
///
/// Chunks are written at the offset the store reports for them and nothing
/// past `expected` is written. Stops at the end-of-file sentinel or once
/// `expected` bytes are in place, and returns the resulting file length.
pub async fn download<S: RemoteStore>(
    store: &S,
    path: &str,
    dest: &Path,
    expected: u64,
) -> Result<u64, FsError> {
    let mut file = File::create(dest).await?;
    let mut offset = 0u64;
    let mut written = 0u64;
    let mut empty_run = 0u32;

    while written < expected {
        let chunk = store.download_chunk(path, offset).await?;
        if chunk.is_end() {
            break;
        }
        if chunk.data.is_empty() {
            empty_run += 1;
            if empty_run > MAX_EMPTY_CHUNKS {
                return Err(FsError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("store keeps sending empty chunks for {path} at offset {offset}"),
                )));
            }
            continue;
        }
        empty_run = 0;

        let usable = expected.saturating_sub(chunk.offset).min(chunk.data.len() as u64);
        if usable > 0 {
            file.seek(SeekFrom::Start(chunk.offset)).await?;
            file.write_all(&chunk.data[..usable as usize]).await?;
            written = written.max(chunk.offset + usable);
        }
        offset = chunk.offset + chunk.data.len() as u64;
        if offset >= expected {
            break;
        }
    }

    file.flush().await?;
    tracing::debug!(path, written, expected, "download complete");
    Ok(written)
}

/// Pushes the whole content of `file` to the store as sequential chunks of at
/// most `chunk_size` bytes. Returns the number of bytes sent.
pub async fn upload<S: RemoteStore>(
    store: &S,
    path: &str,
    file: &mut File,
    chunk_size: usize,
) -> Result<u64, FsError> {
    file.seek(SeekFrom::Start(0)).await?;
    let mut offset = 0u64;

    loop {
        let mut buf = vec![0u8; chunk_size];
        let n = fill(file, &mut buf).await?;
        if n == 0 {
            break;
        }
        buf.truncate(n);
        store.upload_chunk(path, Chunk::new(offset, Bytes::from(buf))).await?;
        offset += n as u64;
        if n < chunk_size {
            break;
        }
    }

    tracing::debug!(path, sent = offset, "upload complete");
    Ok(offset)
}
