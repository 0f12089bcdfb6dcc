//! Per-descriptor state: the open handle on a cached copy plus its cursor.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::cache::CacheKey;
use crate::error::FsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Bound to a shared, read-only copy.
    Read,
    /// Bound to a private copy that is written back on close.
    Write,
}

/// Origin of an `lseek` offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Whence {
    FromStart,
    FromCurrent,
    FromEnd,
}

pub struct Session {
    key: CacheKey,
    cache_path: PathBuf,
    /// Store-normalized path used for every store call made on behalf of
    /// this session.
    logical_path: String,
    mode: SessionMode,
    cursor: u64,
    modified: bool,
    file: File,
}

impl Session {
    pub async fn open(
        key: CacheKey,
        cache_path: PathBuf,
        logical_path: &str,
        mode: SessionMode,
    ) -> io::Result<Self> {
        let file = match mode {
            SessionMode::Read => File::open(&cache_path).await?,
            SessionMode::Write => {
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&cache_path)
                    .await?
            }
        };
        Ok(Self {
            key,
            cache_path,
            logical_path: logical_path.to_owned(),
            mode,
            cursor: 0,
            modified: false,
            file,
        })
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    pub fn logical_path(&self) -> &str {
        &self.logical_path
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub(crate) fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// Reads at the cursor until `buf` is full or the copy ends. Returns 0 at
    /// end of file.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.seek(SeekFrom::Start(self.cursor)).await?;
        let n = fill(&mut self.file, buf).await?;
        self.cursor += n as u64;
        Ok(n)
    }

    /// Writes all of `data` at the cursor and marks the session modified.
    pub async fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.file.seek(SeekFrom::Start(self.cursor)).await?;
        self.file.write_all(data).await?;
        self.cursor += data.len() as u64;
        self.modified = true;
        Ok(data.len())
    }

    /// Moves the cursor. Positions past the end are allowed; a negative
    /// result is rejected and leaves the cursor where it was.
    pub async fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64, FsError> {
        let base = match whence {
            Whence::FromStart => 0,
            Whence::FromCurrent => self.cursor,
            Whence::FromEnd => {
                // Pending writes must land before the length is sampled.
                self.file.flush().await?;
                self.file.metadata().await?.len()
            }
        };
        let target = i64::try_from(base)
            .ok()
            .and_then(|base| base.checked_add(offset))
            .filter(|target| *target >= 0)
            .ok_or(FsError::InvalidArgument("seek before start of file"))?;
        self.cursor = target as u64;
        Ok(self.cursor)
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        self.file.flush().await
    }

    /// Flushes and releases the handle.
    pub async fn close(mut self) -> io::Result<()> {
        self.file.flush().await
    }
}

/// Reads into `buf` until it is full or the reader is exhausted.
pub(crate) async fn fill<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}
