use super::prelude::*;

/// Writes `data` at the cursor of a write session.
///
/// Room for the bytes is claimed from the cache before the descriptor is
/// even looked up, so a full cache reports `ENOMEM` ahead of `EBADF`. The
/// private copy's accounted size then grows with the file.
pub(super) async fn write<S: RemoteStore>(
    fh: &mut FileHandler<S>,
    fd: Fd,
    data: &[u8],
) -> Result<usize, FsError> {
    if fh.dirs.contains(&fd) {
        return Err(FsError::IsDirectory(fd));
    }
    let len = data.len() as u64;
    fh.proxy.cache.make_room(len)?;

    let session = fh.sessions.get_mut(&fd).ok_or(FsError::BadDescriptor(fd))?;
    if session.mode() != SessionMode::Write {
        return Err(FsError::NotWritable(fd));
    }

    fh.proxy.cache.reserve_write(session.key(), session.cursor() + len)?;
    Ok(session.write(data).await?)
}

/// Deletes `path` on the store. Cached copies and open sessions are left
/// alone.
pub(super) async fn unlink<S: RemoteStore>(fh: &mut FileHandler<S>, path: &str) -> Result<(), FsError> {
    fh.proxy.store.unlink(path).await?;
    debug!(path, "unlinked");
    Ok(())
}
