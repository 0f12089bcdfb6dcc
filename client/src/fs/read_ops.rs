use super::prelude::*;

pub(super) async fn read<S: RemoteStore>(
    fh: &mut FileHandler<S>,
    fd: Fd,
    buf: Option<&mut [u8]>,
) -> Result<usize, FsError> {
    if fh.dirs.contains(&fd) {
        return Err(FsError::IsDirectory(fd));
    }
    let session = fh.sessions.get_mut(&fd).ok_or(FsError::BadDescriptor(fd))?;
    let buf = buf.ok_or(FsError::InvalidArgument("missing read buffer"))?;
    Ok(session.read(buf).await?)
}

pub(super) async fn lseek<S: RemoteStore>(
    fh: &mut FileHandler<S>,
    fd: Fd,
    offset: i64,
    whence: Whence,
) -> Result<u64, FsError> {
    if fh.dirs.contains(&fd) {
        return Err(FsError::IsDirectory(fd));
    }
    let session = fh.sessions.get_mut(&fd).ok_or(FsError::BadDescriptor(fd))?;
    session.seek(offset, whence).await
}
