use super::prelude::*;

/// Closes `fd`.
///
/// A write session is pushed back to the store first. If that fails the
/// descriptor stays open with its private copy intact, so the caller may try
/// again. A read session gives up its pin on the shared copy.
pub(super) async fn close<S: RemoteStore>(fh: &mut FileHandler<S>, fd: Fd) -> Result<(), FsError> {
    if fh.dirs.remove(&fd) {
        return Ok(());
    }

    let proxy = Arc::clone(&fh.proxy);
    let session = fh.sessions.get_mut(&fd).ok_or(FsError::BadDescriptor(fd))?;
    if session.mode() == SessionMode::Write {
        if let Err(e) = write_back(&proxy, session).await {
            warn!(fd, path = session.logical_path(), error = %e, "write-back failed, keeping private copy");
            return Err(e);
        }
    }

    let Some(session) = fh.sessions.remove(&fd) else {
        return Err(FsError::BadDescriptor(fd));
    };
    let key = session.key().clone();
    let mode = session.mode();
    let cache_path = session.cache_path().to_path_buf();
    if let Err(e) = session.close().await {
        warn!(fd, error = %e, "closing cached copy failed");
    }

    match mode {
        SessionMode::Write => discard_private(&proxy, &key, &cache_path),
        SessionMode::Read => {
            let outcome = proxy.cache.release_reader(&key);
            debug!(fd, %key, ?outcome, "reader released");
        }
    }
    Ok(())
}

async fn write_back<S: RemoteStore>(proxy: &Proxy<S>, session: &mut Session) -> Result<(), FsError> {
    session.flush().await?;
    let path = session.logical_path().to_owned();

    proxy.store.invalidate_prior_version(&path).await?;
    let sent = transfer::upload(&proxy.store, &path, session.file_mut(), proxy.upload_chunk_size).await?;
    let version = proxy.store.mint_version(&path).await?;
    info!(path, sent, version, "written back");
    Ok(())
}

fn discard_private<S: RemoteStore>(proxy: &Proxy<S>, key: &CacheKey, cache_path: &std::path::Path) {
    if proxy.cache.evict(key).is_none() {
        if let Err(e) = std::fs::remove_file(cache_path) {
            warn!(%key, error = %e, "could not delete private copy");
        }
    }
}

/// Drops every descriptor of a client that went away.
///
/// Nothing is written back. Readers are released like on `close`, so a copy
/// already superseded by a newer version goes away with its last reader.
/// Private copies are discarded so the departed client holds no cache space.
pub(super) async fn clientdone<S: RemoteStore>(fh: &mut FileHandler<S>) {
    let proxy = Arc::clone(&fh.proxy);
    let sessions: Vec<(Fd, Session)> = fh.sessions.drain().collect();

    for (fd, session) in sessions {
        let key = session.key().clone();
        let mode = session.mode();
        let modified = session.is_modified();
        let cache_path = session.cache_path().to_path_buf();
        if let Err(e) = session.close().await {
            warn!(fd, error = %e, "closing cached copy failed");
        }

        match mode {
            SessionMode::Read => {
                let outcome = proxy.cache.release_reader(&key);
                debug!(fd, %key, ?outcome, "reader released");
            }
            SessionMode::Write => {
                if modified {
                    warn!(fd, %key, "client left, discarding unsaved changes");
                }
                discard_private(&proxy, &key, &cache_path);
            }
        }
    }

    let dirs = fh.dirs.len();
    fh.dirs.clear();
    debug!(dirs, "client done");
}
