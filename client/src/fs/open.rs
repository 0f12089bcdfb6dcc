use super::prelude::*;

/// Opens `path` for `mode` and returns a fresh descriptor.
///
/// The store is asked for the authoritative metadata first; any error it
/// reports is returned as is. Directories get a bare descriptor. For files,
/// the copy matching the store's version is reused when cached and pulled in
/// otherwise. Read opens share that copy; write opens get a private clone.
///
/// # Arguments
///
/// * `fh` - The client's handler, receiving the new descriptor.
/// * `path` - The path as the client spelled it.
/// * `mode` - Forwarded to the store, which validates and may create the file.
pub(super) async fn open<S: RemoteStore>(
    fh: &mut FileHandler<S>,
    path: &str,
    mode: OpenMode,
) -> Result<Fd, FsError> {
    let proxy = Arc::clone(&fh.proxy);
    let metadata = proxy.store.get_metadata(path, mode).await?;
    if let Some(errno) = metadata.error {
        debug!(path, ?mode, errno = errno.name(), "store refused open");
        return Err(FsError::Store(errno));
    }

    if metadata.is_dir {
        let fd = proxy.allocate_fd();
        fh.dirs.insert(fd);
        debug!(path, fd, "opened directory");
        return Ok(fd);
    }

    let logical = metadata.normalized_path.as_str();
    let key = CacheKey::shared(logical, metadata.last_modified);

    let shared = {
        let _admission = proxy.cache.admit().await;
        proxy.cache.evict_stale(logical, metadata.last_modified);
        match proxy.cache.pin(&key) {
            Some(record) => {
                debug!(%key, readers = record.reader_count, "cache hit");
                record
            }
            None => {
                debug!(%key, size = metadata.size, "cache miss");
                materialize(&proxy, path, &metadata, &key).await?
            }
        }
    };

    let fd = proxy.allocate_fd();
    let session = if mode == OpenMode::Read {
        match Session::open(key.clone(), shared.cache_path.clone(), logical, SessionMode::Read).await {
            Ok(session) => session,
            Err(e) => {
                proxy.cache.unpin(&key);
                return Err(e.into());
            }
        }
    } else {
        let cloned = clone_private(&proxy, &shared, &key, fd).await;
        proxy.cache.unpin(&key);
        cloned?
    };

    info!(path = logical, fd, mode = ?session.mode(), "opened");
    fh.sessions.insert(fd, session);
    Ok(fd)
}

/// Reserves room for the shared copy under `key`, pinned for the caller, and
/// pulls its bytes from the store. The version is only recorded once the copy
/// is complete.
async fn materialize<S: RemoteStore>(
    proxy: &Proxy<S>,
    requested: &str,
    metadata: &FileMetadata,
    key: &CacheKey,
) -> Result<CachedFileRecord, FsError> {
    let logical = metadata.normalized_path.as_str();
    let cache_path = proxy.cache.path_for(key);
    let mut record = CachedFileRecord::shared(
        requested,
        logical,
        cache_path.clone(),
        metadata.size,
        metadata.last_modified,
    );
    record.reader_count = 1;
    proxy.cache.reserve(key.clone(), record.clone())?;

    match transfer::download(&proxy.store, logical, &cache_path, metadata.size).await {
        Ok(size) => {
            if size != record.size {
                debug!(%key, expected = record.size, size, "store sent fewer bytes than announced");
                record.size = size;
                proxy.cache.put(key.clone(), record.clone());
            }
            proxy.cache.record_version(logical, metadata.last_modified);
            proxy.cache.touch(key);
            Ok(record)
        }
        Err(e) => {
            warn!(%key, error = %e, "download failed");
            proxy.cache.evict(key);
            Err(e)
        }
    }
}

/// Clones the shared copy into a private one owned by descriptor `fd`.
async fn clone_private<S: RemoteStore>(
    proxy: &Proxy<S>,
    shared: &CachedFileRecord,
    key: &CacheKey,
    fd: Fd,
) -> Result<Session, FsError> {
    let private_key = key.private(fd);
    let private_path = proxy.cache.path_for(&private_key);
    proxy
        .cache
        .reserve(private_key.clone(), shared.private_copy(private_path.clone()))?;

    let opened = async {
        tokio::fs::copy(&shared.cache_path, &private_path).await?;
        Session::open(
            private_key.clone(),
            private_path.clone(),
            &shared.normalized_input_path,
            SessionMode::Write,
        )
        .await
    }
    .await;

    opened.map_err(|e| {
        warn!(key = %private_key, error = %e, "could not prepare private copy");
        proxy.cache.evict(&private_key);
        FsError::from(e)
    })
}
