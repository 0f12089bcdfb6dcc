use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use afs_proxy::api_client::{Chunk, FileMetadata, HttpStore, OpenMode, RemoteStore};
use afs_proxy::error::{Errno, FsError};
use afs_proxy::fs::{Cache, Proxy, Whence};
use afs_proxy::gateway::{self, Request, Response};
use afs_server::store::Store;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

struct Stack {
    proxy: Arc<Proxy<HttpStore>>,
    root: tempfile::TempDir,
    _cache_dir: tempfile::TempDir,
    shutdown: CancellationToken,
}

impl Drop for Stack {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn spawn_store(root: &Path, shutdown: &CancellationToken) -> HttpStore {
    let store = Arc::new(Store::open(root).await.expect("Failed to open store"));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("Failed to bind");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(afs_server::serve(listener, store, shutdown.clone()));

    let base = Url::parse(&format!("http://{addr}/")).unwrap();
    let http = HttpStore::new(base);
    http.health().await.expect("store should be up");
    http
}

async fn spawn_stack(cache_limit: u64) -> Stack {
    let root = tempfile::tempdir().expect("Failed to create store root");
    let cache_dir = tempfile::tempdir().expect("Failed to create cache dir");
    let shutdown = CancellationToken::new();

    let http = spawn_store(root.path(), &shutdown).await;
    let cache = Cache::open(cache_dir.path(), cache_limit).await.expect("Failed to open cache");
    Stack {
        proxy: Arc::new(Proxy::new(cache, http)),
        root,
        _cache_dir: cache_dir,
        shutdown,
    }
}

fn write_root_file(root: &Path, name: &str, data: &[u8]) {
    std::fs::write(root.join(name), data).unwrap();
}

#[tokio::test]
async fn large_file_round_trip_over_http() {
    let stack = spawn_stack(16 * 1024 * 1024).await;
    let original: Vec<u8> = (0..2_500_000u32).map(|i| (i % 253) as u8).collect();
    write_root_file(stack.root.path(), "big.bin", &original);
    let mut fh = stack.proxy.handler();

    let fd = fh.open("big.bin", OpenMode::Read).await.expect("open big file");
    let mut buf = vec![0u8; original.len() + 1];
    assert_eq!(fh.read(fd, Some(&mut buf)).await.unwrap(), original.len());
    assert_eq!(&buf[..original.len()], &original[..]);
    fh.close(fd).await.unwrap();

    // Overwrite the head through a write session; the tail must survive.
    let fd = fh.open("big.bin", OpenMode::Write).await.unwrap();
    let replacement = vec![b'x'; 1_200_000];
    fh.write(fd, &replacement).await.unwrap();
    fh.close(fd).await.unwrap();

    let on_disk = std::fs::read(stack.root.path().join("big.bin")).unwrap();
    assert_eq!(on_disk.len(), original.len());
    assert_eq!(&on_disk[..replacement.len()], &replacement[..]);
    assert_eq!(&on_disk[replacement.len()..], &original[replacement.len()..]);
}

#[tokio::test]
async fn create_new_and_nested_paths() {
    let stack = spawn_stack(1024 * 1024).await;
    std::fs::create_dir(stack.root.path().join("docs")).unwrap();
    let mut fh = stack.proxy.handler();

    let fd = fh.open("docs/new.txt", OpenMode::CreateNew).await.unwrap();
    fh.write(fd, b"fresh").await.unwrap();
    fh.close(fd).await.unwrap();
    assert_eq!(std::fs::read(stack.root.path().join("docs/new.txt")).unwrap(), b"fresh");

    let err = fh.open("docs/new.txt", OpenMode::CreateNew).await.unwrap_err();
    assert_eq!(err.errno(), Errno::AlreadyExists);
    let err = fh.open("docs/../../outside.txt", OpenMode::Create).await.unwrap_err();
    assert_eq!(err.errno(), Errno::PermissionDenied);

    let dir = fh.open("docs", OpenMode::Read).await.unwrap();
    assert!(fh.is_directory(dir));
    fh.close(dir).await.unwrap();

    fh.unlink("docs/new.txt").await.unwrap();
    assert!(!stack.root.path().join("docs/new.txt").exists());
    assert_eq!(fh.unlink("docs/new.txt").await.unwrap_err().errno(), Errno::NotFound);
}

#[tokio::test]
async fn stale_copy_replaced_after_remote_write() {
    let stack = spawn_stack(1024 * 1024).await;
    write_root_file(stack.root.path(), "note.txt", b"first");
    let mut reader = stack.proxy.handler();
    let mut writer = stack.proxy.handler();

    let fd = reader.open("note.txt", OpenMode::Read).await.unwrap();
    reader.close(fd).await.unwrap();

    let w = writer.open("note.txt", OpenMode::Write).await.unwrap();
    writer.write(w, b"second").await.unwrap();
    writer.close(w).await.unwrap();

    let fd = reader.open("note.txt", OpenMode::Read).await.unwrap();
    let mut buf = [0u8; 16];
    let n = reader.read(fd, Some(&mut buf)).await.unwrap();
    assert_eq!(&buf[..n], b"second");
    assert_eq!(stack.proxy.cache().len(), 1);
}

/// Forwards to the HTTP store but parks after the first uploaded chunk until
/// `resume` is notified.
struct PausedUpload {
    inner: HttpStore,
    parked: Notify,
    resume: Notify,
}

impl RemoteStore for PausedUpload {
    async fn get_metadata(&self, path: &str, mode: OpenMode) -> Result<FileMetadata, FsError> {
        self.inner.get_metadata(path, mode).await
    }

    async fn download_chunk(&self, path: &str, offset: u64) -> Result<Chunk, FsError> {
        self.inner.download_chunk(path, offset).await
    }

    async fn upload_chunk(&self, path: &str, chunk: Chunk) -> Result<(), FsError> {
        let first = chunk.offset == 0;
        self.inner.upload_chunk(path, chunk).await?;
        if first {
            self.parked.notify_one();
            self.resume.notified().await;
        }
        Ok(())
    }

    async fn invalidate_prior_version(&self, path: &str) -> Result<(), FsError> {
        self.inner.invalidate_prior_version(path).await
    }

    async fn mint_version(&self, path: &str) -> Result<i64, FsError> {
        self.inner.mint_version(path).await
    }

    async fn unlink(&self, path: &str) -> Result<(), FsError> {
        self.inner.unlink(path).await
    }
}

async fn read_all<S: RemoteStore>(proxy: &Arc<Proxy<S>>, path: &str) -> Vec<u8> {
    let mut fh = proxy.handler();
    let fd = fh.open(path, OpenMode::Read).await.expect("open for read");
    let mut buf = vec![0u8; 64];
    let n = fh.read(fd, Some(&mut buf)).await.unwrap();
    fh.close(fd).await.unwrap();
    buf.truncate(n);
    buf
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_back_invisible_until_close_returns() {
    let root = tempfile::tempdir().expect("Failed to create store root");
    let cache_dir = tempfile::tempdir().expect("Failed to create cache dir");
    let shutdown = CancellationToken::new();
    write_root_file(root.path(), "shared.txt", b"OLDOLDOLD");

    let store = PausedUpload {
        inner: spawn_store(root.path(), &shutdown).await,
        parked: Notify::new(),
        resume: Notify::new(),
    };
    let cache = Cache::open(cache_dir.path(), 1024).await.expect("Failed to open cache");
    let proxy = Arc::new(Proxy::new(cache, store).with_upload_chunk_size(3));

    let mut writer = proxy.handler();
    let fd = writer.open("shared.txt", OpenMode::Write).await.unwrap();
    writer.write(fd, b"NEWNEWNEW").await.unwrap();
    let closing = tokio::spawn(async move { writer.close(fd).await });

    proxy.store().parked.notified().await;
    assert_eq!(read_all(&proxy, "shared.txt").await, b"OLDOLDOLD");
    assert_eq!(std::fs::read(root.path().join("shared.txt")).unwrap(), b"OLDOLDOLD");

    proxy.store().resume.notify_one();
    closing.await.unwrap().expect("write-back succeeds");
    assert_eq!(read_all(&proxy, "shared.txt").await, b"NEWNEWNEW");
    shutdown.cancel();
}

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn call(ws: &mut Client, request: &Request) -> Response {
    let text = serde_json::to_string(request).unwrap();
    ws.send(Message::Text(text)).await.expect("Failed to send request");
    reply(ws).await
}

async fn reply(ws: &mut Client) -> Response {
    loop {
        match ws.next().await.expect("connection open").expect("valid frame") {
            Message::Text(text) => return serde_json::from_str(&text).expect("valid response"),
            _ => continue,
        }
    }
}

#[tokio::test]
async fn websocket_client_session() {
    let stack = spawn_stack(1024 * 1024).await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(gateway::serve(listener, Arc::clone(&stack.proxy), stack.shutdown.clone()));

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .expect("Failed to connect");

    let opened = call(
        &mut ws,
        &Request::Open {
            path: "hello.txt".into(),
            mode: OpenMode::CreateNew,
        },
    )
    .await;
    let Response::Ok { ok: fd, .. } = opened else {
        panic!("open failed: {opened:?}");
    };
    let fd = fd as i32;

    let written = call(
        &mut ws,
        &Request::Write {
            fd,
            data: b"hello world".to_vec(),
        },
    )
    .await;
    assert_eq!(written, Response::ok(11));

    let seek = Request::Lseek {
        fd,
        offset: -5,
        whence: Whence::FromEnd,
    };
    assert_eq!(call(&mut ws, &seek).await, Response::ok(6));

    let read = call(&mut ws, &Request::Read { fd, len: Some(64) }).await;
    assert_eq!(
        read,
        Response::Ok {
            ok: 5,
            data: Some(b"world".to_vec())
        }
    );
    assert_eq!(
        call(&mut ws, &Request::Read { fd, len: None }).await,
        Response::error(Errno::InvalidArgument)
    );

    assert_eq!(call(&mut ws, &Request::Close { fd }).await, Response::ok(0));
    assert_eq!(
        std::fs::read(stack.root.path().join("hello.txt")).unwrap(),
        b"hello world"
    );
    assert_eq!(
        call(&mut ws, &Request::Close { fd }).await,
        Response::error(Errno::BadDescriptor)
    );

    ws.send(Message::Text("{\"op\":\"fly\"}".into())).await.unwrap();
    assert_eq!(reply(&mut ws).await, Response::error(Errno::InvalidArgument));
}
