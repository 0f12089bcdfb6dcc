//! Client-facing endpoint. Each WebSocket connection gets its own
//! [`FileHandler`]; requests and replies are JSON text frames.

use std::io;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use crate::api_client::{OpenMode, RemoteStore};
use crate::error::{Errno, Fd, FsError};
use crate::fs::{FileHandler, Proxy, Whence};

/// Upper bound on the buffer a single `read` request may ask for.
pub const MAX_READ_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Open { path: String, mode: OpenMode },
    Close { fd: Fd },
    /// A missing `len` is a missing buffer.
    Read {
        fd: Fd,
        #[serde(default)]
        len: Option<usize>,
    },
    Write { fd: Fd, data: Vec<u8> },
    Lseek { fd: Fd, offset: i64, whence: Whence },
    Unlink { path: String },
    Clientdone,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Ok {
        ok: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Vec<u8>>,
    },
    Error { error: Errno, code: i32 },
}

impl Response {
    pub fn ok(value: i64) -> Self {
        Response::Ok { ok: value, data: None }
    }

    pub fn error(errno: Errno) -> Self {
        Response::Error {
            error: errno,
            code: errno.code(),
        }
    }
}

impl From<FsError> for Response {
    fn from(err: FsError) -> Self {
        Response::error(err.errno())
    }
}

/// Runs one request against `handler`.
pub async fn dispatch<S: RemoteStore>(handler: &mut FileHandler<S>, request: Request) -> Response {
    let result = match request {
        Request::Open { path, mode } => handler.open(&path, mode).await.map(|fd| Response::ok(fd.into())),
        Request::Close { fd } => handler.close(fd).await.map(|()| Response::ok(0)),
        Request::Read { fd, len } => {
            let mut buf = len.map(|len| vec![0u8; len.min(MAX_READ_LEN)]);
            let read = handler.read(fd, buf.as_deref_mut()).await;
            read.map(|n| {
                let mut data = buf.unwrap_or_default();
                data.truncate(n);
                Response::Ok {
                    ok: n as i64,
                    data: Some(data),
                }
            })
        }
        Request::Write { fd, data } => handler.write(fd, &data).await.map(|n| Response::ok(n as i64)),
        Request::Lseek { fd, offset, whence } => handler
            .lseek(fd, offset, whence)
            .await
            .map(|pos| Response::ok(pos as i64)),
        Request::Unlink { path } => handler.unlink(&path).await.map(|()| Response::ok(0)),
        Request::Clientdone => {
            handler.clientdone().await;
            Ok(Response::ok(0))
        }
    };
    result.unwrap_or_else(|e| {
        tracing::debug!(error = %e, "request failed");
        Response::from(e)
    })
}

fn encode(response: &Response) -> String {
    serde_json::to_string(response)
        .unwrap_or_else(|_| format!(r#"{{"error":"EIO","code":{}}}"#, Errno::Io.code()))
}

/// Accepts clients on `listener` until `shutdown` fires.
pub async fn serve<S: RemoteStore>(
    listener: TcpListener,
    proxy: Arc<Proxy<S>>,
    shutdown: CancellationToken,
) -> io::Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "accepting clients");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("gateway stopped");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let handler = proxy.handler();
                let token = shutdown.child_token();
                tokio::spawn(async move {
                    tracing::info!(%peer, "client connected");
                    match handle_connection(stream, handler, token).await {
                        Ok(()) => tracing::info!(%peer, "client disconnected"),
                        Err(e) => tracing::warn!(%peer, error = %e, "client connection lost"),
                    }
                });
            }
        }
    }
}

async fn handle_connection<S: RemoteStore>(
    stream: TcpStream,
    mut handler: FileHandler<S>,
    shutdown: CancellationToken,
) -> Result<(), tungstenite::Error> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut source) = ws.split();

    let result = loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            message = source.next() => message,
        };
        match message {
            None | Some(Ok(Message::Close(_))) => break Ok(()),
            Some(Err(e)) => break Err(e),
            Some(Ok(Message::Text(text))) => {
                let response = match serde_json::from_str::<Request>(&text) {
                    Ok(request) => dispatch(&mut handler, request).await,
                    Err(e) => {
                        tracing::debug!(error = %e, "malformed request");
                        Response::error(Errno::InvalidArgument)
                    }
                };
                if let Err(e) = sink.send(Message::Text(encode(&response))).await {
                    break Err(e);
                }
            }
            Some(Ok(_)) => {}
        }
    };

    // Whatever the reason for leaving, the client's descriptors go with it.
    handler.clientdone().await;
    result
}
