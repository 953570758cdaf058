//! TCP transport: one JSON request per line, answered by one JSON reply per line.

use std::{
    io,
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use serde::Serialize;
use tokio::{
    io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::{watch, Mutex},
};
use tracing::{debug, info, warn};

use crate::{
    client::ClientLockCache,
    config::ClientConfig,
    error::RpcError,
    interface::release::ReleaseHook,
    protocol::{
        rpc::{CallbackConnector, LockCallbackRpc, LockServerRpc},
        wire::{Reply, Request},
        ClientId, LockId, LockStatus, Version,
    },
    util::stopped,
};

/// Turns a decoded request into a reply.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: Request) -> Reply;
}

fn reply_from<T>(result: Result<T, RpcError>, ok: impl FnOnce(T) -> Reply) -> Reply {
    match result {
        Ok(value) => ok(value),
        Err(e) => Reply::Error {
            message: e.to_string(),
        },
    }
}

fn misrouted(request: &Request) -> Reply {
    Reply::Error {
        message: format!("{} is not served by this endpoint", request.name()),
    }
}

/// Exposes a lock server to clients.
pub struct ServerEndpoint(pub Arc<dyn LockServerRpc>);

#[async_trait]
impl RequestHandler for ServerEndpoint {
    async fn handle(&self, request: Request) -> Reply {
        match request {
            Request::Acquire {
                client,
                lock,
                version,
            } => reply_from(self.0.acquire(&client, lock, version).await, |status| {
                Reply::Status { status }
            }),
            Request::Release {
                client,
                lock,
                version,
            } => reply_from(self.0.release(&client, lock, version).await, |status| {
                Reply::Status { status }
            }),
            Request::Stat { lock } => {
                reply_from(self.0.stat(lock).await, |count| Reply::Count { count })
            }
            other => misrouted(&other),
        }
    }
}

/// Exposes a client's callback handlers to the server. Holds the client weakly
/// so the listener does not keep it alive.
pub struct CallbackEndpoint {
    target: Weak<dyn LockCallbackRpc>,
}

impl CallbackEndpoint {
    pub fn new(target: &Arc<dyn LockCallbackRpc>) -> Self {
        Self {
            target: Arc::downgrade(target),
        }
    }
}

#[async_trait]
impl RequestHandler for CallbackEndpoint {
    async fn handle(&self, request: Request) -> Reply {
        let target = match self.target.upgrade() {
            Some(target) => target,
            None => {
                return Reply::Error {
                    message: "client is gone".to_string(),
                }
            }
        };
        match request {
            Request::Retry { lock, version } => {
                reply_from(target.retry(lock, version).await, |_| Reply::Ack)
            }
            Request::Revoke { lock, version } => {
                reply_from(target.revoke(lock, version).await, |_| Reply::Ack)
            }
            other => misrouted(&other),
        }
    }
}

/// Accepts connections until `shutdown` fires, serving each on its own task.
pub async fn serve(
    listener: TcpListener,
    handler: Arc<dyn RequestHandler>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), RpcError> {
    loop {
        let accepted = tokio::select! {
            _ = stopped(&mut shutdown) => return Ok(()),
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                if let Some(pause) = accept_pause(&e) {
                    tokio::select! {
                        _ = stopped(&mut shutdown) => return Ok(()),
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
                continue;
            }
        };
        debug!(%peer, "connection accepted");

        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, handler).await {
                debug!(%peer, error = %e, "connection closed");
            }
        });
    }
}

/// How long to wait before accepting again after `e`. A connection that died
/// in the backlog only costs that connection; anything else (such as running
/// out of file descriptors) gets a pause.
fn accept_pause(e: &io::Error) -> Option<Duration> {
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted => None,
        _ => Some(Duration::from_millis(100)),
    }
}

async fn serve_connection(
    stream: TcpStream,
    handler: Arc<dyn RequestHandler>,
) -> Result<(), RpcError> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    while let Some(line) = lines.next_line().await? {
        let reply = match serde_json::from_str::<Request>(&line) {
            Ok(request) => handler.handle(request).await,
            Err(e) => Reply::Error {
                message: e.to_string(),
            },
        };
        write_message(&mut write, &reply).await?;
    }
    Ok(())
}

async fn write_message<W, T>(write: &mut W, message: &T) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    write.write_all(&line).await?;
    Ok(())
}

struct Framed {
    lines: Lines<BufReader<OwnedReadHalf>>,
    write: OwnedWriteHalf,
}

impl Framed {
    async fn connect(addr: &str) -> Result<Self, RpcError> {
        let (read, write) = TcpStream::connect(addr).await?.into_split();
        Ok(Self {
            lines: BufReader::new(read).lines(),
            write,
        })
    }

    async fn round_trip(&mut self, request: &Request) -> Result<Reply, RpcError> {
        write_message(&mut self.write, request).await?;
        match self.lines.next_line().await? {
            Some(line) => Ok(serde_json::from_str(&line)?),
            None => Err(RpcError::Transport("connection closed by peer".to_string())),
        }
    }
}

/// A lazily dialed connection that redials after any failure. Calls on one
/// connection are serialized.
struct Connection {
    addr: String,
    framed: Mutex<Option<Framed>>,
}

impl Connection {
    fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            framed: Mutex::new(None),
        }
    }

    async fn call(&self, request: Request) -> Result<Reply, RpcError> {
        let mut slot = self.framed.lock().await;
        if slot.is_none() {
            *slot = Some(Framed::connect(&self.addr).await?);
        }
        let framed = slot
            .as_mut()
            .ok_or_else(|| RpcError::Transport(format!("no connection to {}", self.addr)))?;

        let result = framed.round_trip(&request).await;
        if let Err(e) = &result {
            warn!(addr = %self.addr, op = request.name(), error = %e, "dropping connection");
            *slot = None;
        }

        match result? {
            Reply::Error { message } => Err(RpcError::Remote(message)),
            reply => Ok(reply),
        }
    }
}

/// Client-side stub for a lock server reachable over TCP.
pub struct TcpServerStub {
    connection: Connection,
}

impl TcpServerStub {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            connection: Connection::new(addr),
        }
    }

    async fn status(&self, request: Request) -> Result<LockStatus, RpcError> {
        let op = request.name();
        match self.connection.call(request).await? {
            Reply::Status { status } => Ok(status),
            _ => Err(RpcError::UnexpectedReply(op)),
        }
    }
}

#[async_trait]
impl LockServerRpc for TcpServerStub {
    async fn acquire(
        &self,
        client: &ClientId,
        lock: LockId,
        version: Version,
    ) -> Result<LockStatus, RpcError> {
        self.status(Request::Acquire {
            client: client.clone(),
            lock,
            version,
        })
        .await
    }

    async fn release(
        &self,
        client: &ClientId,
        lock: LockId,
        version: Version,
    ) -> Result<LockStatus, RpcError> {
        self.status(Request::Release {
            client: client.clone(),
            lock,
            version,
        })
        .await
    }

    async fn stat(&self, lock: LockId) -> Result<u64, RpcError> {
        match self.connection.call(Request::Stat { lock }).await? {
            Reply::Count { count } => Ok(count),
            _ => Err(RpcError::UnexpectedReply("stat")),
        }
    }
}

struct TcpCallbackStub {
    connection: Connection,
}

impl TcpCallbackStub {
    async fn ack(&self, request: Request) -> Result<(), RpcError> {
        let op = request.name();
        match self.connection.call(request).await? {
            Reply::Ack => Ok(()),
            _ => Err(RpcError::UnexpectedReply(op)),
        }
    }
}

#[async_trait]
impl LockCallbackRpc for TcpCallbackStub {
    async fn retry(&self, lock: LockId, version: Version) -> Result<(), RpcError> {
        self.ack(Request::Retry { lock, version }).await
    }

    async fn revoke(&self, lock: LockId, version: Version) -> Result<(), RpcError> {
        self.ack(Request::Revoke { lock, version }).await
    }
}

/// Reaches clients at the address their id names.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl CallbackConnector for TcpConnector {
    async fn connect(&self, client: &ClientId) -> Result<Arc<dyn LockCallbackRpc>, RpcError> {
        Ok(Arc::new(TcpCallbackStub {
            connection: Connection::new(client.as_str()),
        }))
    }
}

/// Binds a callback listener on `callback_addr`, derives the client id from the
/// bound address, and starts a lock cache talking to the server at `server_addr`.
pub async fn connect_client(
    server_addr: &str,
    callback_addr: &str,
    release_hook: Arc<dyn ReleaseHook>,
    config: ClientConfig,
) -> Result<Arc<ClientLockCache>, RpcError> {
    let listener = TcpListener::bind(callback_addr).await?;
    let id = ClientId::from(listener.local_addr()?);
    let cache = ClientLockCache::new(
        id.clone(),
        Arc::new(TcpServerStub::new(server_addr)),
        release_hook,
        config,
    );

    let target: Arc<dyn LockCallbackRpc> = cache.clone();
    let endpoint = Arc::new(CallbackEndpoint::new(&target));
    let shutdown = cache.shutdown_signal();
    tokio::spawn(async move {
        if let Err(e) = serve(listener, endpoint, shutdown).await {
            warn!(client = %id, error = %e, "callback listener failed");
        }
    });

    info!(client = %cache.id(), server = server_addr, "lock client started");
    Ok(cache)
}
