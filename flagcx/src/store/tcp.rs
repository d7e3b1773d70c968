use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;

use super::{InMemoryStore, Store};
use crate::error::{FlagcxError, Result};
use crate::protocol::codec::{read_prefixed, write_prefixed};
use crate::protocol::{StoreMessage, WireMessage};

type Waiters = Arc<std::sync::Mutex<HashMap<u64, oneshot::Sender<StoreMessage>>>>;

/// Client side of a TCP rendezvous store.
///
/// A single connection carries every request. Responses are routed back by
/// request id, so a `get` blocked on a missing key does not hold up puts
/// issued meanwhile by other groups of the same process.
pub struct TcpStore {
    server: SocketAddr,
    writer: Mutex<OwnedWriteHalf>,
    waiters: Waiters,
    next_req: AtomicU64,
    reader: JoinHandle<()>,
}

impl TcpStore {
    /// Connect to a [`StoreServer`], retrying until `timeout` elapses so
    /// ranks may start before the server does.
    pub async fn connect(server: SocketAddr, timeout: Duration) -> Result<Self> {
        let deadline = tokio::time::Instant::now() + timeout;
        let stream = loop {
            match TcpStream::connect(server).await {
                Ok(stream) => break stream,
                Err(e) if tokio::time::Instant::now() < deadline => {
                    tracing::debug!(%server, error = %e, "store not reachable yet, retrying");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(e) => {
                    return Err(FlagcxError::Store {
                        key: String::new(),
                        reason: format!("cannot reach store at {server}: {e}"),
                    });
                }
            }
        };
        stream.set_nodelay(true)?;
        let (mut read_half, write_half) = stream.into_split();

        let waiters: Waiters = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let reader_waiters = Arc::clone(&waiters);
        let reader = tokio::spawn(async move {
            loop {
                let body = match read_prefixed(&mut read_half).await {
                    Ok(Some(body)) => body,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "store connection read failed");
                        break;
                    }
                };
                let msg = match StoreMessage::decode(&body) {
                    Ok(msg) => msg,
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping undecodable store response");
                        continue;
                    }
                };
                let waiter = reader_waiters
                    .lock()
                    .ok()
                    .and_then(|mut w| w.remove(&msg.req_id()));
                if let Some(tx) = waiter {
                    let _ = tx.send(msg);
                }
            }
            // Dropping the senders fails every outstanding request.
            if let Ok(mut w) = reader_waiters.lock() {
                w.clear();
            }
        });

        tracing::debug!(%server, "connected to rendezvous store");
        Ok(Self {
            server,
            writer: Mutex::new(write_half),
            waiters,
            next_req: AtomicU64::new(1),
            reader,
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server
    }

    async fn request(&self, key: &str, build: impl FnOnce(u64) -> StoreMessage) -> Result<StoreMessage> {
        let req_id = self.next_req.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .map_err(|_| store_err(key, "waiter table poisoned"))?
            .insert(req_id, tx);

        let body = build(req_id).encode()?;
        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = write_prefixed(&mut *writer, &body).await {
                if let Ok(mut w) = self.waiters.lock() {
                    w.remove(&req_id);
                }
                return Err(store_err(key, format!("write failed: {e}")));
            }
        }

        rx.await
            .map_err(|_| store_err(key, "connection to store closed"))
    }
}

impl Drop for TcpStore {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn store_err(key: &str, reason: impl Into<String>) -> FlagcxError {
    FlagcxError::Store {
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn unexpected(key: &str, msg: StoreMessage) -> FlagcxError {
    match msg {
        StoreMessage::Failed { reason, .. } => store_err(key, reason),
        other => store_err(key, format!("unexpected response {other:?}")),
    }
}

impl Store for TcpStore {
    fn put<'a>(&'a self, key: &'a str, value: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let resp = self
                .request(key, |req_id| StoreMessage::Put {
                    req_id,
                    key: key.to_string(),
                    value: value.to_vec(),
                })
                .await?;
            match resp {
                StoreMessage::Done { .. } => Ok(()),
                other => Err(unexpected(key, other)),
            }
        })
    }

    fn get<'a>(&'a self, key: &'a str, timeout: Duration) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            let timeout_ms = timeout.as_millis() as u64;
            let resp = self
                .request(key, |req_id| StoreMessage::Get {
                    req_id,
                    key: key.to_string(),
                    timeout_ms,
                })
                .await?;
            match resp {
                StoreMessage::Value { value, .. } => Ok(value),
                StoreMessage::TimedOut { .. } => Err(FlagcxError::StoreTimeout {
                    key: key.to_string(),
                    timeout_ms,
                }),
                other => Err(unexpected(key, other)),
            }
        })
    }

    fn put_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: &'a [u8],
    ) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            let resp = self
                .request(key, |req_id| StoreMessage::PutIfAbsent {
                    req_id,
                    key: key.to_string(),
                    value: value.to_vec(),
                })
                .await?;
            match resp {
                StoreMessage::Value { value, .. } => Ok(value),
                other => Err(unexpected(key, other)),
            }
        })
    }
}

/// TCP front end for an [`InMemoryStore`], normally run by rank 0.
pub struct StoreServer {
    listener: TcpListener,
    store: Arc<InMemoryStore>,
}

impl StoreServer {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            store: Arc::new(InMemoryStore::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept clients until the task is dropped or aborted.
    pub async fn serve(self) -> Result<()> {
        tracing::info!(addr = %self.listener.local_addr()?, "rendezvous store listening");
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let store = Arc::clone(&self.store);
            tokio::spawn(async move {
                if let Err(e) = serve_connection(stream, store).await {
                    tracing::warn!(%peer, error = %e, "store client connection ended with error");
                }
            });
        }
    }

    /// Run [`serve`](Self::serve) on a background task.
    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.serve())
    }
}

async fn serve_connection(stream: TcpStream, store: Arc<InMemoryStore>) -> Result<()> {
    stream.set_nodelay(true)?;
    let (mut read_half, write_half) = stream.into_split();
    let writer = Arc::new(Mutex::new(write_half));

    while let Some(body) = read_prefixed(&mut read_half).await? {
        let request = StoreMessage::decode(&body)?;
        let store = Arc::clone(&store);
        let writer = Arc::clone(&writer);
        // Each request runs on its own task so a waiting Get never blocks
        // the Puts that would satisfy it.
        tokio::spawn(async move {
            let response = handle_request(&store, request).await;
            let encoded = match response.encode() {
                Ok(encoded) => encoded,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to encode store response");
                    return;
                }
            };
            let mut writer = writer.lock().await;
            if let Err(e) = write_prefixed(&mut *writer, &encoded).await {
                tracing::debug!(error = %e, "store client went away before response");
            }
        });
    }
    Ok(())
}

async fn handle_request(store: &InMemoryStore, request: StoreMessage) -> StoreMessage {
    match request {
        StoreMessage::Put { req_id, key, value } => match store.put(&key, &value).await {
            Ok(()) => StoreMessage::Done { req_id },
            Err(e) => StoreMessage::Failed {
                req_id,
                reason: e.to_string(),
            },
        },
        StoreMessage::Get {
            req_id,
            key,
            timeout_ms,
        } => match store.get(&key, Duration::from_millis(timeout_ms)).await {
            Ok(value) => StoreMessage::Value { req_id, value },
            Err(FlagcxError::StoreTimeout { .. }) => StoreMessage::TimedOut { req_id },
            Err(e) => StoreMessage::Failed {
                req_id,
                reason: e.to_string(),
            },
        },
        StoreMessage::PutIfAbsent { req_id, key, value } => {
            match store.put_if_absent(&key, &value).await {
                Ok(value) => StoreMessage::Value { req_id, value },
                Err(e) => StoreMessage::Failed {
                    req_id,
                    reason: e.to_string(),
                },
            }
        }
        other => StoreMessage::Failed {
            req_id: other.req_id(),
            reason: "not a request".into(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn start_server() -> SocketAddr {
        let server = StoreServer::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        server.spawn();
        addr
    }

    #[tokio::test]
    async fn test_put_get_over_tcp() {
        let addr = start_server().await;
        let client = TcpStore::connect(addr, Duration::from_secs(5)).await.unwrap();
        client.put("a", b"1").await.unwrap();
        assert_eq!(client.get("a", Duration::from_secs(1)).await.unwrap(), b"1");
    }

    #[tokio::test]
    async fn test_blocking_get_does_not_stall_other_requests() {
        let addr = start_server().await;
        let client = Arc::new(TcpStore::connect(addr, Duration::from_secs(5)).await.unwrap());

        let waiting = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.get("late", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Same connection: must not queue behind the pending get.
        client.put("late", b"here").await.unwrap();
        assert_eq!(waiting.await.unwrap().unwrap(), b"here");
    }

    #[tokio::test]
    async fn test_two_clients_share_state() {
        let addr = start_server().await;
        let a = TcpStore::connect(addr, Duration::from_secs(5)).await.unwrap();
        let b = TcpStore::connect(addr, Duration::from_secs(5)).await.unwrap();
        assert_eq!(a.put_if_absent("m", b"x").await.unwrap(), b"x");
        assert_eq!(b.put_if_absent("m", b"y").await.unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_get_timeout_over_tcp() {
        let addr = start_server().await;
        let client = TcpStore::connect(addr, Duration::from_secs(5)).await.unwrap();
        let err = client
            .get("missing", Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, FlagcxError::StoreTimeout { timeout_ms: 30, .. }));
    }
}
