//! SPICE over WebSocket, bridged in-process to the VM's local SPICE port.

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

pub const CONNECT_ATTEMPTS: u32 = 3;
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const CONNECT_BACKOFF: Duration = Duration::from_secs(1);
const READ_CHUNK: usize = 65536;

/// Live bridges, keyed by VM id. Each bridge watches its own cancel flag.
#[derive(Default)]
pub struct SpiceSessions {
    next_id: AtomicU64,
    sessions: Mutex<HashMap<String, HashMap<u64, watch::Sender<bool>>>>,
}

/// Registration of one bridge; unregisters on drop.
pub struct SessionGuard {
    owner: Arc<SpiceSessions>,
    vm_id: String,
    id: u64,
    cancel: watch::Receiver<bool>,
}

impl SessionGuard {
    pub fn cancelled(&self) -> watch::Receiver<bool> {
        self.cancel.clone()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let mut sessions = self.owner.sessions.lock();
        if let Some(per_vm) = sessions.get_mut(&self.vm_id) {
            per_vm.remove(&self.id);
            if per_vm.is_empty() {
                sessions.remove(&self.vm_id);
            }
        }
    }
}

impl SpiceSessions {
    pub fn register(self: &Arc<Self>, vm_id: &str) -> SessionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(false);
        self.sessions
            .lock()
            .entry(vm_id.to_string())
            .or_default()
            .insert(id, tx);
        SessionGuard {
            owner: Arc::clone(self),
            vm_id: vm_id.to_string(),
            id,
            cancel: rx,
        }
    }

    pub fn count(&self, vm_id: &str) -> usize {
        self.sessions.lock().get(vm_id).map_or(0, HashMap::len)
    }

    /// Ask every bridge of `vm_id` to close. Returns how many were signalled.
    pub fn cancel_vm(&self, vm_id: &str) -> usize {
        let sessions = self.sessions.lock();
        let Some(per_vm) = sessions.get(vm_id) else {
            return 0;
        };
        for tx in per_vm.values() {
            let _ = tx.send(true);
        }
        per_vm.len()
    }

    pub fn cancel_all(&self) -> usize {
        let sessions = self.sessions.lock();
        let mut n = 0;
        for tx in sessions.values().flat_map(HashMap::values) {
            let _ = tx.send(true);
            n += 1;
        }
        n
    }
}

/// Connect to the VM's SPICE server, retrying refused, timed out and
/// otherwise failed attempts.
pub async fn connect_spice(port: u16) -> std::io::Result<TcpStream> {
    let mut last_err = None;
    for attempt in 1..=CONNECT_ATTEMPTS {
        match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await
        {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => {
                tracing::debug!(port, attempt, error = %e, "spice connect failed");
                last_err = Some(e);
            }
            Err(_) => {
                tracing::debug!(port, attempt, "spice connect timed out");
                last_err = Some(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to 127.0.0.1:{port} timed out"),
                ));
            }
        }
        if attempt < CONNECT_ATTEMPTS {
            tokio::time::sleep(CONNECT_BACKOFF).await;
        }
    }
    Err(last_err.unwrap_or_else(|| std::io::ErrorKind::NotConnected.into()))
}

/// Why a bridge ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeEnd {
    ClientClosed,
    ServerClosed,
    Cancelled,
}

/// Pump bytes both ways until either side closes or `cancel` flips. The
/// losing direction is dropped before the TCP write half is flushed and
/// shut down and the WebSocket is closed.
pub async fn bridge<S>(
    ws: WebSocketStream<S>,
    tcp: TcpStream,
    mut cancel: watch::Receiver<bool>,
) -> BridgeEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (mut tcp_rx, mut tcp_tx) = tcp.into_split();

    let end = tokio::select! {
        _ = async {
            while let Some(Ok(msg)) = ws_rx.next().await {
                match msg {
                    Message::Binary(data) => {
                        if tcp_tx.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        } => BridgeEnd::ClientClosed,
        _ = async {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                match tcp_rx.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if ws_tx.send(Message::binary(buf[..n].to_vec())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        } => BridgeEnd::ServerClosed,
        _ = wait_cancelled(&mut cancel) => BridgeEnd::Cancelled,
    };

    let _ = tcp_tx.flush().await;
    let _ = tcp_tx.shutdown().await;
    let _ = ws_tx.close().await;
    end
}

async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone without cancelling: the bridge runs until a peer ends it.
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::protocol::Role;

    #[test]
    fn test_sessions_cancel_and_unregister() {
        let sessions = Arc::new(SpiceSessions::default());
        let a = sessions.register("vm1");
        let _b = sessions.register("vm1");
        let c = sessions.register("vm2");
        assert_eq!(sessions.count("vm1"), 2);

        assert_eq!(sessions.cancel_vm("vm1"), 2);
        assert!(*a.cancelled().borrow());
        assert!(!*c.cancelled().borrow());

        drop(a);
        assert_eq!(sessions.count("vm1"), 1);
        assert_eq!(sessions.cancel_all(), 2);
        assert!(*c.cancelled().borrow());
        assert_eq!(sessions.cancel_vm("missing"), 0);
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_retries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let started = std::time::Instant::now();
        assert!(connect_spice(port).await.is_err());
        assert!(started.elapsed() >= CONNECT_BACKOFF * (CONNECT_ATTEMPTS - 1));
    }

    /// Websocket pair over a loopback socket, no HTTP handshake.
    async fn ws_pair() -> (WebSocketStream<TcpStream>, WebSocketStream<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let server = WebSocketStream::from_raw_socket(server.unwrap().0, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client.unwrap(), Role::Client, None).await;
        (server, client)
    }

    #[tokio::test]
    async fn test_bridge_pumps_both_ways() {
        let spice = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = spice.local_addr().unwrap().port();
        let echo = tokio::spawn(async move {
            let (mut sock, _) = spice.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = sock.read(&mut buf).await.unwrap();
            sock.write_all(&buf[..n]).await.unwrap();
            sock.write_all(b"!").await.unwrap();
        });

        let (server_ws, mut client) = ws_pair().await;
        let tcp = connect_spice(port).await.unwrap();
        let (_tx, rx) = watch::channel(false);
        let bridged = tokio::spawn(bridge(server_ws, tcp, rx));

        client.send(Message::binary(b"REDQ".to_vec())).await.unwrap();
        let mut got = Vec::new();
        while got.len() < 5 {
            match client.next().await.unwrap().unwrap() {
                Message::Binary(b) => got.extend_from_slice(&b),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(got, b"REDQ!");

        echo.await.unwrap();
        assert_eq!(bridged.await.unwrap(), BridgeEnd::ServerClosed);
    }

    #[tokio::test]
    async fn test_bridge_stops_on_cancel() {
        let spice = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = spice.local_addr().unwrap().port();
        let held = tokio::spawn(async move { spice.accept().await.unwrap() });

        let (server_ws, mut client) = ws_pair().await;
        let tcp = connect_spice(port).await.unwrap();
        let (_peer, _) = held.await.unwrap();

        let sessions = Arc::new(SpiceSessions::default());
        let guard = sessions.register("vm1");
        let bridged = tokio::spawn(bridge(server_ws, tcp, guard.cancelled()));

        sessions.cancel_vm("vm1");
        assert_eq!(bridged.await.unwrap(), BridgeEnd::Cancelled);
        // Client sees the close frame.
        assert!(matches!(
            client.next().await,
            Some(Ok(Message::Close(_))) | None | Some(Err(_))
        ));
    }
}
