//! WebSocket listener for SPICE consoles: `/ws/spice/{vm_id}?token=...`.

use super::spice::{self, SpiceSessions};
use crate::error::{Error, Result};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::WebSocketStream;

pub const SPICE_PATH: &str = "/ws/spice/";

pub const CLOSE_UNAUTHORIZED: u16 = 4401;
pub const CLOSE_NOT_FOUND: u16 = 4404;
pub const CLOSE_NOT_READY: u16 = 4400;
pub const CLOSE_UNREACHABLE: u16 = 4500;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Out of descriptors or memory: retrying at once would spin. Errors tied
/// to a single connection (aborted, reset) are retried immediately.
fn accept_backoff(e: &io::Error) -> Duration {
    match e.raw_os_error() {
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM) => ACCEPT_BACKOFF,
        _ => Duration::ZERO,
    }
}

/// Resolves a bearer token to a user name.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Option<String>;
}

/// A single shared secret, for operator use.
pub struct StaticToken {
    token: String,
    user: String,
}

impl StaticToken {
    pub fn new(token: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            user: user.into(),
        }
    }
}

impl TokenVerifier for StaticToken {
    fn verify(&self, token: &str) -> Option<String> {
        (!self.token.is_empty() && token == self.token).then(|| self.user.clone())
    }
}

/// Where a VM's SPICE server listens. Errors are `NotFound` for an unknown
/// VM (closed with 4404) and `InvalidState` when it is not running or has
/// no SPICE port (4400). Whether the port is live is decided by the
/// connect attempts of [`spice::connect_spice`]: a port that refuses or
/// times out on every attempt closes the socket with 4500.
pub trait SpiceTargets: Send + Sync {
    fn spice_port(&self, vm_id: &str) -> Result<u16>;
}

pub struct ConsoleServer {
    targets: Arc<dyn SpiceTargets>,
    verifier: Arc<dyn TokenVerifier>,
    sessions: Arc<SpiceSessions>,
}

impl ConsoleServer {
    pub fn new(
        targets: Arc<dyn SpiceTargets>,
        verifier: Arc<dyn TokenVerifier>,
        sessions: Arc<SpiceSessions>,
    ) -> Self {
        Self {
            targets,
            verifier,
            sessions,
        }
    }

    /// Accept connections until `shutdown` flips, then cancel every bridge
    /// and wait for the connection tasks to finish.
    pub async fn run(self: Arc<Self>, listener: TcpListener, shutdown: watch::Receiver<bool>) {
        let listener = &listener;
        self.serve(move || listener.accept(), shutdown).await;
    }

    /// Accept loop over `next_conn`. A failed accept never ends the loop:
    /// it is logged, and under descriptor or memory pressure the loop
    /// backs off before trying again.
    async fn serve<F, Fut>(self: Arc<Self>, mut next_conn: F, mut shutdown: watch::Receiver<bool>)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = io::Result<(TcpStream, SocketAddr)>>,
    {
        let mut conns = JoinSet::new();
        loop {
            tokio::select! {
                accepted = next_conn() => match accepted {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(&self);
                        conns.spawn(async move {
                            tracing::debug!(%peer, "console connection");
                            server.handle(stream).await;
                        });
                    }
                    Err(e) => {
                        let pause = accept_backoff(&e);
                        tracing::warn!(error = %e, backoff_ms = pause.as_millis() as u64, "console accept failed");
                        if !pause.is_zero() {
                            tokio::select! {
                                _ = tokio::time::sleep(pause) => {}
                                _ = shutdown.changed() => break,
                            }
                        }
                    }
                },
                Some(_) = conns.join_next(), if !conns.is_empty() => {}
                _ = shutdown.changed() => break,
            }
        }

        let n = self.sessions.cancel_all();
        tracing::info!(sessions = n, "console server shutting down");
        while conns.join_next().await.is_some() {}
    }

    async fn handle(&self, stream: TcpStream) {
        let mut route = None;
        let callback = |req: &Request, mut resp: Response| -> std::result::Result<Response, ErrorResponse> {
            let Some(parsed) = parse_route(req) else {
                let mut err = ErrorResponse::new(Some("not found".to_string()));
                *err.status_mut() = StatusCode::NOT_FOUND;
                return Err(err);
            };
            let wants_binary = req
                .headers()
                .get_all(header::SEC_WEBSOCKET_PROTOCOL)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .flat_map(|v| v.split(','))
                .any(|p| p.trim() == "binary");
            if wants_binary {
                resp.headers_mut()
                    .insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("binary"));
            }
            route = Some(parsed);
            Ok(resp)
        };
        let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                tracing::debug!(error = %e, "console handshake rejected");
                return;
            }
        };
        let Some(route) = route else { return };
        self.serve_spice(ws, route).await;
    }

    async fn serve_spice<S>(&self, mut ws: WebSocketStream<S>, route: Route)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let vm_id = route.vm_id;
        let user = route
            .token
            .as_deref()
            .and_then(|t| self.verifier.verify(t));
        let Some(user) = user else {
            tracing::warn!(vm_id = %vm_id, "spice console rejected: bad token");
            close(&mut ws, CLOSE_UNAUTHORIZED, "unauthorized").await;
            return;
        };

        let targets = Arc::clone(&self.targets);
        let id = vm_id.clone();
        let port = match tokio::task::spawn_blocking(move || targets.spice_port(&id)).await {
            Ok(Ok(port)) => port,
            Ok(Err(Error::NotFound { .. })) => {
                close(&mut ws, CLOSE_NOT_FOUND, "vm not found").await;
                return;
            }
            Ok(Err(e)) => {
                close(&mut ws, CLOSE_NOT_READY, &e.to_string()).await;
                return;
            }
            Err(e) => {
                tracing::error!(vm_id = %vm_id, error = %e, "spice target lookup panicked");
                close(&mut ws, CLOSE_UNREACHABLE, "internal error").await;
                return;
            }
        };

        let tcp = match spice::connect_spice(port).await {
            Ok(tcp) => tcp,
            Err(e) => {
                tracing::warn!(vm_id = %vm_id, port, error = %e, "spice server unreachable");
                close(&mut ws, CLOSE_UNREACHABLE, "spice server unreachable").await;
                return;
            }
        };

        let guard = self.sessions.register(&vm_id);
        tracing::info!(vm_id = %vm_id, port, user = %user, "spice console connected");
        let end = spice::bridge(ws, tcp, guard.cancelled()).await;
        tracing::info!(vm_id = %vm_id, port, reason = ?end, "spice console disconnected");
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Route {
    vm_id: String,
    token: Option<String>,
}

fn parse_route(req: &Request) -> Option<Route> {
    let uri = req.uri();
    let vm_id = uri.path().strip_prefix(SPICE_PATH)?;
    if vm_id.is_empty() || vm_id.contains('/') {
        return None;
    }
    let token = uri.query().and_then(|q| {
        url::form_urlencoded::parse(q.as_bytes())
            .find(|(k, _)| k == "token")
            .map(|(_, v)| v.into_owned())
    });
    Some(Route {
        vm_id: vm_id.to_string(),
        token,
    })
}

async fn close<S>(ws: &mut WebSocketStream<S>, code: u16, reason: &str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    };
    let _ = ws.close(Some(frame)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;
    use std::collections::HashMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Targets(HashMap<String, Result<u16>>);

    impl SpiceTargets for Targets {
        fn spice_port(&self, vm_id: &str) -> Result<u16> {
            match self.0.get(vm_id) {
                Some(Ok(p)) => Ok(*p),
                Some(Err(e)) => Err(Error::InvalidState(e.to_string())),
                None => Err(Error::vm_not_found(vm_id)),
            }
        }
    }

    async fn start(targets: Targets) -> (String, Arc<SpiceSessions>, watch::Sender<bool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let sessions = Arc::new(SpiceSessions::default());
        let server = Arc::new(ConsoleServer::new(
            Arc::new(targets),
            Arc::new(StaticToken::new("s3cret", "admin")),
            Arc::clone(&sessions),
        ));
        let (tx, rx) = watch::channel(false);
        tokio::spawn(server.run(listener, rx));
        (addr.to_string(), sessions, tx)
    }

    async fn dial(addr: &str, path: &str) -> WebSocketStream<TcpStream> {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (ws, _) = tokio_tungstenite::client_async(format!("ws://{addr}{path}"), stream)
            .await
            .unwrap();
        ws
    }

    async fn close_code(ws: &mut WebSocketStream<TcpStream>) -> u16 {
        match ws.next().await {
            Some(Ok(Message::Close(Some(frame)))) => frame.code.into(),
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[test]
    fn test_static_token() {
        let v = StaticToken::new("abc", "admin");
        assert_eq!(v.verify("abc").as_deref(), Some("admin"));
        assert!(v.verify("abd").is_none());
        assert!(StaticToken::new("", "admin").verify("").is_none());
    }

    #[tokio::test]
    async fn test_close_codes() {
        let targets = Targets(HashMap::from([(
            "stopped".to_string(),
            Err(Error::InvalidState("vm is not running".into())),
        )]));
        let (addr, _sessions, _shutdown) = start(targets).await;

        let mut ws = dial(&addr, "/ws/spice/anything?token=wrong").await;
        assert_eq!(close_code(&mut ws).await, CLOSE_UNAUTHORIZED);

        let mut ws = dial(&addr, "/ws/spice/missing?token=s3cret").await;
        assert_eq!(close_code(&mut ws).await, CLOSE_NOT_FOUND);

        let mut ws = dial(&addr, "/ws/spice/stopped?token=s3cret").await;
        assert_eq!(close_code(&mut ws).await, CLOSE_NOT_READY);
    }

    #[tokio::test]
    async fn test_dead_spice_port_is_unreachable() {
        // Bind then drop, so the port refuses connections.
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let targets = Targets(HashMap::from([("vm1".to_string(), Ok(port))]));
        let (addr, sessions, _shutdown) = start(targets).await;

        let mut ws = dial(&addr, "/ws/spice/vm1?token=s3cret").await;
        assert_eq!(close_code(&mut ws).await, CLOSE_UNREACHABLE);
        assert_eq!(sessions.count("vm1"), 0);
    }

    #[tokio::test]
    async fn test_accept_errors_do_not_stop_the_server() {
        let listener = Arc::new(TcpListener::bind("127.0.0.1:0").await.unwrap());
        let addr = listener.local_addr().unwrap().to_string();
        let server = Arc::new(ConsoleServer::new(
            Arc::new(Targets(HashMap::new())),
            Arc::new(StaticToken::new("s3cret", "admin")),
            Arc::new(SpiceSessions::default()),
        ));
        let (tx, rx) = watch::channel(false);

        let mut failures = vec![
            io::Error::from_raw_os_error(libc::EMFILE),
            io::Error::from_raw_os_error(libc::ECONNABORTED),
        ];
        let next_conn = move || {
            let injected = failures.pop();
            let listener = Arc::clone(&listener);
            async move {
                match injected {
                    Some(e) => Err(e),
                    None => listener.accept().await,
                }
            }
        };
        let task = tokio::spawn(server.serve(next_conn, rx));

        let mut ws = dial(&addr, "/ws/spice/vm1?token=wrong").await;
        assert_eq!(close_code(&mut ws).await, CLOSE_UNAUTHORIZED);
        assert!(!task.is_finished());

        tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[test]
    fn test_accept_backoff() {
        assert_eq!(
            accept_backoff(&io::Error::from_raw_os_error(libc::EMFILE)),
            ACCEPT_BACKOFF
        );
        assert!(accept_backoff(&io::Error::from_raw_os_error(libc::ECONNABORTED)).is_zero());
    }

    #[tokio::test]
    async fn test_unknown_path_is_rejected() {
        let (addr, _sessions, _shutdown) = start(Targets(HashMap::new())).await;
        let stream = TcpStream::connect(&addr).await.unwrap();
        let res = tokio_tungstenite::client_async(format!("ws://{addr}/ws/vnc/x"), stream).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_bridges_to_spice_port_and_shuts_down() {
        let spice = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = spice.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = spice.accept().await.unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
            // Hold the connection open until the bridge closes it.
            let _ = sock.read(&mut buf).await;
        });

        let targets = Targets(HashMap::from([("vm1".to_string(), Ok(port))]));
        let (addr, sessions, shutdown) = start(targets).await;

        let mut ws = dial(&addr, "/ws/spice/vm1?token=s3cret").await;
        ws.send(Message::binary(b"ping".to_vec())).await.unwrap();
        match ws.next().await {
            Some(Ok(Message::Binary(b))) => assert_eq!(&b[..], b"ping"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(sessions.count("vm1"), 1);

        shutdown.send(true).unwrap();
        assert!(matches!(
            ws.next().await,
            Some(Ok(Message::Close(_))) | None | Some(Err(_))
        ));
    }

    #[test]
    fn test_parse_route() {
        let req = Request::builder()
            .uri("/ws/spice/abc123?token=a%20b&x=1")
            .body(())
            .unwrap();
        assert_eq!(
            parse_route(&req),
            Some(Route {
                vm_id: "abc123".into(),
                token: Some("a b".into())
            })
        );
        let req = Request::builder().uri("/ws/spice/").body(()).unwrap();
        assert_eq!(parse_route(&req), None);
    }
}
