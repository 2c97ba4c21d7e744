//! Socket adapter: owns the ZeroMQ socket and adapts it to the task model.
//!
//! Queue-driven socket patterns (DEALER/ROUTER/PUSH/PULL/PUB/SUB) hand their
//! socket to a background driver task that multiplexes an outbound command
//! queue with the socket's inbound side, so one task may send while another
//! receives. REQ/REP enforce strict alternation at the ZeroMQ level, so they
//! stay sequential: callers take turns on the socket directly.
//!
//! Closing the adapter stops the driver; every suspended send or receive
//! fails with a closed error.

use std::future::Future;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use zeromq::{
    DealerSocket, PubSocket, PullSocket, PushSocket, RepSocket, ReqSocket, RouterSocket, Socket,
    SocketRecv, SocketSend, SubSocket, ZmqMessage,
};

use crate::error::{RpcError, TimeoutExpired};

/// ZeroMQ socket pattern a transport is built around.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Req,
    Rep,
    Dealer,
    Router,
    Push,
    Pull,
    Pub,
    Sub,
}

impl SocketKind {
    pub fn recv_is_supported(self) -> bool {
        matches!(
            self,
            SocketKind::Req
                | SocketKind::Rep
                | SocketKind::Dealer
                | SocketKind::Router
                | SocketKind::Pull
                | SocketKind::Sub
        )
    }

    pub fn emit_is_supported(self) -> bool {
        matches!(
            self,
            SocketKind::Req
                | SocketKind::Rep
                | SocketKind::Dealer
                | SocketKind::Router
                | SocketKind::Push
                | SocketKind::Pub
        )
    }

    /// REQ/REP alternate strictly; they cannot be driven by a free-running
    /// receive loop.
    pub(crate) fn is_sequential(self) -> bool {
        matches!(self, SocketKind::Req | SocketKind::Rep)
    }

    /// DEALER/DEALER-facing patterns frame the payload behind an empty
    /// delimiter (and identity frames on the ROUTER side).
    pub(crate) fn uses_envelope(self) -> bool {
        matches!(self, SocketKind::Dealer | SocketKind::Router)
    }
}

enum AnySocket {
    Req(ReqSocket),
    Rep(RepSocket),
    Dealer(DealerSocket),
    Router(RouterSocket),
    Push(PushSocket),
    Pull(PullSocket),
    Pub(PubSocket),
    Sub(SubSocket),
}

impl AnySocket {
    fn new(kind: SocketKind) -> Self {
        match kind {
            SocketKind::Req => AnySocket::Req(ReqSocket::new()),
            SocketKind::Rep => AnySocket::Rep(RepSocket::new()),
            SocketKind::Dealer => AnySocket::Dealer(DealerSocket::new()),
            SocketKind::Router => AnySocket::Router(RouterSocket::new()),
            SocketKind::Push => AnySocket::Push(PushSocket::new()),
            SocketKind::Pull => AnySocket::Pull(PullSocket::new()),
            SocketKind::Pub => AnySocket::Pub(PubSocket::new()),
            SocketKind::Sub => AnySocket::Sub(SubSocket::new()),
        }
    }

    async fn bind(&mut self, endpoint: &str) -> Result<(), RpcError> {
        match self {
            AnySocket::Req(s) => s.bind(endpoint).await.map(|_| ())?,
            AnySocket::Rep(s) => s.bind(endpoint).await.map(|_| ())?,
            AnySocket::Dealer(s) => s.bind(endpoint).await.map(|_| ())?,
            AnySocket::Router(s) => s.bind(endpoint).await.map(|_| ())?,
            AnySocket::Push(s) => s.bind(endpoint).await.map(|_| ())?,
            AnySocket::Pull(s) => s.bind(endpoint).await.map(|_| ())?,
            AnySocket::Pub(s) => s.bind(endpoint).await.map(|_| ())?,
            AnySocket::Sub(s) => s.bind(endpoint).await.map(|_| ())?,
        }
        Ok(())
    }

    async fn connect(&mut self, endpoint: &str) -> Result<(), RpcError> {
        match self {
            AnySocket::Req(s) => s.connect(endpoint).await.map(|_| ())?,
            AnySocket::Rep(s) => s.connect(endpoint).await.map(|_| ())?,
            AnySocket::Dealer(s) => s.connect(endpoint).await.map(|_| ())?,
            AnySocket::Router(s) => s.connect(endpoint).await.map(|_| ())?,
            AnySocket::Push(s) => s.connect(endpoint).await.map(|_| ())?,
            AnySocket::Pull(s) => s.connect(endpoint).await.map(|_| ())?,
            AnySocket::Pub(s) => s.connect(endpoint).await.map(|_| ())?,
            AnySocket::Sub(s) => s.connect(endpoint).await.map(|_| ())?,
        }
        Ok(())
    }

    async fn subscribe(&mut self, prefix: &str) -> Result<(), RpcError> {
        match self {
            AnySocket::Sub(s) => Ok(s.subscribe(prefix).await?),
            _ => Err(RpcError::Protocol(
                "subscribe is only valid on SUB sockets".into(),
            )),
        }
    }

    async fn send(&mut self, msg: ZmqMessage) -> Result<(), RpcError> {
        match self {
            AnySocket::Req(s) => Ok(s.send(msg).await?),
            AnySocket::Rep(s) => Ok(s.send(msg).await?),
            AnySocket::Dealer(s) => Ok(s.send(msg).await?),
            AnySocket::Router(s) => Ok(s.send(msg).await?),
            AnySocket::Push(s) => Ok(s.send(msg).await?),
            AnySocket::Pub(s) => Ok(s.send(msg).await?),
            AnySocket::Pull(_) | AnySocket::Sub(_) => Err(RpcError::Protocol(
                "socket pattern does not support send".into(),
            )),
        }
    }

    async fn recv(&mut self) -> Result<ZmqMessage, RpcError> {
        match self {
            AnySocket::Req(s) => Ok(s.recv().await?),
            AnySocket::Rep(s) => Ok(s.recv().await?),
            AnySocket::Dealer(s) => Ok(s.recv().await?),
            AnySocket::Router(s) => Ok(s.recv().await?),
            AnySocket::Pull(s) => Ok(s.recv().await?),
            AnySocket::Sub(s) => Ok(s.recv().await?),
            AnySocket::Push(_) | AnySocket::Pub(_) => Err(RpcError::Protocol(
                "socket pattern does not support recv".into(),
            )),
        }
    }
}

enum SocketCommand {
    Bind(String, oneshot::Sender<Result<(), RpcError>>),
    Connect(String, oneshot::Sender<Result<(), RpcError>>),
    Subscribe(String, oneshot::Sender<Result<(), RpcError>>),
    Send(ZmqMessage),
    Close,
}

/// Handle through which the transport reaches its socket.
pub(crate) enum SocketHandle {
    Driven {
        cmd_tx: mpsc::Sender<SocketCommand>,
        recv_rx: Mutex<mpsc::Receiver<ZmqMessage>>,
        driver: std::sync::Mutex<Option<JoinHandle<()>>>,
    },
    Sequential {
        socket: Mutex<Option<AnySocket>>,
    },
}

impl SocketHandle {
    pub(crate) fn new(kind: SocketKind) -> Self {
        let socket = AnySocket::new(kind);
        if kind.is_sequential() {
            return SocketHandle::Sequential {
                socket: Mutex::new(Some(socket)),
            };
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(1);
        let (recv_tx, recv_rx) = mpsc::channel(1);
        let recv_enabled = kind.recv_is_supported();
        let driver = tokio::spawn(drive_socket(socket, cmd_rx, recv_tx, recv_enabled));
        SocketHandle::Driven {
            cmd_tx,
            recv_rx: Mutex::new(recv_rx),
            driver: std::sync::Mutex::new(Some(driver)),
        }
    }

    async fn command(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<(), RpcError>>) -> SocketCommand,
    ) -> Result<(), RpcError> {
        match self {
            SocketHandle::Driven { cmd_tx, .. } => {
                let (ack_tx, ack_rx) = oneshot::channel();
                cmd_tx
                    .send(make(ack_tx))
                    .await
                    .map_err(|_| RpcError::Closed)?;
                ack_rx.await.map_err(|_| RpcError::Closed)?
            }
            SocketHandle::Sequential { .. } => unreachable!("sequential sockets use direct access"),
        }
    }

    pub(crate) async fn bind(&self, endpoint: &str) -> Result<(), RpcError> {
        match self {
            SocketHandle::Driven { .. } => {
                self.command(|ack| SocketCommand::Bind(endpoint.to_owned(), ack))
                    .await
            }
            SocketHandle::Sequential { socket } => {
                let mut guard = socket.lock().await;
                guard.as_mut().ok_or(RpcError::Closed)?.bind(endpoint).await
            }
        }
    }

    pub(crate) async fn connect(&self, endpoint: &str) -> Result<(), RpcError> {
        match self {
            SocketHandle::Driven { .. } => {
                self.command(|ack| SocketCommand::Connect(endpoint.to_owned(), ack))
                    .await
            }
            SocketHandle::Sequential { socket } => {
                let mut guard = socket.lock().await;
                guard
                    .as_mut()
                    .ok_or(RpcError::Closed)?
                    .connect(endpoint)
                    .await
            }
        }
    }

    pub(crate) async fn subscribe(&self, prefix: &str) -> Result<(), RpcError> {
        match self {
            SocketHandle::Driven { .. } => {
                self.command(|ack| SocketCommand::Subscribe(prefix.to_owned(), ack))
                    .await
            }
            SocketHandle::Sequential { .. } => Err(RpcError::Protocol(
                "subscribe is only valid on SUB sockets".into(),
            )),
        }
    }

    /// Queue one outbound message. The driver performs the actual socket
    /// send; a full queue fails with [`RpcError::Timeout`] after `timeout`.
    pub(crate) async fn send(
        &self,
        msg: ZmqMessage,
        timeout: Option<Duration>,
    ) -> Result<(), RpcError> {
        match self {
            SocketHandle::Driven { cmd_tx, .. } => match timeout {
                None => cmd_tx
                    .send(SocketCommand::Send(msg))
                    .await
                    .map_err(|_| RpcError::Closed),
                Some(d) if d.is_zero() => cmd_tx.try_send(SocketCommand::Send(msg)).map_err(|e| {
                    match e {
                        mpsc::error::TrySendError::Full(_) => {
                            TimeoutExpired::new(Some(d)).into()
                        }
                        mpsc::error::TrySendError::Closed(_) => RpcError::Closed,
                    }
                }),
                Some(d) => cmd_tx
                    .send_timeout(SocketCommand::Send(msg), d)
                    .await
                    .map_err(|e| match e {
                        mpsc::error::SendTimeoutError::Timeout(_) => {
                            TimeoutExpired::new(Some(d)).into()
                        }
                        mpsc::error::SendTimeoutError::Closed(_) => RpcError::Closed,
                    }),
            },
            SocketHandle::Sequential { socket } => {
                with_deadline(timeout, async {
                    let mut guard = socket.lock().await;
                    guard.as_mut().ok_or(RpcError::Closed)?.send(msg).await
                })
                .await
            }
        }
    }

    /// Receive one multipart message, waiting up to `timeout`.
    pub(crate) async fn recv(&self, timeout: Option<Duration>) -> Result<ZmqMessage, RpcError> {
        match self {
            SocketHandle::Driven { recv_rx, .. } => {
                with_deadline(timeout, async {
                    let mut rx = recv_rx.lock().await;
                    rx.recv().await.ok_or(RpcError::Closed)
                })
                .await
            }
            SocketHandle::Sequential { socket } => {
                with_deadline(timeout, async {
                    let mut guard = socket.lock().await;
                    guard.as_mut().ok_or(RpcError::Closed)?.recv().await
                })
                .await
            }
        }
    }

    /// Stop the driver and drop the socket. Suspended operations fail with a
    /// closed error.
    pub(crate) async fn close(&self) {
        match self {
            SocketHandle::Driven { cmd_tx, driver, .. } => {
                let _ = cmd_tx.send(SocketCommand::Close).await;
                let handle = driver.lock().expect("driver handle lock").take();
                if let Some(handle) = handle {
                    handle.abort();
                }
            }
            SocketHandle::Sequential { socket } => {
                socket.lock().await.take();
            }
        }
    }
}

impl Drop for SocketHandle {
    fn drop(&mut self) {
        if let SocketHandle::Driven { driver, .. } = self {
            if let Ok(mut guard) = driver.lock() {
                if let Some(handle) = guard.take() {
                    handle.abort();
                }
            }
        }
    }
}

/// Driver loop: the only task with access to the socket. Outbound commands
/// win over inbound traffic; an inbound message parks in `pending` until the
/// recv queue has room, so sends never stall behind a slow reader.
async fn drive_socket(
    mut socket: AnySocket,
    mut cmd_rx: mpsc::Receiver<SocketCommand>,
    recv_tx: mpsc::Sender<ZmqMessage>,
    recv_enabled: bool,
) {
    let mut pending: Option<ZmqMessage> = None;
    loop {
        tokio::select! {
            biased;
            cmd = cmd_rx.recv() => match cmd {
                Some(SocketCommand::Send(msg)) => {
                    if let Err(e) = socket.send(msg).await {
                        warn!(error = %e, "socket send failed");
                    }
                }
                Some(SocketCommand::Bind(endpoint, ack)) => {
                    let _ = ack.send(socket.bind(&endpoint).await);
                }
                Some(SocketCommand::Connect(endpoint, ack)) => {
                    let _ = ack.send(socket.connect(&endpoint).await);
                }
                Some(SocketCommand::Subscribe(prefix, ack)) => {
                    let _ = ack.send(socket.subscribe(&prefix).await);
                }
                Some(SocketCommand::Close) | None => break,
            },
            permit = recv_tx.reserve(), if pending.is_some() => match permit {
                Ok(permit) => permit.send(pending.take().expect("pending message present")),
                Err(_) => break,
            },
            msg = socket.recv(), if recv_enabled && pending.is_none() => match msg {
                Ok(msg) => pending = Some(msg),
                Err(e) => {
                    debug!(error = %e, "socket recv loop ending");
                    break;
                }
            },
        }
    }
}

/// Run `fut` under an optional deadline, mapping expiry to
/// [`RpcError::Timeout`].
pub(crate) async fn with_deadline<T, F>(timeout: Option<Duration>, fut: F) -> Result<T, RpcError>
where
    F: Future<Output = Result<T, RpcError>>,
{
    match timeout {
        None => fut.await,
        Some(d) => match tokio::time::timeout(d, fut).await {
            Ok(result) => result,
            Err(_) => Err(TimeoutExpired::new(Some(d)).into()),
        },
    }
}
