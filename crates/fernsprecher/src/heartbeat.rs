//! Keep-alive layer over a channel.
//!
//! Sends a `_zpc_hb` frame every interval and watches for the peer's.
//! Silence longer than twice the interval trips the lost-remote signal:
//! every pending or future operation on the layer fails with
//! [`RpcError::LostRemote`]. In passive mode the layer stays quiet until the
//! peer proves liveness first, which lets short unary calls against legacy
//! peers complete without a single heartbeat.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rmpv::Value;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::context::Context;
use crate::error::{LostRemote, RpcError};
use crate::event::{Event, Header, HEARTBEAT, MORE, PROTOCOL_VERSION};
use crate::socket::with_deadline;
use crate::traits::ChannelBase;

struct HbShared {
    channel: Arc<dyn ChannelBase>,
    freq: Duration,
    last_peer_hb: StdMutex<Option<Instant>>,
    /// Set from the first received event's header version; `true` aliases
    /// heartbeats and credit grants (protocol v2 overloads heartbeats as
    /// flow control).
    compat_v2: StdMutex<Option<bool>>,
    heartbeat_task: StdMutex<Option<JoinHandle<()>>>,
    lost_tx: watch::Sender<bool>,
}

impl HbShared {
    fn compat_v2(&self) -> bool {
        self.compat_v2
            .lock()
            .expect("compat flag lock")
            .unwrap_or(false)
    }
}

fn start_heartbeat(shared: &Arc<HbShared>) {
    let mut guard = shared.heartbeat_task.lock().expect("heartbeat task lock");
    if guard.is_none() && !shared.freq.is_zero() {
        *guard = Some(tokio::spawn(heartbeat_loop(shared.clone())));
    }
}

/// Channel wrapper adding liveness to one conversation.
pub struct HeartbeatChannel {
    shared: Arc<HbShared>,
    input_rx: Mutex<mpsc::Receiver<Event>>,
    lost_rx: watch::Receiver<bool>,
    recv_task: StdMutex<Option<JoinHandle<()>>>,
}

impl HeartbeatChannel {
    /// Wrap `channel`. `passive` delays our own heartbeating until the peer
    /// sends one first.
    pub fn new(channel: Arc<dyn ChannelBase>, freq: Duration, passive: bool) -> Arc<Self> {
        let (lost_tx, lost_rx) = watch::channel(false);
        let shared = Arc::new(HbShared {
            channel,
            freq,
            last_peer_hb: StdMutex::new(None),
            compat_v2: StdMutex::new(None),
            heartbeat_task: StdMutex::new(None),
            lost_tx,
        });

        let (input_tx, input_rx) = mpsc::channel(1);
        let recv_task = tokio::spawn(recv_loop(shared.clone(), input_tx));

        if !passive {
            start_heartbeat(&shared);
        }

        Arc::new(Self {
            shared,
            input_rx: Mutex::new(input_rx),
            lost_rx,
            recv_task: StdMutex::new(Some(recv_task)),
        })
    }

    /// The heartbeat interval this layer was configured with.
    pub fn freq(&self) -> Duration {
        self.shared.freq
    }

    /// True once the peer has been declared dead.
    pub fn lost_remote(&self) -> bool {
        *self.lost_rx.borrow()
    }

    fn lost_error(&self) -> RpcError {
        LostRemote::new(self.shared.freq).into()
    }

    fn abort_tasks(&self) {
        if let Ok(mut guard) = self.recv_task.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
        if let Ok(mut guard) = self.shared.heartbeat_task.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

/// Intercepts the peer's heartbeats; everything else flows through to the
/// user-visible receive side.
async fn recv_loop(shared: Arc<HbShared>, input_tx: mpsc::Sender<Event>) {
    loop {
        let mut event = match shared.channel.recv(None).await {
            Ok(event) => event,
            Err(e) => {
                debug!(error = %e, "heartbeat recv loop ending");
                break;
            }
        };

        {
            let mut compat = shared.compat_v2.lock().expect("compat flag lock");
            if compat.is_none() {
                *compat = Some(event.version().unwrap_or(0) < PROTOCOL_VERSION);
            }
        }

        if event.name() == HEARTBEAT {
            *shared.last_peer_hb.lock().expect("last heartbeat lock") = Some(Instant::now());
            start_heartbeat(&shared);
            if shared.compat_v2() {
                // v2 heartbeats double as credit grants.
                event.set_name(MORE);
                if input_tx.send(event).await.is_err() {
                    break;
                }
            }
        } else if input_tx.send(event).await.is_err() {
            break;
        }
    }
}

async fn heartbeat_loop(shared: Arc<HbShared>) {
    loop {
        tokio::time::sleep(shared.freq).await;

        let lost = {
            let mut last = shared.last_peer_hb.lock().expect("last heartbeat lock");
            let last = last.get_or_insert_with(Instant::now);
            last.elapsed() > shared.freq * 2
        };
        if lost {
            debug!(freq = ?shared.freq, "peer missed heartbeats, marking remote lost");
            let _ = shared.lost_tx.send(true);
            break;
        }

        // The 0 argument only matters to v2 peers, which read credits out of
        // heartbeats.
        if shared
            .channel
            .emit(HEARTBEAT, Value::Array(vec![Value::from(0)]), None)
            .await
            .is_err()
        {
            break;
        }
    }
}

#[async_trait]
impl ChannelBase for HeartbeatChannel {
    fn context(&self) -> Arc<Context> {
        self.shared.channel.context()
    }

    fn recv_is_supported(&self) -> bool {
        self.shared.channel.recv_is_supported()
    }

    fn emit_is_supported(&self) -> bool {
        self.shared.channel.emit_is_supported()
    }

    fn new_event(&self, name: &str, args: Value, xheader: Option<Header>) -> Event {
        let name = if self.shared.compat_v2() && name == MORE {
            HEARTBEAT
        } else {
            name
        };
        self.shared.channel.new_event(name, args, xheader)
    }

    async fn emit_event(&self, event: Event, timeout: Option<Duration>) -> Result<(), RpcError> {
        if self.lost_remote() {
            return Err(self.lost_error());
        }
        self.shared.channel.emit_event(event, timeout).await
    }

    async fn recv(&self, timeout: Option<Duration>) -> Result<Event, RpcError> {
        let mut lost_rx = self.lost_rx.clone();
        if *lost_rx.borrow_and_update() {
            return Err(self.lost_error());
        }

        with_deadline(timeout, async {
            let mut rx = self.input_rx.lock().await;
            tokio::select! {
                event = rx.recv() => event.ok_or(RpcError::Closed),
                _ = lost_rx.changed() => Err(self.lost_error()),
            }
        })
        .await
    }

    async fn close(&self) {
        self.abort_tasks();
        self.shared.channel.close().await;
    }
}

impl Drop for HeartbeatChannel {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}
