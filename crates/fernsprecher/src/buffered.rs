//! Credit-based flow control over a heartbeated channel.
//!
//! Each side owns a bounded inbox and grants the peer credits (`_zpc_more`)
//! as slots free up. An emit consumes one credit and blocks while the peer
//! is saturated. Both sides start with a single credit: the conversation
//! opener.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use rmpv::Value;
use tokio::sync::{mpsc, Mutex, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::context::Context;
use crate::error::{LostRemote, RpcError, TimeoutExpired};
use crate::event::{Event, Header, MORE};
use crate::socket::with_deadline;
use crate::traits::ChannelBase;

/// Default inbox capacity, and therefore the default credit window.
pub const DEFAULT_INBOX_SIZE: usize = 100;

/// Why the receive side shut down; replayed to every later caller.
enum Terminal {
    Lost(LostRemote),
    Overflow,
    Closed,
}

impl Terminal {
    fn to_error(&self) -> RpcError {
        match self {
            Terminal::Lost(lost) => lost.clone().into(),
            Terminal::Overflow => {
                RpcError::Protocol("buffered channel overflow: peer exceeded granted credits".into())
            }
            Terminal::Closed => RpcError::Closed,
        }
    }
}

type ClosePredicate = Box<dyn Fn(&Event) -> bool + Send + Sync>;

struct BufShared {
    channel: Arc<dyn ChannelBase>,
    input_queue_size: usize,
    /// Credits the peer has granted us (`remote_open_slots`).
    credits: Semaphore,
    terminal: StdMutex<Option<Terminal>>,
    on_close_if: StdMutex<Option<ClosePredicate>>,
}

impl BufShared {
    fn shutdown(&self, terminal: Terminal) {
        let mut guard = self.terminal.lock().expect("terminal lock");
        if guard.is_none() {
            *guard = Some(terminal);
        }
        // Wake blocked emitters; they re-read the terminal cause.
        self.credits.close();
    }

    fn terminal_error(&self) -> RpcError {
        self.terminal
            .lock()
            .expect("terminal lock")
            .as_ref()
            .map(Terminal::to_error)
            .unwrap_or(RpcError::Closed)
    }
}

struct RecvState {
    /// Slots already promised to the peer, including the opening slot.
    reserved: usize,
    /// The first recv only arms replenishment; grants start on the second.
    armed: bool,
}

/// Flow-controlled channel wrapper.
pub struct BufferedChannel {
    shared: Arc<BufShared>,
    input_rx: Mutex<mpsc::Receiver<Event>>,
    recv_state: Mutex<RecvState>,
    recv_task: StdMutex<Option<JoinHandle<()>>>,
}

impl BufferedChannel {
    pub fn new(channel: Arc<dyn ChannelBase>, input_queue_size: usize) -> Arc<Self> {
        let shared = Arc::new(BufShared {
            channel,
            input_queue_size,
            credits: Semaphore::new(1),
            terminal: StdMutex::new(None),
            on_close_if: StdMutex::new(None),
        });

        let (input_tx, input_rx) = mpsc::channel(input_queue_size.max(1));
        let recv_task = tokio::spawn(recv_loop(shared.clone(), input_tx));

        Arc::new(Self {
            shared,
            input_rx: Mutex::new(input_rx),
            recv_state: Mutex::new(RecvState {
                reserved: 1,
                armed: false,
            }),
            recv_task: StdMutex::new(Some(recv_task)),
        })
    }

    /// Install a predicate examined on every delivered event; when it
    /// returns true the channel closes itself right after that delivery.
    pub fn set_on_close_if(&self, predicate: impl Fn(&Event) -> bool + Send + Sync + 'static) {
        *self.shared.on_close_if.lock().expect("close predicate lock") = Some(Box::new(predicate));
    }

    /// Credits currently available for emitting.
    pub fn remote_open_slots(&self) -> usize {
        self.shared.credits.available_permits()
    }

    /// Inbox slots currently promised to the peer.
    pub async fn input_queue_reserved(&self) -> usize {
        self.recv_state.lock().await.reserved
    }

    /// Replenishment rule: once armed, grant the peer every free slot as
    /// soon as less than half the inbox is promised.
    async fn maybe_request_more(&self) -> Result<(), RpcError> {
        let grant = {
            let mut state = self.recv_state.lock().await;
            if !state.armed {
                state.armed = true;
                None
            } else if state.reserved < self.shared.input_queue_size / 2 {
                let open_slots = self.shared.input_queue_size - state.reserved;
                state.reserved += open_slots;
                Some(open_slots)
            } else {
                None
            }
        };

        if let Some(open_slots) = grant {
            debug!(open_slots, "granting receive credits");
            self.shared
                .channel
                .emit(MORE, Value::Array(vec![Value::from(open_slots as u64)]), None)
                .await?;
        }
        Ok(())
    }

    fn abort_recv_task(&self) {
        if let Ok(mut guard) = self.recv_task.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

/// Pulls from the wrapped channel: credit grants feed the semaphore, user
/// events feed the inbox. An inbox overflow means the peer wrote beyond the
/// credits we granted, which is fatal for the channel.
async fn recv_loop(shared: Arc<BufShared>, input_tx: mpsc::Sender<Event>) {
    loop {
        let event = match shared.channel.recv(None).await {
            Ok(event) => event,
            Err(RpcError::LostRemote(lost)) => {
                shared.shutdown(Terminal::Lost(lost));
                break;
            }
            Err(e) => {
                debug!(error = %e, "buffered recv loop ending");
                shared.shutdown(Terminal::Closed);
                break;
            }
        };

        if event.name() == MORE {
            match event.args_vec().first().and_then(Value::as_u64) {
                Some(n) => shared.credits.add_permits(n as usize),
                None => warn!(event = %event, "malformed credit grant ignored"),
            }
            continue;
        }

        let close_now = shared
            .on_close_if
            .lock()
            .expect("close predicate lock")
            .as_ref()
            .map(|predicate| predicate(&event))
            .unwrap_or(false);

        match input_tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                error!(event = %event, "buffered channel queue overflow");
                shared.shutdown(Terminal::Overflow);
                break;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }

        if close_now {
            shared.shutdown(Terminal::Closed);
            shared.channel.close().await;
            break;
        }
    }
}

#[async_trait]
impl ChannelBase for BufferedChannel {
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
        self.shared.channel.new_event(name, args, xheader)
    }

    /// Consumes one credit, then forwards. With no credits left the call
    /// waits up to `timeout` for the peer to grant more; a zero timeout
    /// fails immediately.
    async fn emit_event(&self, event: Event, timeout: Option<Duration>) -> Result<(), RpcError> {
        let permit = match timeout {
            Some(d) if d.is_zero() => match self.shared.credits.try_acquire() {
                Ok(permit) => permit,
                Err(TryAcquireError::NoPermits) => {
                    return Err(TimeoutExpired::new(Some(d)).into());
                }
                Err(TryAcquireError::Closed) => return Err(self.shared.terminal_error()),
            },
            _ => {
                let acquired = with_deadline(timeout, async {
                    self.shared
                        .credits
                        .acquire()
                        .await
                        .map_err(|_| self.shared.terminal_error())
                })
                .await?;
                acquired
            }
        };
        permit.forget();

        // The deadline only guards the credit wait; the send itself is
        // unbounded, like the layers below.
        match self.shared.channel.emit_event(event, None).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // The event never left; hand the credit back.
                self.shared.credits.add_permits(1);
                Err(e)
            }
        }
    }

    async fn recv(&self, timeout: Option<Duration>) -> Result<Event, RpcError> {
        self.maybe_request_more().await?;

        let event = with_deadline(timeout, async {
            let mut rx = self.input_rx.lock().await;
            match rx.recv().await {
                Some(event) => Ok(event),
                None => Err(self.shared.terminal_error()),
            }
        })
        .await?;

        self.recv_state.lock().await.reserved -= 1;
        Ok(event)
    }

    async fn close(&self) {
        self.abort_recv_task();
        self.shared.shutdown(Terminal::Closed);
        self.shared.channel.close().await;
    }
}

impl Drop for BufferedChannel {
    fn drop(&mut self) {
        self.abort_recv_task();
    }
}
