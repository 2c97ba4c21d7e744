//! Logical channels multiplexed over one events transport.
//!
//! The multiplexer runs a dispatcher task that pulls events off the
//! transport and routes them by their `response_to` header: events answering
//! a live channel land in that channel's one-slot mailbox, conversation
//! openers land in the broadcast queue for the server's acceptor, anything
//! else is dropped with a warning.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rmpv::Value;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::context::Context;
use crate::error::RpcError;
use crate::event::{Event, Header};
use crate::socket::with_deadline;
use crate::traits::ChannelBase;

struct MuxShared {
    events: Arc<dyn ChannelBase>,
    active: StdMutex<HashMap<String, mpsc::Sender<Event>>>,
    broadcast_tx: Option<mpsc::Sender<Event>>,
    /// Trips when the multiplexer (or its transport) dies, so pending
    /// channel receives fail instead of waiting forever.
    closed_tx: watch::Sender<bool>,
}

/// Demultiplexes concurrent conversations over a single transport.
pub struct ChannelMultiplexer {
    shared: Arc<MuxShared>,
    broadcast_rx: Option<Mutex<mpsc::Receiver<Event>>>,
    dispatcher: StdMutex<Option<JoinHandle<()>>>,
}

impl ChannelMultiplexer {
    /// Wrap a transport. With `ignore_broadcast` (client side) events that
    /// open no known channel are dropped instead of queued for an acceptor,
    /// and the dispatcher only starts once the first channel is created.
    pub fn new(events: Arc<dyn ChannelBase>, ignore_broadcast: bool) -> Arc<Self> {
        let listening = events.recv_is_supported() && !ignore_broadcast;
        let (broadcast_tx, broadcast_rx) = if listening {
            let (tx, rx) = mpsc::channel(1);
            (Some(tx), Some(Mutex::new(rx)))
        } else {
            (None, None)
        };

        let (closed_tx, _closed_rx) = watch::channel(false);
        let mux = Arc::new(Self {
            shared: Arc::new(MuxShared {
                events,
                active: StdMutex::new(HashMap::new()),
                broadcast_tx,
                closed_tx,
            }),
            broadcast_rx,
            dispatcher: StdMutex::new(None),
        });

        if listening {
            mux.ensure_dispatcher();
        }
        mux
    }

    fn ensure_dispatcher(&self) {
        if !self.shared.events.recv_is_supported() {
            return;
        }
        let mut guard = self.dispatcher.lock().expect("dispatcher lock");
        if guard.is_none() {
            let shared = self.shared.clone();
            *guard = Some(tokio::spawn(dispatch_loop(shared)));
        }
    }

    /// Open a new channel.
    ///
    /// With `from_event` (server side) the channel adopts the event's
    /// `message_id` as its id, captures the peer identity, and the event is
    /// placed in the channel's mailbox so the handler sees it first.
    pub fn channel(&self, from_event: Option<Event>) -> Arc<Channel> {
        self.ensure_dispatcher();
        Channel::new(self.shared.clone(), from_event)
    }

    /// Number of live channels registered on this multiplexer.
    pub fn active_channel_count(&self) -> usize {
        self.shared.active.lock().expect("active channels lock").len()
    }

    /// True when a channel with the given id is registered.
    pub fn has_channel(&self, channel_id: &str) -> bool {
        self.shared
            .active
            .lock()
            .expect("active channels lock")
            .contains_key(channel_id)
    }
}

async fn dispatch_loop(shared: Arc<MuxShared>) {
    loop {
        let event = match shared.events.recv(None).await {
            Ok(event) => event,
            Err(RpcError::Closed) => break,
            Err(e) => {
                warn!(error = %e, "multiplexer ignoring error on recv");
                continue;
            }
        };

        let target = match event.response_to() {
            Some(channel_id) => shared
                .active
                .lock()
                .expect("active channels lock")
                .get(channel_id)
                .cloned(),
            None => shared.broadcast_tx.clone(),
        };

        match target {
            Some(tx) => {
                // The mailbox has one slot; a slow owner briefly parks the
                // dispatcher, a closed owner drops the event.
                let _ = tx.send(event).await;
            }
            None => {
                warn!(name = %event.name(), "unable to route event");
            }
        }
    }
    debug!("multiplexer dispatcher ending");
    let _ = shared.closed_tx.send(true);
}

#[async_trait]
impl ChannelBase for ChannelMultiplexer {
    fn context(&self) -> Arc<Context> {
        self.shared.events.context()
    }

    fn recv_is_supported(&self) -> bool {
        self.shared.events.recv_is_supported()
    }

    fn emit_is_supported(&self) -> bool {
        self.shared.events.emit_is_supported()
    }

    fn new_event(&self, name: &str, args: Value, xheader: Option<Header>) -> Event {
        self.shared.events.new_event(name, args, xheader)
    }

    async fn emit_event(&self, event: Event, timeout: Option<Duration>) -> Result<(), RpcError> {
        self.shared.events.emit_event(event, timeout).await
    }

    /// Listening mode pulls the next conversation-opening event; otherwise
    /// this is a pass-through read of the transport.
    async fn recv(&self, timeout: Option<Duration>) -> Result<Event, RpcError> {
        match &self.broadcast_rx {
            Some(rx) => {
                with_deadline(timeout, async {
                    let mut rx = rx.lock().await;
                    rx.recv().await.ok_or(RpcError::Closed)
                })
                .await
            }
            None => self.shared.events.recv(timeout).await,
        }
    }

    async fn close(&self) {
        let handle = self.dispatcher.lock().expect("dispatcher lock").take();
        if let Some(handle) = handle {
            handle.abort();
        }
        let _ = self.shared.closed_tx.send(true);
    }
}

impl Drop for ChannelMultiplexer {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.dispatcher.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

/// One logical conversation: a request and everything answering it.
pub struct Channel {
    shared: Arc<MuxShared>,
    channel_id: StdMutex<Option<String>>,
    identity: Option<Vec<Bytes>>,
    mailbox_tx: mpsc::Sender<Event>,
    mailbox_rx: Mutex<mpsc::Receiver<Event>>,
}

impl Channel {
    fn new(shared: Arc<MuxShared>, from_event: Option<Event>) -> Arc<Self> {
        let (mailbox_tx, mailbox_rx) = mpsc::channel(1);
        let mut channel_id = None;
        let mut identity = None;

        if let Some(event) = from_event {
            let id = event
                .message_id()
                .unwrap_or_default()
                .to_owned();
            identity = event.identity().map(|frames| frames.to_vec());
            shared
                .active
                .lock()
                .expect("active channels lock")
                .insert(id.clone(), mailbox_tx.clone());
            debug!(channel_id = %id, "<-- new channel");
            let _ = mailbox_tx.try_send(event);
            channel_id = Some(id);
        }

        Arc::new(Self {
            shared,
            channel_id: StdMutex::new(channel_id),
            identity,
            mailbox_tx,
            mailbox_rx: Mutex::new(mailbox_rx),
        })
    }

    /// The conversation id, once the first event has been created or
    /// adopted.
    pub fn id(&self) -> Option<String> {
        self.channel_id.lock().expect("channel id lock").clone()
    }

    fn close_sync(&self) {
        let mut guard = self.channel_id.lock().expect("channel id lock");
        if let Some(id) = guard.take() {
            self.shared
                .active
                .lock()
                .expect("active channels lock")
                .remove(&id);
            debug!(channel_id = %id, "-x- closed channel");
        }
    }
}

#[async_trait]
impl ChannelBase for Channel {
    fn context(&self) -> Arc<Context> {
        self.shared.events.context()
    }

    fn recv_is_supported(&self) -> bool {
        self.shared.events.recv_is_supported()
    }

    fn emit_is_supported(&self) -> bool {
        self.shared.events.emit_is_supported()
    }

    /// The first event created on a fresh channel donates its `message_id`
    /// as the channel id; every later event answers it via `response_to`.
    fn new_event(&self, name: &str, args: Value, xheader: Option<Header>) -> Event {
        let mut event = self.shared.events.new_event(name, args, xheader);
        let mut guard = self.channel_id.lock().expect("channel id lock");
        match guard.as_ref() {
            None => {
                let id = event.message_id().unwrap_or_default().to_owned();
                self.shared
                    .active
                    .lock()
                    .expect("active channels lock")
                    .insert(id.clone(), self.mailbox_tx.clone());
                debug!(channel_id = %id, "--> new channel");
                *guard = Some(id);
            }
            Some(id) => {
                event.set_response_to(id.clone());
            }
        }
        event.set_identity(self.identity.clone());
        event
    }

    async fn emit_event(&self, event: Event, timeout: Option<Duration>) -> Result<(), RpcError> {
        self.shared.events.emit_event(event, timeout).await
    }

    async fn recv(&self, timeout: Option<Duration>) -> Result<Event, RpcError> {
        let mut closed_rx = self.shared.closed_tx.subscribe();
        if *closed_rx.borrow_and_update() {
            return Err(RpcError::Closed);
        }

        with_deadline(timeout, async {
            let mut rx = self.mailbox_rx.lock().await;
            tokio::select! {
                biased;
                event = rx.recv() => event.ok_or(RpcError::Closed),
                _ = closed_rx.changed() => Err(RpcError::Closed),
            }
        })
        .await
    }

    async fn close(&self) {
        self.close_sync();
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close_sync();
    }
}
