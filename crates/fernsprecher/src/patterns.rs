//! Call patterns: how a server produces the replies for a method and how a
//! client consumes them.
//!
//! `ReqRep` answers with a single `OK`/`ERR` event; `ReqStream` emits a
//! `STREAM` chunk per yielded item and terminates with `STREAM_DONE`. The
//! client selects the pattern from the first reply event's name, through the
//! `client_patterns_list` middleware hook so custom reply shapes can be
//! plugged in.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use rmpv::Value;

use crate::buffered::BufferedChannel;
use crate::context::Context;
use crate::error::{HandlerError, RemoteError, RpcError};
use crate::event::{Event, REPLY_ERR, REPLY_OK, STREAM, STREAM_DONE};
use crate::server::{MethodDef, MethodHandler};
use crate::traits::ChannelBase;

/// What a call produced: a single value or a lazy stream of chunks.
pub enum Reply {
    Value(Value),
    Stream(ReplyStream),
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reply::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Reply::Stream(_) => f.debug_tuple("Stream").field(&"..").finish(),
        }
    }
}

impl Reply {
    /// Unwrap a single-valued reply.
    pub fn into_value(self) -> Result<Value, RpcError> {
        match self {
            Reply::Value(value) => Ok(value),
            Reply::Stream(_) => Err(RpcError::Protocol(
                "expected a single reply, got a stream".into(),
            )),
        }
    }

    /// Unwrap a streamed reply.
    pub fn into_stream(self) -> Result<ReplyStream, RpcError> {
        match self {
            Reply::Stream(stream) => Ok(stream),
            Reply::Value(_) => Err(RpcError::Protocol(
                "expected a streamed reply, got a single value".into(),
            )),
        }
    }
}

/// Lazy consumer of a streamed reply. Each `recv` pulls the next chunk; the
/// stream ends at the terminal frame, after which the channel is closed.
pub struct ReplyStream {
    context: Arc<Context>,
    channel: Arc<BufferedChannel>,
    request: Event,
    pending: Option<Event>,
    done: bool,
}

impl ReplyStream {
    /// Next chunk, or `None` once the stream completed. A server-side error
    /// mid-stream surfaces as [`RpcError::Remote`].
    pub async fn recv(&mut self) -> Result<Option<Value>, RpcError> {
        self.recv_timeout(None).await
    }

    pub async fn recv_timeout(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Option<Value>, RpcError> {
        if self.done {
            return Ok(None);
        }

        let event = match self.pending.take() {
            Some(event) => event,
            None => self.channel.recv(timeout).await?,
        };

        match event.name() {
            STREAM => Ok(Some(event.args().clone())),
            REPLY_ERR => {
                let error = remote_error_from_event(&self.context, &event);
                self.context.hook_client_after_request(
                    &self.request,
                    Some(&event),
                    Some(&RpcError::Remote(error.clone())),
                );
                self.done = true;
                self.channel.close().await;
                Err(error.into())
            }
            _ => {
                // STREAM_DONE, or any unknown terminal name.
                self.context
                    .hook_client_after_request(&self.request, Some(&event), None);
                self.done = true;
                self.channel.close().await;
                Ok(None)
            }
        }
    }

    /// Drain the remaining chunks into a vector.
    pub async fn collect(mut self) -> Result<Vec<Value>, RpcError> {
        let mut items = Vec::new();
        while let Some(item) = self.recv().await? {
            items.push(item);
        }
        Ok(items)
    }
}

/// Build the error a client raises for an `ERR` reply: middleware may
/// override, otherwise the payload shape decides (3-tuple for v ≥ 2 peers,
/// bare repr string for v1).
pub(crate) fn remote_error_from_event(context: &Arc<Context>, event: &Event) -> RemoteError {
    if let Some(error) = context.hook_client_handle_remote_error(event) {
        return error;
    }

    let args = event.args_vec();
    if event.version().unwrap_or(1) >= 2 {
        let field = |i: usize| {
            args.get(i)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned()
        };
        let traceback = args.get(2).and_then(Value::as_str).map(str::to_owned);
        RemoteError::new(field(0), field(1), traceback)
    } else {
        let msg = args
            .first()
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        RemoteError::new("RemoteError", msg, None)
    }
}

/// Client-side view of a reply shape.
#[async_trait]
pub trait ReplyPattern: Send + Sync {
    /// Does the first reply event belong to this pattern?
    fn accept_answer(&self, event: &Event) -> bool;

    /// Consume the reply, driving hooks and channel lifecycle.
    async fn process_answer(
        &self,
        context: Arc<Context>,
        channel: Arc<BufferedChannel>,
        request: Event,
        reply: Event,
    ) -> Result<Reply, RpcError>;
}

/// Single request, single reply.
pub struct ReqRep;

#[async_trait]
impl ReplyPattern for ReqRep {
    fn accept_answer(&self, _event: &Event) -> bool {
        true
    }

    async fn process_answer(
        &self,
        context: Arc<Context>,
        channel: Arc<BufferedChannel>,
        request: Event,
        reply: Event,
    ) -> Result<Reply, RpcError> {
        if reply.name() == REPLY_ERR {
            let error = remote_error_from_event(&context, &reply);
            context.hook_client_after_request(
                &request,
                Some(&reply),
                Some(&RpcError::Remote(error.clone())),
            );
            channel.close().await;
            return Err(error.into());
        }

        context.hook_client_after_request(&request, Some(&reply), None);
        channel.close().await;
        let result = reply.args_vec().into_iter().next().unwrap_or(Value::Nil);
        Ok(Reply::Value(result))
    }
}

/// Single request, streamed reply.
pub struct ReqStream;

#[async_trait]
impl ReplyPattern for ReqStream {
    fn accept_answer(&self, event: &Event) -> bool {
        matches!(event.name(), STREAM | STREAM_DONE)
    }

    async fn process_answer(
        &self,
        context: Arc<Context>,
        channel: Arc<BufferedChannel>,
        request: Event,
        reply: Event,
    ) -> Result<Reply, RpcError> {
        // Shut the receive side down promptly once the terminal frame lands.
        channel.set_on_close_if(|event| event.name() == STREAM_DONE);

        Ok(Reply::Stream(ReplyStream {
            context,
            channel,
            request,
            pending: Some(reply),
            done: false,
        }))
    }
}

/// Default pattern list, most specific first.
pub fn patterns_list() -> Vec<Arc<dyn ReplyPattern>> {
    vec![Arc::new(ReqStream), Arc::new(ReqRep)]
}

/// Outcome of running a method on the server side.
pub(crate) enum DispatchError {
    /// The handler failed; an `ERR` reply should travel back.
    Fault(HandlerError),
    /// The channel stack failed; nothing can travel back.
    Transport(RpcError),
}

impl From<HandlerError> for DispatchError {
    fn from(error: HandlerError) -> Self {
        DispatchError::Fault(error)
    }
}

impl From<RpcError> for DispatchError {
    fn from(error: RpcError) -> Self {
        DispatchError::Transport(error)
    }
}


/// Run a method and ship its replies according to its pattern.
pub(crate) async fn process_call(
    context: &Arc<Context>,
    channel: &Arc<BufferedChannel>,
    request: &Event,
    method: &MethodDef,
) -> Result<(), DispatchError> {
    match method.handler() {
        MethodHandler::Rep(handler) => {
            context.hook_server_before_exec(request);
            let result = handler(request.args_vec()).await?;
            let reply = channel.new_event(
                REPLY_OK,
                Value::Array(vec![result]),
                Some(context.hook_get_task_context()),
            );
            context.hook_server_after_exec(request, Some(&reply));
            channel.emit_event(reply, None).await?;
        }
        MethodHandler::Stream(handler) => {
            context.hook_server_before_exec(request);
            let mut stream = handler(request.args_vec()).await?;
            let xheader = context.hook_get_task_context();
            while let Some(item) = stream.next().await {
                let item = item?;
                channel.emit(STREAM, item, Some(xheader.clone())).await?;
            }
            let done = channel.new_event(STREAM_DONE, Value::Nil, Some(xheader));
            // Deliberately fired once per stream, when it completes, not per
            // chunk.
            context.hook_server_after_exec(request, Some(&done));
            channel.emit_event(done, None).await?;
        }
    }
    Ok(())
}
