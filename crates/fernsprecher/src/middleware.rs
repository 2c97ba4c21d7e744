//! Middleware hook points.
//!
//! A middleware is any object implementing [`Middleware`]; every hook has a
//! no-op default, so implementations override only what they care about.
//! Registration appends the middleware to the context's chain; chained hooks
//! (`resolve_endpoint`, `client_patterns_list`) feed each output into the
//! next middleware, side-effect hooks run in registration order.

use std::sync::Arc;

use crate::error::{HandlerError, RemoteError, RpcError};
use crate::event::{Event, Header};
use crate::patterns::ReplyPattern;

pub trait Middleware: Send + Sync {
    /// Rewrite an endpoint before bind/connect (e.g. a service name into an
    /// ipc path). Chained left-to-right.
    fn resolve_endpoint(&self, endpoint: String) -> String {
        endpoint
    }

    /// Inspect the header of a freshly received request, before dispatch.
    /// Typically stores propagated task context (trace ids) somewhere
    /// task-local.
    fn load_task_context(&self, _header: &Header) {}

    /// Produce header entries to attach to an outgoing event. Results of all
    /// middlewares are merged.
    fn get_task_context(&self) -> Header {
        Header::new()
    }

    /// A server method is about to run.
    fn server_before_exec(&self, _request: &Event) {}

    /// A server method completed normally. `reply` is `None` for one-way
    /// patterns, and for streamed replies this fires once the stream is
    /// done.
    fn server_after_exec(&self, _request: &Event, _reply: Option<&Event>) {}

    /// A server method failed. `reply` is `None` for one-way patterns.
    fn server_inspect_exception(
        &self,
        _request: &Event,
        _reply: Option<&Event>,
        _task_context: &Header,
        _error: &HandlerError,
    ) {
    }

    /// Turn an `ERR` reply into a richer error. The last non-`None` result
    /// across the chain wins; `None` everywhere falls back to the stock
    /// [`RemoteError`] construction.
    fn client_handle_remote_error(&self, _event: &Event) -> Option<RemoteError> {
        None
    }

    /// The client is about to send a request.
    fn client_before_request(&self, _request: &Event) {}

    /// An answer, error, or timeout arrived for a request. On timeout,
    /// `reply` is `None` and `error` is the timeout.
    fn client_after_request(
        &self,
        _request: &Event,
        _reply: Option<&Event>,
        _error: Option<&RpcError>,
    ) {
    }

    /// Rewrite the list of reply patterns the client selects from. Chained;
    /// lets middleware introduce custom reply shapes.
    fn client_patterns_list(
        &self,
        patterns: Vec<Arc<dyn ReplyPattern>>,
    ) -> Vec<Arc<dyn ReplyPattern>> {
        patterns
    }
}
