//! fernsprecher: an RPC framework layered on ZeroMQ.
//!
//! Named procedures exposed by a service become remotely callable over
//! ZeroMQ transports (tcp, ipc, inproc), with request/reply, one-way push,
//! publish/subscribe and server-streaming calls. Under the facades sits a
//! layered channel stack: event framing, a multiplexer that routes
//! concurrent in-flight calls over one socket, peer-to-peer heartbeats with
//! liveness detection, and credit-based end-to-end flow control. A
//! middleware chain hooks into endpoint resolution, request/response
//! lifecycles, and error translation.
//!
//! ```ignore
//! let mut methods = Methods::new("calculator");
//! methods.rep("add", |args| async move {
//!     let a = args[0].as_i64().unwrap_or_default();
//!     let b = args[1].as_i64().unwrap_or_default();
//!     Ok(Value::from(a + b))
//! });
//!
//! let server = Server::new(methods);
//! server.bind("tcp://127.0.0.1:4242").await?;
//! tokio::spawn(async move { server.run().await });
//!
//! let client = Client::new();
//! client.connect("tcp://127.0.0.1:4242").await?;
//! let reply = client.call("add", vec![1.into(), 4.into()]).await?;
//! assert_eq!(reply.into_value()?, Value::from(5));
//! ```

pub mod buffered;
pub mod channel;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod events;
pub mod heartbeat;
pub mod middleware;
pub mod oneway;
pub mod patterns;
pub mod serializer;
pub mod server;
pub mod socket;
pub mod traits;
pub mod wrapped;

pub use buffered::{BufferedChannel, DEFAULT_INBOX_SIZE};
pub use channel::{Channel, ChannelMultiplexer};
pub use client::{CallOptions, Client, PendingReply};
pub use config::{ClientConfig, ServerConfig};
pub use context::{fork_task_context, Context};
pub use error::{HandlerError, LostRemote, RemoteError, RpcError, TimeoutExpired};
pub use event::{Event, Header, PROTOCOL_VERSION};
pub use events::Events;
pub use heartbeat::HeartbeatChannel;
pub use middleware::Middleware;
pub use oneway::{Publisher, Puller, Pusher, Subscriber};
pub use patterns::{patterns_list, Reply, ReplyPattern, ReplyStream, ReqRep, ReqStream};
pub use serializer::{from_wire, to_wire, MsgPack, Serializer};
pub use server::{MethodDef, Methods, Server, ValueStream};
pub use socket::SocketKind;
pub use traits::ChannelBase;
pub use wrapped::WrappedEvents;

/// The dynamic value type carried by event arguments and headers.
pub use rmpv::Value;
