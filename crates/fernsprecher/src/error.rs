use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// A local deadline expired while waiting on a receive, a send queue, or a
/// flow-control credit.
#[derive(Debug, Clone)]
pub struct TimeoutExpired {
    /// The deadline that was exceeded. `None` when the waiting primitive had
    /// no deadline of its own (e.g. a closed rendezvous).
    pub timeout: Option<Duration>,

    /// What the caller was doing, e.g. `calling remote method add`.
    pub when: Option<String>,
}

impl TimeoutExpired {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            when: None,
        }
    }

    pub fn when(timeout: Option<Duration>, when: impl Into<String>) -> Self {
        Self {
            timeout,
            when: Some(when.into()),
        }
    }
}

impl fmt::Display for TimeoutExpired {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.timeout {
            Some(d) => write!(f, "timeout after {:?}", d)?,
            None => write!(f, "timeout")?,
        }
        if let Some(when) = &self.when {
            write!(f, ", when {when}")?;
        }
        Ok(())
    }
}

impl std::error::Error for TimeoutExpired {}

/// The peer missed two heartbeat intervals; the conversation is dead.
#[derive(Debug, Clone)]
pub struct LostRemote {
    /// Heartbeat interval the channel was configured with. The peer is
    /// declared lost after `2 × heartbeat_freq` of silence.
    pub heartbeat_freq: Duration,
}

impl LostRemote {
    pub fn new(heartbeat_freq: Duration) -> Self {
        Self { heartbeat_freq }
    }
}

impl fmt::Display for LostRemote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lost remote after {:?} heartbeat",
            self.heartbeat_freq * 2
        )
    }
}

impl std::error::Error for LostRemote {}

/// A server-side failure surfaced on the client.
///
/// The server's exception type never crosses the wire as a type: `name` is a
/// string tag, `msg` is the human message, and `traceback` is an opaque text
/// blob for display only.
#[derive(Debug, Clone)]
pub struct RemoteError {
    pub name: String,
    pub msg: String,
    pub traceback: Option<String>,
}

impl RemoteError {
    pub fn new(name: impl Into<String>, msg: impl Into<String>, traceback: Option<String>) -> Self {
        Self {
            name: name.into(),
            msg: msg.into(),
            traceback,
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.traceback {
            Some(tb) => write!(f, "{tb}"),
            None => write!(f, "{}: {}", self.name, self.msg),
        }
    }
}

impl std::error::Error for RemoteError {}

/// A failure produced by a procedure handler, destined to travel back to the
/// caller as an `ERR` reply.
#[derive(Debug, Clone)]
pub struct HandlerError {
    /// Error type tag, e.g. `NameError` or `RuntimeError`.
    pub name: String,

    /// Human-readable message.
    pub message: String,

    /// Optional long-form detail shipped as the traceback field of the reply.
    pub traceback: Option<String>,
}

impl HandlerError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            traceback: None,
        }
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for HandlerError {}

/// Errors that can occur in the fernsprecher RPC stack.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error(transparent)]
    Timeout(#[from] TimeoutExpired),

    #[error(transparent)]
    LostRemote(#[from] LostRemote),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("channel closed")]
    Closed,

    #[error("zeromq error: {0}")]
    Zmq(#[from] zeromq::ZmqError),

    #[error("encode error: {0}")]
    Encode(#[from] rmpv::encode::Error),

    #[error("decode error: {0}")]
    Decode(#[from] rmpv::decode::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),
}

impl RpcError {
    /// True when the error marks the end of the conversation: every further
    /// operation on the same channel stack will fail the same way.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RpcError::LostRemote(_) | RpcError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_display() {
        let e = TimeoutExpired::new(Some(Duration::from_secs(2)));
        assert_eq!(e.to_string(), "timeout after 2s");

        let e = TimeoutExpired::when(Some(Duration::from_secs(2)), "calling remote method add");
        assert_eq!(e.to_string(), "timeout after 2s, when calling remote method add");
    }

    #[test]
    fn lost_remote_reports_doubled_interval() {
        let e = LostRemote::new(Duration::from_secs(5));
        assert_eq!(e.to_string(), "lost remote after 10s heartbeat");
    }

    #[test]
    fn remote_error_prefers_traceback() {
        let plain = RemoteError::new("RuntimeError", "oops!", None);
        assert_eq!(plain.to_string(), "RuntimeError: oops!");

        let full = RemoteError::new("RuntimeError", "oops!", Some("trace text".into()));
        assert_eq!(full.to_string(), "trace text");
    }
}
