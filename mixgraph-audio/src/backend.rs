//! Transport trait: the async seam between the provider and a server.
//!
//! `Transport` carries finished bundles to wherever they go (a UDP socket for
//! a real server, a recorder for tests) and answers node-tree queries. The
//! provider never builds `rosc` packets itself; it speaks `BackendMessage`.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::callbacks::CallbackRegistry;
use crate::query_tree::QueryTreeGroup;

/// Result type for backend operations.
pub type BackendResult<T = ()> = Result<T, BackendError>;

/// Boxed future returned by `Transport` methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Error from a backend operation.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendError(pub String);

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for BackendError {}

impl From<std::io::Error> for BackendError {
    fn from(e: std::io::Error) -> Self {
        BackendError(e.to_string())
    }
}

impl From<String> for BackendError {
    fn from(s: String) -> Self {
        BackendError(s)
    }
}

impl From<&str> for BackendError {
    fn from(s: &str) -> Self {
        BackendError(s.to_string())
    }
}

/// A loosely-typed argument for backend messages, so domain code doesn't depend on `rosc`.
#[derive(Debug, Clone, PartialEq)]
pub enum RawArg {
    Int(i32),
    Float(f32),
    Str(String),
    Blob(Vec<u8>),
}

impl RawArg {
    pub fn as_int(&self) -> Option<i32> {
        match self {
            RawArg::Int(v) => Some(*v),
            RawArg::Float(v) => Some(*v as i32),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            RawArg::Int(v) => Some(*v as f32),
            RawArg::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            RawArg::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for RawArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawArg::Int(v) => write!(f, "{}", v),
            RawArg::Float(v) => write!(f, "{:?}", v),
            RawArg::Str(s) => write!(f, "{}", s),
            RawArg::Blob(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<i32> for RawArg {
    fn from(v: i32) -> Self {
        RawArg::Int(v)
    }
}

impl From<f32> for RawArg {
    fn from(v: f32) -> Self {
        RawArg::Float(v)
    }
}

impl From<&str> for RawArg {
    fn from(v: &str) -> Self {
        RawArg::Str(v.to_string())
    }
}

impl From<String> for RawArg {
    fn from(v: String) -> Self {
        RawArg::Str(v)
    }
}

/// Protocol-agnostic message for bundled operations.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendMessage {
    pub addr: String,
    pub args: Vec<RawArg>,
}

impl BackendMessage {
    pub fn new(addr: &str, args: Vec<RawArg>) -> Self {
        Self { addr: addr.to_string(), args }
    }

    /// Space-separated rendering, e.g. `/g_head 1001 1016`.
    pub fn render(&self) -> String {
        let mut out = self.addr.clone();
        for arg in &self.args {
            out.push(' ');
            out.push_str(&arg.to_string());
        }
        out
    }
}

impl fmt::Display for BackendMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// One wire transaction: an optional offset in seconds (None = immediately)
/// and the messages in issue order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Bundle {
    pub timetag: Option<f64>,
    pub messages: Vec<BackendMessage>,
}

impl Bundle {
    pub fn rendered(&self) -> Vec<String> {
        self.messages.iter().map(BackendMessage::render).collect()
    }

    pub fn addresses(&self) -> Vec<&str> {
        self.messages.iter().map(|m| m.addr.as_str()).collect()
    }
}

/// Where flushed bundles go.
///
/// Each method represents one exchange with the server. Implementations
/// translate bundles into OSC packets or record them for testing.
pub trait Transport: Send + Sync {
    /// Deliver one bundle. Order of calls is the order of delivery.
    fn send_bundle(&self, bundle: Bundle) -> BoxFuture<'_, BackendResult>;

    /// Fetch the full server node tree, rooted at node 0.
    fn query_tree(&self) -> BoxFuture<'_, BackendResult<QueryTreeGroup>>;

    /// Route unsolicited inbound messages (level meters) into `registry`.
    fn attach_callbacks(&self, _registry: Arc<CallbackRegistry>) {}
}

/// A no-op transport that silently succeeds. Useful when no server is connected.
pub struct NullTransport;

impl Transport for NullTransport {
    fn send_bundle(&self, _: Bundle) -> BoxFuture<'_, BackendResult> {
        Box::pin(async { Ok(()) })
    }

    fn query_tree(&self) -> BoxFuture<'_, BackendResult<QueryTreeGroup>> {
        Box::pin(async { Ok(QueryTreeGroup::new(0)) })
    }
}
