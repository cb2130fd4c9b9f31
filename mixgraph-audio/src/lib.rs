//! # mixgraph-audio
//!
//! The remote side of the mix graph: a `Provider` that hands out server node
//! ids, buses and buffers, buffers every command issued inside a transaction
//! scope, and flushes each outermost scope as one timestamped bundle through a
//! `Transport`.

pub mod allocator;
pub mod backend;
pub mod callbacks;
pub mod node_registry;
pub mod osc_transport;
pub mod provider;
pub mod query_tree;
pub mod synthdefs;
pub mod test_transport;

pub use backend::{BackendError, BackendMessage, BackendResult, BoxFuture, Bundle, NullTransport, RawArg, Transport};
pub use callbacks::CallbackRegistry;
pub use provider::{Control, Provider, ServerOptions};
pub use query_tree::{QueryTreeGroup, QueryTreeNode, QueryTreeSynth};
pub use synthdefs::PatchFlags;
pub use test_transport::{SharedTestTransport, TestTransport};
