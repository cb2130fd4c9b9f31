//! Shared fixtures for the integration tests.

use std::sync::Arc;

use async_std::task::block_on;
use mixgraph_audio::{Provider, ServerOptions, SharedTestTransport, TestTransport};
use mixgraph_core::Application;
use mixgraph_types::NodeId;

/// A booted two-channel application with one context, recording every bundle.
pub fn booted() -> (Application, NodeId, Arc<TestTransport>) {
    let transport = Arc::new(TestTransport::new());
    let mut app = Application::new(2);
    let context = block_on(app.add_context(Some("main"))).unwrap();
    let provider = Provider::new(Arc::new(SharedTestTransport(transport.clone())), ServerOptions::default());
    block_on(app.boot_with(provider)).unwrap();
    transport.clear();
    (app, context, transport)
}

pub fn addresses(transport: &TestTransport) -> Vec<String> {
    transport
        .bundles()
        .iter()
        .flat_map(|b| b.messages.iter().map(|m| m.addr.clone()))
        .collect()
}
