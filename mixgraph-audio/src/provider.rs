//! The remote-connection handle.
//!
//! `Provider` owns the server's id namespaces (node ids, audio/control buses,
//! buffers) and turns semantic calls into wire messages. Calls made while a
//! transaction scope is open are buffered; when the outermost scope closes
//! they leave as one bundle, in issue order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mixgraph_types::{AddAction, BufferId, BusGroup, CalculationRate, CallbackId, RemoteNode};

use crate::allocator::BlockAllocator;
use crate::backend::{BackendError, BackendMessage, BackendResult, Bundle, RawArg, Transport};
use crate::callbacks::CallbackRegistry;
use crate::node_registry::NodeRegistry;
use crate::query_tree::QueryTreeGroup;

/// A synth control value.
#[derive(Debug, Clone, PartialEq)]
pub enum Control {
    Float(f32),
    Int(i32),
    /// Audio buses are passed by index; control buses are mapped (`c<index>`).
    Bus(BusGroup),
}

impl Control {
    fn to_arg(&self) -> RawArg {
        match self {
            Control::Float(v) => RawArg::Float(*v),
            Control::Int(v) => RawArg::Int(*v),
            Control::Bus(bus) => match bus.rate {
                CalculationRate::Audio => RawArg::Float(bus.index as f32),
                CalculationRate::Control => RawArg::Str(bus.map_symbol()),
            },
        }
    }
}

impl From<f32> for Control {
    fn from(v: f32) -> Self {
        Control::Float(v)
    }
}

impl From<BusGroup> for Control {
    fn from(bus: BusGroup) -> Self {
        Control::Bus(bus)
    }
}

/// Layout of the server's id namespaces.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerOptions {
    pub initial_node_id: i32,
    pub default_group: i32,
    pub output_bus_channels: u32,
    pub input_bus_channels: u32,
    pub audio_bus_channels: u32,
    pub control_bus_channels: u32,
    pub buffer_count: u32,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            initial_node_id: 1000,
            default_group: 1,
            output_bus_channels: 8,
            input_bus_channels: 8,
            audio_bus_channels: 1024,
            control_bus_channels: 16384,
            buffer_count: 1024,
        }
    }
}

impl ServerOptions {
    /// First audio bus after the hardware outputs and inputs.
    pub fn first_private_bus(&self) -> i32 {
        (self.output_bus_channels + self.input_bus_channels) as i32
    }
}

struct ProviderState {
    next_node_id: i32,
    audio_buses: BlockAllocator,
    control_buses: BlockAllocator,
    buffers: BlockAllocator,
    nodes: NodeRegistry,
    depth: usize,
    timetag: Option<f64>,
    pending: Vec<BackendMessage>,
}

impl ProviderState {
    fn push(&mut self, message: BackendMessage) {
        if self.depth == 0 {
            log::warn!(
                target: "mixgraph::provider",
                "{} issued outside a transaction; it will ride the next bundle",
                message.addr
            );
        }
        self.pending.push(message);
    }

    fn next_node(&mut self) -> i32 {
        let id = self.next_node_id;
        self.next_node_id += 1;
        id
    }
}

pub struct Provider {
    transport: Arc<dyn Transport>,
    callbacks: Arc<CallbackRegistry>,
    options: ServerOptions,
    state: Mutex<ProviderState>,
    /// Held while a bundle is in flight; a new outermost scope waits on it.
    flush_gate: async_std::sync::Mutex<()>,
}

impl Provider {
    pub fn new(transport: Arc<dyn Transport>, options: ServerOptions) -> Arc<Self> {
        let callbacks = Arc::new(CallbackRegistry::new());
        transport.attach_callbacks(callbacks.clone());
        let private = options.first_private_bus();
        let state = ProviderState {
            next_node_id: options.initial_node_id,
            audio_buses: BlockAllocator::new(
                private,
                options.audio_bus_channels.saturating_sub(private as u32),
            ),
            control_buses: BlockAllocator::new(0, options.control_bus_channels),
            buffers: BlockAllocator::new(0, options.buffer_count),
            nodes: NodeRegistry::new(),
            depth: 0,
            timetag: None,
            pending: Vec::new(),
        };
        Arc::new(Self {
            transport,
            callbacks,
            options,
            state: Mutex::new(state),
            flush_gate: async_std::sync::Mutex::new(()),
        })
    }

    fn state(&self) -> MutexGuard<'_, ProviderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub fn callbacks(&self) -> &Arc<CallbackRegistry> {
        &self.callbacks
    }

    /// The server's default group, under which top-level nodes are placed.
    pub fn default_group(&self) -> RemoteNode {
        RemoteNode::group(self.options.default_group)
    }

    // ─── Nodes ──────────────────────────────────────────────────────

    /// /g_new id action target
    pub fn add_group(&self, target: RemoteNode, action: AddAction, label: Option<&str>) -> RemoteNode {
        let mut state = self.state();
        let node = RemoteNode::group(state.next_node());
        state.nodes.register(node, label);
        state.push(BackendMessage::new(
            "/g_new",
            vec![RawArg::Int(node.id), RawArg::Int(action.code()), RawArg::Int(target.id)],
        ));
        node
    }

    /// /s_new synthdef id action target [name value ...]
    pub fn add_synth(
        &self,
        synthdef: &str,
        target: RemoteNode,
        action: AddAction,
        controls: &[(&str, Control)],
        label: Option<&str>,
    ) -> RemoteNode {
        let mut state = self.state();
        let node = RemoteNode::synth(state.next_node());
        state.nodes.register(node, label);
        let mut args = vec![
            RawArg::Str(synthdef.to_string()),
            RawArg::Int(node.id),
            RawArg::Int(action.code()),
            RawArg::Int(target.id),
        ];
        for (name, value) in controls {
            args.push(RawArg::Str(name.to_string()));
            args.push(value.to_arg());
        }
        state.push(BackendMessage::new("/s_new", args));
        node
    }

    /// Groups are freed outright; synths are released through their gate.
    pub fn free_node(&self, node: RemoteNode) {
        let mut state = self.state();
        state.nodes.unregister(node.id);
        let message = if node.is_group() {
            BackendMessage::new("/n_free", vec![RawArg::Int(node.id)])
        } else {
            BackendMessage::new(
                "/n_set",
                vec![RawArg::Int(node.id), RawArg::Str("gate".into()), RawArg::Int(0)],
            )
        };
        state.push(message);
    }

    /// Forget a node that dies with its enclosing group. No message is sent.
    pub fn dispose_node(&self, node: RemoteNode) {
        self.state().nodes.unregister(node.id);
    }

    /// /n_set id name value ...
    pub fn set_node(&self, node: RemoteNode, controls: &[(&str, Control)]) {
        let mut args = vec![RawArg::Int(node.id)];
        for (name, value) in controls {
            args.push(RawArg::Str(name.to_string()));
            args.push(value.to_arg());
        }
        self.state().push(BackendMessage::new("/n_set", args));
    }

    pub fn move_node(&self, node: RemoteNode, target: RemoteNode, action: AddAction) {
        let (addr, args) = match action {
            AddAction::AddToHead => ("/g_head", vec![RawArg::Int(target.id), RawArg::Int(node.id)]),
            AddAction::AddToTail => ("/g_tail", vec![RawArg::Int(target.id), RawArg::Int(node.id)]),
            AddAction::AddBefore => ("/n_before", vec![RawArg::Int(node.id), RawArg::Int(target.id)]),
            AddAction::AddAfter | AddAction::Replace => {
                ("/n_after", vec![RawArg::Int(node.id), RawArg::Int(target.id)])
            }
        };
        self.state().push(BackendMessage::new(addr, args));
    }

    pub fn is_live(&self, node: RemoteNode) -> bool {
        self.state().nodes.is_live(node.id)
    }

    pub fn live_node_count(&self) -> usize {
        self.state().nodes.live_count()
    }

    // ─── Buses & buffers ────────────────────────────────────────────

    pub fn add_bus_group(&self, rate: CalculationRate, channel_count: u32) -> BackendResult<BusGroup> {
        let mut state = self.state();
        let allocator = match rate {
            CalculationRate::Audio => &mut state.audio_buses,
            CalculationRate::Control => &mut state.control_buses,
        };
        let index = allocator
            .allocate(channel_count)
            .ok_or_else(|| BackendError(format!("out of {:?} buses ({} channels)", rate, channel_count)))?;
        Ok(BusGroup { rate, index, channel_count })
    }

    pub fn add_bus(&self) -> BackendResult<BusGroup> {
        self.add_bus_group(CalculationRate::Control, 1)
    }

    pub fn free_bus_group(&self, bus: BusGroup) {
        let mut state = self.state();
        match bus.rate {
            CalculationRate::Audio => state.audio_buses.free(bus.index),
            CalculationRate::Control => state.control_buses.free(bus.index),
        };
    }

    /// /c_set index value
    pub fn set_bus(&self, bus: BusGroup, value: f32) {
        self.state().push(BackendMessage::new(
            "/c_set",
            vec![RawArg::Int(bus.index), RawArg::Float(value)],
        ));
    }

    /// /b_allocRead bufnum path 0 0
    pub fn add_buffer(&self, path: &str) -> BackendResult<BufferId> {
        let mut state = self.state();
        let id = state
            .buffers
            .allocate(1)
            .ok_or_else(|| BackendError("out of buffers".into()))?;
        state.push(BackendMessage::new(
            "/b_allocRead",
            vec![RawArg::Int(id), RawArg::Str(path.to_string()), RawArg::Int(0), RawArg::Int(0)],
        ));
        Ok(BufferId(id))
    }

    /// /b_free bufnum
    pub fn free_buffer(&self, buffer: BufferId) {
        let mut state = self.state();
        state.buffers.free(buffer.0);
        state.push(BackendMessage::new("/b_free", vec![RawArg::Int(buffer.0)]));
    }

    // ─── Callbacks ──────────────────────────────────────────────────

    pub fn register_osc_callback<F>(&self, addr: &str, prefix: Vec<RawArg>, procedure: F) -> CallbackId
    where
        F: Fn(&BackendMessage) + Send + Sync + 'static,
    {
        self.callbacks.register(addr, prefix, procedure)
    }

    pub fn unregister_osc_callback(&self, id: CallbackId) {
        if !self.callbacks.unregister(id) {
            log::warn!(target: "mixgraph::provider", "callback {:?} was not registered", id);
        }
    }

    // ─── Transactions ───────────────────────────────────────────────

    /// Open a transaction scope. The outermost scope fixes the bundle's
    /// timetag (`at` seconds ahead; `None` = immediately) and first waits
    /// for any bundle still in flight.
    pub async fn begin(&self, at: Option<f64>) {
        let outermost = self.state().depth == 0;
        if outermost {
            let _in_flight = self.flush_gate.lock().await;
        }
        let mut state = self.state();
        if state.depth == 0 {
            state.timetag = at;
        }
        state.depth += 1;
    }

    /// Close a transaction scope, flushing when it was the outermost one.
    /// Nothing is sent if nothing was issued.
    pub async fn end(&self) -> BackendResult {
        let _gate = self.flush_gate.lock().await;
        let bundle = {
            let mut state = self.state();
            if state.depth == 0 {
                return Err(BackendError("transaction end without begin".into()));
            }
            state.depth -= 1;
            if state.depth > 0 || state.pending.is_empty() {
                return Ok(());
            }
            Bundle {
                timetag: state.timetag.take(),
                messages: std::mem::take(&mut state.pending),
            }
        };
        log::debug!(
            target: "mixgraph::provider",
            "flushing bundle of {} message(s)",
            bundle.messages.len()
        );
        self.transport.send_bundle(bundle).await
    }

    pub fn in_transaction(&self) -> bool {
        self.state().depth > 0
    }

    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    /// Fetch the server's node tree, annotated with the labels nodes were created under.
    pub async fn query_tree(&self) -> BackendResult<QueryTreeGroup> {
        let mut tree = self.transport.query_tree().await?;
        let labels: HashMap<i32, String> = self.state().nodes.labels().clone();
        tree.annotate(&labels);
        Ok(tree)
    }

    /// Drop every live-node record after the connection went away.
    pub fn invalidate(&self) {
        let mut state = self.state();
        state.nodes.invalidate_all();
        state.pending.clear();
    }
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider").field("options", &self.options).finish_non_exhaustive()
    }
}
