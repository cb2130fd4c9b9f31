//! The root aggregate: arena, registry, provider and the moment scope that
//! turns a batch of edits into one bundle per provider.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use mixgraph_audio::{Provider, QueryTreeNode, ServerOptions, Transport};
use mixgraph_types::{ApplicationId, NodeId, MAX_CHANNEL_COUNT, MIN_CHANNEL_COUNT};

use crate::error::{MixError, MixResult};
use crate::node::{Changes, Node, NodeKind, PatchKind, TrackRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Offline,
    Realtime,
}

/// Open transaction scopes, one per distinct provider. Close with
/// [`Application::unlock`].
#[must_use]
pub struct Moment {
    providers: Vec<Arc<Provider>>,
    at: Option<f64>,
}

impl Moment {
    /// Seconds ahead the bundles are stamped with, if any.
    pub fn at(&self) -> Option<f64> {
        self.at
    }
}

pub struct Application {
    pub(crate) id: ApplicationId,
    pub(crate) nodes: Vec<Node>,
    pub(crate) registry: HashMap<Uuid, NodeId>,
    pub(crate) root: NodeId,
    pub(crate) status: Status,
    pub(crate) channel_count: u32,
    pub(crate) provider: Option<Arc<Provider>>,
    /// Nodes reconciled since the last `settle`.
    pub(crate) touched: Vec<NodeId>,
}

impl Application {
    /// An offline application with an empty root. `channel_count` is the
    /// fallback for every node that does not set its own.
    pub fn new(channel_count: u32) -> Self {
        let id = ApplicationId::fresh();
        let channel_count = channel_count.clamp(MIN_CHANNEL_COUNT, MAX_CHANNEL_COUNT);
        let mut root = Node::new(NodeKind::Root);
        root.application = Some(id);
        root.cached.application = Some(id);
        root.cached.channel_count = channel_count;
        Application {
            id,
            nodes: vec![root],
            registry: HashMap::new(),
            root: NodeId::new(0),
            status: Status::Offline,
            channel_count,
            provider: None,
            touched: Vec::new(),
        }
    }

    pub fn id(&self) -> ApplicationId {
        self.id
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn is_booted(&self) -> bool {
        self.status == Status::Realtime
    }

    pub fn provider(&self) -> Option<&Arc<Provider>> {
        self.provider.as_ref()
    }

    pub fn channel_count(&self) -> u32 {
        self.channel_count
    }

    // ─── Moments ────────────────────────────────────────────────────

    /// Open one transaction scope on every distinct provider among `nodes`,
    /// or on the application's provider when none of them has one.
    pub async fn lock(&self, nodes: &[NodeId], at: Option<f64>) -> Moment {
        let mut providers: Vec<Arc<Provider>> = Vec::new();
        for provider in nodes.iter().filter_map(|id| self.get(*id).and_then(|n| n.provider.clone())) {
            if !providers.iter().any(|p| Arc::ptr_eq(p, &provider)) {
                providers.push(provider);
            }
        }
        if providers.is_empty() {
            providers.extend(self.provider.clone());
        }
        for provider in &providers {
            provider.begin(at).await;
        }
        Moment { providers, at }
    }

    /// Close every scope of `moment`, flushing the outermost ones. All
    /// providers are closed; the first failure is returned.
    pub async fn unlock(&self, moment: Moment) -> MixResult {
        let mut first = None;
        for provider in moment.providers {
            if let Err(e) = provider.end().await {
                log::warn!(target: "mixgraph::provider", "bundle flush failed: {}", e);
                first.get_or_insert(e);
            }
        }
        match first {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Run `edit` inside a moment over `nodes`. An error from `edit` wins
    /// over a flush error.
    pub async fn transact<T, F>(&mut self, nodes: &[NodeId], at: Option<f64>, edit: F) -> MixResult<T>
    where
        F: FnOnce(&mut Self) -> MixResult<T>,
    {
        let moment = self.lock(nodes, at).await;
        let result = edit(self);
        let flushed = self.unlock(moment).await;
        let value = result?;
        flushed?;
        Ok(value)
    }

    // ─── Lifecycle ──────────────────────────────────────────────────

    pub async fn boot(&mut self, transport: Arc<dyn Transport>, options: ServerOptions) -> MixResult {
        if self.is_booted() {
            return Err(MixError::AlreadyBooted);
        }
        self.boot_with(Provider::new(transport, options)).await
    }

    /// Allocate the whole tree against `provider`.
    pub async fn boot_with(&mut self, provider: Arc<Provider>) -> MixResult {
        if self.is_booted() {
            return Err(MixError::AlreadyBooted);
        }
        log::debug!(target: "mixgraph::reconcile", "booting application {}", self.id);
        self.provider = Some(provider.clone());
        self.status = Status::Realtime;
        let root = self.root;
        self.transact(&[root], None, |app| {
            app.set(root, Changes::provider(Some(provider)), None, false)?;
            app.settle()
        })
        .await
    }

    /// Free every remote resource and go offline. The local tree is kept.
    pub async fn quit(&mut self) -> MixResult {
        if !self.is_booted() {
            return Err(MixError::NotBooted);
        }
        log::debug!(target: "mixgraph::reconcile", "quitting application {}", self.id);
        let root = self.root;
        let result = self
            .transact(&[root], None, |app| {
                app.set(root, Changes::provider(None), None, false)?;
                app.settle()
            })
            .await;
        self.provider = None;
        self.status = Status::Offline;
        result
    }

    /// Server node tree below `id`'s group, or the whole tree for the root.
    pub async fn query(&self, id: NodeId) -> MixResult<QueryTreeNode> {
        let provider = self.provider.as_ref().ok_or(MixError::NotBooted)?;
        let tree = provider.query_tree().await?;
        if id == self.root {
            return Ok(QueryTreeNode::Group(tree));
        }
        let remote = self.check(id)?.remote_node().ok_or(MixError::NotBooted)?;
        tree.find(remote.id)
            .ok_or_else(|| MixError::UnknownNode(format!("server node {}", remote.id)))
    }

    // ─── Structure ──────────────────────────────────────────────────

    /// Set or clear `id`'s explicit channel count.
    pub async fn set_channel_count(&mut self, id: NodeId, channel_count: Option<u32>) -> MixResult {
        self.check(id)?;
        if id == self.root {
            let count = channel_count.unwrap_or(mixgraph_types::DEFAULT_CHANNEL_COUNT);
            return self.set_application_channel_count(count).await;
        }
        self.transact(&[id], None, |app| app.apply_channel_count(id, channel_count)).await
    }

    /// Change the fallback channel count every node without its own
    /// inherits.
    pub async fn set_application_channel_count(&mut self, channel_count: u32) -> MixResult {
        if !(MIN_CHANNEL_COUNT..=MAX_CHANNEL_COUNT).contains(&channel_count) {
            return Err(MixError::InvalidChannelCount(channel_count));
        }
        if self.channel_count == channel_count {
            return Ok(());
        }
        self.channel_count = channel_count;
        let root = self.root;
        self.transact(&[root], None, |app| {
            app.set(root, Changes::default(), None, false)?;
            app.settle()
        })
        .await
    }

    /// The group `item` is stored in when it lives under `owner`.
    fn container_for(&self, item: NodeId, owner: NodeId) -> MixResult<NodeId> {
        match &self.check(item)?.kind {
            NodeKind::Context(_) if owner == self.root => Ok(self.root),
            NodeKind::Track(track) if track.role == TrackRole::Track => self.track_container(owner),
            NodeKind::Track(track) if track.role == TrackRole::Chain => match &self.check(owner)?.kind {
                NodeKind::Rack(rack) => Ok(rack.chains),
                _ => Err(MixError::WrongKind { node: owner, expected: "rack" }),
            },
            NodeKind::Rack(_) | NodeKind::Device(_) => self
                .check(owner)?
                .as_track()
                .map(|t| t.devices)
                .ok_or(MixError::WrongKind { node: owner, expected: "track or chain" }),
            _ => Err(MixError::WrongKind { node: item, expected: "movable node" }),
        }
    }

    /// Move `id` under `owner` at `index`, counted without `id` itself.
    pub async fn move_to(&mut self, id: NodeId, owner: NodeId, index: usize) -> MixResult {
        let container = self.container_for(id, owner)?;
        self.transact(&[id, owner], None, |app| app.move_into(id, container, index)).await
    }

    fn is_deletable(&self, id: NodeId) -> bool {
        let node = self.node(id);
        match &node.kind {
            NodeKind::Context(_) | NodeKind::Rack(_) | NodeKind::Device(_) => true,
            NodeKind::Track(track) => track.is_user(),
            NodeKind::Patch(patch) => matches!(patch.kind, PatchKind::Send { .. } | PatchKind::Receive { .. }),
            NodeKind::Parameter(param) => !param.is_builtin,
            NodeKind::Root | NodeKind::Group(_) => false,
        }
    }

    /// Detach `id` from its parent, releasing its remote resources.
    pub async fn delete(&mut self, id: NodeId) -> MixResult {
        self.check(id)?;
        if !self.is_deletable(id) {
            return Err(MixError::WrongKind { node: id, expected: "deletable node" });
        }
        self.transact(&[id], None, |app| app.remove_children(&[id])).await
    }

    /// Dissolve a track into its sub-tracks or a rack into its chain's devices.
    pub async fn ungroup(&mut self, id: NodeId) -> MixResult {
        match &self.check(id)?.kind {
            NodeKind::Track(track) if track.role == TrackRole::Track => {
                self.transact(&[id], None, |app| app.ungroup_track(id)).await
            }
            NodeKind::Rack(_) => {
                if self.chains(id).len() > 1 {
                    return Err(MixError::WrongKind { node: id, expected: "rack with at most one chain" });
                }
                self.transact(&[id], None, |app| app.ungroup_rack(id)).await
            }
            _ => Err(MixError::WrongKind { node: id, expected: "track or rack" }),
        }
    }
}

impl std::fmt::Display for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.describe(self.root))
    }
}

#[cfg(test)]
mod tests {
    use async_std::task::block_on;
    use mixgraph_audio::{SharedTestTransport, TestTransport};

    use super::*;

    fn transport() -> (Arc<TestTransport>, Arc<dyn Transport>) {
        let transport = Arc::new(TestTransport::new());
        let shared: Arc<dyn Transport> = Arc::new(SharedTestTransport(transport.clone()));
        (transport, shared)
    }

    #[test]
    fn boot_allocates_and_quit_frees() {
        let mut app = Application::new(2);
        let context = app.insert_context(None).unwrap();
        let (recorder, transport) = transport();
        block_on(app.boot(transport, ServerOptions::default())).unwrap();
        assert!(app.is_booted());
        assert_eq!(recorder.bundles().len(), 1);
        let group = app.node(context).remote_node().unwrap();
        assert!(recorder.node_exists(group.id));

        recorder.clear();
        block_on(app.quit()).unwrap();
        assert_eq!(app.status(), Status::Offline);
        assert!(app.node(context).remote_node().is_none());
        assert!(!recorder.node_exists(group.id));
        assert_eq!(recorder.count(|m| m.addr == "/n_free"), 1);
    }

    #[test]
    fn boot_twice_is_rejected() {
        let mut app = Application::new(2);
        let (_, transport) = transport();
        block_on(app.boot(transport.clone(), ServerOptions::default())).unwrap();
        assert!(matches!(
            block_on(app.boot(transport, ServerOptions::default())),
            Err(MixError::AlreadyBooted)
        ));
        let mut offline = Application::new(2);
        assert!(matches!(block_on(offline.quit()), Err(MixError::NotBooted)));
    }

    #[test]
    fn edits_in_one_transaction_flush_once() {
        let mut app = Application::new(2);
        let (recorder, transport) = transport();
        block_on(app.boot(transport, ServerOptions::default())).unwrap();
        let context = block_on(app.add_context(None)).unwrap();
        recorder.clear();

        block_on(app.transact(&[context], None, |app| {
            let a = app.insert_track(context, None)?;
            app.insert_track(a, None)?;
            Ok(())
        }))
        .unwrap();
        assert_eq!(recorder.bundles().len(), 1);
        assert!(recorder.errors().is_empty());
    }

    #[test]
    fn validation_errors_win_and_send_nothing() {
        let mut app = Application::new(2);
        let (recorder, transport) = transport();
        block_on(app.boot(transport, ServerOptions::default())).unwrap();
        let context = block_on(app.add_context(None)).unwrap();
        recorder.clear();

        let result = block_on(app.set_channel_count(context, Some(12)));
        assert!(matches!(result, Err(MixError::InvalidChannelCount(12))));
        let master = app.master_track(context).unwrap();
        assert!(matches!(block_on(app.delete(master)), Err(MixError::WrongKind { .. })));
        assert!(recorder.bundles().is_empty());
    }

    #[test]
    fn flush_failures_propagate_without_rollback() {
        let mut app = Application::new(2);
        let (recorder, transport) = transport();
        block_on(app.boot(transport, ServerOptions::default())).unwrap();
        let context = block_on(app.add_context(None)).unwrap();
        recorder.fail_next_send("socket closed");

        let result = block_on(app.add_track(context, None));
        assert!(matches!(result, Err(MixError::Backend(_))));
        assert_eq!(app.tracks(context).len(), 1);
    }

    #[test]
    fn move_to_reorders_tracks() {
        let mut app = Application::new(2);
        let context = app.insert_context(None).unwrap();
        let a = app.insert_track(context, None).unwrap();
        let b = app.insert_track(context, None).unwrap();
        block_on(app.move_to(b, context, 0)).unwrap();
        assert_eq!(app.tracks(context), vec![b, a]);
        block_on(app.move_to(a, b, 0)).unwrap();
        assert_eq!(app.tracks(b), vec![a]);
        assert!(matches!(block_on(app.move_to(b, a, 0)), Err(MixError::Cycle { .. })));
    }

    #[test]
    fn query_returns_the_context_group() {
        let mut app = Application::new(2);
        let (_, transport) = transport();
        block_on(app.boot(transport, ServerOptions::default())).unwrap();
        let context = block_on(app.add_context(None)).unwrap();
        let remote = app.node(context).remote_node().unwrap();
        let node = block_on(app.query(context)).unwrap();
        assert_eq!(node.node_id(), remote.id);
        assert!(node.as_group().is_some_and(|g| !g.children.is_empty()));
    }
}
