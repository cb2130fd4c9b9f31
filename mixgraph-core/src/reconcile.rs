//! The diff-then-apply driver.
//!
//! Every structural edit funnels through [`Application::splice`], which
//! relinks the arena and then calls [`Application::set`] on each node whose
//! membership changed. `set` applies tri-state field updates and reconciles:
//! the node's cached snapshot is compared with its live state, and the
//! difference turns into applicate/deapplicate, allocate/deallocate, move or
//! reallocate calls against the provider, recursing into children. Once the
//! tree is consistent, `settle` recomputes mixer activation and re-resolves
//! patch edges for everything the pass touched.

use std::collections::BTreeSet;
use std::ops::Range;
use std::sync::Arc;

use mixgraph_audio::Provider;
use mixgraph_types::{NodeId, RemoteNode};

use crate::application::Application;
use crate::error::{MixError, MixResult};
use crate::node::{Anchor, CachedState, Changes, GroupRole, NodeKind, PatchKind, TrackRole, Update};

const TRACE: &str = "mixgraph::reconcile";

fn same_provider(a: &Option<Arc<Provider>>, b: &Option<Arc<Provider>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

impl Application {
    fn trace(&self, id: NodeId, what: &str) {
        if log::log_enabled!(target: TRACE, log::Level::Debug) {
            let node = self.node(id);
            log::debug!(
                target: TRACE,
                "{}{} {}",
                "    ".repeat(self.depth(id)),
                what,
                node.label()
            );
        }
    }

    /// Apply field updates to `id` and reconcile it (and, recursively, its
    /// children). Clearing the application also clears the provider.
    pub(crate) fn set(&mut self, id: NodeId, changes: Changes, anchor: Option<Anchor>, dispose_only: bool) -> MixResult {
        let Changes { application, provider, channel_count } = changes;
        let node = self.node_mut(id);
        if matches!(application, Update::Clear) {
            node.provider = None;
        } else {
            provider.apply(&mut node.provider);
        }
        application.apply(&mut node.application);
        channel_count.apply(&mut node.channel_count);
        self.reconcile(id, anchor, dispose_only)
    }

    fn live_state(&self, id: NodeId) -> CachedState {
        let node = self.node(id);
        CachedState {
            application: node.application,
            parent: node.parent,
            index: self.index_of(id),
            channel_count: self.effective_channel_count(id),
            provider: node.provider.clone(),
        }
    }

    fn reconcile(&mut self, id: NodeId, anchor: Option<Anchor>, dispose_only: bool) -> MixResult {
        let live = self.live_state(id);
        let old = std::mem::replace(&mut self.node_mut(id).cached, live.clone());
        let mut changed = false;

        if old.application != live.application {
            changed = true;
            if old.application.is_some() {
                self.deapplicate(id);
            }
            if live.application.is_some() {
                self.applicate(id);
            }
        }

        let children = self.node(id).children.clone();
        let application = Update::from_option(live.application);

        if !same_provider(&old.provider, &live.provider) {
            changed = true;
            if let Some(provider) = &old.provider {
                let owned_group = self.node(id).remote_node().is_some_and(|n| n.is_group());
                self.trace(id, "deallocating");
                self.deallocate(id, provider, dispose_only);
                for child in children.iter().rev() {
                    let changes = Changes { application: application.clone(), provider: Update::Clear, ..Default::default() };
                    self.set(*child, changes, None, dispose_only || owned_group)?;
                }
            }
            if let Some(provider) = &live.provider {
                self.preallocate(id, provider)?;
                let anchor = self.placement(id, anchor, provider);
                self.trace(id, "allocating");
                self.allocate(id, provider, anchor)?;
                let mut child_anchor = self.node(id).remote_node().map(Anchor::head);
                for child in children {
                    let changes = Changes {
                        application: application.clone(),
                        provider: Update::Set(provider.clone()),
                        ..Default::default()
                    };
                    self.set(child, changes, child_anchor, false)?;
                    if let Some(remote) = self.node(child).remote_node() {
                        child_anchor = Some(Anchor::after(remote));
                    }
                }
            }
        } else {
            let moved = old.parent != live.parent || old.index != live.index;
            let resized = old.channel_count != live.channel_count;
            changed |= moved || resized;
            if let Some(provider) = &live.provider {
                if moved {
                    self.relocate(id, anchor, provider);
                }
                if resized {
                    self.trace(id, "reallocating");
                    self.reallocate(id, provider)?;
                }
            }
            for child in children {
                let changes = Changes {
                    application: application.clone(),
                    provider: Update::from_option(live.provider.clone()),
                    ..Default::default()
                };
                self.set(child, changes, None, dispose_only)?;
            }
        }

        if changed {
            self.touched.push(id);
        }
        Ok(())
    }

    fn applicate(&mut self, id: NodeId) {
        if let Some(uuid) = self.node(id).uuid {
            self.registry.insert(uuid, id);
        }
    }

    fn deapplicate(&mut self, id: NodeId) {
        if let Some(uuid) = self.node(id).uuid {
            if self.registry.get(&uuid) == Some(&id) {
                self.registry.remove(&uuid);
            }
        }
        self.release_peer(id);
    }

    fn preallocate(&mut self, id: NodeId, provider: &Arc<Provider>) -> MixResult {
        if self.node(id).parameter_group().is_some() {
            self.preallocate_parameters(id, provider)?;
        }
        Ok(())
    }

    fn allocate(&mut self, id: NodeId, provider: &Arc<Provider>, anchor: Anchor) -> MixResult {
        match &self.node(id).kind {
            NodeKind::Root => Ok(()),
            NodeKind::Context(_) => {
                let group = provider.add_group(anchor.target, anchor.action, Some("context"));
                self.node_mut(id).resources.nodes.insert("node", group);
                Ok(())
            }
            NodeKind::Group(role) => {
                let role = *role;
                if role == GroupRole::Parameters && !self.parameter_group_has_bus(id) {
                    return Ok(());
                }
                let group = provider.add_group(anchor.target, anchor.action, Some(role.label()));
                self.node_mut(id).resources.nodes.insert("node", group);
                Ok(())
            }
            NodeKind::Track(_) => self.allocate_track(id, provider, anchor),
            NodeKind::Rack(_) => self.allocate_rack(id, provider, anchor),
            NodeKind::Device(_) => self.allocate_device(id, provider, anchor),
            NodeKind::Parameter(_) => self.allocate_parameter(id, provider, anchor),
            NodeKind::Patch(_) => {
                let group = provider.add_group(anchor.target, anchor.action, Some("patch"));
                self.node_mut(id).resources.nodes.insert("node", group);
                Ok(())
            }
        }
    }

    /// Drop every remote handle of `id`. The node's own group is freed unless
    /// an enclosing group is going away with it; everything else it owns
    /// lives inside that group and is only forgotten.
    fn deallocate(&mut self, id: NodeId, provider: &Arc<Provider>, dispose_only: bool) {
        let node = self.node_mut(id);
        let resources = std::mem::take(&mut node.resources);
        match &mut node.kind {
            NodeKind::Patch(patch) => patch.signature = None,
            NodeKind::Device(device) => {
                for (_, voice) in std::mem::take(&mut device.voices) {
                    provider.dispose_node(voice);
                }
            }
            _ => {}
        }
        for (role, remote) in resources.nodes {
            if role == "node" && !dispose_only {
                provider.free_node(remote);
            } else {
                provider.dispose_node(remote);
            }
        }
        for (_, bus) in resources.audio_buses.into_iter().chain(resources.control_buses) {
            provider.free_bus_group(bus);
        }
        for (_, buffer) in resources.buffers {
            provider.free_buffer(buffer);
        }
        for (_, callback) in resources.callbacks {
            provider.unregister_osc_callback(callback);
        }
    }

    fn relocate(&mut self, id: NodeId, anchor: Option<Anchor>, provider: &Arc<Provider>) {
        let Some(remote) = self.node(id).remote_node() else {
            return;
        };
        let anchor = self.placement(id, anchor, provider);
        self.trace(id, "moving");
        provider.move_node(remote, anchor.target, anchor.action);
    }

    fn reallocate(&mut self, id: NodeId, provider: &Arc<Provider>) -> MixResult {
        match self.node(id).kind {
            NodeKind::Track(_) => self.reallocate_track(id, provider),
            NodeKind::Rack(_) => self.reallocate_rack(id, provider),
            NodeKind::Device(_) => self.reallocate_device(id, provider),
            _ => Ok(()),
        }
    }

    /// Where `id` goes on the server. Some nodes always sit next to one of
    /// their parent's synths; the rest take the caller's anchor, or one
    /// derived from their siblings.
    fn placement(&self, id: NodeId, anchor: Option<Anchor>, provider: &Arc<Provider>) -> Anchor {
        if let Some(fixed) = self.fixed_placement(id) {
            return fixed;
        }
        if let Some(anchor) = anchor {
            return anchor;
        }
        let Some(parent) = self.node(id).parent else {
            return Anchor::tail(provider.default_group());
        };
        let siblings = self.children(parent);
        let index = self.index_of(id).unwrap_or(siblings.len());
        if let Some(previous) = siblings[..index].iter().rev().find_map(|s| self.node(*s).remote_node()) {
            return Anchor::after(previous);
        }
        let container = self.container_group(parent, provider);
        if index + 1 >= siblings.len() {
            Anchor::tail(container)
        } else {
            Anchor::head(container)
        }
    }

    fn fixed_placement(&self, id: NodeId) -> Option<Anchor> {
        let node = self.node(id);
        let parent = self.node(node.parent?);
        let synth = |role: &str| parent.resources.nodes.get(role).copied();
        match &node.kind {
            NodeKind::Group(GroupRole::SubTracks) => synth("input").map(Anchor::after),
            NodeKind::Group(GroupRole::Devices) => synth("input_levels").map(Anchor::after),
            NodeKind::Group(GroupRole::PrefaderSends) => synth("output").map(Anchor::before),
            NodeKind::Group(GroupRole::PostfaderSends) => synth("output").map(Anchor::after),
            NodeKind::Group(GroupRole::Parameters) => parent.remote_node().map(Anchor::head),
            NodeKind::Group(GroupRole::Receives) => {
                let parameters = parent.parameter_group().and_then(|g| self.node(g).remote_node());
                match parameters {
                    Some(group) => Some(Anchor::after(group)),
                    None => parent.remote_node().map(Anchor::head),
                }
            }
            NodeKind::Patch(patch) if patch.kind == PatchKind::DeviceOut => parent.remote_node().map(Anchor::tail),
            // A bus parameter in a group that never needed its own remote
            // group sits at the head of its owner, ahead of the owner's synths.
            NodeKind::Parameter(_) if parent.remote_node().is_none() => {
                parent.parent.and_then(|owner| self.node(owner).remote_node()).map(Anchor::head)
            }
            _ => None,
        }
    }

    /// Nearest remote group at or above `id`; the server's default group for
    /// top-level nodes.
    pub(crate) fn container_group(&self, id: NodeId, provider: &Arc<Provider>) -> RemoteNode {
        self.parentage(id)
            .into_iter()
            .find_map(|n| self.node(n).remote_node().filter(RemoteNode::is_group))
            .unwrap_or_else(|| provider.default_group())
    }

    fn accepts(&self, container: NodeId, item: NodeId) -> bool {
        let item = &self.node(item).kind;
        match &self.node(container).kind {
            NodeKind::Root => matches!(item, NodeKind::Context(_)),
            NodeKind::Group(GroupRole::Tracks | GroupRole::SubTracks) => {
                matches!(item, NodeKind::Track(t) if t.role == TrackRole::Track)
            }
            NodeKind::Group(GroupRole::Chains) => matches!(item, NodeKind::Track(t) if t.role == TrackRole::Chain),
            NodeKind::Group(GroupRole::Devices) => matches!(item, NodeKind::Rack(_) | NodeKind::Device(_)),
            NodeKind::Group(GroupRole::Receives) => {
                matches!(item, NodeKind::Patch(p) if matches!(p.kind, PatchKind::Receive { .. }))
            }
            NodeKind::Group(GroupRole::PrefaderSends | GroupRole::PostfaderSends) => matches!(
                item,
                NodeKind::Patch(p) if matches!(p.kind, PatchKind::Send { .. } | PatchKind::DirectOut { .. })
            ),
            NodeKind::Group(GroupRole::Parameters) => matches!(item, NodeKind::Parameter(_)),
            _ => false,
        }
    }

    /// Replace `container.children[range]` with `items`.
    ///
    /// Items may already live in `container` (a move) or elsewhere (a
    /// re-parent). Validation happens before any remote call. Indices in
    /// `range` refer to the list as it is before the call.
    pub(crate) fn splice(&mut self, container: NodeId, range: Range<usize>, items: &[NodeId]) -> MixResult {
        self.check(container)?;
        let len = self.children(container).len();
        if range.start > range.end || range.end > len {
            return Err(MixError::InvalidIndex { index: range.end, len });
        }
        let mut seen = BTreeSet::new();
        for &item in items {
            self.check(item)?;
            if item == container || self.is_ancestor(item, container) {
                return Err(MixError::Cycle { node: item, container });
            }
            if !self.accepts(container, item) {
                return Err(MixError::WrongKind { node: item, expected: self.node(container).kind.label() });
            }
            if !seen.insert(item) {
                return Err(MixError::InvalidIndex { index: range.start, len });
            }
        }

        let old_children = self.children(container).to_vec();
        let keep = |c: &&NodeId| !seen.contains(*c);
        let removed: Vec<NodeId> = old_children[range.clone()].iter().filter(keep).copied().collect();
        let mut new_children: Vec<NodeId> = old_children[..range.start].iter().filter(keep).copied().collect();
        let insert_at = new_children.len();
        new_children.extend_from_slice(items);
        new_children.extend(old_children[range.end..].iter().filter(keep).copied());

        let mut old_parents = BTreeSet::new();
        for &item in items {
            if let Some(parent) = self.node(item).parent {
                if parent != container {
                    self.node_mut(parent).children.retain(|c| *c != item);
                    old_parents.insert(parent);
                }
            }
        }

        let provider = self.node(container).provider.clone();
        let mut anchor = provider.as_ref().map(|provider| {
            match new_children[..insert_at].iter().rev().find_map(|s| self.node(*s).remote_node()) {
                Some(previous) => Anchor::after(previous),
                None => {
                    let group = self.container_group(container, provider);
                    if insert_at == new_children.len() - items.len() {
                        Anchor::tail(group)
                    } else {
                        Anchor::head(group)
                    }
                }
            }
        });

        self.node_mut(container).children = new_children;
        for &r in &removed {
            self.node_mut(r).parent = None;
        }
        for &item in items {
            self.node_mut(item).parent = Some(container);
        }

        // Items go first: they may be leaving the subtree of a removed node.
        let application = self.node(container).application;
        for &item in items {
            let changes = Changes {
                application: Update::from_option(application),
                provider: Update::from_option(provider.clone()),
                ..Default::default()
            };
            self.set(item, changes, anchor, false)?;
            if let Some(remote) = self.node(item).remote_node() {
                anchor = Some(Anchor::after(remote));
            }
        }
        for &r in &removed {
            let changes = Changes { application: Update::Clear, ..Default::default() };
            self.set(r, changes, None, false)?;
        }

        // Shifted siblings keep their remote position; only the snapshot moves.
        for parent in std::iter::once(container).chain(old_parents.iter().copied()) {
            for (index, child) in self.node(parent).children.clone().into_iter().enumerate() {
                let cached = &mut self.node_mut(child).cached;
                cached.parent = Some(parent);
                cached.index = Some(index);
            }
        }

        self.touched.push(container);
        self.touched.extend(old_parents);
        self.settle()
    }

    pub(crate) fn append(&mut self, container: NodeId, items: &[NodeId]) -> MixResult {
        let len = self.children(container).len();
        self.splice(container, len..len, items)
    }

    /// Move `id` to `index` of `container`. The index counts positions in the
    /// container as it would be without `id`.
    pub(crate) fn move_into(&mut self, id: NodeId, container: NodeId, index: usize) -> MixResult {
        self.check(id)?;
        let siblings: Vec<NodeId> = self.children(container).iter().copied().filter(|c| *c != id).collect();
        if index > siblings.len() {
            return Err(MixError::InvalidIndex { index, len: siblings.len() });
        }
        match siblings.get(index) {
            Some(next) => {
                let at = self.children(container).iter().position(|c| c == next).unwrap_or(0);
                self.splice(container, at..at, &[id])
            }
            None => self.append(container, &[id]),
        }
    }

    /// Detach each node from its parent.
    pub(crate) fn remove_children(&mut self, ids: &[NodeId]) -> MixResult {
        for &id in ids {
            self.check(id)?;
        }
        for &id in ids {
            let Some(parent) = self.node(id).parent else {
                continue;
            };
            if let Some(index) = self.index_of(id) {
                self.splice(parent, index..index + 1, &[])?;
            }
        }
        Ok(())
    }

    /// Detach `ids`, each of which must be a direct child of `container`.
    pub(crate) fn remove_from(&mut self, container: NodeId, ids: &[NodeId]) -> MixResult {
        for &id in ids {
            if self.check(id)?.parent != Some(container) {
                return Err(MixError::NotInParent { node: id, parent: container });
            }
        }
        self.remove_children(ids)
    }

    /// Change the explicit channel count of `id`, reallocating whatever
    /// depends on it below.
    pub(crate) fn apply_channel_count(&mut self, id: NodeId, channel_count: Option<u32>) -> MixResult {
        if let Some(count) = channel_count {
            if !(mixgraph_types::MIN_CHANNEL_COUNT..=mixgraph_types::MAX_CHANNEL_COUNT).contains(&count) {
                return Err(MixError::InvalidChannelCount(count));
            }
        }
        self.check(id)?;
        if self.node(id).channel_count == channel_count {
            return Ok(());
        }
        self.set(id, Changes::channel_count(channel_count), None, false)?;
        self.settle()
    }

    /// Run the cleanup hooks for everything reconciled since the last call.
    pub(crate) fn settle(&mut self) -> MixResult {
        let touched = std::mem::take(&mut self.touched);
        if touched.is_empty() {
            return Ok(());
        }
        let mut scopes = BTreeSet::new();
        for &id in &touched {
            if matches!(self.node(id).kind, NodeKind::Context(_) | NodeKind::Rack(_)) {
                scopes.insert(id);
            }
            scopes.extend(self.context_of(id));
            scopes.extend(self.rack_of(id));
        }
        self.refresh_mixers(&scopes);
        self.resolve_patches(&touched)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mixgraph_audio::{Provider, ServerOptions, SharedTestTransport, TestTransport};

    use crate::application::Application;
    use crate::error::MixError;

    fn booted() -> (Application, Arc<TestTransport>) {
        let transport = Arc::new(TestTransport::new());
        let mut app = Application::new(2);
        let provider = Provider::new(Arc::new(SharedTestTransport(transport.clone())), ServerOptions::default());
        async_std::task::block_on(app.boot_with(provider)).unwrap();
        (app, transport)
    }

    #[test]
    fn splice_rejects_cycles_before_any_remote_call() {
        let (mut app, transport) = booted();
        let context = async_std::task::block_on(app.add_context(None)).unwrap();
        let outer = async_std::task::block_on(app.add_track(context, None)).unwrap();
        let inner = async_std::task::block_on(app.add_track(outer, None)).unwrap();
        transport.clear();

        let subtracks = app.node(inner).as_track().and_then(|t| t.subtracks).unwrap();
        let result = app.splice(subtracks, 0..0, &[outer]);
        assert!(matches!(result, Err(MixError::Cycle { .. })));
        assert_eq!(app.node(outer).parent, Some(app.children(context)[0]));
        assert!(transport.bundles().is_empty());
    }

    #[test]
    fn splice_rejects_bad_ranges_and_kinds() {
        let mut app = Application::new(2);
        let context = app.insert_context(None).unwrap();
        let tracks = app.children(context)[0];
        assert!(matches!(app.splice(tracks, 0..1, &[]), Err(MixError::InvalidIndex { .. })));
        let master = app.children(context)[1];
        let master_parameters = app.node(master).parameter_group().unwrap();
        assert!(matches!(
            app.splice(master_parameters, 0..0, &[context]),
            Err(MixError::Cycle { .. }) | Err(MixError::WrongKind { .. })
        ));
    }

    #[test]
    fn move_into_counts_positions_without_the_moved_node() {
        let mut app = Application::new(2);
        let context = app.insert_context(None).unwrap();
        let a = app.insert_track(context, None).unwrap();
        let b = app.insert_track(context, None).unwrap();
        let c = app.insert_track(context, None).unwrap();
        let tracks = app.children(context)[0];

        app.move_into(a, tracks, 2).unwrap();
        assert_eq!(app.children(tracks), &[b, c, a]);
        app.move_into(a, tracks, 0).unwrap();
        assert_eq!(app.children(tracks), &[a, b, c]);
        app.move_into(c, tracks, 1).unwrap();
        assert_eq!(app.children(tracks), &[a, c, b]);
        assert_eq!(app.node(b).cached.index, Some(2));
    }

    #[test]
    fn detaching_clears_application_and_registry() {
        let mut app = Application::new(2);
        let context = app.insert_context(None).unwrap();
        let track = app.insert_track(context, None).unwrap();
        let uuid = app.node(track).uuid.unwrap();
        assert_eq!(app.lookup(&uuid), Some(track));

        app.remove_children(&[track]).unwrap();
        assert!(app.node(track).application.is_none());
        assert!(app.node(track).parent.is_none());
        assert_eq!(app.lookup(&uuid), None);
    }

    #[test]
    fn channel_count_range_is_validated() {
        let mut app = Application::new(2);
        let context = app.insert_context(None).unwrap();
        assert!(matches!(app.apply_channel_count(context, Some(0)), Err(MixError::InvalidChannelCount(0))));
        assert!(matches!(app.apply_channel_count(context, Some(9)), Err(MixError::InvalidChannelCount(9))));
        app.apply_channel_count(context, Some(4)).unwrap();
        assert_eq!(app.node(context).cached.channel_count, 4);
    }
}
