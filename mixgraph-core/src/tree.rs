//! Arena access and tree navigation.

use std::fmt::Write as _;

use mixgraph_types::{NodeId, DEFAULT_CHANNEL_COUNT};
use uuid::Uuid;

use crate::application::Application;
use crate::error::{MixError, MixResult};
use crate::node::{Node, NodeKind, TrackRole};

impl Application {
    pub(crate) fn insert_node(&mut self, node: Node) -> NodeId {
        let id = NodeId::new(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    /// Link `child` under `parent` without reconciling. Only for building
    /// detached subtrees.
    pub(crate) fn link(&mut self, parent: NodeId, child: NodeId) {
        self.nodes[child.index()].parent = Some(parent);
        self.nodes[parent.index()].children.push(child);
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    pub(crate) fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    /// Reject ids this application never issued.
    pub fn check(&self, id: NodeId) -> MixResult<&Node> {
        self.get(id).ok_or_else(|| MixError::UnknownNode(id.to_string()))
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Children of `id`; empty for ids this application never issued.
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.get(id).map_or(&[], |n| n.children.as_slice())
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.get(id)?.parent
    }

    pub fn lookup(&self, uuid: &Uuid) -> Option<NodeId> {
        self.registry.get(uuid).copied()
    }

    pub fn index_of(&self, id: NodeId) -> Option<usize> {
        let parent = self.get(id)?.parent?;
        self.children(parent).iter().position(|c| *c == id)
    }

    /// The node followed by its ancestors, nearest first. Empty for unknown ids.
    pub fn parentage(&self, id: NodeId) -> Vec<NodeId> {
        let Some(node) = self.get(id) else {
            return Vec::new();
        };
        let mut out = vec![id];
        let mut current = node.parent;
        while let Some(p) = current {
            out.push(p);
            current = self.node(p).parent;
        }
        out
    }

    pub fn depth(&self, id: NodeId) -> usize {
        self.parentage(id).len().saturating_sub(1)
    }

    /// Whether `ancestor` is a strict ancestor of `id`.
    pub fn is_ancestor(&self, ancestor: NodeId, id: NodeId) -> bool {
        let mut current = self.parent(id);
        while let Some(p) = current {
            if p == ancestor {
                return true;
            }
            current = self.node(p).parent;
        }
        false
    }

    /// Child-index path from the top of the tree; sorts in server execution order.
    pub fn graph_order(&self, id: NodeId) -> Vec<usize> {
        let mut path: Vec<usize> = self
            .parentage(id)
            .into_iter()
            .filter_map(|n| self.index_of(n))
            .collect();
        path.reverse();
        path
    }

    /// Pre-order list of `id` and everything below it.
    pub fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.get(id).map(|_| id).into_iter().collect();
        while let Some(next) = stack.pop() {
            out.push(next);
            stack.extend(self.children(next).iter().rev().copied());
        }
        out
    }

    pub fn effective_channel_count(&self, id: NodeId) -> u32 {
        for n in self.parentage(id) {
            if let Some(count) = self.node(n).channel_count {
                return count;
            }
        }
        if self.get(id).is_some_and(|n| n.application.is_some()) || self.is_ancestor(self.root, id) || id == self.root {
            return self.channel_count;
        }
        DEFAULT_CHANNEL_COUNT
    }

    fn nearest(&self, id: NodeId, pred: impl Fn(&Node) -> bool) -> Option<NodeId> {
        self.parentage(id).into_iter().skip(1).find(|n| pred(self.node(*n)))
    }

    pub fn context_of(&self, id: NodeId) -> Option<NodeId> {
        if matches!(self.get(id)?.kind, NodeKind::Context(_)) {
            return Some(id);
        }
        self.nearest(id, |n| matches!(n.kind, NodeKind::Context(_)))
    }

    /// Nearest enclosing track or chain (excluding `id` itself).
    pub fn track_object_of(&self, id: NodeId) -> Option<NodeId> {
        self.nearest(id, Node::is_track_like)
    }

    /// Nearest enclosing rack or device (excluding `id` itself).
    pub fn device_of(&self, id: NodeId) -> Option<NodeId> {
        self.nearest(id, Node::is_device_like)
    }

    pub fn rack_of(&self, id: NodeId) -> Option<NodeId> {
        self.nearest(id, |n| matches!(n.kind, NodeKind::Rack(_)))
    }

    /// The node owning the parameter group a parameter lives in.
    pub fn parameter_owner(&self, parameter: NodeId) -> Option<NodeId> {
        let group = self.parent(parameter)?;
        self.parent(group)
    }

    pub fn track_role(&self, id: NodeId) -> Option<TrackRole> {
        self.get(id)?.as_track().map(|t| t.role)
    }

    /// Indented rendering with remote ids, one node per line.
    pub fn describe(&self, id: NodeId) -> String {
        let mut out = String::new();
        let base = self.depth(id);
        for n in self.subtree(id) {
            let node = self.node(n);
            let pad = "    ".repeat(self.depth(n) - base);
            let remote = node
                .remote_node()
                .map(|r| r.id.to_string())
                .unwrap_or_else(|| "?".to_string());
            let _ = write!(out, "{}<{} [{}]", pad, node.label(), remote);
            if let Some(uuid) = node.uuid {
                let _ = write!(out, " {}", uuid);
            }
            out.push_str(">\n");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use mixgraph_types::{NodeId, DEFAULT_CHANNEL_COUNT};

    use crate::application::Application;
    use crate::node::NodeKind;

    #[test]
    fn navigation_over_a_fresh_context() {
        let mut app = Application::new(2);
        let context = app.insert_context(None).unwrap();
        let track = app.insert_track(context, None).unwrap();
        let tracks = app.children(context)[0];

        assert_eq!(app.parentage(track), vec![track, tracks, context, app.root()]);
        assert_eq!(app.context_of(track), Some(context));
        assert!(app.is_ancestor(context, track));
        assert!(!app.is_ancestor(track, context));
        assert_eq!(app.graph_order(track), vec![0, 0, 0]);
        assert_eq!(app.effective_channel_count(track), 2);
        assert!(matches!(app.node(tracks).kind, NodeKind::Group(_)));
        assert!(app.describe(context).starts_with("<Context [?]"));
    }

    #[test]
    fn foreign_ids_navigate_to_nothing() {
        let app = Application::new(2);
        let stranger = NodeId::new(999);
        assert!(app.children(stranger).is_empty());
        assert_eq!(app.parent(stranger), None);
        assert_eq!(app.index_of(stranger), None);
        assert!(app.parentage(stranger).is_empty());
        assert!(app.subtree(stranger).is_empty());
        assert_eq!(app.context_of(stranger), None);
        assert_eq!(app.describe(stranger), "");
        assert_eq!(app.effective_channel_count(stranger), DEFAULT_CHANNEL_COUNT);
    }

    #[test]
    fn channel_count_inherits_from_nearest_explicit() {
        let mut app = Application::new(4);
        let context = app.insert_context(None).unwrap();
        let track = app.insert_track(context, None).unwrap();
        assert_eq!(app.effective_channel_count(track), 4);
        app.node_mut(context).channel_count = Some(1);
        assert_eq!(app.effective_channel_count(track), 1);
        app.node_mut(track).channel_count = Some(6);
        assert_eq!(app.effective_channel_count(track), 6);
    }
}
