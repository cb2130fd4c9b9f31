//! Contexts: a track container plus its master and cue tracks.

use std::collections::BTreeSet;

use mixgraph_types::NodeId;

use crate::application::Application;
use crate::error::{MixError, MixResult};
use crate::node::{ContextData, GroupRole, Node, NodeKind, PatchKind, TrackRole};

/// Hardware channels the cue track writes.
const CUE_CHANNELS: u32 = 2;

impl Application {
    pub(crate) fn build_context(&mut self, name: Option<&str>) -> NodeId {
        let tracks = self.insert_node(Node::new(NodeKind::Group(GroupRole::Tracks)));
        let master = self.build_track(TrackRole::Master, None);
        let cue = self.build_track(TrackRole::Cue, None);
        let outputs = [
            (master, PatchKind::DirectOut { bus: Some(0), channel_count: None }),
            (cue, PatchKind::DirectOut { bus: None, channel_count: Some(CUE_CHANNELS) }),
        ];
        for (track, kind) in outputs {
            let patch = self.create_patch(kind);
            if let Some(sends) = self.node(track).as_track().map(|t| t.postfader_sends) {
                self.link(sends, patch);
            }
        }
        let mut node = Node::new(NodeKind::Context(ContextData { tracks, master, cue, soloed: BTreeSet::new() }));
        node.name = name.map(str::to_string);
        let context = self.insert_node(node);
        for child in [tracks, master, cue] {
            self.link(context, child);
        }
        context
    }

    pub fn contexts(&self) -> Vec<NodeId> {
        self.children(self.root).to_vec()
    }

    fn context_data(&self, context: NodeId) -> MixResult<&ContextData> {
        match &self.check(context)?.kind {
            NodeKind::Context(data) => Ok(data),
            _ => Err(MixError::WrongKind { node: context, expected: "context" }),
        }
    }

    pub fn master_track(&self, context: NodeId) -> MixResult<NodeId> {
        self.context_data(context).map(|c| c.master)
    }

    pub fn cue_track(&self, context: NodeId) -> MixResult<NodeId> {
        self.context_data(context).map(|c| c.cue)
    }

    pub(crate) fn insert_context(&mut self, name: Option<&str>) -> MixResult<NodeId> {
        let context = self.build_context(name);
        let root = self.root;
        self.append(root, &[context])?;
        Ok(context)
    }

    pub async fn add_context(&mut self, name: Option<&str>) -> MixResult<NodeId> {
        let root = self.root;
        self.transact(&[root], None, |app| app.insert_context(name)).await
    }

    pub async fn remove_contexts(&mut self, contexts: &[NodeId]) -> MixResult {
        let root = self.root;
        let mut locked = vec![root];
        locked.extend_from_slice(contexts);
        self.transact(&locked, None, |app| app.remove_from(root, contexts)).await
    }
}

#[cfg(test)]
mod tests {
    use async_std::task::block_on;

    use super::*;
    use crate::node::SendPosition;

    #[test]
    fn contexts_carry_master_and_cue_outputs() {
        let mut app = Application::new(2);
        let context = app.insert_context(Some("main")).unwrap();
        let master = app.master_track(context).unwrap();
        let cue = app.cue_track(context).unwrap();

        assert_eq!(&app.children(context)[1..], &[master, cue]);
        let out = app.sends(master, SendPosition::Postfader);
        assert_eq!(out.len(), 1);
        assert_eq!(
            app.node(out[0]).as_patch().map(|p| p.kind.clone()),
            Some(PatchKind::DirectOut { bus: Some(0), channel_count: None })
        );
        assert_eq!(app.sends(cue, SendPosition::Postfader).len(), 1);
        assert_eq!(app.contexts(), vec![context]);
    }

    #[test]
    fn removing_contexts_detaches_them() {
        let mut app = Application::new(2);
        let a = block_on(app.add_context(None)).unwrap();
        let b = block_on(app.add_context(None)).unwrap();
        block_on(app.remove_contexts(&[a])).unwrap();
        assert_eq!(app.contexts(), vec![b]);
        assert!(app.master_track(b).is_ok());
        assert!(matches!(app.master_track(app.root()), Err(MixError::WrongKind { .. })));
    }
}
