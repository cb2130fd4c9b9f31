//! Mute/solo scopes and activation.
//!
//! A context is the scope for its user tracks (nested sub-tracks included);
//! a rack is the scope for its chains. Each scope keeps the set of directly
//! soloed members, rebuilt from the members' flags whenever membership or a
//! flag changes. Only members whose activation flips get an `/n_set`.

use std::collections::BTreeSet;

use mixgraph_audio::Control;
use mixgraph_types::NodeId;

use crate::application::Application;
use crate::error::{MixError, MixResult};
use crate::node::{NodeKind, TrackData, TrackRole};

impl Application {
    fn user_track(&self, id: NodeId) -> MixResult<&TrackData> {
        match self.check(id)?.as_track() {
            Some(track) if track.is_user() => Ok(track),
            _ => Err(MixError::WrongKind { node: id, expected: "track or chain" }),
        }
    }

    /// The context or rack whose solo set `id` belongs to.
    pub fn mixer_of(&self, id: NodeId) -> Option<NodeId> {
        match self.get(id)?.as_track()?.role {
            TrackRole::Chain => self.rack_of(id),
            TrackRole::Track => self.context_of(id),
            TrackRole::Master | TrackRole::Cue => None,
        }
    }

    /// Members of a mixer scope in pre-order.
    pub fn mixer_members(&self, scope: NodeId) -> Vec<NodeId> {
        let Some(node) = self.get(scope) else {
            return Vec::new();
        };
        match &node.kind {
            NodeKind::Rack(rack) => self.children(rack.chains).to_vec(),
            NodeKind::Context(context) => {
                let mut out = Vec::new();
                let mut stack: Vec<NodeId> = self.children(context.tracks).iter().rev().copied().collect();
                while let Some(track) = stack.pop() {
                    out.push(track);
                    if let Some(sub) = self.node(track).as_track().and_then(|t| t.subtracks) {
                        stack.extend(self.children(sub).iter().rev().copied());
                    }
                }
                out
            }
            _ => Vec::new(),
        }
    }

    pub fn is_muted(&self, id: NodeId) -> bool {
        self.get(id).and_then(|n| n.as_track()).is_some_and(|t| t.is_muted)
    }

    pub fn is_soloed(&self, id: NodeId) -> bool {
        self.get(id).and_then(|n| n.as_track()).is_some_and(|t| t.is_soloed)
    }

    pub fn is_cued(&self, id: NodeId) -> bool {
        self.get(id).and_then(|n| n.as_track()).is_some_and(|t| t.is_cued)
    }

    pub fn is_active(&self, id: NodeId) -> bool {
        self.get(id).is_some_and(|n| n.is_active)
    }

    pub async fn mute(&mut self, id: NodeId) -> MixResult {
        self.set_muted(id, true).await
    }

    pub async fn unmute(&mut self, id: NodeId) -> MixResult {
        self.set_muted(id, false).await
    }

    async fn set_muted(&mut self, id: NodeId, muted: bool) -> MixResult {
        if self.user_track(id)?.is_muted == muted {
            return Ok(());
        }
        self.transact(&[id], None, |app| {
            if let Some(track) = app.node_mut(id).as_track_mut() {
                track.is_muted = muted;
            }
            let scopes: BTreeSet<NodeId> = app.mixer_of(id).into_iter().collect();
            app.refresh_mixers(&scopes);
            Ok(())
        })
        .await
    }

    /// Solo `id`. An exclusive solo first unsolos everything else in scope.
    pub async fn solo(&mut self, id: NodeId, exclusive: bool) -> MixResult {
        if self.user_track(id)?.is_soloed {
            return Ok(());
        }
        self.transact(&[id], None, |app| {
            let scope = app.mixer_of(id);
            if exclusive {
                for member in scope.map(|s| app.mixer_members(s)).unwrap_or_default() {
                    app.set_solo_flag(member, false);
                }
            }
            app.set_solo_flag(id, true);
            app.refresh_mixers(&scope.into_iter().collect());
            Ok(())
        })
        .await
    }

    /// Unsolo `id`. A non-exclusive unsolo clears every solo in scope.
    pub async fn unsolo(&mut self, id: NodeId, exclusive: bool) -> MixResult {
        if !self.user_track(id)?.is_soloed {
            return Ok(());
        }
        self.transact(&[id], None, |app| {
            let scope = app.mixer_of(id);
            app.set_solo_flag(id, false);
            if !exclusive {
                for member in scope.map(|s| app.mixer_members(s)).unwrap_or_default() {
                    app.set_solo_flag(member, false);
                }
            }
            app.refresh_mixers(&scope.into_iter().collect());
            Ok(())
        })
        .await
    }

    /// Cue state is bookkeeping only.
    pub async fn cue(&mut self, id: NodeId) -> MixResult {
        self.set_cued(id, true)
    }

    pub async fn uncue(&mut self, id: NodeId) -> MixResult {
        self.set_cued(id, false)
    }

    fn set_cued(&mut self, id: NodeId, cued: bool) -> MixResult {
        self.user_track(id)?;
        if let Some(track) = self.node_mut(id).as_track_mut() {
            track.is_cued = cued;
        }
        Ok(())
    }

    fn set_solo_flag(&mut self, id: NodeId, soloed: bool) {
        if let Some(track) = self.node_mut(id).as_track_mut() {
            track.is_soloed = soloed;
        }
    }

    /// Rebuild the solo sets of `scopes` and push activation changes.
    pub(crate) fn refresh_mixers(&mut self, scopes: &BTreeSet<NodeId>) {
        for &scope in scopes {
            let members = self.mixer_members(scope);
            let soloed: BTreeSet<NodeId> = members.iter().copied().filter(|m| self.is_soloed(*m)).collect();
            let flat = match &mut self.node_mut(scope).kind {
                NodeKind::Context(context) => {
                    context.soloed = soloed.clone();
                    false
                }
                NodeKind::Rack(rack) => {
                    rack.soloed = soloed.clone();
                    true
                }
                _ => continue,
            };
            let activation: Vec<(NodeId, bool)> = members
                .iter()
                .map(|m| {
                    let active = if flat {
                        !self.is_muted(*m) && (soloed.is_empty() || soloed.contains(m))
                    } else {
                        self.nested_activation(*m, &soloed)
                    };
                    (*m, active)
                })
                .collect();
            for (member, active) in activation {
                self.set_track_active(member, active);
            }
        }
    }

    /// Mute anywhere up the track tree wins; otherwise a track plays when
    /// nothing is soloed or a solo sits on it, above it or below it.
    fn nested_activation(&self, id: NodeId, soloed: &BTreeSet<NodeId>) -> bool {
        let lineage: Vec<NodeId> = self
            .parentage(id)
            .into_iter()
            .take_while(|n| !matches!(self.node(*n).kind, NodeKind::Context(_)))
            .filter(|n| self.node(*n).as_track().is_some_and(|t| t.role == TrackRole::Track))
            .collect();
        if lineage.iter().any(|n| self.is_muted(*n)) {
            return false;
        }
        soloed.is_empty()
            || lineage.iter().any(|n| soloed.contains(n))
            || soloed.iter().any(|s| self.is_ancestor(id, *s))
    }

    fn set_track_active(&mut self, id: NodeId, active: bool) {
        let node = self.node_mut(id);
        if node.is_active == active {
            return;
        }
        node.is_active = active;
        let output = node.resources.nodes.get("output").copied();
        if let (Some(provider), Some(output)) = (node.provider.clone(), output) {
            log::debug!(target: "mixgraph::reconcile", "{} {}", if active { "activating" } else { "deactivating" }, node.label());
            provider.set_node(output, &[("active", Control::Int(i32::from(active)))]);
        }
    }
}

#[cfg(test)]
mod tests {
    use async_std::task::block_on;

    use crate::application::Application;

    #[test]
    fn nested_solo_keeps_ancestors_and_descendants_audible() {
        let mut app = Application::new(2);
        let context = app.insert_context(None).unwrap();
        let parent = app.insert_track(context, None).unwrap();
        let child = app.insert_track(parent, None).unwrap();
        let other = app.insert_track(context, None).unwrap();

        block_on(app.solo(child, true)).unwrap();
        assert!(app.is_active(parent));
        assert!(app.is_active(child));
        assert!(!app.is_active(other));

        block_on(app.mute(parent)).unwrap();
        assert!(!app.is_active(child));
        block_on(app.unmute(parent)).unwrap();
        assert!(app.is_active(child));
    }

    #[test]
    fn non_exclusive_unsolo_clears_the_scope() {
        let mut app = Application::new(2);
        let context = app.insert_context(None).unwrap();
        let a = app.insert_track(context, None).unwrap();
        let b = app.insert_track(context, None).unwrap();
        let c = app.insert_track(context, None).unwrap();

        block_on(app.solo(a, false)).unwrap();
        block_on(app.solo(b, false)).unwrap();
        assert!(!app.is_active(c));

        block_on(app.unsolo(a, true)).unwrap();
        assert!(!app.is_active(a));
        assert!(app.is_active(b));

        block_on(app.solo(a, false)).unwrap();
        block_on(app.unsolo(a, false)).unwrap();
        assert!(!app.is_soloed(b));
        assert!([a, b, c].iter().all(|t| app.is_active(*t)));
    }

    #[test]
    fn cue_is_stored_only() {
        let mut app = Application::new(2);
        let context = app.insert_context(None).unwrap();
        let a = app.insert_track(context, None).unwrap();
        block_on(app.cue(a)).unwrap();
        assert!(app.is_cued(a));
        block_on(app.uncue(a)).unwrap();
        assert!(!app.is_cued(a));
        let master = app.children(context)[1];
        assert!(block_on(app.cue(master)).is_err());
    }
}
