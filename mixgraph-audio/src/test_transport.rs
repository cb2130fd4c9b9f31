//! Recording transport with a simulated server node tree.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::backend::{BackendError, BackendMessage, BackendResult, BoxFuture, Bundle, RawArg, Transport};
use crate::query_tree::{QueryTreeGroup, QueryTreeNode, QueryTreeSynth};

#[derive(Debug, Clone)]
struct SimNode {
    parent: Option<i32>,
    children: Vec<i32>,
    synthdef: Option<String>,
    controls: Vec<(String, RawArg)>,
}

impl SimNode {
    fn group(parent: Option<i32>) -> Self {
        Self { parent, children: Vec::new(), synthdef: None, controls: Vec::new() }
    }
}

/// Minimal model of a server's node tree: root group 0 holding default group 1.
#[derive(Debug, Clone)]
struct ServerModel {
    nodes: HashMap<i32, SimNode>,
    errors: Vec<String>,
}

impl ServerModel {
    fn new() -> Self {
        let mut nodes = HashMap::new();
        let mut root = SimNode::group(None);
        root.children.push(1);
        nodes.insert(0, root);
        nodes.insert(1, SimNode::group(Some(0)));
        Self { nodes, errors: Vec::new() }
    }

    fn fail(&mut self, message: &BackendMessage, why: &str) {
        let text = format!("{}: {}", message.render(), why);
        log::warn!(target: "mixgraph::provider", "simulated server rejected {}", text);
        self.errors.push(text);
    }

    fn detach(&mut self, id: i32) {
        let parent = self.nodes.get(&id).and_then(|n| n.parent);
        if let Some(parent) = parent.and_then(|p| self.nodes.get_mut(&p)) {
            parent.children.retain(|c| *c != id);
        }
    }

    /// Place `id` relative to `target`; `id` must already be in `nodes`.
    fn place(&mut self, id: i32, action: i32, target: i32) -> Result<(), &'static str> {
        let target_node = self.nodes.get(&target).ok_or("target does not exist")?;
        let (parent, index) = match action {
            0 | 1 => {
                if target_node.synthdef.is_some() {
                    return Err("target is not a group");
                }
                let index = if action == 0 { 0 } else { target_node.children.len() };
                (target, index)
            }
            2 | 3 | 4 => {
                let parent = target_node.parent.ok_or("target has no parent")?;
                let siblings = &self.nodes[&parent].children;
                let at = siblings.iter().position(|c| *c == target).ok_or("target not in parent")?;
                (parent, if action == 3 { at + 1 } else { at })
            }
            _ => return Err("unknown add action"),
        };
        self.detach(id);
        if let Some(node) = self.nodes.get_mut(&id) {
            node.parent = Some(parent);
        }
        let siblings = &mut self.nodes.get_mut(&parent).ok_or("parent vanished")?.children;
        let index = index.min(siblings.len());
        siblings.insert(index, id);
        if action == 4 {
            self.remove(target);
        }
        Ok(())
    }

    fn remove(&mut self, id: i32) {
        self.detach(id);
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if let Some(node) = self.nodes.remove(&next) {
                stack.extend(node.children);
            }
        }
    }

    fn synth_descendants(&self, id: i32) -> Vec<i32> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if let Some(node) = self.nodes.get(&next) {
                if node.synthdef.is_some() {
                    out.push(next);
                }
                stack.extend(node.children.iter().copied());
            }
        }
        out
    }

    fn apply(&mut self, message: &BackendMessage) {
        let ints: Vec<Option<i32>> = message.args.iter().map(RawArg::as_int).collect();
        let int = |i: usize| ints.get(i).copied().flatten();
        match message.addr.as_str() {
            "/g_new" => {
                for chunk in 0..message.args.len() / 3 {
                    let (Some(id), Some(action), Some(target)) =
                        (int(chunk * 3), int(chunk * 3 + 1), int(chunk * 3 + 2))
                    else {
                        return self.fail(message, "malformed");
                    };
                    if self.nodes.contains_key(&id) {
                        return self.fail(message, "duplicate node id");
                    }
                    self.nodes.insert(id, SimNode::group(None));
                    if let Err(why) = self.place(id, action, target) {
                        self.nodes.remove(&id);
                        return self.fail(message, why);
                    }
                }
            }
            "/s_new" => {
                let (Some(def), Some(id), Some(action), Some(target)) =
                    (message.args.first().and_then(RawArg::as_str), int(1), int(2), int(3))
                else {
                    return self.fail(message, "malformed");
                };
                if self.nodes.contains_key(&id) {
                    return self.fail(message, "duplicate node id");
                }
                let controls = message.args[4..]
                    .chunks(2)
                    .filter_map(|pair| match pair {
                        [RawArg::Str(k), v] => Some((k.clone(), v.clone())),
                        _ => None,
                    })
                    .collect();
                self.nodes.insert(
                    id,
                    SimNode { parent: None, children: Vec::new(), synthdef: Some(def.to_string()), controls },
                );
                if let Err(why) = self.place(id, action, target) {
                    self.nodes.remove(&id);
                    self.fail(message, why);
                }
            }
            "/n_free" => {
                for id in ints.iter().flatten() {
                    if !self.nodes.contains_key(id) {
                        return self.fail(message, "node not found");
                    }
                    self.remove(*id);
                }
            }
            "/n_set" => {
                let Some(id) = int(0) else {
                    return self.fail(message, "malformed");
                };
                if !self.nodes.contains_key(&id) {
                    return self.fail(message, "node not found");
                }
                for pair in message.args[1..].chunks(2) {
                    let [RawArg::Str(name), value] = pair else { continue };
                    if name == "gate" && value.as_float() == Some(0.0) {
                        // released synths free themselves
                        for synth in self.synth_descendants(id) {
                            self.remove(synth);
                        }
                        continue;
                    }
                    if let Some(node) = self.nodes.get_mut(&id) {
                        node.controls.retain(|(k, _)| k != name);
                        node.controls.push((name.clone(), value.clone()));
                    }
                }
            }
            "/g_head" | "/g_tail" => {
                let action = if message.addr == "/g_head" { 0 } else { 1 };
                for chunk in 0..message.args.len() / 2 {
                    let (Some(group), Some(node)) = (int(chunk * 2), int(chunk * 2 + 1)) else {
                        return self.fail(message, "malformed");
                    };
                    if !self.nodes.contains_key(&node) {
                        return self.fail(message, "node not found");
                    }
                    if let Err(why) = self.place(node, action, group) {
                        return self.fail(message, why);
                    }
                }
            }
            "/n_before" | "/n_after" => {
                let action = if message.addr == "/n_before" { 2 } else { 3 };
                let (Some(node), Some(target)) = (int(0), int(1)) else {
                    return self.fail(message, "malformed");
                };
                if !self.nodes.contains_key(&node) {
                    return self.fail(message, "node not found");
                }
                if let Err(why) = self.place(node, action, target) {
                    self.fail(message, why);
                }
            }
            _ => {}
        }
    }

    fn tree(&self, id: i32) -> QueryTreeNode {
        let Some(node) = self.nodes.get(&id) else {
            return QueryTreeNode::Group(QueryTreeGroup::new(id));
        };
        match &node.synthdef {
            Some(def) => QueryTreeNode::Synth(QueryTreeSynth {
                node_id: id,
                synthdef: def.clone(),
                annotation: None,
                controls: node.controls.clone(),
            }),
            None => QueryTreeNode::Group(QueryTreeGroup {
                node_id: id,
                annotation: None,
                children: node.children.iter().map(|c| self.tree(*c)).collect(),
            }),
        }
    }
}

struct Recorded {
    bundles: Vec<Bundle>,
    model: ServerModel,
    fail_next: Option<String>,
}

/// A test transport that records every bundle and keeps a simulated node
/// tree up to date, so tests can assert both the wire traffic and the
/// resulting server state. Uses `Mutex` so it is `Send + Sync`.
pub struct TestTransport {
    inner: Mutex<Recorded>,
}

impl TestTransport {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Recorded {
                bundles: Vec::new(),
                model: ServerModel::new(),
                fail_next: None,
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Recorded> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// All bundles received so far.
    pub fn bundles(&self) -> Vec<Bundle> {
        self.inner().bundles.clone()
    }

    /// Forget recorded bundles. The simulated tree is kept.
    pub fn clear(&self) {
        self.inner().bundles.clear();
    }

    /// Count recorded messages matching a predicate.
    pub fn count<F: Fn(&BackendMessage) -> bool>(&self, f: F) -> usize {
        self.inner()
            .bundles
            .iter()
            .flat_map(|b| b.messages.iter())
            .filter(|m| f(m))
            .count()
    }

    /// Messages the simulated server could not apply.
    pub fn errors(&self) -> Vec<String> {
        self.inner().model.errors.clone()
    }

    /// Make the next `send_bundle` fail without touching the model.
    pub fn fail_next_send(&self, reason: &str) {
        self.inner().fail_next = Some(reason.to_string());
    }

    pub fn tree(&self) -> QueryTreeGroup {
        match self.inner().model.tree(0) {
            QueryTreeNode::Group(g) => g,
            QueryTreeNode::Synth(_) => QueryTreeGroup::new(0),
        }
    }

    pub fn node_exists(&self, id: i32) -> bool {
        self.inner().model.nodes.contains_key(&id)
    }
}

impl Default for TestTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for TestTransport {
    fn send_bundle(&self, bundle: Bundle) -> BoxFuture<'_, BackendResult> {
        let result = {
            let mut inner = self.inner();
            match inner.fail_next.take() {
                Some(reason) => Err(BackendError(reason)),
                None => {
                    for message in &bundle.messages {
                        inner.model.apply(message);
                    }
                    inner.bundles.push(bundle);
                    Ok(())
                }
            }
        };
        Box::pin(async move { result })
    }

    fn query_tree(&self) -> BoxFuture<'_, BackendResult<QueryTreeGroup>> {
        let tree = self.tree();
        Box::pin(async move { Ok(tree) })
    }
}

/// Wraps `Arc<TestTransport>` so a provider can own the transport while
/// tests keep an `Arc` for assertions.
pub struct SharedTestTransport(pub Arc<TestTransport>);

impl Transport for SharedTestTransport {
    fn send_bundle(&self, bundle: Bundle) -> BoxFuture<'_, BackendResult> {
        self.0.send_bundle(bundle)
    }

    fn query_tree(&self) -> BoxFuture<'_, BackendResult<QueryTreeGroup>> {
        self.0.query_tree()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_std::task::block_on;

    fn send(transport: &TestTransport, messages: Vec<BackendMessage>) {
        block_on(transport.send_bundle(Bundle { timetag: None, messages })).unwrap();
    }

    fn g_new(id: i32, action: i32, target: i32) -> BackendMessage {
        BackendMessage::new("/g_new", vec![id.into(), action.into(), target.into()])
    }

    #[test]
    fn builds_and_reorders_groups() {
        let transport = TestTransport::new();
        send(&transport, vec![g_new(1000, 0, 1), g_new(1001, 1, 1000), g_new(1002, 1, 1000)]);
        assert_eq!(transport.tree().find(1000).unwrap().as_group().unwrap().child_ids(), vec![1001, 1002]);

        send(&transport, vec![BackendMessage::new("/g_head", vec![1000.into(), 1002.into()])]);
        assert_eq!(transport.tree().find(1000).unwrap().as_group().unwrap().child_ids(), vec![1002, 1001]);

        send(&transport, vec![BackendMessage::new("/n_after", vec![1002.into(), 1001.into()])]);
        assert_eq!(transport.tree().find(1000).unwrap().as_group().unwrap().child_ids(), vec![1001, 1002]);
        assert!(transport.errors().is_empty());
    }

    #[test]
    fn gate_off_removes_synths_and_n_free_removes_groups() {
        let transport = TestTransport::new();
        send(
            &transport,
            vec![
                g_new(1000, 0, 1),
                BackendMessage::new("/s_new", vec!["mixer/ramp".into(), 1001.into(), 0.into(), 1000.into()]),
            ],
        );
        assert!(transport.node_exists(1001));
        send(&transport, vec![BackendMessage::new("/n_set", vec![1001.into(), "gate".into(), 0.into()])]);
        assert!(!transport.node_exists(1001));
        send(&transport, vec![BackendMessage::new("/n_free", vec![1000.into()])]);
        assert!(!transport.node_exists(1000));
        assert_eq!(transport.bundles().len(), 3);
    }

    #[test]
    fn invalid_targets_are_reported() {
        let transport = TestTransport::new();
        send(&transport, vec![g_new(1000, 0, 999)]);
        assert_eq!(transport.errors().len(), 1);
        assert!(!transport.node_exists(1000));
    }

    #[test]
    fn failed_send_records_nothing() {
        let transport = TestTransport::new();
        transport.fail_next_send("boom");
        let result = block_on(transport.send_bundle(Bundle { timetag: None, messages: vec![g_new(1000, 0, 1)] }));
        assert!(result.is_err());
        assert!(transport.bundles().is_empty());
        assert!(!transport.node_exists(1000));
    }
}
