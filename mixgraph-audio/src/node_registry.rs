use std::collections::HashMap;

use mixgraph_types::RemoteNode;

/// Best-effort registry of server nodes this provider believes are alive,
/// with the label each was created under. Labels annotate query trees;
/// double frees surface as warnings instead of silent OSC to dead nodes.
pub struct NodeRegistry {
    live_nodes: HashMap<i32, RemoteNode>,
    labels: HashMap<i32, String>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            live_nodes: HashMap::new(),
            labels: HashMap::new(),
        }
    }

    /// Record that a node has been created on the server.
    pub fn register(&mut self, node: RemoteNode, label: Option<&str>) {
        self.live_nodes.insert(node.id, node);
        if let Some(label) = label {
            self.labels.insert(node.id, label.to_string());
        }
    }

    /// Record that a node has been freed (or is about to be freed).
    /// Returns `false` and warns if the node was not tracked.
    pub fn unregister(&mut self, node_id: i32) -> bool {
        self.labels.remove(&node_id);
        if self.live_nodes.remove(&node_id).is_some() {
            true
        } else {
            log::warn!(
                target: "mixgraph::nodes",
                "node {} is not tracked as live",
                node_id
            );
            false
        }
    }

    /// Mark all nodes as dead (e.g. after the connection is dropped).
    pub fn invalidate_all(&mut self) {
        self.live_nodes.clear();
        self.labels.clear();
    }

    pub fn is_live(&self, node_id: i32) -> bool {
        self.live_nodes.contains_key(&node_id)
    }

    pub fn label(&self, node_id: i32) -> Option<&str> {
        self.labels.get(&node_id).map(String::as_str)
    }

    pub fn labels(&self) -> &HashMap<i32, String> {
        &self.labels
    }

    /// Number of nodes currently believed to be alive.
    pub fn live_count(&self) -> usize {
        self.live_nodes.len()
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_unregister() {
        let mut reg = NodeRegistry::new();
        reg.register(RemoteNode::group(1000), Some("Context"));
        assert!(reg.is_live(1000));
        assert_eq!(reg.label(1000), Some("Context"));
        assert_eq!(reg.live_count(), 1);

        assert!(reg.unregister(1000));
        assert!(!reg.is_live(1000));
        assert_eq!(reg.live_count(), 0);
    }

    #[test]
    fn invalidate_all_clears_everything() {
        let mut reg = NodeRegistry::new();
        reg.register(RemoteNode::synth(1), None);
        reg.register(RemoteNode::synth(2), None);
        reg.register(RemoteNode::group(3), Some("g"));
        assert_eq!(reg.live_count(), 3);

        reg.invalidate_all();
        assert_eq!(reg.live_count(), 0);
        assert!(reg.labels().is_empty());
    }

    #[test]
    fn unregister_unknown_returns_false() {
        let mut reg = NodeRegistry::new();
        assert!(!reg.unregister(999));
    }
}
