use std::collections::HashMap;
use std::fmt;

use crate::backend::{BackendError, BackendResult, RawArg};

#[derive(Debug, Clone, PartialEq)]
pub struct QueryTreeSynth {
    pub node_id: i32,
    pub synthdef: String,
    pub annotation: Option<String>,
    pub controls: Vec<(String, RawArg)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryTreeGroup {
    pub node_id: i32,
    pub annotation: Option<String>,
    pub children: Vec<QueryTreeNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryTreeNode {
    Group(QueryTreeGroup),
    Synth(QueryTreeSynth),
}

impl QueryTreeNode {
    pub fn node_id(&self) -> i32 {
        match self {
            QueryTreeNode::Group(g) => g.node_id,
            QueryTreeNode::Synth(s) => s.node_id,
        }
    }

    pub fn as_group(&self) -> Option<&QueryTreeGroup> {
        match self {
            QueryTreeNode::Group(g) => Some(g),
            QueryTreeNode::Synth(_) => None,
        }
    }

    pub fn as_synth(&self) -> Option<&QueryTreeSynth> {
        match self {
            QueryTreeNode::Synth(s) => Some(s),
            QueryTreeNode::Group(_) => None,
        }
    }

    fn annotate(&mut self, labels: &HashMap<i32, String>) {
        match self {
            QueryTreeNode::Group(g) => g.annotate(labels),
            QueryTreeNode::Synth(s) => s.annotation = labels.get(&s.node_id).cloned(),
        }
    }

    fn write_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let pad = "    ".repeat(depth);
        match self {
            QueryTreeNode::Group(g) => {
                write!(f, "{}{} group", pad, g.node_id)?;
                if let Some(a) = &g.annotation {
                    write!(f, " ({})", a)?;
                }
                writeln!(f)?;
                for child in &g.children {
                    child.write_indented(f, depth + 1)?;
                }
                Ok(())
            }
            QueryTreeNode::Synth(s) => {
                write!(f, "{}{} {}", pad, s.node_id, s.synthdef)?;
                if let Some(a) = &s.annotation {
                    write!(f, " ({})", a)?;
                }
                writeln!(f)?;
                if !s.controls.is_empty() {
                    let controls: Vec<String> =
                        s.controls.iter().map(|(k, v)| format!("{}: {}", k, v)).collect();
                    writeln!(f, "{}    {}", pad, controls.join(", "))?;
                }
                Ok(())
            }
        }
    }
}

impl QueryTreeGroup {
    pub fn new(node_id: i32) -> Self {
        Self { node_id, annotation: None, children: Vec::new() }
    }

    /// Depth-first search for a node by id, including `self`.
    pub fn find(&self, node_id: i32) -> Option<QueryTreeNode> {
        if self.node_id == node_id {
            return Some(QueryTreeNode::Group(self.clone()));
        }
        for child in &self.children {
            if child.node_id() == node_id {
                return Some(child.clone());
            }
            if let QueryTreeNode::Group(g) = child {
                if let Some(found) = g.find(node_id) {
                    return Some(found);
                }
            }
        }
        None
    }

    pub fn child_ids(&self) -> Vec<i32> {
        self.children.iter().map(QueryTreeNode::node_id).collect()
    }

    /// Attach labels from `labels` to every node they name.
    pub fn annotate(&mut self, labels: &HashMap<i32, String>) {
        self.annotation = labels.get(&self.node_id).cloned();
        for child in &mut self.children {
            child.annotate(labels);
        }
    }

    /// Parse the arguments of a `/g_queryTree.reply`.
    pub fn from_reply(args: &[RawArg]) -> BackendResult<Self> {
        let mut cursor = ReplyCursor { args, pos: 0 };
        let with_controls = cursor.int()? != 0;
        let node_id = cursor.int()?;
        let child_count = cursor.int()?;
        let mut root = QueryTreeGroup::new(node_id);
        for _ in 0..child_count.max(0) {
            root.children.push(cursor.node(with_controls)?);
        }
        Ok(root)
    }
}

impl fmt::Display for QueryTreeGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "NODE TREE {} group", self.node_id)?;
        for child in &self.children {
            child.write_indented(f, 1)?;
        }
        Ok(())
    }
}

struct ReplyCursor<'a> {
    args: &'a [RawArg],
    pos: usize,
}

impl ReplyCursor<'_> {
    fn next(&mut self) -> BackendResult<&RawArg> {
        let arg = self
            .args
            .get(self.pos)
            .ok_or_else(|| BackendError("truncated /g_queryTree.reply".into()))?;
        self.pos += 1;
        Ok(arg)
    }

    fn int(&mut self) -> BackendResult<i32> {
        self.next()?
            .as_int()
            .ok_or_else(|| BackendError("expected integer in /g_queryTree.reply".into()))
    }

    fn node(&mut self, with_controls: bool) -> BackendResult<QueryTreeNode> {
        let node_id = self.int()?;
        let child_count = self.int()?;
        if child_count < 0 {
            let synthdef = match self.next()? {
                RawArg::Str(s) => s.clone(),
                other => other.to_string(),
            };
            let mut controls = Vec::new();
            if with_controls {
                let count = self.int()?;
                for _ in 0..count.max(0) {
                    let name = self.next()?.to_string();
                    let value = self.next()?.clone();
                    controls.push((name, value));
                }
            }
            return Ok(QueryTreeNode::Synth(QueryTreeSynth {
                node_id,
                synthdef,
                annotation: None,
                controls,
            }));
        }
        let mut group = QueryTreeGroup::new(node_id);
        for _ in 0..child_count {
            group.children.push(self.node(with_controls)?);
        }
        Ok(QueryTreeNode::Group(group))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply() -> Vec<RawArg> {
        // root 0 -> group 1 -> [group 1000 -> [synth 1001], synth 1002]
        vec![
            RawArg::Int(0),
            RawArg::Int(0),
            RawArg::Int(1),
            RawArg::Int(1),
            RawArg::Int(2),
            RawArg::Int(1000),
            RawArg::Int(1),
            RawArg::Int(1001),
            RawArg::Int(-1),
            RawArg::Str("mixer/levels/2".into()),
            RawArg::Int(1002),
            RawArg::Int(-1),
            RawArg::Str("mixer/patch/2x2".into()),
        ]
    }

    #[test]
    fn parses_nested_reply() {
        let tree = QueryTreeGroup::from_reply(&reply()).unwrap();
        assert_eq!(tree.node_id, 0);
        let default_group = tree.children[0].as_group().unwrap();
        assert_eq!(default_group.child_ids(), vec![1000, 1002]);
        let inner = tree.find(1000).unwrap();
        assert_eq!(inner.as_group().unwrap().child_ids(), vec![1001]);
        assert_eq!(tree.find(1002).unwrap().as_synth().unwrap().synthdef, "mixer/patch/2x2");
    }

    #[test]
    fn truncated_reply_is_an_error() {
        let mut args = reply();
        args.truncate(8);
        assert!(QueryTreeGroup::from_reply(&args).is_err());
    }

    #[test]
    fn annotate_and_render() {
        let mut tree = QueryTreeGroup::from_reply(&reply()).unwrap();
        let mut labels = HashMap::new();
        labels.insert(1000, "Track".to_string());
        tree.annotate(&labels);
        let text = tree.to_string();
        assert!(text.contains("1000 group (Track)"));
        assert!(text.contains("1001 mixer/levels/2"));
    }
}
