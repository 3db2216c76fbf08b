//! The executable document tree
//!
//! Nodes live in a key-indexed arena; document order is a doubly linked
//! chain of keys. There are no parent pointers: a heading owns everything
//! after it up to the next heading of equal or lower level, and content and
//! operation nodes always belong to the nearest preceding heading.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{FractalicError, Result};
use crate::node::{KeyGen, Node, NodeKey};

/// How a fragment joins the tree at a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MergeMode {
    #[default]
    Append,
    Prepend,
    Replace,
}

impl MergeMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "append" => Some(Self::Append),
            "prepend" => Some(Self::Prepend),
            "replace" => Some(Self::Replace),
            _ => None,
        }
    }
}

/// An ordered, doubly linked collection of nodes
#[derive(Debug, Clone, Default)]
pub struct Tree {
    nodes: HashMap<NodeKey, Node>,
    head: Option<NodeKey>,
    tail: Option<NodeKey>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn head(&self) -> Option<&Node> {
        self.head.as_ref().and_then(|k| self.nodes.get(k))
    }

    pub fn tail(&self) -> Option<&Node> {
        self.tail.as_ref().and_then(|k| self.nodes.get(k))
    }

    pub fn get(&self, key: &NodeKey) -> Option<&Node> {
        self.nodes.get(key)
    }

    pub fn get_mut(&mut self, key: &NodeKey) -> Option<&mut Node> {
        self.nodes.get_mut(key)
    }

    pub fn contains(&self, key: &NodeKey) -> bool {
        self.nodes.contains_key(key)
    }

    /// Iterate nodes in document order
    pub fn iter(&self) -> TreeIter<'_> {
        TreeIter {
            tree: self,
            cursor: self.head.clone(),
        }
    }

    /// Keys in document order
    pub fn keys_in_order(&self) -> Vec<NodeKey> {
        self.iter().map(|n| n.key.clone()).collect()
    }

    /// Append a node at the end of the chain
    pub fn push_back(&mut self, mut node: Node) {
        node.prev = self.tail.clone();
        node.next = None;
        let key = node.key.clone();
        if let Some(tail) = self.tail.clone() {
            if let Some(t) = self.nodes.get_mut(&tail) {
                t.next = Some(key.clone());
            }
        } else {
            self.head = Some(key.clone());
        }
        self.tail = Some(key.clone());
        self.nodes.insert(key, node);
    }

    /// Linear search matching either id or key
    pub fn find_by_id_or_key(&self, query: &str) -> Option<&Node> {
        self.iter().find(|n| n.matches(query))
    }

    /// All descendants of a node in order, excluding the node itself
    ///
    /// For a heading this is every following node up to (not including) the
    /// next heading of equal or lower level. Operations and content own
    /// nothing.
    pub fn children_under(&self, key: &NodeKey) -> Vec<NodeKey> {
        let Some(node) = self.nodes.get(key) else {
            return Vec::new();
        };
        if !node.is_heading() {
            return Vec::new();
        }
        let mut out = Vec::new();
        let mut cursor = node.next.clone();
        while let Some(k) = cursor {
            let Some(n) = self.nodes.get(&k) else { break };
            if n.is_heading() && n.level <= node.level {
                break;
            }
            out.push(k.clone());
            cursor = n.next.clone();
        }
        out
    }

    /// A node plus its descendant region, in order
    pub fn region(&self, key: &NodeKey) -> Vec<NodeKey> {
        if !self.nodes.contains_key(key) {
            return Vec::new();
        }
        let mut out = vec![key.clone()];
        out.extend(self.children_under(key));
        out
    }

    /// Direct children of a heading: nodes in its region not enclosed by a
    /// deeper intermediate heading
    pub fn direct_children(&self, key: &NodeKey) -> Vec<NodeKey> {
        let region = self.children_under(key);
        let mut out = Vec::new();
        let mut skip_above: Option<u8> = None;
        for k in region {
            let Some(n) = self.nodes.get(&k) else { continue };
            if let Some(limit) = skip_above {
                if n.is_heading() && n.level <= limit {
                    skip_above = None;
                } else {
                    continue;
                }
            }
            out.push(k.clone());
            if n.is_heading() {
                skip_above = Some(n.level);
            }
        }
        out
    }

    /// Splice a fragment into the tree at `pos`
    ///
    /// `append` splices after the region of `pos`, `prepend` before `pos`,
    /// `replace` removes `pos` with its region and splices in its place.
    /// Fragment nodes whose keys already exist in the tree are reissued
    /// fresh keys from `keygen`. Returns the keys of the inserted nodes.
    pub fn insert(
        &mut self,
        pos: &NodeKey,
        fragment: Vec<Node>,
        mode: MergeMode,
        keygen: &mut KeyGen,
    ) -> Result<Vec<NodeKey>> {
        if !self.nodes.contains_key(pos) {
            return Err(FractalicError::internal(format!(
                "insert target {} is not in the tree",
                pos
            )));
        }

        // Anchor is the node the fragment lands after (None = new head)
        let anchor = match mode {
            MergeMode::Append => Some(
                self.region(pos)
                    .last()
                    .cloned()
                    .unwrap_or_else(|| pos.clone()),
            ),
            MergeMode::Prepend => self.nodes.get(pos).and_then(|n| n.prev.clone()),
            MergeMode::Replace => {
                let anchor = self.nodes.get(pos).and_then(|n| n.prev.clone());
                self.remove_region(pos)?;
                anchor
            }
        };

        self.splice_after(anchor, fragment, keygen)
    }

    /// Unlink a single node, leaving any descendants in place
    pub fn remove_node(&mut self, key: &NodeKey) -> Result<()> {
        let node = self
            .nodes
            .remove(key)
            .ok_or_else(|| FractalicError::internal(format!("{} is not in the tree", key)))?;
        match &node.prev {
            Some(p) => {
                if let Some(n) = self.nodes.get_mut(p) {
                    n.next = node.next.clone();
                }
            }
            None => self.head = node.next.clone(),
        }
        match &node.next {
            Some(nx) => {
                if let Some(n) = self.nodes.get_mut(nx) {
                    n.prev = node.prev.clone();
                }
            }
            None => self.tail = node.prev.clone(),
        }
        Ok(())
    }

    /// Remove a node and its descendant region
    pub fn remove_region(&mut self, key: &NodeKey) -> Result<()> {
        let doomed = self.region(key);
        let first = doomed
            .first()
            .ok_or_else(|| FractalicError::internal("empty region"))?;
        let last = doomed
            .last()
            .ok_or_else(|| FractalicError::internal("empty region"))?;

        let before = self.nodes.get(first).and_then(|n| n.prev.clone());
        let after = self.nodes.get(last).and_then(|n| n.next.clone());

        for k in &doomed {
            self.nodes.remove(k);
        }

        match &before {
            Some(b) => {
                if let Some(n) = self.nodes.get_mut(b) {
                    n.next = after.clone();
                }
            }
            None => self.head = after.clone(),
        }
        match &after {
            Some(a) => {
                if let Some(n) = self.nodes.get_mut(a) {
                    n.prev = before.clone();
                }
            }
            None => self.tail = before.clone(),
        }
        Ok(())
    }

    /// Splice `fragment` into the chain after `anchor` (None = at the head)
    fn splice_after(
        &mut self,
        anchor: Option<NodeKey>,
        fragment: Vec<Node>,
        keygen: &mut KeyGen,
    ) -> Result<Vec<NodeKey>> {
        let mut inserted = Vec::with_capacity(fragment.len());
        let mut cursor = anchor;
        for mut node in fragment {
            if self.nodes.contains_key(&node.key) {
                let fresh = keygen.next_key();
                if let Some(id) = &node.id {
                    if id == &format!("op-{}", node.key) {
                        node.id = Some(format!("op-{}", fresh));
                    }
                }
                node.key = fresh;
            }
            let key = node.key.clone();
            let after = match &cursor {
                Some(c) => self.nodes.get(c).and_then(|n| n.next.clone()),
                None => self.head.clone(),
            };

            node.prev = cursor.clone();
            node.next = after.clone();
            self.nodes.insert(key.clone(), node);

            match &cursor {
                Some(c) => {
                    if let Some(n) = self.nodes.get_mut(c) {
                        n.next = Some(key.clone());
                    }
                }
                None => self.head = Some(key.clone()),
            }
            match &after {
                Some(a) => {
                    if let Some(n) = self.nodes.get_mut(a) {
                        n.prev = Some(key.clone());
                    }
                }
                None => self.tail = Some(key.clone()),
            }

            inserted.push(key.clone());
            cursor = Some(key);
        }
        Ok(inserted)
    }

    /// Detach a copy of a region as a standalone fragment (keys preserved)
    pub fn clone_region(&self, key: &NodeKey) -> Vec<Node> {
        self.region(key)
            .iter()
            .filter_map(|k| self.nodes.get(k))
            .map(|n| {
                let mut n = n.clone();
                n.prev = None;
                n.next = None;
                n
            })
            .collect()
    }

    /// Verify chain consistency: one head, one tail, no cycles, symmetric
    /// prev/next links, and every node reachable
    pub fn check_integrity(&self) -> Result<()> {
        let mut seen = 0usize;
        let mut prev: Option<&NodeKey> = None;
        let mut cursor = self.head.clone();
        while let Some(k) = cursor {
            let node = self
                .nodes
                .get(&k)
                .ok_or_else(|| FractalicError::internal(format!("dangling link to {}", k)))?;
            if node.prev.as_ref() != prev {
                return Err(FractalicError::internal(format!(
                    "asymmetric prev link at {}",
                    k
                )));
            }
            seen += 1;
            if seen > self.nodes.len() {
                return Err(FractalicError::internal("cycle in node chain"));
            }
            if node.next.is_none() && self.tail.as_ref() != Some(&node.key) {
                return Err(FractalicError::internal("tail pointer out of date"));
            }
            prev = Some(&node.key);
            cursor = node.next.clone();
        }
        if seen != self.nodes.len() {
            return Err(FractalicError::internal(format!(
                "{} of {} nodes reachable from head",
                seen,
                self.nodes.len()
            )));
        }
        Ok(())
    }
}

/// Iterator over nodes in document order
pub struct TreeIter<'a> {
    tree: &'a Tree,
    cursor: Option<NodeKey>,
}

impl<'a> Iterator for TreeIter<'a> {
    type Item = &'a Node;

    fn next(&mut self) -> Option<Self::Item> {
        let key = self.cursor.take()?;
        let node = self.tree.nodes.get(&key)?;
        self.cursor = node.next.clone();
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Node, OpName};

    fn heading(gen: &mut KeyGen, level: u8, id: &str) -> Node {
        Node::heading(
            gen.next_key(),
            level,
            id.to_string(),
            format!("{} {}\n", "#".repeat(level as usize), id),
        )
    }

    fn content(gen: &mut KeyGen, level: u8, text: &str) -> Node {
        Node::content(gen.next_key(), level, format!("{}\n", text))
    }

    fn sample_tree() -> (Tree, KeyGen) {
        // # a / body / ## b / inner / # c
        let mut gen = KeyGen::new();
        let mut tree = Tree::new();
        tree.push_back(heading(&mut gen, 1, "a"));
        tree.push_back(content(&mut gen, 1, "body"));
        tree.push_back(heading(&mut gen, 2, "b"));
        tree.push_back(content(&mut gen, 2, "inner"));
        tree.push_back(heading(&mut gen, 1, "c"));
        (tree, gen)
    }

    #[test]
    fn test_order_and_lookup() {
        let (tree, _) = sample_tree();
        tree.check_integrity().unwrap();
        let ids: Vec<_> = tree.iter().map(|n| n.id.clone()).collect();
        assert_eq!(ids.len(), 5);
        assert!(tree.find_by_id_or_key("b").is_some());
        let by_key = tree.head().unwrap().key.clone();
        assert!(tree.find_by_id_or_key(by_key.as_str()).is_some());
        assert!(tree.find_by_id_or_key("missing").is_none());
    }

    #[test]
    fn test_children_under_stops_at_sibling() {
        let (tree, _) = sample_tree();
        let a = tree.find_by_id_or_key("a").unwrap().key.clone();
        let children = tree.children_under(&a);
        // body, ## b, inner, but not # c
        assert_eq!(children.len(), 3);
        let b = tree.find_by_id_or_key("b").unwrap().key.clone();
        assert_eq!(tree.children_under(&b).len(), 1);
    }

    #[test]
    fn test_direct_children_skip_nested_regions() {
        let (tree, _) = sample_tree();
        let a = tree.find_by_id_or_key("a").unwrap().key.clone();
        let direct = tree.direct_children(&a);
        // body and ## b, but not inner
        assert_eq!(direct.len(), 2);
        assert_eq!(tree.get(&direct[1]).unwrap().id.as_deref(), Some("b"));
    }

    #[test]
    fn test_append_lands_after_region() {
        let (mut tree, mut gen) = sample_tree();
        let a = tree.find_by_id_or_key("a").unwrap().key.clone();
        let frag = vec![Node::heading(
            gen.next_key(),
            1,
            "x".to_string(),
            "# x\n".to_string(),
        )];
        tree.insert(&a, frag, MergeMode::Append, &mut gen).unwrap();
        tree.check_integrity().unwrap();
        let ids: Vec<_> = tree
            .iter()
            .filter(|n| n.is_heading())
            .map(|n| n.id.clone().unwrap())
            .collect();
        assert_eq!(ids, vec!["a", "b", "x", "c"]);
    }

    #[test]
    fn test_prepend_lands_before_target() {
        let (mut tree, mut gen) = sample_tree();
        let c = tree.find_by_id_or_key("c").unwrap().key.clone();
        let frag = vec![Node::heading(
            gen.next_key(),
            1,
            "x".to_string(),
            "# x\n".to_string(),
        )];
        tree.insert(&c, frag, MergeMode::Prepend, &mut gen).unwrap();
        tree.check_integrity().unwrap();
        let ids: Vec<_> = tree
            .iter()
            .filter(|n| n.is_heading())
            .map(|n| n.id.clone().unwrap())
            .collect();
        assert_eq!(ids, vec!["a", "b", "x", "c"]);
    }

    #[test]
    fn test_replace_removes_whole_region() {
        let (mut tree, mut gen) = sample_tree();
        let a = tree.find_by_id_or_key("a").unwrap().key.clone();
        let old_region = tree.region(&a);
        let frag = vec![Node::heading(
            gen.next_key(),
            1,
            "x".to_string(),
            "# x\n".to_string(),
        )];
        tree.insert(&a, frag, MergeMode::Replace, &mut gen).unwrap();
        tree.check_integrity().unwrap();
        for key in old_region {
            assert!(!tree.contains(&key));
        }
        assert!(tree.find_by_id_or_key("x").is_some());
        assert!(tree.find_by_id_or_key("b").is_none());
        assert_eq!(tree.head().unwrap().id.as_deref(), Some("x"));
    }

    #[test]
    fn test_replace_at_head_and_tail_updates_pointers() {
        let (mut tree, mut gen) = sample_tree();
        let c = tree.find_by_id_or_key("c").unwrap().key.clone();
        let frag = vec![Node::content(gen.next_key(), 1, "end\n".to_string())];
        tree.insert(&c, frag, MergeMode::Replace, &mut gen).unwrap();
        tree.check_integrity().unwrap();
        assert_eq!(tree.tail().unwrap().text, "end\n");
    }

    #[test]
    fn test_colliding_fragment_keys_are_reissued() {
        let (mut tree, mut gen) = sample_tree();
        let a = tree.find_by_id_or_key("a").unwrap().key.clone();
        // Clone an existing node into the fragment, key included
        let dup = tree.get(&a).unwrap().clone();
        let before = tree.len();
        let inserted = tree
            .insert(&a, vec![dup], MergeMode::Append, &mut gen)
            .unwrap();
        tree.check_integrity().unwrap();
        assert_eq!(tree.len(), before + 1);
        assert_ne!(inserted[0], a);
    }

    #[test]
    fn test_reissued_operation_keeps_synthesized_id_in_sync() {
        let (mut tree, mut gen) = sample_tree();
        let a = tree.find_by_id_or_key("a").unwrap().key.clone();
        let op = Node::operation(
            gen.next_key(),
            OpName::Shell,
            1,
            "@shell\nprompt: echo hi\n".to_string(),
            serde_yaml::Mapping::new(),
        );
        tree.insert(&a, vec![op.clone()], MergeMode::Append, &mut gen)
            .unwrap();
        // Insert the same op again; its key collides and must be reissued
        let inserted = tree
            .insert(&a, vec![op], MergeMode::Append, &mut gen)
            .unwrap();
        let node = tree.get(&inserted[0]).unwrap();
        assert_eq!(node.id.as_deref(), Some(format!("op-{}", node.key).as_str()));
    }
}
