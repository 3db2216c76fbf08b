//! Tree serialization back to Markdown
//!
//! Heading and content nodes are emitted verbatim from their stored text,
//! so non-operation content survives a parse/render round trip
//! byte-identically. Operation nodes are re-emitted as `@name` followed by
//! the canonical YAML of their parameters.

use crate::node::{Node, NodeKind, Role};
use crate::tree::Tree;

/// Render a tree to Markdown
pub fn render(tree: &Tree) -> String {
    render_nodes(tree.iter())
}

/// Render any node sequence to Markdown
pub fn render_nodes<'a>(nodes: impl Iterator<Item = &'a Node>) -> String {
    let mut out = String::new();
    for node in nodes {
        push_node(&mut out, node);
    }
    out
}

/// Render a tree with role markers interleaved so the output can be
/// replayed as chat history
pub fn render_context(tree: &Tree) -> String {
    let mut out = String::new();
    let mut current: Option<Role> = None;
    for node in tree.iter() {
        if current != Some(node.role) {
            if !out.is_empty() && !out.ends_with("\n\n") {
                out.push('\n');
            }
            out.push_str(match node.role {
                Role::User => "<!-- role: user -->\n",
                Role::Assistant => "<!-- role: assistant -->\n",
            });
            current = Some(node.role);
        }
        push_node(&mut out, node);
    }
    out
}

fn push_node(out: &mut String, node: &Node) {
    match node.kind {
        NodeKind::Heading | NodeKind::Content => out.push_str(&node.text),
        NodeKind::Operation(name) => {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push('@');
            out.push_str(name.as_str());
            out.push('\n');
            if let Some(params) = &node.params {
                if !params.is_empty() {
                    if let Ok(yaml) = serde_yaml::to_string(params) {
                        out.push_str(&yaml);
                    }
                }
            }
            out.push('\n');
        }
    }
}
