//! Node model for the executable document tree
//!
//! A document is a flat, doubly linked sequence of nodes. Hierarchy is not
//! stored; it is derived from the sequence plus each node's heading level.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable 8-hex-character node identity, unique within one run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeKey(String);

impl NodeKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Issues fresh node keys from a random per-run seed and a counter
///
/// The counter-multiplier is odd, so the mapping is injective over the
/// full 32-bit range and keys cannot collide within a run.
#[derive(Debug)]
pub struct KeyGen {
    seed: u32,
    counter: u32,
}

impl KeyGen {
    pub fn new() -> Self {
        let bytes = Uuid::new_v4();
        let b = bytes.as_bytes();
        let seed = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        Self { seed, counter: 0 }
    }

    /// Issue the next key
    pub fn next_key(&mut self) -> NodeKey {
        let value = self.seed.wrapping_add(self.counter.wrapping_mul(0x9e37_79b1));
        self.counter = self.counter.wrapping_add(1);
        NodeKey(format!("{:08x}", value))
    }
}

impl Default for KeyGen {
    fn default() -> Self {
        Self::new()
    }
}

/// Names of the recognized operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpName {
    Import,
    Llm,
    Shell,
    Run,
    Return,
    Goto,
}

impl OpName {
    /// Parse an operation name as written in the document (without `@`)
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "import" => Some(Self::Import),
            "llm" => Some(Self::Llm),
            "shell" => Some(Self::Shell),
            "run" => Some(Self::Run),
            "return" => Some(Self::Return),
            "goto" => Some(Self::Goto),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Import => "import",
            Self::Llm => "llm",
            Self::Shell => "shell",
            Self::Run => "run",
            Self::Return => "return",
            Self::Goto => "goto",
        }
    }
}

impl fmt::Display for OpName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Node kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Heading,
    Operation(OpName),
    Content,
}

/// Provenance of a node's text, used when replaying the tree as chat turns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Original document content or caller-supplied input
    User,
    /// Generated by an operation
    Assistant,
}

/// A single node of the document tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Stable identity assigned at creation
    pub key: NodeKey,

    /// Heading, operation, or content run
    pub kind: NodeKind,

    /// Heading level 1-6; for operations and content, the level of the
    /// nearest enclosing heading (0 before the first heading)
    pub level: u8,

    /// Addressable slug; headings always have one, operations get a
    /// synthesized `op-<key>`, content nodes have none
    pub id: Option<String>,

    /// Raw Markdown, header line included for headings
    pub text: String,

    /// Parsed YAML parameters for operation nodes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_yaml::Mapping>,

    /// Provenance role
    pub role: Role,

    /// Reserved for conditional execution
    pub enabled: bool,

    /// Previous node in document order
    pub prev: Option<NodeKey>,

    /// Next node in document order
    pub next: Option<NodeKey>,
}

impl Node {
    /// Create a heading node
    pub fn heading(key: NodeKey, level: u8, id: String, text: String) -> Self {
        Self {
            key,
            kind: NodeKind::Heading,
            level,
            id: Some(id),
            text,
            params: None,
            role: Role::User,
            enabled: true,
            prev: None,
            next: None,
        }
    }

    /// Create a content node
    pub fn content(key: NodeKey, level: u8, text: String) -> Self {
        Self {
            key,
            kind: NodeKind::Content,
            level,
            id: None,
            text,
            params: None,
            role: Role::User,
            enabled: true,
            prev: None,
            next: None,
        }
    }

    /// Create an operation node; the id is synthesized from the key
    pub fn operation(
        key: NodeKey,
        name: OpName,
        level: u8,
        text: String,
        params: serde_yaml::Mapping,
    ) -> Self {
        let id = format!("op-{}", key);
        Self {
            key,
            kind: NodeKind::Operation(name),
            level,
            id: Some(id),
            text,
            params: Some(params),
            role: Role::User,
            enabled: true,
            prev: None,
            next: None,
        }
    }

    pub fn is_heading(&self) -> bool {
        matches!(self.kind, NodeKind::Heading)
    }

    pub fn is_operation(&self) -> bool {
        matches!(self.kind, NodeKind::Operation(_))
    }

    pub fn op_name(&self) -> Option<OpName> {
        match self.kind {
            NodeKind::Operation(name) => Some(name),
            _ => None,
        }
    }

    /// Whether this node answers to the given id-or-key query
    pub fn matches(&self, query: &str) -> bool {
        self.id.as_deref() == Some(query) || self.key.as_str() == query
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keygen_issues_unique_hex_keys() {
        let mut gen = KeyGen::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..10_000 {
            let key = gen.next_key();
            assert_eq!(key.as_str().len(), 8);
            assert!(key.as_str().chars().all(|c| c.is_ascii_hexdigit()));
            assert!(seen.insert(key));
        }
    }

    #[test]
    fn test_operation_node_id_synthesized_from_key() {
        let mut gen = KeyGen::new();
        let key = gen.next_key();
        let node = Node::operation(
            key.clone(),
            OpName::Shell,
            1,
            "@shell\nprompt: echo hi\n".to_string(),
            serde_yaml::Mapping::new(),
        );
        assert_eq!(node.id, Some(format!("op-{}", key)));
        assert!(node.matches(key.as_str()));
        assert!(node.matches(&format!("op-{}", key)));
    }

    #[test]
    fn test_op_name_round_trip() {
        for name in ["import", "llm", "shell", "run", "return", "goto"] {
            assert_eq!(OpName::parse(name).unwrap().as_str(), name);
        }
        assert!(OpName::parse("unknown").is_none());
    }
}
