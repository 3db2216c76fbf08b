//! Block-path resolution
//!
//! Paths select nodes by id or key, with `/` descending one hierarchy
//! level and a trailing `/*` widening the selection from a block to its
//! entire descendant region. Resolution always operates on the current
//! tree at the moment of evaluation.

use crate::error::{FractalicError, Result};
use crate::node::NodeKey;
use crate::ops::BlockSpec;
use crate::tree::Tree;

/// A parsed block path: `a`, `a/b`, `a/b/*`
#[derive(Debug, Clone, PartialEq)]
pub struct BlockPath {
    pub segments: Vec<String>,
    pub wildcard: bool,
}

impl BlockPath {
    /// Parse the textual path grammar
    pub fn parse(path: &str) -> Result<Self> {
        let path = path.trim();
        if path.is_empty() {
            return Err(FractalicError::block_not_found("empty block path"));
        }
        let mut segments: Vec<String> = path.split('/').map(str::to_string).collect();
        let wildcard = segments.last().map(|s| s == "*").unwrap_or(false);
        if wildcard {
            segments.pop();
        }
        if segments.is_empty() || segments.iter().any(|s| s.is_empty() || s.contains('*')) {
            return Err(FractalicError::block_not_found(format!(
                "malformed block path `{}`",
                path
            )));
        }
        Ok(Self { segments, wildcard })
    }
}

/// Find the node a path names, or None
///
/// The first segment matches anywhere in the tree, id before key; each
/// further segment matches among the direct children of the previous hit.
pub fn locate(tree: &Tree, path: &BlockPath) -> Option<NodeKey> {
    let mut segments = path.segments.iter();
    let first = segments.next()?;
    let order = tree.keys_in_order();
    let mut current = find_in(tree, order.iter(), first)?;
    for segment in segments {
        let children = tree.direct_children(&current);
        current = find_in(tree, children.iter(), segment)?;
    }
    Some(current)
}

/// Id matches win over key matches
fn find_in<'a>(
    tree: &Tree,
    mut candidates: impl Iterator<Item = &'a NodeKey> + Clone,
    query: &str,
) -> Option<NodeKey> {
    let by_id = candidates
        .clone()
        .find(|k| tree.get(k).map(|n| n.id.as_deref() == Some(query)).unwrap_or(false));
    if by_id.is_some() {
        return by_id.cloned();
    }
    candidates
        .find(|k| tree.get(k).map(|n| n.key.as_str() == query).unwrap_or(false))
        .cloned()
}

/// The nodes a path selects, in document order
///
/// Without the wildcard a heading selects itself plus its direct content
/// (everything up to the first nested heading); with `/*` it selects its
/// whole descendant region. Non-heading nodes select themselves. An
/// unresolvable path selects nothing.
pub fn select(tree: &Tree, path: &BlockPath) -> Vec<NodeKey> {
    let Some(base) = locate(tree, path) else {
        return Vec::new();
    };
    if path.wildcard {
        return tree.region(&base);
    }
    let mut out = vec![base.clone()];
    let Some(node) = tree.get(&base) else {
        return out;
    };
    if node.is_heading() {
        for key in tree.children_under(&base) {
            match tree.get(&key) {
                Some(n) if n.is_heading() => break,
                Some(_) => out.push(key),
                None => break,
            }
        }
    }
    out
}

/// Select across a one-or-many block spec, concatenating in order and
/// preserving duplicates; unresolved paths contribute nothing
pub fn select_spec(tree: &Tree, spec: &BlockSpec) -> Result<Vec<NodeKey>> {
    let mut out = Vec::new();
    for path in spec.paths() {
        let parsed = BlockPath::parse(path)?;
        out.extend(select(tree, &parsed));
    }
    Ok(out)
}

/// Resolve a path that must name a node, failing with `BlockNotFound`
pub fn require(tree: &Tree, path: &str) -> Result<NodeKey> {
    let parsed = BlockPath::parse(path)?;
    locate(tree, &parsed).ok_or_else(|| FractalicError::block_not_found(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::KeyGen;
    use crate::parser::parse_document;

    fn parse(source: &str) -> Tree {
        let mut gen = KeyGen::new();
        parse_document(source, &mut gen).unwrap()
    }

    fn sample() -> Tree {
        parse(
            "# a\nbody-a\n## b\nbody-b\n### c\nbody-c\n## d\nbody-d\n# e\nbody-e\n",
        )
    }

    #[test]
    fn test_path_parsing() {
        let p = BlockPath::parse("a/b/*").unwrap();
        assert_eq!(p.segments, vec!["a", "b"]);
        assert!(p.wildcard);

        let p = BlockPath::parse("solo").unwrap();
        assert_eq!(p.segments, vec!["solo"]);
        assert!(!p.wildcard);

        assert!(BlockPath::parse("").is_err());
        assert!(BlockPath::parse("a//b").is_err());
        assert!(BlockPath::parse("a/*b").is_err());
    }

    #[test]
    fn test_bare_segment_matches_anywhere() {
        let tree = sample();
        let key = locate(&tree, &BlockPath::parse("c").unwrap()).unwrap();
        assert_eq!(tree.get(&key).unwrap().id.as_deref(), Some("c"));
    }

    #[test]
    fn test_nested_segment_requires_direct_childhood() {
        let tree = sample();
        assert!(locate(&tree, &BlockPath::parse("a/b").unwrap()).is_some());
        assert!(locate(&tree, &BlockPath::parse("b/c").unwrap()).is_some());
        // c is two levels below a, not a direct child
        assert!(locate(&tree, &BlockPath::parse("a/c").unwrap()).is_none());
        assert!(locate(&tree, &BlockPath::parse("e/b").unwrap()).is_none());
    }

    #[test]
    fn test_key_fallback_after_id_miss() {
        let tree = sample();
        let b_key = tree.find_by_id_or_key("b").unwrap().key.clone();
        let located = locate(&tree, &BlockPath::parse(b_key.as_str()).unwrap()).unwrap();
        assert_eq!(located, b_key);
    }

    #[test]
    fn test_select_without_wildcard_stops_at_nested_heading() {
        let tree = sample();
        let selected = select(&tree, &BlockPath::parse("b").unwrap());
        let texts: Vec<_> = selected
            .iter()
            .map(|k| tree.get(k).unwrap().text.trim().to_string())
            .collect();
        assert_eq!(texts, vec!["## b", "body-b"]);
    }

    #[test]
    fn test_select_wildcard_takes_whole_region() {
        let tree = sample();
        let selected = select(&tree, &BlockPath::parse("b/*").unwrap());
        let texts: Vec<_> = selected
            .iter()
            .map(|k| tree.get(k).unwrap().text.trim().to_string())
            .collect();
        assert_eq!(texts, vec!["## b", "body-b", "### c", "body-c"]);
    }

    #[test]
    fn test_select_spec_concatenates_and_keeps_duplicates() {
        let tree = sample();
        let spec = BlockSpec::Many(vec!["d".to_string(), "d".to_string(), "missing".to_string()]);
        let selected = select_spec(&tree, &spec).unwrap();
        assert_eq!(selected.len(), 4); // d + body-d, twice; missing is empty
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let tree = sample();
        let path = BlockPath::parse("a/*").unwrap();
        assert_eq!(select(&tree, &path), select(&tree, &path));
    }

    #[test]
    fn test_require_reports_block_not_found() {
        let tree = sample();
        let err = require(&tree, "nope").unwrap_err();
        assert_eq!(err.kind(), "BlockNotFound");
    }
}
