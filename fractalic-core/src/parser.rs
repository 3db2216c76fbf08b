//! Markdown + operation-block parser
//!
//! Two passes over the source lines: the first tokenizes headings, blanks,
//! and content runs; the second recognizes operation blocks. An operation's
//! YAML body always ends at the first blank line. That is a parser
//! invariant, not a style preference: the body is never continued across
//! blanks even where YAML itself would allow it.

use regex::Regex;
use serde_yaml::Mapping;
use std::collections::HashSet;

use crate::error::{FractalicError, Result};
use crate::node::{KeyGen, Node, OpName};
use crate::ops::OpParams;
use crate::tree::Tree;

/// Parse a document into a tree, drawing node keys from `keygen`
pub fn parse_document(source: &str, keygen: &mut KeyGen) -> Result<Tree> {
    DocumentParser::new(source, keygen).run()
}

struct DocumentParser<'a> {
    lines: Vec<&'a str>,
    keygen: &'a mut KeyGen,
    heading_re: Regex,
    id_suffix_re: Regex,
    op_re: Regex,
}

/// Scope frame used to resolve sibling id collisions
struct IdScope {
    level: u8,
    used: HashSet<String>,
}

impl<'a> DocumentParser<'a> {
    fn new(source: &'a str, keygen: &'a mut KeyGen) -> Self {
        Self {
            lines: source.split_inclusive('\n').collect(),
            keygen,
            heading_re: Regex::new(r"^(#{1,6})\s+(.*)$").unwrap(),
            id_suffix_re: Regex::new(r"\{id=([^}]*)\}\s*$").unwrap(),
            op_re: Regex::new(r"^@([a-z][a-z0-9_-]*)\s*$").unwrap(),
        }
    }

    fn run(mut self) -> Result<Tree> {
        let mut tree = Tree::new();
        let mut scopes: Vec<IdScope> = vec![IdScope {
            level: 0,
            used: HashSet::new(),
        }];
        let mut current_level: u8 = 0;
        let mut content_buf = String::new();
        let mut index = 0usize;

        while index < self.lines.len() {
            let raw = self.lines[index];
            let line = raw.trim_end_matches(|c| c == '\n' || c == '\r');
            let line_no = index + 1;

            if let Some(caps) = self.op_re.captures(line) {
                self.flush_content(&mut tree, &mut content_buf, current_level);
                let name = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
                let op_name = OpName::parse(name)
                    .ok_or_else(|| FractalicError::parse(line_no, format!(
                        "unknown operation `@{}`",
                        name
                    )))?;
                let (node, consumed) =
                    self.parse_operation(op_name, index, current_level)?;
                tree.push_back(node);
                index += consumed;
                continue;
            }

            if let Some(caps) = self.heading_re.captures(line) {
                self.flush_content(&mut tree, &mut content_buf, current_level);
                let level = caps.get(1).map(|m| m.as_str().len()).unwrap_or(1) as u8;
                let title = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
                let id = self.heading_id(title, line_no)?;

                // Close scopes at or below this level, then claim the id
                while scopes.last().map(|s| s.level >= level).unwrap_or(false)
                    && scopes.len() > 1
                {
                    scopes.pop();
                }
                let scope = scopes.last_mut().expect("root scope always present");
                let id = dedupe_id(id, &mut scope.used);
                scopes.push(IdScope {
                    level,
                    used: HashSet::new(),
                });

                let node = Node::heading(self.keygen.next_key(), level, id, raw.to_string());
                tree.push_back(node);
                current_level = level;
                index += 1;
                continue;
            }

            content_buf.push_str(raw);
            index += 1;
        }

        self.flush_content(&mut tree, &mut content_buf, current_level);
        Ok(tree)
    }

    /// Collect and validate an operation block starting at `start`
    ///
    /// Returns the node and the number of lines consumed (marker, body,
    /// and the terminating blank if present).
    fn parse_operation(
        &mut self,
        name: OpName,
        start: usize,
        level: u8,
    ) -> Result<(Node, usize)> {
        let marker_line = start + 1;
        let mut body = String::new();
        let mut consumed = 1usize;
        let mut cursor = start + 1;
        while cursor < self.lines.len() {
            let raw = self.lines[cursor];
            if raw.trim().is_empty() {
                consumed += 1; // the terminating blank belongs to the block
                break;
            }
            body.push_str(raw);
            consumed += 1;
            cursor += 1;
        }

        let mapping: Mapping = if body.trim().is_empty() {
            Mapping::new()
        } else {
            match serde_yaml::from_str::<serde_yaml::Value>(&body) {
                Ok(serde_yaml::Value::Mapping(m)) => m,
                Ok(_) => {
                    return Err(FractalicError::parse(
                        marker_line + 1,
                        format!("@{} body must be a YAML mapping", name),
                    ))
                }
                Err(e) => {
                    let line = marker_line + e.location().map(|l| l.line()).unwrap_or(1);
                    return Err(FractalicError::parse(
                        line,
                        format!("invalid YAML in @{} body: {}", name, e),
                    ));
                }
            }
        };

        // Schema validation happens before execution ever begins
        OpParams::parse(name, &mapping, marker_line)?;

        let mut text = String::new();
        for raw in &self.lines[start..start + consumed] {
            text.push_str(raw);
        }
        let node = Node::operation(self.keygen.next_key(), name, level, text, mapping);
        Ok((node, consumed))
    }

    fn flush_content(&mut self, tree: &mut Tree, buf: &mut String, level: u8) {
        if buf.is_empty() {
            return;
        }
        let text = std::mem::take(buf);
        tree.push_back(Node::content(self.keygen.next_key(), level, text));
    }

    /// Explicit `{id=…}` suffix, else a slug derived from the title
    fn heading_id(&self, title: &str, line_no: usize) -> Result<String> {
        if let Some(caps) = self.id_suffix_re.captures(title) {
            let id = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            if !valid_id(id) {
                return Err(FractalicError::parse(
                    line_no,
                    format!("invalid heading id `{}`", id),
                ));
            }
            return Ok(id.to_string());
        }
        Ok(slugify(title))
    }
}

/// `[A-Za-z][A-Za-z0-9_-]*`
fn valid_id(id: &str) -> bool {
    let mut chars = id.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Lowercase, trim, and collapse runs of non-alphanumerics into `-`
pub fn slugify(title: &str) -> String {
    let mut slug = String::new();
    let mut pending_dash = false;
    for c in title.trim().to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c);
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        return "section".to_string();
    }
    if !slug.chars().next().unwrap_or('0').is_ascii_alphabetic() {
        return format!("section-{}", slug);
    }
    slug
}

/// Claim `id` within a sibling scope, appending `-2`, `-3`, … on collision
fn dedupe_id(id: String, used: &mut HashSet<String>) -> String {
    if used.insert(id.clone()) {
        return id;
    }
    let mut n = 2usize;
    loop {
        let candidate = format!("{}-{}", id, n);
        if used.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}
