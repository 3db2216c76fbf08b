//! Operation handlers: `@import`, `@shell`, `@run`, `@return`, `@goto`
//!
//! Each handler validates its inputs, performs its side effect, and hands
//! the driver a `HandlerOutput`; the driver applies the merge. `@llm`
//! lives in the `llm` module next to the mediator.

use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::address;
use crate::error::{FractalicError, Result};
use crate::events::Stage;
use crate::interpreter::{Directive, HandlerOutput, Interpreter, MergeRequest, RunContext};
use crate::node::{KeyGen, Node, NodeKey, Role};
use crate::ops::{
    effective_header, BlockSpec, GotoParams, ImportParams, ReturnParams, RunParams, ShellParams,
};
use crate::parser::{parse_document, slugify};
use crate::tree::MergeMode;

/// Default header wrapped around `@shell` output
pub const SHELL_HEADER: &str = "# OS Shell Tool response block";
/// Header prepended to a child run's input fragment
pub const INPUT_HEADER: &str = "# Input Parameters {id=input-parameters}";

/// `@import`: parse the source file, select the referenced fragment, and
/// merge it at the target
pub async fn import(
    interp: &Interpreter,
    ctx: &mut RunContext,
    _op: &NodeKey,
    params: ImportParams,
) -> Result<HandlerOutput> {
    interp.check_cancelled()?;
    let path = resolve_relative(&ctx.dir(), &params.file);
    if !path.is_file() {
        return Err(FractalicError::file_not_found(path.display().to_string()));
    }
    let source = tokio::fs::read_to_string(&path).await?;
    let source_tree = parse_document(&source, &mut ctx.keygen)?;

    let fragment = match &params.block {
        Some(spec) => {
            let selected = address::select_spec(&source_tree, spec)?;
            if selected.is_empty() {
                return Err(FractalicError::block_not_found(format!(
                    "{} in {}",
                    spec.paths().join(", "),
                    params.file
                )));
            }
            clone_nodes(&source_tree, &selected)
        }
        None => source_tree.iter().cloned().map(unlink).collect(),
    };

    Ok(HandlerOutput::merged(MergeRequest {
        fragment,
        mode: params.mode,
        to: params.to,
    }))
}

/// `@shell`: run the prompt through a shell in the document's directory,
/// wrap stdout as a content fragment
pub async fn shell(
    interp: &Interpreter,
    ctx: &mut RunContext,
    _op: &NodeKey,
    params: ShellParams,
) -> Result<HandlerOutput> {
    interp.check_cancelled()?;
    let mut command = Command::new("bash");
    command
        .current_dir(ctx.dir())
        .envs(interp.config.shell_environment())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|e| FractalicError::shell(format!("failed to spawn shell: {}", e)))?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(params.prompt.as_bytes()).await?;
        stdin.shutdown().await?;
    }

    let timeout = Duration::from_secs(interp.config.timeouts.shell_secs);
    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| FractalicError::cancelled("@shell timed out"))?
        .map_err(|e| FractalicError::shell(e.to_string()))?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        // stderr never enters the tree; it goes to the trace only
        debug!("@shell stderr: {}", stderr.trim());
        interp
            .recorder
            .publish(Stage::Execute, 0.0, format!("@shell stderr: {}", stderr.trim()))
            .await;
    }
    if !output.status.success() {
        return Err(FractalicError::shell(format!(
            "shell exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let header = effective_header(&params.use_header, Some(SHELL_HEADER));
    let fragment = wrap_output(header, &stdout, &mut ctx.keygen);

    Ok(HandlerOutput::merged(MergeRequest {
        fragment,
        mode: params.mode,
        to: params.to,
    }))
}

/// `@run`: execute another document with an input fragment built from the
/// caller, merge what it returns
pub async fn run(
    interp: &Interpreter,
    ctx: &mut RunContext,
    op: &NodeKey,
    params: RunParams,
) -> Result<HandlerOutput> {
    interp.check_cancelled()?;
    if ctx.depth + 1 > interp.config.max_run_depth {
        return Err(FractalicError::cancelled(format!(
            "@run nesting exceeded {} levels",
            interp.config.max_run_depth
        )));
    }

    let path = resolve_relative(&ctx.dir(), &params.file);
    if !path.is_file() {
        return Err(FractalicError::file_not_found(path.display().to_string()));
    }
    let source = tokio::fs::read_to_string(&path).await?;
    let mut child_keygen = KeyGen::new();
    let mut child_tree = parse_document(&source, &mut child_keygen)
        .map_err(|e| FractalicError::child_failed(params.file.clone(), e))?;

    // The input fragment is built from the caller's tree before anything
    // in the child executes; the caller's tree itself is never shared
    let input = input_fragment(ctx, op, &params.block, &params.prompt)?;
    if !input.is_empty() {
        let header = effective_header(&params.use_header, Some(INPUT_HEADER));
        let mut fragment = Vec::new();
        if let Some(line) = header {
            fragment.push(heading_from_line(&line, &mut child_keygen));
        }
        fragment.extend(input);
        match child_tree.head().map(|n| n.key.clone()) {
            Some(head) => {
                child_tree.insert(&head, fragment, MergeMode::Prepend, &mut child_keygen)?;
            }
            None => {
                for node in fragment {
                    child_tree.push_back(node);
                }
            }
        }
    }

    interp.recorder.push_frame(&params.file, op);
    let mut child_ctx = RunContext::new(child_tree, child_keygen, &path, ctx.depth + 1);
    let result = interp.run(&mut child_ctx).await;
    interp.recorder.pop_frame();
    let result =
        result.map_err(|e| FractalicError::child_failed(params.file.clone(), e))?;

    let fragment = match result.halted {
        Some(fragment) => fragment,
        None => child_ctx.tree.iter().cloned().map(unlink).collect(),
    };

    Ok(HandlerOutput::merged(MergeRequest {
        fragment,
        mode: params.mode,
        to: params.to,
    }))
}

/// `@return`: halt this run level with a fragment
pub fn ret(ctx: &mut RunContext, _op: &NodeKey, params: &ReturnParams) -> Result<HandlerOutput> {
    let mut fragment = Vec::new();
    if let Some(spec) = &params.block {
        let selected = address::select_spec(&ctx.tree, spec)?;
        fragment.extend(clone_nodes(&ctx.tree, &selected));
    }
    if let Some(prompt) = &params.prompt {
        fragment.push(content_node(prompt, 1, Role::User, &mut ctx.keygen));
    }
    if let Some(line) = effective_header(&params.use_header, None) {
        fragment.insert(0, heading_from_line(&line, &mut ctx.keygen));
    }
    Ok(HandlerOutput {
        merge: None,
        directive: Directive::Halt(Some(fragment)),
    })
}

/// `@goto`: jump the cursor to a heading in the current tree
pub fn goto(ctx: &RunContext, params: &GotoParams) -> Result<HandlerOutput> {
    let node = ctx
        .tree
        .find_by_id_or_key(&params.block)
        .ok_or_else(|| FractalicError::block_not_found(params.block.clone()))?;
    if !node.is_heading() {
        return Err(FractalicError::block_not_found(format!(
            "{} names an operation node; @goto targets must be headings",
            params.block
        )));
    }
    Ok(HandlerOutput {
        merge: None,
        directive: Directive::Jump(node.key.clone()),
    })
}

// Fragment construction shared with `@llm`
// ----------------------------------------

/// Build the Markdown input fragment for `@run` per the same rules as the
/// `@llm` context: block only, prompt only (everything preceding), or both
pub fn input_fragment(
    ctx: &mut RunContext,
    op: &NodeKey,
    block: &Option<BlockSpec>,
    prompt: &Option<String>,
) -> Result<Vec<Node>> {
    let mut fragment = Vec::new();
    match (block, prompt) {
        (Some(spec), _) => {
            let selected = address::select_spec(&ctx.tree, spec)?;
            fragment.extend(clone_nodes(&ctx.tree, &selected));
        }
        (None, Some(_)) => {
            let preceding: Vec<NodeKey> = ctx
                .tree
                .iter()
                .take_while(|n| &n.key != op)
                .map(|n| n.key.clone())
                .collect();
            fragment.extend(clone_nodes(&ctx.tree, &preceding));
        }
        (None, None) => {}
    }
    if let Some(prompt) = prompt {
        fragment.push(content_node(prompt, 1, Role::User, &mut ctx.keygen));
    }
    Ok(fragment)
}

/// Clone tree nodes into a standalone fragment, links cleared
pub fn clone_nodes(tree: &crate::tree::Tree, keys: &[NodeKey]) -> Vec<Node> {
    keys.iter()
        .filter_map(|k| tree.get(k))
        .cloned()
        .map(unlink)
        .collect()
}

fn unlink(mut node: Node) -> Node {
    node.prev = None;
    node.next = None;
    node
}

/// A content node holding `text`, normalized to end with a newline
pub fn content_node(text: &str, level: u8, role: Role, keygen: &mut KeyGen) -> Node {
    let mut text = text.to_string();
    if !text.ends_with('\n') {
        text.push('\n');
    }
    let mut node = Node::content(keygen.next_key(), level, text);
    node.role = role;
    node
}

/// Parse a header line (`# Title {id=slug}`) into a heading node
pub fn heading_from_line(line: &str, keygen: &mut KeyGen) -> Node {
    let trimmed = line.trim();
    let hashes = trimmed.chars().take_while(|c| *c == '#').count();
    let (level, text) = if hashes > 0 {
        (hashes.min(6) as u8, trimmed.to_string())
    } else {
        (1, format!("# {}", trimmed))
    };
    let title = text.trim_start_matches('#').trim();
    let id_re = Regex::new(r"\{id=([A-Za-z][A-Za-z0-9_-]*)\}\s*$").unwrap();
    let id = id_re
        .captures(title)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| slugify(title));
    Node::heading(keygen.next_key(), level, id, format!("{}\n", text))
}

/// Wrap tool or shell output under an optional header
pub fn wrap_output(header: Option<String>, body: &str, keygen: &mut KeyGen) -> Vec<Node> {
    let mut fragment = Vec::new();
    let level = match &header {
        Some(line) => {
            let node = heading_from_line(line, keygen);
            let level = node.level;
            fragment.push(node);
            level
        }
        None => 1,
    };
    if !body.is_empty() {
        fragment.push(content_node(body, level, Role::Assistant, keygen));
    }
    fragment
}

fn resolve_relative(dir: &Path, file: &str) -> PathBuf {
    let path = Path::new(file);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        dir.join(path)
    }
}
