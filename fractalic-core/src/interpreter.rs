//! The operation interpreter
//!
//! A strictly sequential driver: the cursor walks the linked node order,
//! dispatches operation nodes to their handlers, and applies the merge each
//! handler requests. Handlers answer with a directive (advance, jump, or
//! halt) and the driver owns every tree mutation.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use crate::address;
use crate::config::Config;
use crate::error::{FractalicError, Result};
use crate::events::Stage;
use crate::handlers;
use crate::llm;
use crate::node::{KeyGen, Node, NodeKey, Role};
use crate::ops::OpParams;
use crate::provider::ChatProvider;
use crate::recorder::RunRecorder;
use crate::tools::ToolRegistry;
use crate::tree::{MergeMode, Tree};

/// What the driver does after an operation completes
#[derive(Debug)]
pub enum Directive {
    /// Continue with the next node
    Advance,
    /// Move the cursor to a resolved target (`@goto`)
    Jump(NodeKey),
    /// Terminate this run, optionally with a return fragment (`@return`)
    Halt(Option<Vec<Node>>),
}

/// A merge requested by a handler
#[derive(Debug)]
pub struct MergeRequest {
    pub fragment: Vec<Node>,
    pub mode: Option<MergeMode>,
    pub to: Option<String>,
}

/// Handler result: an optional merge plus the next driver step
#[derive(Debug)]
pub struct HandlerOutput {
    pub merge: Option<MergeRequest>,
    pub directive: Directive,
}

impl HandlerOutput {
    pub fn advance() -> Self {
        Self {
            merge: None,
            directive: Directive::Advance,
        }
    }

    pub fn merged(merge: MergeRequest) -> Self {
        Self {
            merge: Some(merge),
            directive: Directive::Advance,
        }
    }
}

/// Outcome of one run level
#[derive(Debug)]
pub struct RunResult {
    /// The `@return` fragment if the run halted explicitly
    pub halted: Option<Vec<Node>>,
}

/// Per-level execution state: the tree, its key source, and the guards
pub struct RunContext {
    pub tree: Tree,
    pub keygen: KeyGen,
    /// The executing document, for relative path resolution
    pub file: PathBuf,
    /// `@run` nesting depth of this level
    pub depth: u32,
    /// Operations that already fired in this run
    fired: HashSet<NodeKey>,
    /// Keys the last execution of an operation produced, replaced on
    /// re-execution so `@goto` loops do not accumulate output
    produced: HashMap<NodeKey, Vec<NodeKey>>,
}

impl RunContext {
    pub fn new(tree: Tree, keygen: KeyGen, file: &Path, depth: u32) -> Self {
        Self {
            tree,
            keygen,
            file: file.to_path_buf(),
            depth,
            fired: HashSet::new(),
            produced: HashMap::new(),
        }
    }

    /// Directory the document executes in
    pub fn dir(&self) -> PathBuf {
        self.file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// The sequential operation driver
pub struct Interpreter {
    pub config: Arc<Config>,
    pub registry: Arc<ToolRegistry>,
    pub provider: Arc<dyn ChatProvider>,
    pub recorder: Arc<RunRecorder>,
    cancel: watch::Receiver<bool>,
}

impl Interpreter {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<ToolRegistry>,
        provider: Arc<dyn ChatProvider>,
        recorder: Arc<RunRecorder>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            registry,
            provider,
            recorder,
            cancel,
        }
    }

    /// Fail fast when the run was cancelled externally
    pub fn check_cancelled(&self) -> Result<()> {
        if *self.cancel.borrow() {
            Err(FractalicError::cancelled("execution cancelled"))
        } else {
            Ok(())
        }
    }

    /// Execute one run level to completion
    ///
    /// Boxed because `@run` re-enters the interpreter recursively.
    pub fn run<'a>(
        &'a self,
        ctx: &'a mut RunContext,
    ) -> Pin<Box<dyn Future<Output = Result<RunResult>> + Send + 'a>> {
        Box::pin(self.run_inner(ctx))
    }

    async fn run_inner(&self, ctx: &mut RunContext) -> Result<RunResult> {
        let mut cursor = ctx.tree.head().map(|n| n.key.clone());
        let mut executed = 0usize;

        while let Some(key) = cursor {
            self.check_cancelled()?;

            let Some(node) = ctx.tree.get(&key) else {
                // the cursor node was merged away; the run is over
                break;
            };
            if !node.is_operation() || !node.enabled {
                cursor = node.next.clone();
                continue;
            }

            let name = node
                .op_name()
                .ok_or_else(|| FractalicError::internal("operation node without a name"))?;
            let mapping = node.params.clone().unwrap_or_default();
            let params = OpParams::parse(name, &mapping, 0)?;

            if params.run_once() && ctx.fired.contains(&key) {
                cursor = node.next.clone();
                continue;
            }

            executed += 1;
            self.recorder
                .publish(
                    Stage::Execute,
                    (executed as f64 / (executed as f64 + 4.0)).min(0.95),
                    format!("@{} ({})", name, key),
                )
                .await;
            debug!("dispatching @{} at {}", name, key);

            let saved_next = node.next.clone();
            let output = match params {
                OpParams::Import(p) => handlers::import(self, ctx, &key, p).await?,
                OpParams::Shell(p) => handlers::shell(self, ctx, &key, p).await?,
                OpParams::Llm(p) => llm::execute(self, ctx, &key, p).await?,
                OpParams::Run(p) => handlers::run(self, ctx, &key, p).await?,
                OpParams::Return(p) => handlers::ret(ctx, &key, &p)?,
                OpParams::Goto(p) => handlers::goto(ctx, &p)?,
            };
            ctx.fired.insert(key.clone());

            let inserted = match output.merge {
                Some(request) => Some(self.apply_merge(ctx, &key, request)?),
                None => None,
            };

            cursor = match output.directive {
                Directive::Advance => self.advance_from(ctx, &key, saved_next, inserted),
                Directive::Jump(target) => Some(target),
                Directive::Halt(fragment) => {
                    return Ok(RunResult { halted: fragment });
                }
            };
        }

        Ok(RunResult { halted: None })
    }

    /// Apply a handler's merge per the driver rules
    ///
    /// The target defaults to the operation node itself; fragment nodes
    /// take `role=assistant`; when the operation fired before, its previous
    /// output is removed first so loops replace instead of accumulate.
    fn apply_merge(
        &self,
        ctx: &mut RunContext,
        op_key: &NodeKey,
        request: MergeRequest,
    ) -> Result<Vec<NodeKey>> {
        if let Some(previous) = ctx.produced.remove(op_key) {
            for key in previous {
                if ctx.tree.contains(&key) {
                    ctx.tree.remove_node(&key)?;
                }
            }
        }

        let mut fragment = request.fragment;
        for node in &mut fragment {
            node.role = Role::Assistant;
        }

        let target = match &request.to {
            Some(path) => address::require(&ctx.tree, path)?,
            None => op_key.clone(),
        };
        let mode = request.mode.unwrap_or(self.config.default_operation);
        let inserted = ctx
            .tree
            .insert(&target, fragment, mode, &mut ctx.keygen)?;
        ctx.produced.insert(op_key.clone(), inserted.clone());
        Ok(inserted)
    }

    /// Find where the cursor goes after an `advance` directive
    fn advance_from(
        &self,
        ctx: &RunContext,
        op_key: &NodeKey,
        saved_next: Option<NodeKey>,
        inserted: Option<Vec<NodeKey>>,
    ) -> Option<NodeKey> {
        if let Some(node) = ctx.tree.get(op_key) {
            return node.next.clone();
        }
        // The merge replaced the operation itself; continue at the first
        // surviving inserted node, else at the node that used to follow
        if let Some(keys) = inserted {
            if let Some(first) = keys.iter().find(|k| ctx.tree.contains(k)) {
                return Some(first.clone());
            }
        }
        saved_next.filter(|k| ctx.tree.contains(k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_output_constructors() {
        let advance = HandlerOutput::advance();
        assert!(advance.merge.is_none());
        assert!(matches!(advance.directive, Directive::Advance));

        let merged = HandlerOutput::merged(MergeRequest {
            fragment: Vec::new(),
            mode: None,
            to: None,
        });
        assert!(merged.merge.is_some());
    }
}
