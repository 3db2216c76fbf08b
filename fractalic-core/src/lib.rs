//! Fractalic Core - the document execution engine
//!
//! Structured Markdown documents are the program: prose under headings is
//! context, and YAML-bodied operation blocks are statements that rewrite a
//! live in-memory tree of the document. This crate provides the parser,
//! the tree model, the operation interpreter, the tool registry, and the
//! session recorder that together execute one document.

pub mod address;
pub mod config;
pub mod error;
pub mod events;
pub mod handlers;
pub mod interpreter;
pub mod llm;
pub mod node;
pub mod ops;
pub mod parser;
pub mod provider;
pub mod recorder;
pub mod render;
pub mod tools;
pub mod tree;


// Re-export commonly used types
pub use config::{Config, McpServerConfig, ProviderConfig, RetryConfig, TimeoutConfig};
pub use error::{FractalicError, Result};
pub use events::{BufferSink, LogSink, NullSink, ProgressEvent, ProgressSink, Stage};
pub use interpreter::{Directive, HandlerOutput, Interpreter, RunContext, RunResult};
pub use node::{KeyGen, Node, NodeKey, NodeKind, OpName, Role};
pub use ops::{BlockSpec, OpParams, ToolSelection};
pub use parser::parse_document;
pub use provider::{
    ChatMessage, ChatProvider, ChatRequest, ChatResponse, ChatRole, HttpChatProvider,
    ScriptedChatProvider, ToolCallRequest, ToolSchema,
};
pub use recorder::{NullSnapshotStore, RunRecorder, SnapshotStore};
pub use render::{render, render_context};
pub use tools::{ToolKind, ToolRegistry, ToolSpec};
pub use tree::{MergeMode, Tree};

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use crate::handlers::{heading_from_line, INPUT_HEADER};
use crate::render::render_nodes;

/// Result of one top-level document run, shaped like the execution
/// façade's response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub success: bool,
    /// Whether the run ended through `@return`
    pub explicit_return: bool,
    /// The rendered `@return` fragment, when one was produced
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_content: Option<String>,
    pub snapshot_label: String,
    /// The final tree rendered back to Markdown
    pub output: String,
}

/// Handle for cancelling an engine's in-flight run
#[derive(Clone)]
pub struct CancelHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Abort the current run at its next suspension point
    pub fn cancel(&self) {
        let _ = self.sender.send(true);
    }
}

/// The execution engine: wires configuration, the tool registry, the chat
/// provider, the snapshot store, and the progress sink around the
/// interpreter
pub struct Engine {
    config: Arc<Config>,
    registry: Arc<ToolRegistry>,
    provider: Arc<dyn ChatProvider>,
    snapshots: Arc<dyn SnapshotStore>,
    progress: Arc<dyn ProgressSink>,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
}

impl Engine {
    /// Create an engine with the default HTTP chat transport for the
    /// configured default provider
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let provider_cfg = config
            .provider(&config.default_provider)
            .cloned()
            .unwrap_or_default();
        let provider: Arc<dyn ChatProvider> = Arc::new(HttpChatProvider::new(
            config.default_provider.clone(),
            &provider_cfg,
        ));
        Self::with_parts(
            config,
            provider,
            Arc::new(NullSnapshotStore),
            Arc::new(LogSink),
        )
    }

    /// Create an engine from explicit collaborators
    pub fn with_parts(
        config: Arc<Config>,
        provider: Arc<dyn ChatProvider>,
        snapshots: Arc<dyn SnapshotStore>,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        let registry = Arc::new(ToolRegistry::new(Arc::clone(&config)));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            config,
            registry,
            provider,
            snapshots,
            progress,
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn ChatProvider>) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_snapshot_store(mut self, snapshots: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = snapshots;
        self
    }

    pub fn with_progress_sink(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    pub fn registry(&self) -> Arc<ToolRegistry> {
        Arc::clone(&self.registry)
    }

    /// Handle that aborts the current run from another task
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            sender: Arc::clone(&self.cancel_tx),
        }
    }

    /// Discover tools before the first run
    pub async fn init(&self) -> Result<()> {
        self.registry.rescan().await?;
        info!("engine initialized with {} tools", self.registry.names().await.len());
        Ok(())
    }

    /// Rebuild the tool registry on demand
    pub async fn rescan_tools(&self) -> Result<()> {
        self.registry.rescan().await
    }

    /// Execute one document to completion
    ///
    /// `parameter_text`, when present, is prepended to the tree as
    /// `# Input Parameters {id=input-parameters}` before execution.
    pub async fn run_document(
        &self,
        path: &Path,
        parameter_text: Option<&str>,
    ) -> Result<RunOutcome> {
        let recorder = Arc::new(RunRecorder::new(
            path,
            Arc::clone(&self.snapshots),
            Arc::clone(&self.progress),
        ));
        recorder.start().await?;

        recorder
            .publish(Stage::Parse, 0.05, format!("parsing {}", path.display()))
            .await;
        if !path.is_file() {
            return Err(FractalicError::file_not_found(path.display().to_string()));
        }
        let source = tokio::fs::read_to_string(path).await?;
        let mut keygen = KeyGen::new();
        // A parse failure aborts before any tree exists: only the initial
        // snapshot survives, no .ctx is written
        let mut tree = parse_document(&source, &mut keygen)?;

        if let Some(text) = parameter_text {
            let mut fragment = vec![heading_from_line(INPUT_HEADER, &mut keygen)];
            fragment.push(handlers::content_node(text, 1, Role::User, &mut keygen));
            match tree.head().map(|n| n.key.clone()) {
                Some(head) => {
                    tree.insert(&head, fragment, MergeMode::Prepend, &mut keygen)?;
                }
                None => {
                    for node in fragment {
                        tree.push_back(node);
                    }
                }
            }
        }

        let interpreter = Interpreter::new(
            Arc::clone(&self.config),
            Arc::clone(&self.registry),
            Arc::clone(&self.provider),
            Arc::clone(&recorder),
            self.cancel_rx.clone(),
        );
        let mut ctx = RunContext::new(tree, keygen, path, 0);

        match interpreter.run(&mut ctx).await {
            Ok(result) => {
                let label = recorder.finish(&ctx.tree, true).await?;
                let explicit_return = result.halted.is_some();
                let return_content = result.halted.map(|frag| render_nodes(frag.iter()));
                Ok(RunOutcome {
                    success: true,
                    explicit_return,
                    return_content,
                    snapshot_label: label,
                    output: render(&ctx.tree),
                })
            }
            Err(e) => {
                // Partial mutations are preserved for debugging; the
                // recorder still writes a .ctx for the state at failure
                if let Err(finish_err) = recorder.finish(&ctx.tree, false).await {
                    tracing::warn!("failed to record failure state: {}", finish_err);
                }
                Err(e)
            }
        }
    }
}
