//! Session recording
//!
//! Each run takes a labelled snapshot of the execution directory on start,
//! streams progress while executing, and on completion or failure renders
//! the final tree to `<doc>.ctx`, writes the call tree to `<doc>.trc`,
//! and snapshots again with a completion label.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::events::{ProgressEvent, ProgressSink, Stage};
use crate::node::NodeKey;
use crate::parser::slugify;
use crate::render;
use crate::tree::Tree;

/// Abstract point-in-time capture interface of the version store
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Capture `paths` under `label`, returning the store's id
    async fn snapshot(&self, paths: &[PathBuf], label: &str) -> Result<String>;
}

/// Store that records nothing and echoes the label as the id
#[derive(Debug, Default)]
pub struct NullSnapshotStore;

#[async_trait]
impl SnapshotStore for NullSnapshotStore {
    async fn snapshot(&self, _paths: &[PathBuf], label: &str) -> Result<String> {
        Ok(label.to_string())
    }
}

/// Build a snapshot label of the form `YYYYMMDDHHMMSS_<hex>_<slug>`
pub fn snapshot_label(slug: &str) -> String {
    let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
    let hex = Uuid::new_v4().simple().to_string();
    format!("{}_{}_{}", stamp, &hex[..6], slugify(slug))
}

/// One `@run` invocation in the call tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallFrame {
    pub file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caller_operation_key: Option<String>,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<CallFrame>,
}

/// One tool invocation made by an `@llm` operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub operation_key: String,
    pub tool: String,
    pub arguments: Value,
    pub result: Value,
}

struct RecorderState {
    root: CallFrame,
    /// Index path from the root into the currently open frame
    stack: Vec<usize>,
}

impl RecorderState {
    fn current(&mut self) -> &mut CallFrame {
        let mut frame = &mut self.root;
        for &index in &self.stack {
            frame = &mut frame.children[index];
        }
        frame
    }
}

/// Records one run: snapshots, progress, and the call tree
pub struct RunRecorder {
    document: PathBuf,
    store: Arc<dyn SnapshotStore>,
    sink: Arc<dyn ProgressSink>,
    state: Mutex<RecorderState>,
}

impl RunRecorder {
    pub fn new(
        document: &Path,
        store: Arc<dyn SnapshotStore>,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        let run_id = Uuid::new_v4().to_string();
        Self {
            document: document.to_path_buf(),
            store,
            sink,
            state: Mutex::new(RecorderState {
                root: CallFrame {
                    file: document.display().to_string(),
                    caller_operation_key: None,
                    run_id,
                    tool_calls: Vec::new(),
                    children: Vec::new(),
                },
                stack: Vec::new(),
            }),
        }
    }

    fn slug(&self) -> String {
        self.document
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "document".to_string())
    }

    fn execution_dir(&self) -> PathBuf {
        self.document
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Snapshot the execution directory before anything runs
    pub async fn start(&self) -> Result<String> {
        let label = snapshot_label(&format!("{}-start", self.slug()));
        let id = self
            .store
            .snapshot(&[self.execution_dir()], &label)
            .await?;
        self.publish(Stage::Snapshot, 0.0, format!("start snapshot {}", id))
            .await;
        Ok(id)
    }

    pub async fn publish(&self, stage: Stage, progress: f64, message: impl Into<String>) {
        self.sink
            .publish(ProgressEvent::new(stage, progress, message))
            .await;
    }

    /// Open a child frame for a `@run`
    pub fn push_frame(&self, file: &str, caller_operation: &NodeKey) {
        if let Ok(mut state) = self.state.lock() {
            let child = CallFrame {
                file: file.to_string(),
                caller_operation_key: Some(caller_operation.to_string()),
                run_id: Uuid::new_v4().to_string(),
                tool_calls: Vec::new(),
                children: Vec::new(),
            };
            let index = {
                let current = state.current();
                current.children.push(child);
                current.children.len() - 1
            };
            state.stack.push(index);
        }
    }

    /// Close the innermost `@run` frame
    pub fn pop_frame(&self) {
        if let Ok(mut state) = self.state.lock() {
            if state.stack.pop().is_none() {
                warn!("pop_frame with no open frame");
            }
        }
    }

    /// Record tool-call fan-out under the operation that requested it
    pub fn record_tool_call(
        &self,
        operation: &NodeKey,
        tool: &str,
        arguments: Value,
        result: Value,
    ) {
        if let Ok(mut state) = self.state.lock() {
            state.current().tool_calls.push(ToolCallRecord {
                operation_key: operation.to_string(),
                tool: tool.to_string(),
                arguments,
                result,
            });
        }
    }

    /// Recorded tool calls across all frames, in recording order
    pub fn tool_calls(&self) -> Vec<ToolCallRecord> {
        fn collect(frame: &CallFrame, out: &mut Vec<ToolCallRecord>) {
            out.extend(frame.tool_calls.iter().cloned());
            for child in &frame.children {
                collect(child, out);
            }
        }
        let mut out = Vec::new();
        if let Ok(state) = self.state.lock() {
            collect(&state.root, &mut out);
        }
        out
    }

    /// Emit `.ctx` and `.trc` files and take the completion snapshot
    ///
    /// Called on success and on failure alike: partial trees are preserved
    /// for debugging.
    pub async fn finish(&self, tree: &Tree, succeeded: bool) -> Result<String> {
        let ctx_path = self.document.with_extension("ctx");
        let trc_path = self.document.with_extension("trc");

        tokio::fs::write(&ctx_path, render::render(tree)).await?;
        let trace = {
            let state = self
                .state
                .lock()
                .map_err(|_| crate::error::FractalicError::internal("recorder poisoned"))?;
            serde_json::to_string_pretty(&state.root)?
        };
        tokio::fs::write(&trc_path, trace).await?;
        debug!("wrote {} and {}", ctx_path.display(), trc_path.display());

        let suffix = if succeeded { "done" } else { "failed" };
        let label = snapshot_label(&format!("{}-{}", self.slug(), suffix));
        let id = self
            .store
            .snapshot(&[self.execution_dir()], &label)
            .await?;
        self.publish(
            if succeeded { Stage::Complete } else { Stage::Failed },
            1.0,
            format!("completion snapshot {}", id),
        )
        .await;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullSink;
    use crate::node::KeyGen;
    use crate::parser::parse_document;
    use serde_json::json;

    fn recorder(path: &Path) -> RunRecorder {
        RunRecorder::new(path, Arc::new(NullSnapshotStore), Arc::new(NullSink))
    }

    #[test]
    fn test_snapshot_label_shape() {
        let label = snapshot_label("My Doc");
        let parts: Vec<_> = label.splitn(3, '_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 14);
        assert!(parts[0].chars().all(|c| c.is_ascii_digit()));
        assert_eq!(parts[1].len(), 6);
        assert_eq!(parts[2], "my-doc");
    }

    #[test]
    fn test_frames_nest_under_caller() {
        let mut gen = KeyGen::new();
        let caller = gen.next_key();
        let rec = recorder(Path::new("/tmp/doc.md"));
        rec.push_frame("child.md", &caller);
        rec.record_tool_call(&caller, "echo_tool", json!({"msg": "hi"}), json!({"result": "hi"}));
        rec.pop_frame();
        rec.record_tool_call(&caller, "top_tool", json!({}), json!(null));

        let state = rec.state.lock().unwrap();
        assert_eq!(state.root.children.len(), 1);
        assert_eq!(state.root.children[0].file, "child.md");
        assert_eq!(state.root.children[0].tool_calls.len(), 1);
        assert_eq!(state.root.tool_calls.len(), 1);
        assert_eq!(state.root.tool_calls[0].tool, "top_tool");
    }

    #[tokio::test]
    async fn test_finish_writes_ctx_and_trc() {
        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("doc.md");
        tokio::fs::write(&doc, "# A\nbody\n").await.unwrap();

        let mut gen = KeyGen::new();
        let tree = parse_document("# A\nbody\n", &mut gen).unwrap();
        let rec = recorder(&doc);
        rec.start().await.unwrap();
        rec.finish(&tree, true).await.unwrap();

        let ctx = std::fs::read_to_string(dir.path().join("doc.ctx")).unwrap();
        assert_eq!(ctx, "# A\nbody\n");
        let trc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("doc.trc")).unwrap())
                .unwrap();
        assert!(trc["run_id"].is_string());
        assert!(trc["file"].as_str().unwrap().ends_with("doc.md"));
    }
}
