//! Tool registry
//!
//! Aggregates explicit manifests, auto-discovered scripts, and remote tool
//! servers into one callable surface for the LLM mediator. Discovery is
//! cost-bounded: every probe of an unknown script runs under a strict
//! timeout, and a file whose probes all fail is skipped, not fatal.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{FractalicError, Result};
use crate::ops::ToolSelection;
use crate::provider::ToolSchema;

/// How a registered tool is executed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolKind {
    /// Invoked with `--flag value` pairs derived from the schema
    PythonCli,
    /// Invoked with `--flag value` pairs derived from the schema
    BashCli,
    /// Invoked with a single JSON argument, replies with JSON on stdout
    SimpleJson,
    /// Called over JSON-RPC on a remote tool server
    #[serde(skip)]
    Remote { server: String, url: String },
}

/// One registered tool
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the tool's arguments
    pub parameters: Value,
    pub kind: ToolKind,
    /// Entry path for local tools
    pub entry: Option<PathBuf>,
}

impl ToolSpec {
    pub fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

/// Declarative manifest placed adjacent to a tool (`<name>.tool.yaml`)
#[derive(Debug, Deserialize)]
struct ToolManifest {
    name: String,
    #[serde(default)]
    description: String,
    kind: ToolKind,
    entry: PathBuf,
    #[serde(default)]
    parameters: serde_yaml::Value,
}

/// Registry of callable tools, shared across workflows
///
/// Reads are concurrent; `rescan` rebuilds the table under the exclusive
/// lock.
pub struct ToolRegistry {
    config: Arc<Config>,
    tools: RwLock<Vec<ToolSpec>>,
    client: reqwest::Client,
}

impl ToolRegistry {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            tools: RwLock::new(Vec::new()),
            client: reqwest::Client::new(),
        }
    }

    /// Rebuild the registry from manifests, probed scripts, and remote
    /// servers; local entries win name collisions
    pub async fn rescan(&self) -> Result<()> {
        let mut discovered: Vec<ToolSpec> = Vec::new();

        if let Some(dir) = self.config.tools_dir.clone() {
            self.scan_local(&dir, &mut discovered).await?;
        }

        for server in &self.config.mcp_servers {
            match self.list_remote_tools(&server.name, &server.url).await {
                Ok(remote) => {
                    for spec in remote {
                        if discovered.iter().any(|t| t.name == spec.name) {
                            debug!("remote tool {} shadowed by local entry", spec.name);
                            continue;
                        }
                        discovered.push(spec);
                    }
                }
                Err(e) => {
                    warn!("tool server {} unavailable: {}", server.name, e);
                }
            }
        }

        let mut tools = self.tools.write().await;
        *tools = discovered;
        debug!("tool registry rebuilt with {} entries", tools.len());
        Ok(())
    }

    /// Registered tool names in registry order
    pub async fn names(&self) -> Vec<String> {
        self.tools.read().await.iter().map(|t| t.name.clone()).collect()
    }

    pub async fn get(&self, name: &str) -> Option<ToolSpec> {
        self.tools
            .read()
            .await
            .iter()
            .find(|t| t.name == name)
            .cloned()
    }

    /// Schemas for the tools an `@llm` operation selected
    pub async fn schemas(&self, selection: &ToolSelection) -> Vec<ToolSchema> {
        let tools = self.tools.read().await;
        match selection {
            ToolSelection::None => Vec::new(),
            ToolSelection::All => tools.iter().map(|t| t.schema()).collect(),
            ToolSelection::Named(names) => names
                .iter()
                .filter_map(|n| tools.iter().find(|t| &t.name == n))
                .map(|t| t.schema())
                .collect(),
        }
    }

    /// Invoke a tool by name with JSON arguments
    pub async fn call(&self, name: &str, args: &Value) -> Result<Value> {
        let spec = self
            .get(name)
            .await
            .ok_or_else(|| FractalicError::tool(format!("unknown tool `{}`", name)))?;
        let timeout = Duration::from_secs(self.config.timeouts.tool_secs);
        match &spec.kind {
            ToolKind::SimpleJson => {
                let entry = spec
                    .entry
                    .as_ref()
                    .ok_or_else(|| FractalicError::tool("simple-json tool without entry"))?;
                let arg = serde_json::to_string(args)?;
                let output = run_command(entry, &[arg], timeout).await?;
                serde_json::from_str(output.trim()).map_err(|_| {
                    FractalicError::tool(format!("tool `{}` returned non-JSON output", name))
                })
            }
            ToolKind::PythonCli | ToolKind::BashCli => {
                let entry = spec
                    .entry
                    .as_ref()
                    .ok_or_else(|| FractalicError::tool("cli tool without entry"))?;
                let flags = flag_arguments(args)?;
                let output = run_command(entry, &flags, timeout).await?;
                let trimmed = output.trim();
                Ok(serde_json::from_str(trimmed)
                    .unwrap_or_else(|_| json!({ "output": trimmed })))
            }
            ToolKind::Remote { url, .. } => self.call_remote(url, name, args).await,
        }
    }

    async fn scan_local(&self, dir: &Path, out: &mut Vec<ToolSpec>) -> Result<()> {
        if !dir.is_dir() {
            debug!("tools directory {} does not exist", dir.display());
            return Ok(());
        }

        let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(|e| {
                FractalicError::tool(format!("failed to read {}: {}", dir.display(), e))
            })?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .collect();
        entries.sort();

        // Manifests first; scripts they reference are not probed again
        let mut claimed: Vec<PathBuf> = Vec::new();
        for path in entries.iter().filter(|p| is_manifest(p)) {
            match self.load_manifest(path) {
                Ok(spec) => {
                    if let Some(entry) = &spec.entry {
                        claimed.push(entry.clone());
                    }
                    out.push(spec);
                }
                Err(e) => warn!("skipping manifest {}: {}", path.display(), e),
            }
        }

        for path in entries {
            if is_manifest(&path) || !is_script(&path) || claimed.contains(&path) {
                continue;
            }
            match self.probe_script(&path).await {
                Some(specs) => out.extend(specs),
                None => debug!("no probe succeeded for {}", path.display()),
            }
        }
        Ok(())
    }

    fn load_manifest(&self, path: &Path) -> Result<ToolSpec> {
        let content = std::fs::read_to_string(path)?;
        let manifest: ToolManifest = serde_yaml::from_str(&content)
            .map_err(|e| FractalicError::tool(format!("invalid manifest: {}", e)))?;
        let entry = if manifest.entry.is_absolute() {
            manifest.entry.clone()
        } else {
            path.parent().unwrap_or(Path::new(".")).join(&manifest.entry)
        };
        if !entry.exists() {
            return Err(FractalicError::tool(format!(
                "entry {} does not exist",
                entry.display()
            )));
        }
        Ok(ToolSpec {
            name: manifest.name,
            description: manifest.description,
            parameters: serde_json::to_value(&manifest.parameters)
                .unwrap_or_else(|_| json!({ "type": "object" })),
            kind: manifest.kind,
            entry: Some(entry),
        })
    }

    /// Probe an unknown script, stopping at the first success
    ///
    /// Order matters: the simple-JSON probe comes first because argparse
    /// introspection hangs on scripts that do heavy work at import.
    async fn probe_script(&self, path: &Path) -> Option<Vec<ToolSpec>> {
        let timeout = Duration::from_secs(self.config.timeouts.probe_secs);
        let stem = path.file_stem()?.to_string_lossy().to_string();

        // 1. Simple JSON probe
        if let Ok(reply) =
            run_command(path, &["{\"__test__\": true}".to_string()], timeout).await
        {
            if let Ok(schema) = serde_json::from_str::<Value>(reply.trim()) {
                return Some(vec![ToolSpec {
                    name: stem,
                    description: schema["description"].as_str().unwrap_or_default().to_string(),
                    parameters: normalize_schema(schema),
                    kind: ToolKind::SimpleJson,
                    entry: Some(path.to_path_buf()),
                }]);
            }
        }

        // 2. Schema dump
        if let Ok(reply) =
            run_command(path, &["--fractalic-dump-schema".to_string()], timeout).await
        {
            if let Ok(schema) = serde_json::from_str::<Value>(reply.trim()) {
                return Some(vec![spec_from_dump(&stem, schema, path)]);
            }
        }
        if let Ok(reply) =
            run_command(path, &["--fractalic-dump-multi-schema".to_string()], timeout).await
        {
            if let Ok(Value::Array(schemas)) = serde_json::from_str::<Value>(reply.trim()) {
                return Some(
                    schemas
                        .into_iter()
                        .map(|s| spec_from_dump(&stem, s, path))
                        .collect(),
                );
            }
        }

        // 3. Help parse
        if let Ok(help) = run_command(path, &["--help".to_string()], timeout).await {
            return Some(vec![spec_from_help(&stem, &help, path)]);
        }

        None
    }

    async fn list_remote_tools(&self, server: &str, url: &str) -> Result<Vec<ToolSpec>> {
        let result = self.rpc(url, "list_tools", json!({})).await?;
        let listed = result
            .as_array()
            .or_else(|| result["tools"].as_array())
            .ok_or_else(|| FractalicError::tool("list_tools returned no tool array"))?;
        Ok(listed
            .iter()
            .filter_map(|t| {
                let name = t["name"].as_str()?;
                Some(ToolSpec {
                    name: name.to_string(),
                    description: t["description"].as_str().unwrap_or_default().to_string(),
                    parameters: t
                        .get("input_schema")
                        .or_else(|| t.get("parameters"))
                        .cloned()
                        .unwrap_or_else(|| json!({ "type": "object" })),
                    kind: ToolKind::Remote {
                        server: server.to_string(),
                        url: url.to_string(),
                    },
                    entry: None,
                })
            })
            .collect())
    }

    async fn call_remote(&self, url: &str, name: &str, args: &Value) -> Result<Value> {
        self.rpc(
            url,
            "call_tool",
            json!({ "name": name, "arguments": args }),
        )
        .await
    }

    async fn rpc(&self, url: &str, method: &str, params: Value) -> Result<Value> {
        let timeout = Duration::from_secs(self.config.timeouts.tool_secs);
        let body = json!({
            "jsonrpc": "2.0",
            "id": uuid::Uuid::new_v4().to_string(),
            "method": method,
            "params": params,
        });
        let response = tokio::time::timeout(timeout, async {
            self.client.post(url).json(&body).send().await
        })
        .await
        .map_err(|_| FractalicError::tool(format!("{} timed out against {}", method, url)))?
        .map_err(|e| FractalicError::tool(format!("{} failed: {}", method, e)))?;

        let payload: Value = response
            .json()
            .await
            .map_err(|e| FractalicError::tool(format!("{} returned non-JSON: {}", method, e)))?;
        if let Some(error) = payload.get("error").filter(|e| !e.is_null()) {
            return Err(FractalicError::tool(format!("{}: {}", method, error)));
        }
        Ok(payload.get("result").cloned().unwrap_or(Value::Null))
    }
}

fn is_manifest(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().ends_with(".tool.yaml"))
        .unwrap_or(false)
}

fn is_script(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("py") | Some("sh")
    )
}

/// Run a local tool with the interpreter its extension implies
async fn run_command(entry: &Path, args: &[String], timeout: Duration) -> Result<String> {
    let mut command = match entry.extension().and_then(|e| e.to_str()) {
        Some("py") => {
            let mut c = Command::new("python3");
            c.arg(entry);
            c
        }
        Some("sh") => {
            let mut c = Command::new("bash");
            c.arg(entry);
            c
        }
        _ => Command::new(entry),
    };
    command
        .args(args)
        .current_dir(entry.parent().unwrap_or(Path::new(".")))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command
        .spawn()
        .map_err(|e| FractalicError::tool(format!("failed to spawn {}: {}", entry.display(), e)))?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| FractalicError::tool(format!("{} timed out", entry.display())))?
        .map_err(|e| FractalicError::tool(e.to_string()))?;

    if !output.status.success() {
        return Err(FractalicError::tool(format!(
            "{} exited with {}: {}",
            entry.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// `{"a": 1, "b": "x"}` becomes `--a 1 --b x`
fn flag_arguments(args: &Value) -> Result<Vec<String>> {
    let map = args
        .as_object()
        .ok_or_else(|| FractalicError::tool("cli tool arguments must be a JSON object"))?;
    let mut out = Vec::with_capacity(map.len() * 2);
    for (key, value) in map {
        out.push(format!("--{}", key));
        out.push(match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
    }
    Ok(out)
}

fn normalize_schema(schema: Value) -> Value {
    if schema.get("properties").is_some() || schema.get("type").is_some() {
        schema
    } else {
        json!({ "type": "object", "properties": schema })
    }
}

fn spec_from_dump(stem: &str, schema: Value, path: &Path) -> ToolSpec {
    ToolSpec {
        name: schema["name"].as_str().unwrap_or(stem).to_string(),
        description: schema["description"].as_str().unwrap_or_default().to_string(),
        parameters: schema
            .get("parameters")
            .cloned()
            .unwrap_or_else(|| json!({ "type": "object" })),
        kind: kind_for(path),
        entry: Some(path.to_path_buf()),
    }
}

fn spec_from_help(stem: &str, help: &str, path: &Path) -> ToolSpec {
    let description = help
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default()
        .to_string();
    let flag_re = Regex::new(r"--([a-z][a-z0-9_-]*)").unwrap();
    let mut properties = serde_json::Map::new();
    for caps in flag_re.captures_iter(help) {
        if let Some(flag) = caps.get(1) {
            if flag.as_str() == "help" {
                continue;
            }
            properties
                .entry(flag.as_str().to_string())
                .or_insert_with(|| json!({ "type": "string" }));
        }
    }
    ToolSpec {
        name: stem.to_string(),
        description,
        parameters: json!({ "type": "object", "properties": properties }),
        kind: kind_for(path),
        entry: Some(path.to_path_buf()),
    }
}

fn kind_for(path: &Path) -> ToolKind {
    match path.extension().and_then(|e| e.to_str()) {
        Some("py") => ToolKind::PythonCli,
        _ => ToolKind::BashCli,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn config_with_tools_dir(dir: &Path) -> Arc<Config> {
        let mut config = Config::default();
        config.tools_dir = Some(dir.to_path_buf());
        config.timeouts.probe_secs = 5;
        config.timeouts.tool_secs = 10;
        Arc::new(config)
    }

    fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    const ECHO_TOOL: &str = r#"#!/bin/sh
case "$1" in
  *__test__*)
    echo '{"type": "object", "properties": {"msg": {"type": "string"}}}'
    ;;
  *)
    msg=$(echo "$1" | sed 's/.*"msg"[[:space:]]*:[[:space:]]*"\([^"]*\)".*/\1/')
    echo "{\"result\": \"$msg\"}"
    ;;
esac
"#;

    #[tokio::test]
    async fn test_manifest_registration_and_call() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "echo_tool.sh", ECHO_TOOL);
        write_file(
            dir.path(),
            "echo_tool.tool.yaml",
            "name: echo_tool\ndescription: echo a message back\nkind: simple-json\nentry: echo_tool.sh\nparameters:\n  type: object\n  properties:\n    msg:\n      type: string\n",
        );

        let registry = ToolRegistry::new(config_with_tools_dir(dir.path()));
        registry.rescan().await.unwrap();
        assert_eq!(registry.names().await, vec!["echo_tool"]);

        let result = registry
            .call("echo_tool", &json!({ "msg": "hi" }))
            .await
            .unwrap();
        assert_eq!(result, json!({ "result": "hi" }));
    }

    #[tokio::test]
    async fn test_simple_json_probe_discovers_bare_script() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "echo_tool.sh", ECHO_TOOL);

        let registry = ToolRegistry::new(config_with_tools_dir(dir.path()));
        registry.rescan().await.unwrap();

        let spec = registry.get("echo_tool").await.unwrap();
        assert_eq!(spec.kind, ToolKind::SimpleJson);
        assert!(spec.parameters["properties"]["msg"].is_object());
    }

    #[tokio::test]
    async fn test_help_probe_falls_back_for_cli_scripts() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "lister.sh",
            "#!/bin/sh\nif [ \"$1\" = \"--help\" ]; then\n  echo 'List things in a directory'\n  echo '  --path directory to list'\n  exit 0\nfi\nexit 3\n",
        );

        let registry = ToolRegistry::new(config_with_tools_dir(dir.path()));
        registry.rescan().await.unwrap();

        let spec = registry.get("lister").await.unwrap();
        assert_eq!(spec.kind, ToolKind::BashCli);
        assert_eq!(spec.description, "List things in a directory");
        assert!(spec.parameters["properties"]["path"].is_object());
    }

    #[tokio::test]
    async fn test_failing_script_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "broken.sh", "#!/bin/sh\nexit 7\n");
        write_file(dir.path(), "echo_tool.sh", ECHO_TOOL);

        let registry = ToolRegistry::new(config_with_tools_dir(dir.path()));
        registry.rescan().await.unwrap();
        assert_eq!(registry.names().await, vec!["echo_tool"]);
    }

    #[tokio::test]
    async fn test_unknown_tool_call_is_tool_error() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::new(config_with_tools_dir(dir.path()));
        registry.rescan().await.unwrap();
        let err = registry.call("ghost", &json!({})).await.unwrap_err();
        assert_eq!(err.kind(), "ToolError");
    }

    #[tokio::test]
    async fn test_schema_selection_subsets() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "echo_tool.sh", ECHO_TOOL);
        let registry = ToolRegistry::new(config_with_tools_dir(dir.path()));
        registry.rescan().await.unwrap();

        assert!(registry.schemas(&ToolSelection::None).await.is_empty());
        assert_eq!(registry.schemas(&ToolSelection::All).await.len(), 1);
        assert_eq!(
            registry
                .schemas(&ToolSelection::Named(vec!["echo_tool".to_string()]))
                .await
                .len(),
            1
        );
        assert!(registry
            .schemas(&ToolSelection::Named(vec!["missing".to_string()]))
            .await
            .is_empty());
    }

    #[test]
    fn test_flag_arguments_rendering() {
        let flags = flag_arguments(&json!({ "path": "/tmp", "depth": 2 })).unwrap();
        assert!(flags.chunks(2).any(|c| c == ["--path", "/tmp"]));
        assert!(flags.chunks(2).any(|c| c == ["--depth", "2"]));
        assert!(flag_arguments(&json!([1, 2])).is_err());
    }
}
